//! Command implementations.

mod watch;

use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use sqlview::HostApi;
use sqlview::protocol::{BlobQuery, CountQuery, Filter, OrderBy, PageQuery, Row, RowQuery, SortDirection};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Commands, WindowArgs};
use crate::error::{CliError, Result};
use crate::output::{OutputFormat, Render, ResultBuilder, format_cell, print_result};
use crate::viewer::{ViewState, Viewer, load_config};

pub fn command_name(command: &Commands) -> &'static str {
	match command {
		Commands::Tables { .. } => "tables",
		Commands::Page { .. } => "page",
		Commands::Count { .. } => "count",
		Commands::Row { .. } => "row",
		Commands::Blob { .. } => "blob",
		Commands::Export { .. } => "export",
		Commands::Watch { .. } => "watch",
		Commands::Worker => "worker",
	}
}

/// Parses `COLUMN=PATTERN`.
pub fn parse_filter(raw: &str) -> Result<Filter> {
	match raw.split_once('=') {
		Some((column, pattern)) if !column.trim().is_empty() => Ok(Filter {
			column: column.trim().to_string(),
			pattern: pattern.to_string(),
		}),
		_ => Err(CliError::InvalidInput(format!(
			"filter '{raw}' is not COLUMN=PATTERN"
		))),
	}
}

/// The database name is left empty; the host fills in the session's own.
pub fn page_query(table: &str, window: &WindowArgs) -> Result<PageQuery> {
	Ok(PageQuery {
		name: String::new(),
		table: table.to_string(),
		offset: window.offset,
		limit: window.limit,
		order_by: window.order.as_ref().map(|column| OrderBy {
			column: column.clone(),
			direction: if window.desc {
				SortDirection::Desc
			} else {
				SortDirection::Asc
			},
		}),
		filter: window.filter.as_deref().map(parse_filter).transpose()?,
	})
}

fn view_of(table: &str, window: &WindowArgs) -> ViewState {
	ViewState {
		table: Some(table.to_string()),
		offset: window.offset,
		limit: window.limit,
	}
}

fn emit<T: Serialize + Render>(command: &str, inputs: serde_json::Value, data: T, started: Instant, format: OutputFormat) {
	let result = ResultBuilder::new(command)
		.started_at(started)
		.inputs(inputs)
		.data(data)
		.build();
	print_result(&result, format);
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CountData {
	table: String,
	count: u64,
}

impl Render for CountData {
	fn render(&self) -> String {
		format!("{}\n", self.count)
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RowData {
	table: String,
	columns: Vec<String>,
	row: Row,
}

impl Render for RowData {
	fn render(&self) -> String {
		let width = self.columns.iter().map(|c| c.chars().count()).max().unwrap_or(0).max(5);
		let mut out = format!("{:<width$}  {}\n", "rowid", self.row.rowid);
		for (column, value) in self.columns.iter().zip(&self.row.values) {
			out.push_str(&format!("{column:<width$}  {}\n", format_cell(value)));
		}
		out
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SavedData {
	size: usize,
	path: std::path::PathBuf,
}

impl Render for SavedData {
	fn render(&self) -> String {
		format!("wrote {} bytes to {}\n", self.size, self.path.display())
	}
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
	tokio::fs::write(path, bytes).await.map_err(|source| CliError::Write {
		path: path.to_path_buf(),
		source,
	})
}

pub async fn dispatch(cli: Cli) -> Result<()> {
	if matches!(cli.command, Commands::Worker) {
		sqlview_worker::serve_stdio().await;
		return Ok(());
	}

	let format = cli.format;
	let config = load_config(&cli)?;
	let started = Instant::now();
	let cancel = CancellationToken::new();

	match cli.command {
		Commands::Tables { file } => {
			let viewer = Viewer::open(config, &file, ViewState::default()).await?;
			let tables = viewer.host().list_tables(&cancel).await;
			viewer.close().await;
			emit("tables", json!({ "file": file }), tables?, started, format);
		}

		Commands::Page { file, table, window } => {
			let query = page_query(&table, &window)?;
			let viewer = Viewer::open(config, &file, view_of(&table, &window)).await?;
			let page = viewer.host().get_page(query, &cancel).await;
			viewer.close().await;
			emit(
				"page",
				json!({ "file": file, "table": table, "offset": window.offset, "limit": window.limit }),
				page?,
				started,
				format,
			);
		}

		Commands::Count { file, table, filter } => {
			let query = CountQuery {
				name: String::new(),
				table: table.clone(),
				filter: filter.as_deref().map(parse_filter).transpose()?,
			};
			let viewer = Viewer::open(config, &file, ViewState::default()).await?;
			let count = viewer.host().get_count(query, &cancel).await;
			viewer.close().await;
			emit(
				"count",
				json!({ "file": file, "table": table, "filter": filter }),
				CountData { table, count: count? },
				started,
				format,
			);
		}

		Commands::Row { file, table, rowid } => {
			let viewer = Viewer::open(config, &file, ViewState::default()).await?;
			let found = async {
				let tables = viewer.host().list_tables(&cancel).await?;
				let columns = tables
					.into_iter()
					.find(|t| t.name == table)
					.map(|t| t.columns.into_iter().map(|c| c.name).collect())
					.unwrap_or_default();
				let query = RowQuery {
					name: String::new(),
					table: table.clone(),
					rowid,
				};
				let row = viewer.host().get_by_row_id(query, &cancel).await?;
				Ok::<_, CliError>((columns, row))
			}
			.await;
			viewer.close().await;

			let (columns, row) = found?;
			let row = row.ok_or_else(|| CliError::InvalidInput(format!("no row with rowid {rowid} in {table}")))?;
			emit(
				"row",
				json!({ "file": file, "table": table, "rowid": rowid }),
				RowData { table, columns, row },
				started,
				format,
			);
		}

		Commands::Blob {
			file,
			table,
			rowid,
			column,
			output,
		} => {
			let query = BlobQuery {
				name: String::new(),
				table: table.clone(),
				rowid,
				column: column.clone(),
			};
			let viewer = Viewer::open(config, &file, ViewState::default()).await?;
			let saved = async {
				let bytes = viewer.host().get_blob(query, &cancel).await?;
				let size = bytes.len();
				let path = match output {
					Some(path) => {
						write_file(&path, &bytes).await?;
						path
					}
					None => {
						let name = format!("{table}-{rowid}-{column}.bin");
						viewer.host().download_binary(bytes, &name, false).await?;
						viewer.download_path(&name)
					}
				};
				Ok::<_, CliError>(SavedData { size, path })
			}
			.await;
			viewer.close().await;
			emit(
				"blob",
				json!({ "file": file, "table": table, "rowid": rowid, "column": column }),
				saved?,
				started,
				format,
			);
		}

		Commands::Export { file, output } => {
			let viewer = Viewer::open(config, &file, ViewState::default()).await?;
			let exported = viewer.host().export_database(&cancel).await;
			viewer.close().await;

			let bytes = exported?;
			write_file(&output, &bytes).await?;
			emit(
				"export",
				json!({ "file": file }),
				SavedData {
					size: bytes.len(),
					path: output,
				},
				started,
				format,
			);
		}

		Commands::Watch { file, table, window } => {
			let query = page_query(&table, &window)?;
			let viewer = Viewer::open(config, &file, view_of(&table, &window)).await?;
			watch::run(viewer, query, format).await?;
		}

		Commands::Worker => {}
	}

	Ok(())
}
