//! Result envelope and rendering for every command.
//!
//! With `--format json` each command prints one envelope on stdout:
//!
//! ```json
//! {
//!   "schemaVersion": 1,
//!   "ok": true,
//!   "command": "page",
//!   "data": { ... },
//!   "timings": { "durationMs": 12 }
//! }
//! ```
//!
//! Failures carry `"ok": false` and an `error` object with a stable code.
//! With `--format text` the data is rendered for people and errors go to stderr.


use std::io::{self, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlview::protocol::{CellValue, ColumnInfo, Page, Row, TableInfo, TableKind};

/// Bumped on breaking changes to the envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Widest a text cell may get before it is cut.
const CELL_WIDTH: usize = 40;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text
	#[default]
	Text,
	/// JSON envelope
	Json,
}

impl std::str::FromStr for OutputFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"text" => Ok(OutputFormat::Text),
			"json" => Ok(OutputFormat::Json),
			_ => Err(format!("unknown format: {s}")),
		}
	}
}

impl std::fmt::Display for OutputFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OutputFormat::Text => write!(f, "text"),
			OutputFormat::Json => write!(f, "json"),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub schema_version: Option<u32>,

	pub ok: bool,

	pub command: String,

	/// Inputs used for this command, for traceability
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inputs: Option<serde_json::Value>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub timings: Option<Timings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,

	pub message: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
}

/// Stable error codes for scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	/// The file is above the configured size ceiling
	ImportTooLarge,
	/// The worker could not load the file
	ImportFailed,
	/// The worker or session went away
	SessionError,
	/// Unknown table or column, or a malformed filter
	QueryFailed,
	Canceled,
	IoError,
	InvalidInput,
	InternalError,
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::ImportTooLarge => write!(f, "IMPORT_TOO_LARGE"),
			ErrorCode::ImportFailed => write!(f, "IMPORT_FAILED"),
			ErrorCode::SessionError => write!(f, "SESSION_ERROR"),
			ErrorCode::QueryFailed => write!(f, "QUERY_FAILED"),
			ErrorCode::Canceled => write!(f, "CANCELED"),
			ErrorCode::IoError => write!(f, "IO_ERROR"),
			ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
			ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
	pub duration_ms: u64,
}

impl From<Duration> for Timings {
	fn from(duration: Duration) -> Self {
		Timings {
			duration_ms: duration.as_millis() as u64,
		}
	}
}

pub struct ResultBuilder<T: Serialize> {
	command: String,
	inputs: Option<serde_json::Value>,
	data: Option<T>,
	error: Option<CommandError>,
	start_time: Instant,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			inputs: None,
			data: None,
			error: None,
			start_time: Instant::now(),
		}
	}

	/// Measures from `start` instead of from builder creation.
	pub fn started_at(mut self, start: Instant) -> Self {
		self.start_time = start;
		self
	}

	pub fn inputs(mut self, inputs: serde_json::Value) -> Self {
		self.inputs = Some(inputs);
		self
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, error: CommandError) -> Self {
		self.error = Some(error);
		self
	}

	pub fn build(self) -> CommandResult<T> {
		CommandResult {
			schema_version: Some(SCHEMA_VERSION),
			ok: self.error.is_none(),
			command: self.command,
			inputs: self.inputs,
			data: self.data,
			error: self.error,
			timings: Some(self.start_time.elapsed().into()),
		}
	}
}

/// Something a command can print for people.
pub trait Render {
	fn render(&self) -> String;
}

/// Prints `result`: the whole envelope as JSON, or just the data as text.
pub fn print_result<T: Serialize + Render>(result: &CommandResult<T>, format: OutputFormat) {
	let mut stdout = io::stdout().lock();
	let written = match format {
		OutputFormat::Json => serde_json::to_string_pretty(result)
			.map_err(io::Error::from)
			.and_then(|json| writeln!(stdout, "{json}")),
		OutputFormat::Text => match &result.data {
			Some(data) => write!(stdout, "{}", data.render()),
			None => Ok(()),
		},
	};
	if let Err(err) = written.and_then(|()| stdout.flush()) {
		tracing::debug!(error = %err, "stdout closed");
	}
}

/// Prints a failed envelope; text mode only writes to stderr.
pub fn print_failure(command: &str, error: CommandError, format: OutputFormat) {
	print_error_stderr(&error);
	if format == OutputFormat::Json {
		let result: CommandResult<()> = ResultBuilder::new(command).error(error).build();
		match serde_json::to_string_pretty(&result) {
			Ok(json) => println!("{json}"),
			Err(err) => eprintln!("failed to encode error envelope: {err}"),
		}
	}
}

pub fn print_error_stderr(error: &CommandError) {
	eprintln!("error [{}]: {}", error.code, error.message);
}

impl Render for () {
	fn render(&self) -> String {
		String::new()
	}
}

pub fn format_cell(value: &CellValue) -> String {
	match value {
		CellValue::Null => "NULL".to_string(),
		CellValue::Integer(i) => i.to_string(),
		CellValue::Real(f) => f.to_string(),
		CellValue::Text(text) => truncate(text, CELL_WIDTH),
		CellValue::Blob { size } => format!("<blob {size} B>"),
	}
}

fn truncate(text: &str, width: usize) -> String {
	let single_line = text.replace(['\n', '\r', '\t'], " ");
	if single_line.chars().count() <= width {
		return single_line;
	}
	let mut cut: String = single_line.chars().take(width.saturating_sub(1)).collect();
	cut.push('…');
	cut
}

/// Lays out `header` and `rows` as aligned columns.
pub fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
	let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
	for row in rows {
		for (i, cell) in row.iter().enumerate() {
			if let Some(width) = widths.get_mut(i) {
				*width = (*width).max(cell.chars().count());
			}
		}
	}

	let line = |cells: &[String]| {
		let padded: Vec<String> = cells
			.iter()
			.zip(&widths)
			.map(|(cell, &width)| format!("{cell:<width$}"))
			.collect();
		format!("{}\n", padded.join("  ").trim_end())
	};

	let mut out = line(header);
	let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
	out.push_str(&line(&rule));
	for row in rows {
		out.push_str(&line(row));
	}
	out
}

fn row_cells(row: &Row) -> Vec<String> {
	std::iter::once(row.rowid.to_string())
		.chain(row.values.iter().map(format_cell))
		.collect()
}

impl Render for Page {
	fn render(&self) -> String {
		let header: Vec<String> = std::iter::once("rowid".to_string())
			.chain(self.columns.iter().cloned())
			.collect();
		let rows: Vec<Vec<String>> = self.rows.iter().map(row_cells).collect();
		let mut out = render_table(&header, &rows);
		out.push_str(&format!(
			"({} rows from offset {})\n",
			self.rows.len(),
			self.offset
		));
		out
	}
}

fn column_summary(column: &ColumnInfo) -> String {
	let mut summary = column.name.clone();
	if let Some(decl_type) = &column.decl_type {
		summary.push(' ');
		summary.push_str(decl_type);
	}
	if column.primary_key {
		summary.push_str(" PK");
	}
	if column.not_null {
		summary.push_str(" NOT NULL");
	}
	summary
}

impl Render for Vec<TableInfo> {
	fn render(&self) -> String {
		let header = vec!["name".to_string(), "kind".to_string(), "columns".to_string()];
		let rows: Vec<Vec<String>> = self
			.iter()
			.map(|table| {
				let kind = match table.kind {
					TableKind::Table => "table",
					TableKind::View => "view",
				};
				let columns: Vec<String> = table.columns.iter().map(column_summary).collect();
				vec![table.name.clone(), kind.to_string(), columns.join(", ")]
			})
			.collect();
		render_table(&header, &rows)
	}
}
