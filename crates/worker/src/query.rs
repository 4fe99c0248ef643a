//! Read queries against one imported database.
//!
//! Table and column names come from the caller, so every identifier is checked
//! against the schema before it is quoted into SQL; values are always bound.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use sqlview::Error;
use sqlview_protocol::{
	BlobQuery, CellValue, ColumnInfo, CountQuery, Filter, Page, PageQuery, Row, RowQuery, SortDirection, TableInfo,
	TableKind,
};
use sqlview_runtime::Error as RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
	#[error(transparent)]
	Sqlite(#[from] rusqlite::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("no such table: {0}")]
	NoSuchTable(String),

	#[error("no such column: {0}")]
	NoSuchColumn(String),

	#[error("{0} has no rowid")]
	NoRowid(String),

	#[error("no row with rowid {0}")]
	NoRow(i64),

	#[error("query interrupted")]
	Interrupted,
}

impl QueryError {
	fn is_interrupt(&self) -> bool {
		match self {
			QueryError::Interrupted => true,
			QueryError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
				err.code == rusqlite::ErrorCode::OperationInterrupted
			}
			_ => false,
		}
	}
}

impl From<QueryError> for Error {
	fn from(err: QueryError) -> Self {
		if err.is_interrupt() {
			Error::Rpc(RpcError::Canceled)
		} else {
			Error::Query(err.to_string())
		}
	}
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;

pub(crate) fn quote_ident(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) struct TableMeta {
	pub name: String,
	pub kind: TableKind,
	/// Name that reaches the rowid, or `None` for views, `WITHOUT ROWID`
	/// tables and tables whose columns shadow every rowid alias.
	pub rowid: Option<&'static str>,
	pub columns: Vec<ColumnInfo>,
}

impl TableMeta {
	fn column(&self, name: &str) -> QueryResult<String> {
		if self.columns.iter().any(|c| c.name == name) {
			Ok(quote_ident(name))
		} else {
			Err(QueryError::NoSuchColumn(name.to_string()))
		}
	}

	fn require_rowid(&self) -> QueryResult<&'static str> {
		self.rowid.ok_or_else(|| QueryError::NoRowid(self.name.clone()))
	}

	fn quoted(&self) -> String {
		quote_ident(&self.name)
	}
}

fn columns(conn: &Connection, table: &str) -> QueryResult<Vec<ColumnInfo>> {
	let mut stmt = conn.prepare(r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1) ORDER BY cid"#)?;
	let rows = stmt.query_map([table], |row| {
		let decl_type: String = row.get(1)?;
		Ok(ColumnInfo {
			name: row.get(0)?,
			decl_type: (!decl_type.is_empty()).then_some(decl_type),
			not_null: row.get::<_, i64>(2)? != 0,
			primary_key: row.get::<_, i64>(3)? > 0,
		})
	})?;
	Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn table_meta(conn: &Connection, table: &str) -> QueryResult<TableMeta> {
	let found: Option<String> = conn
		.query_row(
			"SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
			[table],
			|row| row.get(0),
		)
		.optional()?;
	let Some(kind) = found else {
		return Err(QueryError::NoSuchTable(table.to_string()));
	};

	let kind = if kind == "view" { TableKind::View } else { TableKind::Table };
	let columns = columns(conn, table)?;
	let rowid = if kind == TableKind::Table && !without_rowid(conn, table)? {
		rowid_alias(&columns)
	} else {
		None
	};

	Ok(TableMeta {
		name: table.to_string(),
		kind,
		rowid,
		columns,
	})
}

fn without_rowid(conn: &Connection, table: &str) -> QueryResult<bool> {
	let wr: Option<i64> = conn
		.query_row(
			"SELECT wr FROM pragma_table_list(?1) WHERE schema = 'main'",
			[table],
			|row| row.get(0),
		)
		.optional()?;
	Ok(wr.is_some_and(|wr| wr != 0))
}

/// First rowid alias no user column claims.
fn rowid_alias(columns: &[ColumnInfo]) -> Option<&'static str> {
	["rowid", "_rowid_", "oid"]
		.into_iter()
		.find(|alias| !columns.iter().any(|c| c.name.eq_ignore_ascii_case(alias)))
}

/// User tables and views, by name.
pub(crate) fn list_tables(conn: &Connection) -> QueryResult<Vec<TableInfo>> {
	let names: Vec<String> = {
		let mut stmt = conn.prepare(
			"SELECT name FROM sqlite_master \
			 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
		)?;
		let rows = stmt.query_map([], |row| row.get(0))?;
		rows.collect::<rusqlite::Result<Vec<_>>>()?
	};

	names
		.into_iter()
		.map(|name| {
			let meta = table_meta(conn, &name)?;
			Ok(TableInfo {
				name: meta.name,
				kind: meta.kind,
				columns: meta.columns,
			})
		})
		.collect()
}

pub(crate) fn cell(value: ValueRef<'_>) -> CellValue {
	match value {
		ValueRef::Null => CellValue::Null,
		ValueRef::Integer(i) => CellValue::Integer(i),
		ValueRef::Real(f) => CellValue::Real(f),
		ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
		ValueRef::Blob(b) => CellValue::Blob { size: b.len() as u64 },
	}
}

fn where_clause(meta: &TableMeta, filter: Option<&Filter>, params: &mut Vec<Value>) -> QueryResult<String> {
	match filter {
		Some(filter) => {
			let column = meta.column(&filter.column)?;
			params.push(Value::Text(filter.pattern.clone()));
			Ok(format!(" WHERE {column} LIKE ?{}", params.len()))
		}
		None => Ok(String::new()),
	}
}

fn rowid_expr(meta: &TableMeta) -> &'static str {
	meta.rowid.unwrap_or("NULL")
}

/// A window of rows; `abort` is checked between rows.
pub(crate) fn page(conn: &Connection, query: &PageQuery, abort: &AtomicBool) -> QueryResult<Page> {
	let meta = table_meta(conn, &query.table)?;
	let mut params = Vec::new();
	let mut sql = format!("SELECT {}, * FROM {}", rowid_expr(&meta), meta.quoted());
	sql.push_str(&where_clause(&meta, query.filter.as_ref(), &mut params)?);

	match &query.order_by {
		Some(order) => {
			let direction = match order.direction {
				SortDirection::Asc => "ASC",
				SortDirection::Desc => "DESC",
			};
			sql.push_str(&format!(" ORDER BY {} {direction}", meta.column(&order.column)?));
		}
		None => {
			if let Some(rowid) = meta.rowid {
				sql.push_str(&format!(" ORDER BY {rowid}"));
			}
		}
	}

	params.push(Value::Integer(i64::from(query.limit)));
	params.push(Value::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));
	sql.push_str(&format!(" LIMIT ?{} OFFSET ?{}", params.len() - 1, params.len()));

	let mut stmt = conn.prepare(&sql)?;
	let columns: Vec<String> = stmt.column_names().iter().skip(1).map(|c| c.to_string()).collect();
	let width = stmt.column_count();

	let mut rows = stmt.query(params_from_iter(params))?;
	let mut out = Vec::new();
	let mut position = query.offset;
	while let Some(row) = rows.next()? {
		if abort.load(Ordering::Acquire) {
			return Err(QueryError::Interrupted);
		}
		position += 1;
		let rowid = match row.get_ref(0)? {
			ValueRef::Integer(id) => id,
			_ => i64::try_from(position).unwrap_or(i64::MAX),
		};
		let values = (1..width)
			.map(|i| row.get_ref(i).map(cell))
			.collect::<rusqlite::Result<Vec<_>>>()?;
		out.push(Row { rowid, values });
	}

	Ok(Page {
		columns,
		offset: query.offset,
		rows: out,
	})
}

pub(crate) fn count(conn: &Connection, query: &CountQuery) -> QueryResult<u64> {
	let meta = table_meta(conn, &query.table)?;
	let mut params = Vec::new();
	let sql = format!(
		"SELECT count(*) FROM {}{}",
		meta.quoted(),
		where_clause(&meta, query.filter.as_ref(), &mut params)?
	);
	let count: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
	Ok(count.max(0) as u64)
}

pub(crate) fn row(conn: &Connection, query: &RowQuery) -> QueryResult<Option<Row>> {
	let meta = table_meta(conn, &query.table)?;
	let rowid = meta.require_rowid()?;

	let mut stmt = conn.prepare(&format!("SELECT {rowid}, * FROM {} WHERE {rowid} = ?1", meta.quoted()))?;
	let width = stmt.column_count();
	let found = stmt
		.query_row([query.rowid], |row| {
			let values = (1..width)
				.map(|i| row.get_ref(i).map(cell))
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(Row {
				rowid: row.get(0)?,
				values,
			})
		})
		.optional()?;
	Ok(found)
}

/// Full contents of one cell. Text comes back as its UTF-8 bytes, NULL as nothing.
pub(crate) fn blob(conn: &Connection, query: &BlobQuery) -> QueryResult<Bytes> {
	let meta = table_meta(conn, &query.table)?;
	let rowid = meta.require_rowid()?;
	let column = meta.column(&query.column)?;

	let sql = format!("SELECT {column} FROM {} WHERE {rowid} = ?1", meta.quoted());
	let found = conn
		.query_row(&sql, [query.rowid], |row| {
			Ok(match row.get_ref(0)? {
				ValueRef::Blob(b) | ValueRef::Text(b) => Bytes::copy_from_slice(b),
				ValueRef::Integer(i) => Bytes::from(i.to_string()),
				ValueRef::Real(f) => Bytes::from(f.to_string()),
				ValueRef::Null => Bytes::new(),
			})
		})
		.optional()?;
	found.ok_or(QueryError::NoRow(query.rowid))
}
