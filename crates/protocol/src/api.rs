//! Parameter and result shapes for the worker, host facade and UI interfaces.
//!
//! Method names are grouped per interface in [`methods`]. Binary fields are
//! always [`BufferRef`]s into the enclosing payload's transfer list.

use serde::{Deserialize, Serialize};

use crate::payload::{BufferRef, RemoteRef};

/// Method names routed by the service adapters.
pub mod methods {
	pub mod worker {
		pub const IMPORT_FROM_BUFFER: &str = "import_from_buffer";
		pub const IMPORT_FROM_STREAM: &str = "import_from_stream";
		pub const LIST_TABLES: &str = "list_tables";
		pub const GET_PAGE: &str = "get_page";
		pub const GET_COUNT: &str = "get_count";
		pub const GET_BY_ROW_ID: &str = "get_by_row_id";
		pub const GET_BLOB: &str = "get_blob";
		pub const EXPORT_DATABASE: &str = "export_database";
		pub const CLOSE: &str = "close";
	}

	pub mod host {
		pub const GET_INITIAL_PAYLOAD: &str = "get_initial_payload";
		pub const REQUEST_REFRESH: &str = "request_refresh";
		pub const DOWNLOAD_BINARY: &str = "download_binary";
	}

	pub mod ui {
		pub const FORCE_UPDATE: &str = "force_update";
		pub const GET_SERIALIZED_STATE_FOR_SAVE: &str = "get_serialized_state_for_save";
	}

	pub mod stream {
		pub const READ_CHUNK: &str = "read_chunk";
	}
}

/// Options accompanying a buffer import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
	/// Largest database the worker accepts, in bytes.
	pub max_size: u64,
	/// Open the imported database read-only.
	#[serde(default)]
	pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBufferParams {
	pub name: String,
	pub bytes: BufferRef,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub wal: Option<BufferRef>,
	pub options: ImportOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStreamParams {
	pub name: String,
	/// Byte source exposed by the caller; the callee releases it when done.
	pub source: RemoteRef,
	pub size: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub wal: Option<BufferRef>,
	pub options: ImportOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameParams {
	pub name: String,
}

/// Result carrying a single transferred buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferResult {
	pub bytes: BufferRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
	Table,
	View,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
	pub name: String,
	/// Declared type as written in the schema, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub decl_type: Option<String>,
	#[serde(default)]
	pub primary_key: bool,
	#[serde(default)]
	pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
	pub name: String,
	pub kind: TableKind,
	pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
	#[default]
	Asc,
	Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
	pub column: String,
	#[serde(default)]
	pub direction: SortDirection,
}

/// `column LIKE pattern` restriction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
	pub column: String,
	pub pattern: String,
}

/// A window of rows from one table, in rowid order unless `order_by` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
	pub name: String,
	pub table: String,
	#[serde(default)]
	pub offset: u64,
	pub limit: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub order_by: Option<OrderBy>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountQuery {
	pub name: String,
	pub table: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowQuery {
	pub name: String,
	pub table: String,
	pub rowid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobQuery {
	pub name: String,
	pub table: String,
	pub rowid: i64,
	pub column: String,
}

/// One cell. Blob contents are fetched separately through `get_blob`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
	Null,
	Integer(i64),
	Real(f64),
	Text(String),
	Blob { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
	pub rowid: i64,
	pub values: Vec<CellValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
	pub columns: Vec<String>,
	pub offset: u64,
	pub rows: Vec<Row>,
}

/// Where a surface finds the raw document bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentRef {
	/// Bytes transferred with the payload.
	Inline { bytes: BufferRef },
	/// Byte source exposed by the host; the surface releases it when done.
	Stream { source: RemoteRef },
}

/// What a surface needs to render a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPayload {
	pub filename: String,
	/// Import generation the surface should query against.
	pub generation: u64,
	pub size: u64,
	pub editable: bool,
	pub size_limit: u64,
	pub content: ContentRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadParams {
	pub bytes: BufferRef,
	pub suggested_name: String,
	#[serde(default)]
	pub open_after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceUpdateParams {
	pub filename: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadChunkParams {
	pub max_len: u32,
}

/// A chunk of a byte stream; `None` marks the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
	pub chunk: Option<BufferRef>,
}
