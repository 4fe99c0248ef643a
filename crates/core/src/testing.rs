//! Test doubles for sessions and the orchestrator.
//!
//! [`FakeWorker`] serves a synthetic `items` table so orchestration can be
//! tested without SQLite; it still runs behind a real connection when
//! launched through [`launcher`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sqlview_protocol::{
	BlobQuery, CellValue, ColumnInfo, CountQuery, ImportOptions, Page, PageQuery, Row, RowQuery, TableInfo, TableKind,
};
use sqlview_runtime::Error as RpcError;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::api::{ByteSource, BytesSource, UiApi, WorkerApi, read_to_end};
use crate::error::{Error, Result};
use crate::files::{FileProvider, FileStat};
use crate::launcher::{InProcessLauncher, WorkerLauncher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportRecord {
	pub name: String,
	pub size: u64,
	pub streamed: bool,
	pub wal: bool,
}

/// Bumps a counter when dropped, so abandoned handlers can be observed.
struct CountOnDrop(Arc<AtomicUsize>);

impl CountOnDrop {
	fn disarm(self) {
		std::mem::forget(self);
	}
}

impl Drop for CountOnDrop {
	fn drop(&mut self) {
		self.0.fetch_add(1, Ordering::SeqCst);
	}
}

pub(crate) struct FakeWorker {
	tag: String,
	rows: u64,
	/// When set, `get_page` waits for a permit before answering.
	gate: Option<Arc<Semaphore>>,
	pub imports: Mutex<Vec<ImportRecord>>,
	pub abandoned: Arc<AtomicUsize>,
	pub closed: AtomicBool,
}

impl FakeWorker {
	pub fn new(rows: u64) -> Arc<Self> {
		Self::tagged("w", rows, None)
	}

	pub fn tagged(tag: &str, rows: u64, gate: Option<Arc<Semaphore>>) -> Arc<Self> {
		Arc::new(Self {
			tag: tag.to_string(),
			rows,
			gate,
			imports: Mutex::new(Vec::new()),
			abandoned: Arc::new(AtomicUsize::new(0)),
			closed: AtomicBool::new(false),
		})
	}

	fn row(&self, rowid: i64) -> Row {
		Row {
			rowid,
			values: vec![CellValue::Integer(rowid), CellValue::Text(format!("{}:{rowid}", self.tag))],
		}
	}

	fn record(&self, name: &str, size: u64, streamed: bool, wal: bool) {
		self.imports.lock().push(ImportRecord {
			name: name.to_string(),
			size,
			streamed,
			wal,
		});
	}
}

#[async_trait]
impl WorkerApi for FakeWorker {
	async fn import_from_buffer(&self, name: &str, bytes: Bytes, wal: Option<Bytes>, options: ImportOptions) -> Result<()> {
		if bytes.len() as u64 > options.max_size {
			return Err(Error::ImportTooLarge {
				size: bytes.len() as u64,
				limit: options.max_size,
			});
		}
		if bytes.starts_with(b"corrupt") {
			return Err(Error::ImportFailed("file is not a database".to_string()));
		}
		self.record(name, bytes.len() as u64, false, wal.is_some());
		Ok(())
	}

	async fn import_from_stream(
		&self,
		name: &str,
		source: Box<dyn ByteSource>,
		_size: u64,
		wal: Option<Bytes>,
		options: ImportOptions,
	) -> Result<()> {
		let bytes = read_to_end(source.as_ref(), 64 * 1024, options.max_size).await?;
		self.record(name, bytes.len() as u64, true, wal.is_some());
		Ok(())
	}

	async fn list_tables(&self, _name: &str, _cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		let column = |name: &str, decl: &str, primary_key: bool| ColumnInfo {
			name: name.to_string(),
			decl_type: Some(decl.to_string()),
			primary_key,
			not_null: primary_key,
		};
		Ok(vec![TableInfo {
			name: "items".to_string(),
			kind: TableKind::Table,
			columns: vec![column("id", "INTEGER", true), column("label", "TEXT", false)],
		}])
	}

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page> {
		if query.table != "items" {
			return Err(Error::Query(format!("no such table: {}", query.table)));
		}
		if let Some(gate) = &self.gate {
			let guard = CountOnDrop(Arc::clone(&self.abandoned));
			tokio::select! {
				_ = cancel.cancelled() => return Err(Error::Rpc(RpcError::Canceled)),
				permit = gate.acquire() => {
					if permit.is_err() {
						return Err(Error::Query("gate closed".to_string()));
					}
				}
			}
			guard.disarm();
		}
		let start = query.offset + 1;
		let end = (query.offset + u64::from(query.limit)).min(self.rows);
		Ok(Page {
			columns: vec!["id".to_string(), "label".to_string()],
			offset: query.offset,
			rows: (start..=end).map(|rowid| self.row(rowid as i64)).collect(),
		})
	}

	async fn get_count(&self, _query: CountQuery, _cancel: &CancellationToken) -> Result<u64> {
		Ok(self.rows)
	}

	async fn get_by_row_id(&self, query: RowQuery, _cancel: &CancellationToken) -> Result<Option<Row>> {
		Ok((query.rowid >= 1 && query.rowid as u64 <= self.rows).then(|| self.row(query.rowid)))
	}

	/// Column `slow` never answers; the handler waits to be cancelled.
	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes> {
		if query.column == "slow" {
			let _abandoned = CountOnDrop(Arc::clone(&self.abandoned));
			cancel.cancelled().await;
			return Err(Error::Rpc(RpcError::Canceled));
		}
		Ok(Bytes::from(vec![query.rowid as u8; 16]))
	}

	async fn export_database(&self, name: &str, _cancel: &CancellationToken) -> Result<Bytes> {
		Ok(Bytes::from(format!("export:{name}:{}", self.tag)))
	}

	async fn close(&self) -> Result<()> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

pub(crate) type Workers = Arc<Mutex<Vec<Arc<FakeWorker>>>>;

/// In-process launcher creating fake workers tagged `w1`, `w2`, ...
///
/// Only the first worker is gated by `gate`.
pub(crate) fn launcher(rows: u64, gate: Option<Arc<Semaphore>>) -> (Arc<dyn WorkerLauncher>, Workers) {
	let workers: Workers = Arc::new(Mutex::new(Vec::new()));
	let created = Arc::clone(&workers);
	let launcher = InProcessLauncher::new(move || {
		let mut created = created.lock();
		let index = created.len() + 1;
		let gate = if index == 1 { gate.clone() } else { None };
		let worker = FakeWorker::tagged(&format!("w{index}"), rows, gate);
		created.push(Arc::clone(&worker));
		worker as Arc<dyn WorkerApi>
	});
	(Arc::new(launcher), workers)
}

/// Files held in memory; `set` simulates an edit on disk.
#[derive(Default)]
pub(crate) struct MemoryFiles {
	files: Mutex<HashMap<String, Bytes>>,
	/// Bumped on every `set`; reported as the modification time.
	versions: Mutex<HashMap<String, u64>>,
	wal: Mutex<HashMap<String, Bytes>>,
	pub downloads: Mutex<Vec<(String, Bytes)>>,
}

impl MemoryFiles {
	pub fn with(uri: &str, bytes: impl Into<Bytes>) -> Arc<Self> {
		let files = Arc::new(Self::default());
		files.set(uri, bytes);
		files
	}

	pub fn set(&self, uri: &str, bytes: impl Into<Bytes>) {
		self.files.lock().insert(uri.to_string(), bytes.into());
		*self.versions.lock().entry(uri.to_string()).or_default() += 1;
	}

	pub fn set_wal(&self, uri: &str, bytes: impl Into<Bytes>) {
		self.wal.lock().insert(uri.to_string(), bytes.into());
	}

	fn get(&self, uri: &str) -> Result<Bytes> {
		self.files
			.lock()
			.get(uri)
			.cloned()
			.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, uri.to_string()).into())
	}
}

#[async_trait]
impl FileProvider for MemoryFiles {
	async fn stat(&self, uri: &str) -> Result<FileStat> {
		let size = self.get(uri)?.len() as u64;
		let version = self.versions.lock().get(uri).copied().unwrap_or_default();
		Ok(FileStat {
			size,
			modified: Some(UNIX_EPOCH + Duration::from_secs(version)),
		})
	}

	async fn read(&self, uri: &str) -> Result<Bytes> {
		self.get(uri)
	}

	async fn open_stream(&self, uri: &str) -> Result<Box<dyn ByteSource>> {
		Ok(Box::new(BytesSource::new(self.get(uri)?)))
	}

	async fn read_wal(&self, uri: &str) -> Result<Option<Bytes>> {
		Ok(self.wal.lock().get(uri).cloned())
	}

	async fn save_download(&self, bytes: Bytes, suggested_name: &str) -> Result<PathBuf> {
		self.downloads.lock().push((suggested_name.to_string(), bytes));
		Ok(PathBuf::from(suggested_name))
	}
}

/// Surface that records what the host asked of it.
#[derive(Default)]
pub(crate) struct RecordingUi {
	pub updates: Mutex<Vec<String>>,
	pub state: Bytes,
}

impl RecordingUi {
	pub fn with_state(state: &'static [u8]) -> Arc<Self> {
		Arc::new(Self {
			updates: Mutex::new(Vec::new()),
			state: Bytes::from_static(state),
		})
	}

	pub fn update_count(&self) -> usize {
		self.updates.lock().len()
	}
}

#[async_trait]
impl UiApi for RecordingUi {
	async fn force_update(&self, filename: &str) -> Result<()> {
		self.updates.lock().push(filename.to_string());
		Ok(())
	}

	async fn get_serialized_state_for_save(&self) -> Result<Bytes> {
		Ok(self.state.clone())
	}
}
