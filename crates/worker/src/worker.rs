//! SQLite-backed [`WorkerApi`].
//!
//! Each import lands in its own file under a private temporary directory.
//! Reads open a fresh read-only connection on a blocking thread, so they run
//! concurrently with each other and never see a half-finished import. A
//! canceled read interrupts its connection and returns at once; the blocking
//! thread winds down on its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use sqlview::{ByteSource, Error, Result, WorkerApi};
use sqlview_protocol::{BlobQuery, CountQuery, ImportOptions, Page, PageQuery, Row, RowQuery, TableInfo};
use sqlview_runtime::Error as RpcError;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OnceCell, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::query::{self, QueryError, QueryResult};

/// Chunk size requested from a streamed import source.
const IMPORT_CHUNK: usize = 1024 * 1024;

/// One imported database file. The file is removed when the last reader lets go.
#[derive(Debug)]
struct Database {
	path: PathBuf,
	size: u64,
}

impl Drop for Database {
	fn drop(&mut self) {
		remove_quietly(&self.path);
		remove_quietly(&wal_path(&self.path));
	}
}

fn wal_path(path: &Path) -> PathBuf {
	let mut wal = path.as_os_str().to_owned();
	wal.push("-wal");
	PathBuf::from(wal)
}

fn remove_quietly(path: &Path) {
	if let Err(err) = std::fs::remove_file(path) {
		if err.kind() != std::io::ErrorKind::NotFound {
			warn!(target = "sqlview.worker", path = %path.display(), error = %err, "failed to remove file");
		}
	}
}

/// Folds a WAL sidecar into the main file and checks that the result opens.
fn prepare(path: &Path) -> QueryResult<()> {
	let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
	let _mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
	let _objects: i64 = conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))?;
	Ok(())
}

fn too_large(size: u64, options: &ImportOptions) -> Result<()> {
	if size > options.max_size {
		Err(Error::ImportTooLarge {
			size,
			limit: options.max_size,
		})
	} else {
		Ok(())
	}
}

#[derive(Debug)]
pub struct SqliteWorker {
	dir: OnceCell<TempDir>,
	next_file: AtomicU64,
	databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl SqliteWorker {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			dir: OnceCell::new(),
			next_file: AtomicU64::new(1),
			databases: Mutex::new(HashMap::new()),
		})
	}

	/// Directory imports are written to, once the first import has created it.
	pub fn data_dir(&self) -> Option<&Path> {
		self.dir.get().map(TempDir::path)
	}

	/// Names of the databases currently imported.
	pub fn databases(&self) -> Vec<String> {
		let mut names: Vec<String> = self.databases.lock().keys().cloned().collect();
		names.sort();
		names
	}

	async fn dir(&self) -> Result<&Path> {
		let dir = self
			.dir
			.get_or_try_init(|| async { tempfile::Builder::new().prefix("sqlview-").tempdir() })
			.await?;
		Ok(dir.path())
	}

	async fn next_path(&self, stem: &str) -> Result<PathBuf> {
		let n = self.next_file.fetch_add(1, Ordering::Relaxed);
		Ok(self.dir().await?.join(format!("{stem}-{n}.db")))
	}

	fn database(&self, name: &str) -> Result<Arc<Database>> {
		self.databases
			.lock()
			.get(name)
			.cloned()
			.ok_or_else(|| Error::Query(format!("no database named '{name}'")))
	}

	/// Writes the WAL sidecar if any, validates the file and publishes it as `name`.
	async fn finish_import(&self, name: &str, path: PathBuf, wal: Option<Bytes>) -> Result<()> {
		let database = Database {
			size: tokio::fs::metadata(&path).await?.len(),
			path,
		};
		if let Some(wal) = wal {
			tokio::fs::write(wal_path(&database.path), &wal).await?;
		}

		let checked = database.path.clone();
		let prepared = tokio::task::spawn_blocking(move || prepare(&checked))
			.await
			.map_err(|err| Error::ImportFailed(format!("import task failed: {err}")))?;
		if let Err(err) = prepared {
			warn!(target = "sqlview.worker", name, error = %err, "import rejected");
			return Err(Error::ImportFailed(err.to_string()));
		}

		info!(target = "sqlview.worker", name, size = database.size, "database imported");
		self.databases.lock().insert(name.to_string(), Arc::new(database));
		Ok(())
	}

	/// Runs `f` against a fresh connection to `name` on a blocking thread.
	///
	/// A canceled read interrupts the statement and returns once the thread is done.
	async fn read<T, F>(&self, name: &str, flags: OpenFlags, cancel: &CancellationToken, f: F) -> Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&Connection, &AtomicBool) -> QueryResult<T> + Send + 'static,
	{
		if cancel.is_cancelled() {
			return Err(Error::Rpc(RpcError::Canceled));
		}

		let database = self.database(name)?;
		let abort = Arc::new(AtomicBool::new(false));
		let (handle_tx, mut handle_rx) = oneshot::channel();

		let mut task = {
			let abort = Arc::clone(&abort);
			tokio::task::spawn_blocking(move || -> QueryResult<T> {
				let conn = Connection::open_with_flags(&database.path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
				let _ = handle_tx.send(conn.get_interrupt_handle());
				if abort.load(Ordering::SeqCst) {
					return Err(QueryError::Interrupted);
				}
				f(&conn, &abort)
			})
		};

		tokio::select! {
			joined = &mut task => match joined {
				Ok(result) => Ok(result?),
				Err(err) => Err(Error::Query(format!("query task failed: {err}"))),
			},
			_ = cancel.cancelled() => {
				abort.store(true, Ordering::SeqCst);
				if let Ok(handle) = handle_rx.try_recv() {
					handle.interrupt();
				}
				// Callers clean up files the task writes only once it is gone.
				let _ = task.await;
				debug!(target = "sqlview.worker", name, "read canceled");
				Err(Error::Rpc(RpcError::Canceled))
			}
		}
	}
}

#[async_trait]
impl WorkerApi for SqliteWorker {
	async fn import_from_buffer(&self, name: &str, bytes: Bytes, wal: Option<Bytes>, options: ImportOptions) -> Result<()> {
		too_large(bytes.len() as u64, &options)?;

		let path = self.next_path("import").await?;
		tokio::fs::write(&path, &bytes).await?;
		self.finish_import(name, path, wal).await
	}

	async fn import_from_stream(
		&self,
		name: &str,
		source: Box<dyn ByteSource>,
		size: u64,
		wal: Option<Bytes>,
		options: ImportOptions,
	) -> Result<()> {
		too_large(size, &options)?;

		let path = self.next_path("import").await?;
		let written = async {
			let mut file = tokio::fs::File::create(&path).await?;
			let mut total = 0u64;
			while let Some(chunk) = source.read_chunk(IMPORT_CHUNK).await? {
				total += chunk.len() as u64;
				too_large(total, &options)?;
				file.write_all(&chunk).await?;
			}
			file.flush().await?;
			Ok::<_, Error>(total)
		}
		.await;
		drop(source);

		match written {
			Ok(total) => {
				debug!(target = "sqlview.worker", name, size = total, "stream received");
				self.finish_import(name, path, wal).await
			}
			Err(err) => {
				remove_quietly(&path);
				Err(err)
			}
		}
	}

	async fn list_tables(&self, name: &str, cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		self.read(name, OpenFlags::SQLITE_OPEN_READ_ONLY, cancel, |conn, _| {
			query::list_tables(conn)
		})
		.await
	}

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page> {
		let name = query.name.clone();
		self.read(&name, OpenFlags::SQLITE_OPEN_READ_ONLY, cancel, move |conn, abort| {
			query::page(conn, &query, abort)
		})
		.await
	}

	async fn get_count(&self, query: CountQuery, cancel: &CancellationToken) -> Result<u64> {
		let name = query.name.clone();
		self.read(&name, OpenFlags::SQLITE_OPEN_READ_ONLY, cancel, move |conn, _| {
			query::count(conn, &query)
		})
		.await
	}

	async fn get_by_row_id(&self, query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>> {
		let name = query.name.clone();
		self.read(&name, OpenFlags::SQLITE_OPEN_READ_ONLY, cancel, move |conn, _| {
			query::row(conn, &query)
		})
		.await
	}

	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes> {
		let name = query.name.clone();
		self.read(&name, OpenFlags::SQLITE_OPEN_READ_ONLY, cancel, move |conn, _| {
			query::blob(conn, &query)
		})
		.await
	}

	async fn export_database(&self, name: &str, cancel: &CancellationToken) -> Result<Bytes> {
		let target = self.next_path("export").await?;
		let exported = self
			.read(name, OpenFlags::SQLITE_OPEN_READ_WRITE, cancel, {
				let target = target.clone();
				move |conn, _| {
					conn.execute("VACUUM INTO ?1", [target.to_string_lossy()])?;
					Ok(Bytes::from(std::fs::read(&target)?))
				}
			})
			.await;
		remove_quietly(&target);

		let bytes = exported?;
		debug!(target = "sqlview.worker", name, size = bytes.len(), "database exported");
		Ok(bytes)
	}

	async fn close(&self) -> Result<()> {
		let dropped: Vec<Arc<Database>> = self.databases.lock().drain().map(|(_, db)| db).collect();
		debug!(target = "sqlview.worker", databases = dropped.len(), "worker closed");
		Ok(())
	}
}
