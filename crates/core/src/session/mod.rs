//! One worker bound to one document.
//!
//! A session moves through `Spawning → Ready → (Refreshing → Ready)* → Closed`;
//! `Failed` is reachable from any state but `Closed`. Each load produces a new
//! [`Generation`] (worker plus imported database). Readers clone the current
//! generation's `Arc`, so a refresh swaps the pointer without disturbing reads
//! already in flight; the old worker goes away when its last reader drops it.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sqlview_protocol::{BlobQuery, CountQuery, ImportOptions, Page, PageQuery, Row, RowQuery, TableInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::stream::{CappedSource, SizedSource};
use crate::api::{ByteSource, Content, InitialContent};
use crate::config::Config;
use crate::document::{DocumentEvent, Listeners};
use crate::error::{Error, Result};
use crate::files::{FileProvider, FileStat};
use crate::launcher::{WorkerHandle, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Spawning,
	Ready,
	Refreshing,
	Closed,
	Failed,
}

/// Collaborators shared by every session of an orchestrator.
#[derive(Clone)]
pub struct SessionContext {
	pub config: Arc<Config>,
	pub launcher: Arc<dyn WorkerLauncher>,
	pub files: Arc<dyn FileProvider>,
}

/// A worker with one imported database.
#[derive(Debug)]
pub struct Generation {
	pub number: u64,
	pub worker: WorkerHandle,
	/// Name the database was imported under.
	pub db_name: String,
	pub size: u64,
	/// Imported bytes, kept when small enough to hand to surfaces inline.
	pub inline: Option<Bytes>,
	/// The file as it was when imported; absent for backup content.
	pub source: Option<FileStat>,
}

enum SourceContent {
	Bytes(Bytes),
	Stream(Box<dyn ByteSource>),
}

struct StateCell {
	state: SessionState,
	failure: Option<String>,
}

struct SessionInner {
	uri: String,
	filename: String,
	ctx: SessionContext,
	listeners: Listeners,
	state: Mutex<StateCell>,
	current: RwLock<Option<Arc<Generation>>>,
	last_generation: AtomicU64,
	/// Serializes loads; reads never take it.
	reload: tokio::sync::Mutex<()>,
}

/// Handle to a session; clones share it.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

fn filename_of(uri: &str) -> String {
	Path::new(uri)
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or(uri)
		.to_string()
}

/// Maps a failed import to the session-level error reported to callers.
fn import_error(err: Error) -> Error {
	match err {
		Error::ImportTooLarge { .. } | Error::ImportFailed(_) | Error::WorkerCrashed(_) => err,
		err if err.is_transport_closed() => Error::WorkerCrashed("worker exited during import".to_string()),
		Error::Query(detail) => Error::ImportFailed(detail),
		err => Error::ImportFailed(err.to_string()),
	}
}

impl Session {
	pub(crate) fn new(uri: impl Into<String>, ctx: SessionContext, listeners: Listeners) -> Self {
		let uri = uri.into();
		Self {
			inner: Arc::new(SessionInner {
				filename: filename_of(&uri),
				uri,
				ctx,
				listeners,
				state: Mutex::new(StateCell {
					state: SessionState::Spawning,
					failure: None,
				}),
				current: RwLock::new(None),
				last_generation: AtomicU64::new(0),
				reload: tokio::sync::Mutex::new(()),
			}),
		}
	}

	pub fn uri(&self) -> &str {
		&self.inner.uri
	}

	pub fn filename(&self) -> &str {
		&self.inner.filename
	}

	pub fn state(&self) -> SessionState {
		self.inner.state.lock().state
	}

	/// Message of the last failure, while the session is `Failed`.
	pub fn failure(&self) -> Option<String> {
		self.inner.state.lock().failure.clone()
	}

	/// Number of the generation reads currently go to.
	pub fn generation(&self) -> Option<u64> {
		self.inner.current.read().as_ref().map(|g| g.number)
	}

	/// Imports the first generation. `backup` replaces the file's content.
	pub async fn open(&self, backup: Option<Bytes>) -> Result<u64> {
		let _reload = self.inner.reload.lock().await;
		if self.state() == SessionState::Closed {
			return Err(Error::SessionClosed);
		}
		self.load(backup, true).await
	}

	/// Re-imports the file into a new worker and swaps it in.
	///
	/// The previous generation keeps serving until the swap. Allowed from
	/// `Failed`; a session that was never opened is opened instead.
	pub async fn refresh(&self) -> Result<u64> {
		let _reload = self.inner.reload.lock().await;
		let first = {
			let mut cell = self.inner.state.lock();
			match cell.state {
				SessionState::Closed => return Err(Error::SessionClosed),
				SessionState::Spawning => true,
				_ => {
					cell.state = SessionState::Refreshing;
					false
				}
			}
		};
		self.load(None, first).await
	}

	async fn load(&self, backup: Option<Bytes>, first: bool) -> Result<u64> {
		let number = self.inner.last_generation.fetch_add(1, Ordering::AcqRel) + 1;
		match self.build_generation(number, backup).await {
			Ok(generation) => self.install(generation, first).await,
			Err(err) => {
				warn!(target = "sqlview.session", uri = %self.inner.uri, generation = number, error = %err, "load failed");
				self.fail(err.to_string());
				Err(err)
			}
		}
	}

	async fn build_generation(&self, number: u64, backup: Option<Bytes>) -> Result<Generation> {
		let config = &self.inner.ctx.config;
		let files = &self.inner.ctx.files;
		let uri = &self.inner.uri;

		let (size, source, wal) = match &backup {
			Some(bytes) => (bytes.len() as u64, None, None),
			None => {
				let stat = files.stat(uri).await?;
				(stat.size, Some(stat), files.read_wal(uri).await?)
			}
		};
		if size > config.max_import_size {
			return Err(Error::ImportTooLarge {
				size,
				limit: config.max_import_size,
			});
		}

		let content = match backup {
			Some(bytes) => SourceContent::Bytes(bytes),
			None if size <= config.stream_threshold => SourceContent::Bytes(files.read(uri).await?),
			None => SourceContent::Stream(Box::new(CappedSource::new(
				files.open_stream(uri).await?,
				config.chunk_size(),
			))),
		};

		let label = format!("{}#{number}", self.inner.filename);
		let worker = self.inner.ctx.launcher.launch(&label).await.map_err(import_error)?;
		let db_name = self.inner.filename.clone();
		let options = ImportOptions {
			max_size: config.max_import_size,
			read_only: true,
		};

		debug!(target = "sqlview.session", uri = %uri, generation = number, size, streamed = matches!(content, SourceContent::Stream(_)), "importing");
		let (imported, inline) = match content {
			SourceContent::Bytes(bytes) => {
				let result = worker
					.api()
					.import_from_buffer(&db_name, bytes.clone(), wal, options)
					.await;
				(result, Some(bytes))
			}
			SourceContent::Stream(source) => {
				let result = worker
					.api()
					.import_from_stream(&db_name, source, size, wal, options)
					.await;
				(result, None)
			}
		};

		if let Err(err) = imported {
			worker.terminate().await;
			return Err(import_error(err));
		}

		Ok(Generation {
			number,
			worker,
			db_name,
			size,
			inline,
			source,
		})
	}

	async fn install(&self, generation: Generation, first: bool) -> Result<u64> {
		let generation = Arc::new(generation);
		let number = generation.number;

		let previous = {
			let mut cell = self.inner.state.lock();
			if cell.state == SessionState::Closed {
				None
			} else {
				cell.state = SessionState::Ready;
				cell.failure = None;
				Some(self.inner.current.write().replace(Arc::clone(&generation)))
			}
		};
		let Some(previous) = previous else {
			generation.worker.terminate().await;
			return Err(Error::SessionClosed);
		};

		self.watch_worker(&generation);
		info!(target = "sqlview.session", uri = %self.inner.uri, generation = number, size = generation.size, "generation ready");
		// Readers still holding the old generation keep its worker alive.
		drop(previous);

		let event = if first {
			DocumentEvent::Ready { generation: number }
		} else {
			DocumentEvent::Changed { generation: number }
		};
		self.inner.listeners.emit(&event);
		Ok(number)
	}

	/// Moves to `Failed` unless already there or closed; listeners hear it once.
	fn fail(&self, message: String) {
		self.fail_when(message, |_| true);
	}

	/// Fails the session only while generation `number` is the one installed.
	fn fail_generation(&self, number: u64, message: String) -> bool {
		self.fail_when(message, |current| current == Some(number))
	}

	fn fail_when(&self, message: String, applies: impl FnOnce(Option<u64>) -> bool) -> bool {
		{
			let mut cell = self.inner.state.lock();
			if matches!(cell.state, SessionState::Closed | SessionState::Failed) {
				return false;
			}
			// Checked under the state lock so a concurrent install cannot slip in.
			let mut current = self.inner.current.write();
			if !applies(current.as_ref().map(|g| g.number)) {
				return false;
			}
			cell.state = SessionState::Failed;
			cell.failure = Some(message.clone());
			current.take();
		}
		self.inner.listeners.emit(&DocumentEvent::Failed { message });
		true
	}

	/// Fails the session if the current generation's worker goes away on its own.
	fn watch_worker(&self, generation: &Arc<Generation>) {
		let Some(connection) = generation.worker.connection().cloned() else {
			return;
		};
		let number = generation.number;
		let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			connection.closed().await;
			let Some(inner) = session.upgrade() else {
				return;
			};
			let session = Session { inner };
			let message = Error::WorkerCrashed(format!("worker for generation {number} exited")).to_string();
			if session.fail_generation(number, message) {
				warn!(target = "sqlview.session", uri = %session.inner.uri, generation = number, "worker exited unexpectedly");
			}
		});
	}

	/// The generation reads go to, or why there is none.
	pub fn current(&self) -> Result<Arc<Generation>> {
		if let Some(generation) = self.inner.current.read().as_ref() {
			return Ok(Arc::clone(generation));
		}
		let cell = self.inner.state.lock();
		match cell.state {
			SessionState::Closed => Err(Error::SessionClosed),
			_ => Err(Error::SessionFailed(
				cell.failure.clone().unwrap_or_else(|| "document is not loaded".to_string()),
			)),
		}
	}

	/// What a surface needs to render the current generation.
	///
	/// Content that was streamed in is streamed again from the file, which
	/// must still be the one the generation imported. A file changed since
	/// fails with `SessionFailed` until the session is refreshed.
	pub async fn initial_content(&self, editable: bool) -> Result<InitialContent> {
		let generation = self.current()?;
		let content = match &generation.inline {
			Some(bytes) => Content::Inline(bytes.clone()),
			None => Content::Stream(self.stream_generation(&generation).await?),
		};
		Ok(InitialContent {
			filename: self.inner.filename.clone(),
			generation: generation.number,
			size: generation.size,
			editable,
			size_limit: self.inner.ctx.config.max_import_size,
			content,
		})
	}

	async fn stream_generation(&self, generation: &Generation) -> Result<Box<dyn ByteSource>> {
		let files = &self.inner.ctx.files;
		let stream = files.open_stream(&self.inner.uri).await?;
		let now = files.stat(&self.inner.uri).await?;
		if generation.source != Some(now) {
			debug!(target = "sqlview.session", uri = %self.inner.uri, generation = generation.number, "file changed since import");
			return Err(Error::SessionFailed(format!(
				"{} changed on disk since generation {} was imported",
				self.inner.filename, generation.number
			)));
		}
		Ok(Box::new(SizedSource::new(stream, generation.size)))
	}

	pub async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		let generation = self.current()?;
		generation.worker.api().list_tables(&generation.db_name, cancel).await
	}

	pub async fn get_page(&self, mut query: PageQuery, cancel: &CancellationToken) -> Result<Page> {
		let generation = self.current()?;
		query.name = generation.db_name.clone();
		generation.worker.api().get_page(query, cancel).await
	}

	pub async fn get_count(&self, mut query: CountQuery, cancel: &CancellationToken) -> Result<u64> {
		let generation = self.current()?;
		query.name = generation.db_name.clone();
		generation.worker.api().get_count(query, cancel).await
	}

	pub async fn get_by_row_id(&self, mut query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>> {
		let generation = self.current()?;
		query.name = generation.db_name.clone();
		generation.worker.api().get_by_row_id(query, cancel).await
	}

	pub async fn get_blob(&self, mut query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes> {
		let generation = self.current()?;
		query.name = generation.db_name.clone();
		generation.worker.api().get_blob(query, cancel).await
	}

	pub async fn export_database(&self, cancel: &CancellationToken) -> Result<Bytes> {
		let generation = self.current()?;
		generation.worker.api().export_database(&generation.db_name, cancel).await
	}

	/// Closes and terminates the current worker; later reads fail with `SessionClosed`.
	pub async fn close(&self) {
		{
			let mut cell = self.inner.state.lock();
			if cell.state == SessionState::Closed {
				return;
			}
			cell.state = SessionState::Closed;
		}
		let current = self.inner.current.write().take();
		if let Some(generation) = current {
			generation.worker.terminate().await;
		}
		debug!(target = "sqlview.session", uri = %self.inner.uri, "session closed");
		self.inner.listeners.emit(&DocumentEvent::Closed);
	}
}
