//! Starting and stopping database workers.
//!
//! A [`WorkerLauncher`] produces one [`WorkerHandle`] per session generation.
//! [`InProcessLauncher`] serves the worker on a task over an in-memory
//! transport; [`ProcessLauncher`] spawns the worker executable and talks to it
//! over its stdio.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlview_runtime::transport::{frame_limit_for, memory};
use sqlview_runtime::{Connection, WorkerCommand, WorkerProcess};
use tracing::{debug, warn};

use crate::api::{WorkerApi, WorkerClient, WorkerService};
use crate::error::Result;

/// How long a worker gets to drop its databases before the connection is cut.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
	/// Starts a worker; `label` names it in logs.
	async fn launch(&self, label: &str) -> Result<WorkerHandle>;
}

/// A running worker owned by one session generation.
///
/// Dropping the handle closes the connection, which ends the worker.
pub struct WorkerHandle {
	label: String,
	api: Arc<dyn WorkerApi>,
	connection: Option<Arc<Connection>>,
	process: Mutex<Option<WorkerProcess>>,
}

impl std::fmt::Debug for WorkerHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WorkerHandle")
			.field("label", &self.label)
			.field("remote", &self.connection.is_some())
			.finish()
	}
}

impl WorkerHandle {
	/// Wraps an implementation called directly, without a connection.
	pub fn local(label: impl Into<String>, api: Arc<dyn WorkerApi>) -> Self {
		Self {
			label: label.into(),
			api,
			connection: None,
			process: Mutex::new(None),
		}
	}

	/// Wraps the root of a worker reached through `connection`.
	pub fn remote(label: impl Into<String>, connection: Arc<Connection>, process: Option<WorkerProcess>) -> Self {
		Self {
			label: label.into(),
			api: Arc::new(WorkerClient::new(connection.root())),
			connection: Some(connection),
			process: Mutex::new(process),
		}
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn api(&self) -> &Arc<dyn WorkerApi> {
		&self.api
	}

	pub fn connection(&self) -> Option<&Arc<Connection>> {
		self.connection.as_ref()
	}

	/// Asks the worker to drop its databases, then ends it.
	///
	/// Pending calls fail with `TransportClosed`. Safe to call more than once.
	pub async fn terminate(&self) {
		let process = self.process.lock().take();
		shut_down(&self.label, &self.api, self.connection.as_ref(), process).await;
	}
}

/// The graceful path shared by [`WorkerHandle::terminate`] and drop.
async fn shut_down(
	label: &str,
	api: &Arc<dyn WorkerApi>,
	connection: Option<&Arc<Connection>>,
	process: Option<WorkerProcess>,
) {
	match connection {
		Some(connection) => {
			if !connection.is_closed() {
				match tokio::time::timeout(CLOSE_TIMEOUT, api.close()).await {
					Ok(Ok(())) => {}
					Ok(Err(err)) => debug!(target = "sqlview.session", worker = %label, error = %err, "worker close failed"),
					Err(_) => debug!(target = "sqlview.session", worker = %label, "worker close timed out"),
				}
			}
			connection.close();
		}
		None => {
			if let Err(err) = api.close().await {
				debug!(target = "sqlview.session", worker = %label, error = %err, "worker close failed");
			}
		}
	}

	if let Some(process) = process {
		if let Err(err) = process.shutdown().await {
			warn!(target = "sqlview.session", worker = %label, error = %err, "failed to stop worker process");
		}
	}
	debug!(target = "sqlview.session", worker = %label, "worker terminated");
}

/// A handle dropped without [`terminate`](WorkerHandle::terminate) still shuts
/// its worker down gracefully on the current runtime, so the worker can remove
/// its files before exiting. Outside a runtime the connection is only closed
/// and a worker process is killed.
impl Drop for WorkerHandle {
	fn drop(&mut self) {
		let Some(connection) = self.connection.take() else {
			return;
		};
		let process = self.process.get_mut().take();
		if connection.is_closed() && process.is_none() {
			return;
		}

		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				let label = std::mem::take(&mut self.label);
				let api = Arc::clone(&self.api);
				debug!(target = "sqlview.session", worker = %label, "worker released; shutting it down");
				runtime.spawn(async move { shut_down(&label, &api, Some(&connection), process).await });
			}
			Err(_) => connection.close(),
		}
	}
}

type WorkerFactory = dyn Fn() -> Arc<dyn WorkerApi> + Send + Sync;

/// Serves each worker on a background task of the current runtime.
///
/// Calls still cross a real connection, so payloads are encoded and
/// cancellation travels as messages exactly as with a worker process.
pub struct InProcessLauncher {
	factory: Arc<WorkerFactory>,
}

impl InProcessLauncher {
	pub fn new(factory: impl Fn() -> Arc<dyn WorkerApi> + Send + Sync + 'static) -> Self {
		Self {
			factory: Arc::new(factory),
		}
	}
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
	async fn launch(&self, label: &str) -> Result<WorkerHandle> {
		let (host_side, worker_side) = memory::pair();

		let server = Arc::new(Connection::with_label(worker_side, format!("{label}/worker")));
		server.expose_root(WorkerService::new((self.factory)()));
		tokio::spawn(async move { server.run().await });

		let connection = Connection::spawn(host_side, label);
		debug!(target = "sqlview.session", worker = label, "in-process worker started");
		Ok(WorkerHandle::remote(label, connection, None))
	}
}

/// Spawns a worker process per launch.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
	command: WorkerCommand,
}

impl ProcessLauncher {
	pub fn new(command: WorkerCommand) -> Self {
		Self { command }
	}

	/// Launcher for the worker found by [`sqlview_runtime::locate_worker`].
	pub fn locate() -> Result<Self> {
		Ok(Self::new(sqlview_runtime::locate_worker()?))
	}

	/// Sizes the worker pipe for imports of up to `max_import_size` bytes.
	pub fn with_import_limit(mut self, max_import_size: u64) -> Self {
		self.command = self.command.max_frame_len(frame_limit_for(max_import_size));
		self
	}

	pub fn command(&self) -> &WorkerCommand {
		&self.command
	}
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
	async fn launch(&self, label: &str) -> Result<WorkerHandle> {
		let (process, parts) = WorkerProcess::launch(&self.command).await?;
		let pid = process.id();
		let connection = Connection::spawn(parts, label);
		debug!(target = "sqlview.session", worker = label, ?pid, "worker process started");
		Ok(WorkerHandle::remote(label, connection, Some(process)))
	}
}
