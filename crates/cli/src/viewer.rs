//! The CLI acting as a UI surface of one document.
//!
//! Commands never talk to the worker directly: they attach to the
//! orchestrator over an in-memory connection and use the host facade, the
//! same way a sandboxed surface would.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sqlview::runtime::Connection;
use sqlview::runtime::transport::memory;
use sqlview::{
	Config, HostClient, InProcessLauncher, LocalFiles, Orchestrator, ProcessLauncher, StaticEntitlements, UiApi,
	UiService, WorkerApi, WorkerLauncher, WorkerMode,
};
use sqlview_worker::SqliteWorker;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::Cli;
use crate::error::Result;

const SURFACE_ID: &str = "cli";

/// Loads the configuration file and applies command-line overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<Config> {
	let mut config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
		Some(path) => format!("loading config from {}", path.display()),
		None => "loading config".to_string(),
	})?;

	if cli.isolated {
		config.worker = WorkerMode::Process;
	}
	if let Some(max_size) = cli.max_size {
		config.max_import_size = max_size;
	}
	Ok(config)
}

fn launcher(config: &Config) -> Result<Arc<dyn WorkerLauncher>> {
	match config.worker {
		WorkerMode::InProcess => Ok(Arc::new(InProcessLauncher::new(|| -> Arc<dyn WorkerApi> {
			SqliteWorker::new()
		}))),
		WorkerMode::Process => Ok(Arc::new(
			ProcessLauncher::locate()?.with_import_limit(config.max_import_size),
		)),
	}
}

/// What this surface is looking at; returned as its saved state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub table: Option<String>,
	pub offset: u64,
	pub limit: u32,
}

/// [`UiApi`] for a terminal: updates are queued for the command loop.
struct ConsoleUi {
	view: ViewState,
	updates: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl UiApi for ConsoleUi {
	async fn force_update(&self, filename: &str) -> sqlview::Result<()> {
		info!(target = "sqlview.session", filename, "document changed");
		// The command may have stopped listening; the update is moot then.
		let _ = self.updates.send(filename.to_string());
		Ok(())
	}

	async fn get_serialized_state_for_save(&self) -> sqlview::Result<Bytes> {
		Ok(Bytes::from(serde_json::to_vec(&self.view)?))
	}
}

pub struct Viewer {
	orchestrator: Orchestrator,
	files: Arc<LocalFiles>,
	uri: String,
	host: HostClient,
	connection: Arc<Connection>,
	updates: mpsc::UnboundedReceiver<String>,
}

impl Viewer {
	/// Opens `file` and attaches this process as a surface of it.
	pub async fn open(config: Config, file: &Path, view: ViewState) -> Result<Self> {
		let path = std::fs::canonicalize(file).with_context(|| format!("cannot open {}", file.display()))?;
		let uri = path.to_string_lossy().into_owned();

		let files = Arc::new(LocalFiles::with_default_downloads());
		let orchestrator = Orchestrator::new(
			config.clone(),
			launcher(&config)?,
			files.clone(),
			Arc::new(StaticEntitlements::default()),
		);

		if let Err(err) = orchestrator.open_document(&uri, None).await {
			orchestrator.shutdown().await;
			return Err(err.into());
		}

		let (host_side, surface_side) = memory::pair();
		let (updates_tx, updates) = mpsc::unbounded_channel();
		let connection = Arc::new(Connection::with_label(surface_side, SURFACE_ID));
		connection.expose_root(UiService::new(Arc::new(ConsoleUi {
			view,
			updates: updates_tx,
		})));
		orchestrator.attach_surface(&uri, SURFACE_ID, host_side)?;
		let runner = Arc::clone(&connection);
		tokio::spawn(async move { runner.run().await });

		debug!(target = "sqlview.session", uri = %uri, worker = ?config.worker, "viewer attached");
		Ok(Self {
			host: HostClient::connect(&connection),
			orchestrator,
			files,
			uri,
			connection,
			updates,
		})
	}

	pub fn host(&self) -> &HostClient {
		&self.host
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn path(&self) -> &Path {
		Path::new(&self.uri)
	}

	pub fn orchestrator(&self) -> &Orchestrator {
		&self.orchestrator
	}

	/// Where a download named `name` lands.
	pub fn download_path(&self, name: &str) -> PathBuf {
		self.files.download_dir().join(name)
	}

	/// Waits for the next `force_update` from the host.
	pub async fn next_update(&mut self) -> Option<String> {
		self.updates.recv().await
	}

	pub async fn close(self) {
		self.connection.close();
		self.orchestrator.shutdown().await;
	}
}
