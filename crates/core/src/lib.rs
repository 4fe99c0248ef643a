//! sqlview: view SQLite files through an isolated worker.
//!
//! The host owns an [`Orchestrator`]. Opening a document starts a worker,
//! imports the file into it and keeps one [`Session`] per document. UI
//! surfaces attach over their own connections and call the host facade
//! ([`HostApi`]); the host pushes `force_update` to them when the file changes.
//!
//! # Examples
//!
//! ```ignore
//! use std::sync::Arc;
//! use sqlview::{Config, InProcessLauncher, LocalFiles, Orchestrator, StaticEntitlements, WorkerApi};
//!
//! #[tokio::main]
//! async fn main() -> sqlview::Result<()> {
//!     let launcher = InProcessLauncher::new(|| -> Arc<dyn WorkerApi> { sqlview_worker::SqliteWorker::new() });
//!     let orchestrator = Orchestrator::new(
//!         Config::load(None)?,
//!         Arc::new(launcher),
//!         Arc::new(LocalFiles::with_default_downloads()),
//!         Arc::new(StaticEntitlements::default()),
//!     );
//!
//!     let document = orchestrator.open_document("chinook.db", None).await?;
//!     let tables = document.session().list_tables(&Default::default()).await?;
//!     println!("{} tables", tables.len());
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod document;
pub mod entitlements;
pub mod error;
pub mod files;
pub mod launcher;
pub mod orchestrator;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{
	ByteSource, BytesSource, Content, HostApi, HostClient, HostService, InitialContent, ReaderSource, RemoteByteSource,
	UiApi, UiClient, UiService, WorkerApi, WorkerClient, WorkerService, read_to_end,
};
pub use config::{Config, WorkerMode};
pub use document::{Document, DocumentEvent, Subscription};
pub use entitlements::{Entitlements, StaticEntitlements};
pub use error::{Error, ErrorClass, Result};
pub use files::{FileProvider, FileStat, LocalFiles};
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use orchestrator::Orchestrator;
pub use registry::{Surface, SurfaceId, SurfaceRegistry};
pub use session::{Generation, Session, SessionContext, SessionState};
pub use sqlview_protocol as protocol;
pub use sqlview_runtime as runtime;
