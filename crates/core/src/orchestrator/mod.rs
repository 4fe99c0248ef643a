//! Owns documents, their sessions and the surfaces showing them.
//!
//! ```text
//! ┌──────────┐   HostApi    ┌──────────────┐  WorkerApi  ┌────────┐
//! │ surface  │ ───────────▶ │ Orchestrator │ ──────────▶ │ worker │
//! │ (UiApi)  │ ◀─────────── │  documents   │             └────────┘
//! └──────────┘ force_update │  registry    │
//!                           └──────────────┘
//! ```
//!
//! Each surface gets its own connection whose root object is a host facade
//! bound to the surface's document. Change notifications fan out to every
//! surface of a document concurrently; a surface that fails to take the
//! update is logged and skipped.

mod facade;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use sqlview_runtime::{Connection, TransportParts};
use tracing::{debug, info, warn};

use crate::api::{HostService, UiApi, UiClient};
use crate::config::Config;
use crate::document::{Document, Listeners};
use crate::entitlements::Entitlements;
use crate::error::{Error, Result};
use crate::files::FileProvider;
use crate::launcher::WorkerLauncher;
use crate::registry::{Surface, SurfaceId, SurfaceRegistry};
use crate::session::{Session, SessionContext};

use self::facade::HostFacade;

/// Entry point of the host: open documents, attach surfaces, react to changes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
	inner: Arc<Inner>,
}

struct Inner {
	ctx: SessionContext,
	entitlements: Arc<dyn Entitlements>,
	documents: Mutex<HashMap<String, Arc<Document>>>,
	registry: SurfaceRegistry,
}

impl Orchestrator {
	pub fn new(
		config: Config,
		launcher: Arc<dyn WorkerLauncher>,
		files: Arc<dyn FileProvider>,
		entitlements: Arc<dyn Entitlements>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				ctx: SessionContext {
					config: Arc::new(config),
					launcher,
					files,
				},
				entitlements,
				documents: Mutex::new(HashMap::new()),
				registry: SurfaceRegistry::new(),
			}),
		}
	}

	pub fn config(&self) -> &Config {
		&self.inner.ctx.config
	}

	pub fn registry(&self) -> &SurfaceRegistry {
		&self.inner.registry
	}

	pub fn document(&self, uri: &str) -> Result<Arc<Document>> {
		self.inner.document(uri)
	}

	/// URIs of open documents.
	pub fn documents(&self) -> Vec<String> {
		self.inner.documents.lock().keys().cloned().collect()
	}

	/// Whether surfaces may edit: configured and entitled.
	pub fn editable(&self) -> bool {
		self.inner.editable()
	}

	/// Opens `uri`, importing it into a fresh worker.
	///
	/// An already open document is returned as is. `backup` bytes replace the
	/// file content for the first generation. A document whose import fails
	/// stays open in the `Failed` state so surfaces can request a refresh.
	pub async fn open_document(&self, uri: &str, backup: Option<Bytes>) -> Result<Arc<Document>> {
		let document = {
			let mut documents = self.inner.documents.lock();
			if let Some(existing) = documents.get(uri) {
				return Ok(Arc::clone(existing));
			}
			let listeners = Listeners::default();
			let session = Session::new(uri, self.inner.ctx.clone(), listeners.clone());
			let document = Arc::new(Document::new(session, listeners));
			documents.insert(uri.to_string(), Arc::clone(&document));
			document
		};

		info!(target = "sqlview.session", uri, backup = backup.is_some(), "opening document");
		document.session().open(backup).await?;
		Ok(document)
	}

	/// Serves a surface of `uri` over `parts` and registers it.
	///
	/// The surface reaches the host facade as the connection's root and is
	/// unregistered when the connection closes.
	pub fn attach_surface(&self, uri: &str, id: impl Into<SurfaceId>, parts: TransportParts) -> Result<Arc<Connection>> {
		let id = id.into();
		self.inner.document(uri)?;

		let connection = Arc::new(Connection::with_label(parts, format!("surface:{id}")));
		connection.expose_root(HostService::new(Arc::new(HostFacade::new(
			Arc::downgrade(&self.inner),
			uri,
			id.clone(),
		))));
		let runner = Arc::clone(&connection);
		tokio::spawn(async move { runner.run().await });

		let ui: Arc<dyn UiApi> = Arc::new(UiClient::new(connection.root()));
		let previous = self.inner.registry.register(Surface {
			id: id.clone(),
			uri: uri.to_string(),
			ui,
			connection: Some(Arc::clone(&connection)),
		});
		if let Some(stale) = previous.and_then(|p| p.connection) {
			stale.close();
		}
		debug!(target = "sqlview.session", uri, surface = %id, "surface attached");

		let inner = Arc::downgrade(&self.inner);
		let watched = Arc::clone(&connection);
		tokio::spawn(async move {
			watched.closed().await;
			let Some(inner) = inner.upgrade() else {
				return;
			};
			if inner.registry.unregister_connection(&id, &watched) {
				debug!(target = "sqlview.session", surface = %id, "surface disconnected");
			}
		});

		Ok(connection)
	}

	/// Registers a surface reached without a connection of its own.
	pub fn register_surface(&self, surface: Surface) -> Result<()> {
		self.inner.document(&surface.uri)?;
		self.inner.registry.register(surface);
		Ok(())
	}

	/// Forgets a surface and closes its connection.
	pub fn surface_closed(&self, id: &SurfaceId) -> Result<()> {
		let surface = self.inner.registry.unregister(id)?;
		if let Some(connection) = surface.connection {
			connection.close();
		}
		Ok(())
	}

	/// Re-imports `uri` and tells every surface to update.
	pub async fn refresh_document(&self, uri: &str) -> Result<u64> {
		self.inner.refresh(uri, None).await
	}

	/// Reacts to a change on disk. Changes to files that are not open are ignored.
	pub async fn file_changed(&self, uri: &str) -> Result<()> {
		match self.inner.refresh(uri, None).await {
			Ok(_) | Err(Error::DocumentNotFound(_)) => Ok(()),
			Err(err) => Err(err),
		}
	}

	/// Closes the document's session and disconnects its surfaces.
	pub async fn close_document(&self, uri: &str) -> Result<()> {
		let document = self
			.inner
			.documents
			.lock()
			.remove(uri)
			.ok_or_else(|| Error::DocumentNotFound(uri.to_string()))?;
		self.inner.close(&document).await;
		Ok(())
	}

	/// Re-activates entitlement providers and lets surfaces pick up new capabilities.
	pub async fn license_changed(&self) -> Result<()> {
		self.inner.entitlements.activate_providers().await?;
		let documents: Vec<Arc<Document>> = self.inner.documents.lock().values().cloned().collect();
		for document in documents {
			self.inner
				.notify_surfaces(document.uri(), document.session().filename(), None)
				.await;
		}
		Ok(())
	}

	/// Serialized state of the document's first surface, if it has one.
	pub async fn backup(&self, uri: &str) -> Result<Option<Bytes>> {
		self.inner.document(uri)?;
		match self.inner.registry.first_surface(uri) {
			Some(surface) => Ok(Some(surface.ui.get_serialized_state_for_save().await?)),
			None => Ok(None),
		}
	}

	/// Closes every document.
	pub async fn shutdown(&self) {
		let documents: Vec<Arc<Document>> = self.inner.documents.lock().drain().map(|(_, d)| d).collect();
		for document in documents {
			self.inner.close(&document).await;
		}
		debug!(target = "sqlview.session", "orchestrator shut down");
	}
}

impl Inner {
	fn document(&self, uri: &str) -> Result<Arc<Document>> {
		self.documents
			.lock()
			.get(uri)
			.cloned()
			.ok_or_else(|| Error::DocumentNotFound(uri.to_string()))
	}

	fn editable(&self) -> bool {
		self.ctx.config.editable && self.entitlements.allows_editing()
	}

	/// Refreshes `uri` and notifies its surfaces, skipping `except`.
	async fn refresh(&self, uri: &str, except: Option<&SurfaceId>) -> Result<u64> {
		let document = self.document(uri)?;
		let generation = document.session().refresh().await?;
		self.notify_surfaces(uri, document.session().filename(), except).await;
		Ok(generation)
	}

	/// Sends `force_update` to each surface of `uri` once; returns how many took it.
	async fn notify_surfaces(&self, uri: &str, filename: &str, except: Option<&SurfaceId>) -> usize {
		let surfaces: Vec<Surface> = self
			.registry
			.surfaces(uri)
			.into_iter()
			.filter(|s| Some(&s.id) != except)
			.collect();

		let results = join_all(surfaces.iter().map(|s| s.ui.force_update(filename))).await;

		let mut delivered = 0;
		for (surface, result) in surfaces.iter().zip(results) {
			match result {
				Ok(()) => delivered += 1,
				Err(err) => {
					warn!(target = "sqlview.session", uri, surface = %surface.id, error = %err, "force_update failed")
				}
			}
		}
		debug!(target = "sqlview.session", uri, delivered, "surfaces notified");
		delivered
	}

	async fn close(&self, document: &Document) {
		document.session().close().await;
		for surface in self.registry.remove_document(document.uri()) {
			if let Some(connection) = surface.connection {
				connection.close();
			}
		}
		info!(target = "sqlview.session", uri = document.uri(), "document closed");
	}
}
