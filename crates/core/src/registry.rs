//! Which UI surfaces show which document.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlview_runtime::Connection;

use crate::api::UiApi;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(String);

impl SurfaceId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SurfaceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SurfaceId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

/// A registered surface and the means to reach it.
#[derive(Clone)]
pub struct Surface {
	pub id: SurfaceId,
	pub uri: String,
	pub ui: Arc<dyn UiApi>,
	/// Connection the surface talks through, when it is remote.
	pub connection: Option<Arc<Connection>>,
}

impl fmt::Debug for Surface {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Surface")
			.field("id", &self.id)
			.field("uri", &self.uri)
			.field("connection", &self.connection.as_ref().map(|c| c.label().to_string()))
			.finish()
	}
}

#[derive(Default)]
struct RegistryState {
	by_surface: HashMap<SurfaceId, Surface>,
	/// Surfaces per document, in registration order.
	by_document: HashMap<String, Vec<SurfaceId>>,
}

impl RegistryState {
	fn detach(&mut self, id: &SurfaceId) -> Option<Surface> {
		let surface = self.by_surface.remove(id)?;
		if let Some(ids) = self.by_document.get_mut(&surface.uri) {
			ids.retain(|other| other != id);
			if ids.is_empty() {
				self.by_document.remove(&surface.uri);
			}
		}
		Some(surface)
	}
}

/// Surface bookkeeping, owned by an orchestrator.
#[derive(Default)]
pub struct SurfaceRegistry {
	state: Mutex<RegistryState>,
}

impl SurfaceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `surface` under its document, moving it if it was under another.
	///
	/// Returns the registration it replaced.
	pub fn register(&self, surface: Surface) -> Option<Surface> {
		let mut state = self.state.lock();
		let previous = state.detach(&surface.id);
		state
			.by_document
			.entry(surface.uri.clone())
			.or_default()
			.push(surface.id.clone());
		state.by_surface.insert(surface.id.clone(), surface);
		previous
	}

	pub fn unregister(&self, id: &SurfaceId) -> Result<Surface> {
		self.state
			.lock()
			.detach(id)
			.ok_or_else(|| Error::SurfaceNotFound(id.to_string()))
	}

	/// Unregisters `id` only while it is still bound to `connection`.
	pub(crate) fn unregister_connection(&self, id: &SurfaceId, connection: &Arc<Connection>) -> bool {
		let mut state = self.state.lock();
		let same = state
			.by_surface
			.get(id)
			.and_then(|s| s.connection.as_ref())
			.is_some_and(|c| Arc::ptr_eq(c, connection));
		same && state.detach(id).is_some()
	}

	/// Removes every surface of `uri`.
	pub(crate) fn remove_document(&self, uri: &str) -> Vec<Surface> {
		let mut state = self.state.lock();
		let ids = state.by_document.remove(uri).unwrap_or_default();
		ids.iter().filter_map(|id| state.by_surface.remove(id)).collect()
	}

	/// Snapshot of the surfaces showing `uri`, in registration order.
	pub fn surfaces(&self, uri: &str) -> Vec<Surface> {
		let state = self.state.lock();
		state
			.by_document
			.get(uri)
			.map(|ids| ids.iter().filter_map(|id| state.by_surface.get(id).cloned()).collect())
			.unwrap_or_default()
	}

	/// Calls `f` for each surface of `uri`; the registry is not locked meanwhile.
	pub fn for_each_surface(&self, uri: &str, mut f: impl FnMut(&Surface)) {
		for surface in self.surfaces(uri) {
			f(&surface);
		}
	}

	pub fn first_surface(&self, uri: &str) -> Option<Surface> {
		let state = self.state.lock();
		let id = state.by_document.get(uri)?.first()?;
		state.by_surface.get(id).cloned()
	}

	pub fn document_of(&self, id: &SurfaceId) -> Option<String> {
		self.state.lock().by_surface.get(id).map(|s| s.uri.clone())
	}

	pub fn len(&self) -> usize {
		self.state.lock().by_surface.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
