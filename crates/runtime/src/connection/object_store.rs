//! Registry of objects a connection exposes to its peer.
//!
//! Uses [`DashMap`] so handler tasks and proxy drops can release objects
//! concurrently with dispatch lookups. Exposing the same object twice yields
//! the same id and counts one more reference; the object is withdrawn when
//! every reference has been released. The root object can never be released
//! by the peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlview_protocol::ObjectId;

use crate::service::Dispatch;

struct Exposed {
	object: Arc<dyn Dispatch>,
	refs: usize,
}

/// Thread-safe registry of exposed objects by id.
///
/// Both maps are locked identities first, then objects.
pub struct ObjectStore {
	objects: DashMap<ObjectId, Exposed>,
	identities: DashMap<usize, ObjectId>,
	next_id: AtomicU32,
}

impl Default for ObjectStore {
	fn default() -> Self {
		Self::new()
	}
}

fn identity(object: &Arc<dyn Dispatch>) -> usize {
	Arc::as_ptr(object) as *const () as usize
}

impl ObjectStore {
	pub fn new() -> Self {
		Self {
			objects: DashMap::new(),
			identities: DashMap::new(),
			next_id: AtomicU32::new(1),
		}
	}

	/// Installs the object reachable without a reference, replacing any previous root.
	pub fn set_root(&self, object: Arc<dyn Dispatch>) {
		let exposed = Exposed {
			object: Arc::clone(&object),
			refs: 1,
		};
		if let Some(previous) = self.objects.insert(ObjectId::ROOT, exposed) {
			self.identities.remove(&identity(&previous.object));
		}
		self.identities.insert(identity(&object), ObjectId::ROOT);
	}

	/// Registers `object` and returns its id.
	///
	/// An object that is already exposed keeps its id and gains a reference.
	pub fn insert(&self, object: Arc<dyn Dispatch>) -> ObjectId {
		let slot = self
			.identities
			.entry(identity(&object))
			.or_insert_with(|| ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed)));
		let id = *slot;
		self.objects
			.entry(id)
			.and_modify(|exposed| exposed.refs += 1)
			.or_insert_with(|| Exposed { object, refs: 1 });
		id
	}

	/// Drops one reference to an exposed object, withdrawing it at zero.
	///
	/// Returns false for the root or an unknown id.
	pub fn release(&self, id: ObjectId) -> bool {
		if id.is_root() {
			return false;
		}
		let Some(key) = self.objects.get(&id).map(|exposed| identity(&exposed.object)) else {
			return false;
		};
		let slot = self.identities.entry(key);
		let removed = match self.objects.entry(id) {
			Entry::Occupied(mut exposed) => {
				exposed.get_mut().refs -= 1;
				if exposed.get().refs > 0 {
					return true;
				}
				exposed.remove()
			}
			Entry::Vacant(_) => return false,
		};
		if let Entry::Occupied(slot) = slot {
			if *slot.get() == id {
				slot.remove();
			}
		}
		// Destructors may release further objects; every lock is gone by now.
		drop(removed);
		true
	}

	/// Outstanding references to `id`, zero when it is not exposed.
	pub fn refs(&self, id: ObjectId) -> usize {
		self.objects.get(&id).map_or(0, |exposed| exposed.refs)
	}

	pub fn get(&self, id: ObjectId) -> Option<Arc<dyn Dispatch>> {
		self.objects.get(&id).map(|r| Arc::clone(&r.object))
	}

	pub fn contains(&self, id: ObjectId) -> bool {
		self.objects.contains_key(&id)
	}

	/// Number of exposed objects, root included.
	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	/// Drops every exposed object.
	///
	/// Objects are dropped outside the map locks since their destructors may
	/// release further objects.
	pub fn clear(&self) {
		self.identities.clear();
		let ids: Vec<ObjectId> = self.objects.iter().map(|r| *r.key()).collect();
		for id in ids {
			let removed = self.objects.remove(&id);
			drop(removed);
		}
	}
}
