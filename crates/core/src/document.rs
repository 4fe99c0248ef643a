//! Open documents and their change listeners.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::session::{Session, SessionState};

/// Lifecycle notifications of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
	/// The first generation finished importing.
	Ready { generation: u64 },
	/// A refresh swapped in a new generation.
	Changed { generation: u64 },
	/// The session failed; reported once per failure.
	Failed { message: String },
	Closed,
}

type Listener = Arc<dyn Fn(&DocumentEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerList {
	next_id: u64,
	entries: Vec<(u64, Listener)>,
}

/// Ordered subscriber list shared by a document and its session.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
	list: Arc<Mutex<ListenerList>>,
}

impl Listeners {
	pub(crate) fn subscribe(&self, listener: Listener) -> Subscription {
		let mut list = self.list.lock();
		list.next_id += 1;
		let id = list.next_id;
		list.entries.push((id, listener));
		Subscription {
			id,
			list: Arc::downgrade(&self.list),
		}
	}

	/// Delivers `event` synchronously, in subscription order.
	///
	/// Listeners run outside the lock and may subscribe or unsubscribe; such
	/// changes apply from the next event on.
	pub(crate) fn emit(&self, event: &DocumentEvent) {
		let snapshot: Vec<Listener> = self.list.lock().entries.iter().map(|(_, l)| Arc::clone(l)).collect();
		for listener in snapshot {
			listener(event);
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.list.lock().entries.len()
	}
}

/// Keeps a listener subscribed; dropping it unsubscribes.
#[must_use = "the listener is removed when the subscription is dropped"]
pub struct Subscription {
	id: u64,
	list: Weak<Mutex<ListenerList>>,
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(list) = self.list.upgrade() {
			list.lock().entries.retain(|(id, _)| *id != self.id);
		}
	}
}

/// A file opened for viewing: its URI, current session and listeners.
pub struct Document {
	uri: String,
	session: Session,
	listeners: Listeners,
}

impl std::fmt::Debug for Document {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Document")
			.field("uri", &self.uri)
			.field("state", &self.session.state())
			.field("listeners", &self.listeners.len())
			.finish()
	}
}

impl Document {
	pub(crate) fn new(session: Session, listeners: Listeners) -> Self {
		Self {
			uri: session.uri().to_string(),
			session,
			listeners,
		}
	}

	pub fn uri(&self) -> &str {
		&self.uri
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	pub fn state(&self) -> SessionState {
		self.session.state()
	}

	pub fn generation(&self) -> Option<u64> {
		self.session.generation()
	}

	/// Registers `listener` for this document's events.
	pub fn subscribe(&self, listener: impl Fn(&DocumentEvent) + Send + Sync + 'static) -> Subscription {
		self.listeners.subscribe(Arc::new(listener))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delivers_in_order_and_unsubscribes_on_drop() {
		let listeners = Listeners::default();
		let seen = Arc::new(Mutex::new(Vec::new()));

		let first = {
			let seen = Arc::clone(&seen);
			listeners.subscribe(Arc::new(move |e: &DocumentEvent| seen.lock().push(format!("a:{e:?}"))))
		};
		let second = {
			let seen = Arc::clone(&seen);
			listeners.subscribe(Arc::new(move |e: &DocumentEvent| seen.lock().push(format!("b:{e:?}"))))
		};

		listeners.emit(&DocumentEvent::Ready { generation: 1 });
		drop(first);
		listeners.emit(&DocumentEvent::Closed);

		assert_eq!(
			*seen.lock(),
			vec![
				"a:Ready { generation: 1 }".to_string(),
				"b:Ready { generation: 1 }".to_string(),
				"b:Closed".to_string(),
			]
		);
		assert_eq!(listeners.len(), 1);
		drop(second);
		assert_eq!(listeners.len(), 0);
	}

	#[test]
	fn listener_may_unsubscribe_itself() {
		let listeners = Listeners::default();
		let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
		let calls = Arc::new(Mutex::new(0));

		let subscription = {
			let slot = Arc::clone(&slot);
			let calls = Arc::clone(&calls);
			listeners.subscribe(Arc::new(move |_: &DocumentEvent| {
				*calls.lock() += 1;
				slot.lock().take();
			}))
		};
		*slot.lock() = Some(subscription);

		listeners.emit(&DocumentEvent::Closed);
		listeners.emit(&DocumentEvent::Closed);
		assert_eq!(*calls.lock(), 1);
	}
}
