//! Caller-side proxy for one remote object.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlview_protocol::{ObjectId, Payload};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Proxy for an object exposed by the peer.
///
/// Clones share one handle. The remote object is released exactly once: on the
/// first [`dispose`](Self::dispose) or when the last clone drops, whichever
/// comes first. The peer's root object is never released.
#[derive(Clone)]
pub struct Channel {
	inner: Arc<ChannelInner>,
}

struct ChannelInner {
	id: ObjectId,
	connection: Arc<Connection>,
	disposed: AtomicBool,
}

impl ChannelInner {
	fn release(&self) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		if !self.id.is_root() {
			self.connection.send_release(self.id);
		}
	}
}

impl Drop for ChannelInner {
	fn drop(&mut self) {
		self.release();
	}
}

impl std::fmt::Debug for Channel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Channel")
			.field("id", &self.inner.id)
			.field("connection", &self.inner.connection.label())
			.field("disposed", &self.is_disposed())
			.finish()
	}
}

impl Channel {
	pub(crate) fn new(connection: Arc<Connection>, id: ObjectId) -> Self {
		Self {
			inner: Arc::new(ChannelInner {
				id,
				connection,
				disposed: AtomicBool::new(false),
			}),
		}
	}

	pub fn id(&self) -> ObjectId {
		self.inner.id
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.inner.connection
	}

	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::Acquire)
	}

	/// Invokes `method` with a prepared payload.
	pub async fn call(&self, method: &str, payload: Payload, cancel: Option<&CancellationToken>) -> Result<Payload> {
		if self.is_disposed() {
			return Err(Error::Protocol(format!("proxy for {} was disposed", self.inner.id)));
		}
		self.inner.connection.call(self.inner.id, method, payload, cancel).await
	}

	/// Invokes `method` with JSON-only params and decodes a JSON-only result.
	pub async fn send<P, R>(&self, method: &str, params: &P) -> Result<R>
	where
		P: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let payload = Payload::encode(params)?;
		let result = self.call(method, payload, None).await?;
		Ok(result.decode()?)
	}

	/// Like [`send`](Self::send), ignoring the result.
	pub async fn send_no_result<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<()> {
		let payload = Payload::encode(params)?;
		self.call(method, payload, None).await?;
		Ok(())
	}

	/// Releases the remote object now. Later calls fail; repeated disposal is a no-op.
	pub fn dispose(&self) {
		self.inner.release();
	}
}
