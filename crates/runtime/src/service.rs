//! Callee side of a connection.
//!
//! Exposed objects implement [`Dispatch`]: a single entry point receiving the
//! method name and the call's [`Payload`]. Typed service adapters decode the
//! params, invoke the implementation and encode the result.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use sqlview_protocol::{BufferRef, Payload, RemoteRef};
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::transport::BoxFuture;

/// An object that can be exposed over a connection.
pub trait Dispatch: Send + Sync + 'static {
	/// Handles one incoming call.
	///
	/// The returned future may be dropped before completion when the caller
	/// cancels or the connection closes; `request.cancel` fires first.
	fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Payload>>;
}

/// One incoming call as seen by the callee.
pub struct Request {
	pub method: String,
	pub payload: Payload,
	/// Fires when the caller cancels this call or the connection closes.
	pub cancel: CancellationToken,
	pub connection: Arc<Connection>,
}

impl Request {
	/// Decodes the call's JSON params.
	pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
		self.payload
			.decode()
			.map_err(|e| Error::Protocol(format!("invalid params for {}: {e}", self.method)))
	}

	/// Moves a transferred buffer out of the call's payload.
	pub fn take_buffer(&mut self, buffer: BufferRef) -> Result<Bytes> {
		Ok(self.payload.take_buffer(buffer)?)
	}

	pub fn take_optional(&mut self, buffer: Option<BufferRef>) -> Result<Option<Bytes>> {
		Ok(self.payload.take_optional(buffer)?)
	}

	/// Proxy for an object the caller passed by reference.
	pub fn channel(&self, reference: RemoteRef) -> Channel {
		self.connection.channel(reference)
	}

	/// Error for a method this object does not implement.
	pub fn unknown_method(&self) -> Error {
		Error::Protocol(format!("unknown method '{}'", self.method))
	}
}
