//! RPC connection over one endpoint.
//!
//! A connection is symmetric: it issues calls to objects the peer exposes and
//! serves calls against objects it exposes itself. It handles:
//! - Allocating correlation ids unique among in-flight calls
//! - Correlating responses with pending calls, in any order
//! - Cancellation in both directions
//! - Failing every pending call once when the endpoint closes
//!
//! # Message Flow
//!
//! 1. Caller invokes [`Connection::call`] (usually through a [`Channel`])
//! 2. A fresh id is registered with a oneshot sender and the call is queued
//! 3. The writer task hands the packet to the transport
//! 4. The run loop receives the response and completes the oneshot
//! 5. If the caller gives up first, a [`Message::Cancel`] is sent instead and
//!    the late response, should it still arrive, is dropped

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use sqlview_protocol::{Call, Message, ObjectId, Packet, Payload, RemoteRef, Response};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::service::{Dispatch, Request};
use crate::transport::TransportParts;

mod object_store;

#[cfg(test)]
mod tests;

pub use object_store::ObjectStore;

type Callback = oneshot::Sender<Result<Payload>>;

#[derive(Default)]
struct CallTable {
	pending: HashMap<u32, Callback>,
	/// Ids whose caller gave up; a response for them is expected and dropped.
	abandoned: HashSet<u32>,
}

struct CallState {
	table: Mutex<CallTable>,
	outbound_tx: mpsc::UnboundedSender<Packet>,
}

impl CallState {
	fn send(&self, packet: Packet) -> Result<()> {
		self.outbound_tx.send(packet).map_err(|_| Error::TransportClosed)
	}
}

/// RAII guard abandoning a call whose future is dropped before it resolves.
struct CancelGuard {
	id: u32,
	cancellable: bool,
	calls: Arc<CallState>,
	completed: bool,
}

impl CancelGuard {
	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		let removed = {
			let mut table = self.calls.table.lock();
			let removed = table.pending.remove(&self.id).is_some();
			if removed {
				table.abandoned.insert(self.id);
			}
			removed
		};

		if removed {
			trace!(target = "sqlview.rpc", id = self.id, "call abandoned by caller");
			if self.cancellable {
				let _ = self.calls.send(Packet::new(Message::Cancel { id: self.id }));
			}
		}
	}
}

/// Future returned by [`Connection::call`] with automatic cancellation on drop.
struct ResponseFuture {
	rx: oneshot::Receiver<Result<Payload>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Payload>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::TransportClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// RPC connection over one endpoint.
pub struct Connection {
	label: String,
	last_id: AtomicU32,
	calls: Arc<CallState>,
	transport: Mutex<Option<TransportParts>>,
	outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
	objects: ObjectStore,
	/// Cancellation tokens of calls the peer may still cancel.
	incoming: DashMap<u32, CancellationToken>,
	/// Set as soon as the connection starts closing; handler tokens are its children.
	closing: CancellationToken,
	/// Set once pending calls have been failed and exposed objects dropped.
	closed: CancellationToken,
	shut_down: AtomicBool,
}

impl Connection {
	/// Creates a connection over `parts`. Nothing flows until [`run`](Self::run) is polled.
	pub fn new(parts: TransportParts) -> Self {
		Self::with_label(parts, "connection")
	}

	pub fn with_label(parts: TransportParts, label: impl Into<String>) -> Self {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		Self {
			label: label.into(),
			last_id: AtomicU32::new(0),
			calls: Arc::new(CallState {
				table: Mutex::new(CallTable::default()),
				outbound_tx,
			}),
			transport: Mutex::new(Some(parts)),
			outbound_rx: Mutex::new(Some(outbound_rx)),
			objects: ObjectStore::new(),
			incoming: DashMap::new(),
			closing: CancellationToken::new(),
			closed: CancellationToken::new(),
			shut_down: AtomicBool::new(false),
		}
	}

	/// Creates a connection and drives it on a background task.
	pub fn spawn(parts: TransportParts, label: impl Into<String>) -> Arc<Self> {
		let connection = Arc::new(Self::with_label(parts, label));
		let runner = Arc::clone(&connection);
		tokio::spawn(async move { runner.run().await });
		connection
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	/// Proxy for the peer's root object.
	pub fn root(self: &Arc<Self>) -> Channel {
		Channel::new(Arc::clone(self), ObjectId::ROOT)
	}

	/// Proxy for an object the peer passed by reference.
	pub fn channel(self: &Arc<Self>, reference: RemoteRef) -> Channel {
		Channel::new(Arc::clone(self), reference.id)
	}

	/// Exposes the object the peer reaches through [`root`](Self::root).
	pub fn expose_root(&self, object: Arc<dyn Dispatch>) {
		self.objects.set_root(object);
	}

	/// Exposes `object` until the peer releases it or the connection closes.
	pub fn expose(&self, object: Arc<dyn Dispatch>) -> RemoteRef {
		let id = self.objects.insert(object);
		trace!(target = "sqlview.rpc", label = %self.label, object = %id, "object exposed");
		RemoteRef { id }
	}

	/// Exposes `object` for as long as the returned guard lives.
	pub fn expose_scoped(self: &Arc<Self>, object: Arc<dyn Dispatch>) -> ExposedGuard {
		let reference = self.expose(object);
		ExposedGuard {
			reference,
			connection: Arc::clone(self),
		}
	}

	/// Number of calls issued by this side still awaiting a response.
	pub fn pending_calls(&self) -> usize {
		self.calls.table.lock().pending.len()
	}

	/// Number of objects this side exposes, root included.
	pub fn exposed_objects(&self) -> usize {
		self.objects.len()
	}

	pub fn is_closed(&self) -> bool {
		self.closing.is_cancelled()
	}

	/// Resolves once the connection has fully shut down.
	pub async fn closed(&self) {
		self.closed.cancelled().await
	}

	/// Tears the connection down; every pending call fails with [`Error::TransportClosed`].
	pub fn close(&self) {
		self.closing.cancel();
		let never_ran = self.transport.lock().take().is_some();
		if never_ran {
			self.shutdown();
		}
	}

	/// Invokes `method` on the peer's object `target`.
	///
	/// With a `cancel` token the call is cancellable: firing the token resolves
	/// the call with [`Error::Canceled`] at once and tells the peer to stop.
	/// Dropping the returned future has the same effect.
	pub async fn call(
		&self,
		target: ObjectId,
		method: &str,
		payload: Payload,
		cancel: Option<&CancellationToken>,
	) -> Result<Payload> {
		if cancel.is_some_and(CancellationToken::is_cancelled) {
			return Err(Error::Canceled);
		}

		let (tx, rx) = oneshot::channel();
		let id = {
			let mut table = self.calls.table.lock();
			if self.closing.is_cancelled() {
				return Err(Error::TransportClosed);
			}
			let id = self.next_id(&table);
			table.pending.insert(id, tx);
			id
		};

		let cancellable = cancel.is_some();
		let response = ResponseFuture {
			rx,
			guard: CancelGuard {
				id,
				cancellable,
				calls: Arc::clone(&self.calls),
				completed: false,
			},
		};

		let (params, buffers) = payload.into_wire();
		let call = Call {
			id,
			target,
			method: method.to_string(),
			params,
			cancellable,
		};
		trace!(target = "sqlview.rpc", label = %self.label, id, object = %target, method, buffers = buffers.len(), "call");
		self.calls.send(Packet::with_buffers(Message::Call(call), buffers))?;

		match cancel {
			Some(token) => {
				tokio::select! {
					biased;
					result = response => result,
					_ = token.cancelled() => Err(Error::Canceled),
				}
			}
			None => response.await,
		}
	}

	/// Sends a release for an object the peer exposed.
	pub(crate) fn send_release(&self, target: ObjectId) {
		if self.calls.send(Packet::new(Message::Release { target })).is_err() {
			trace!(target = "sqlview.rpc", label = %self.label, object = %target, "release skipped; connection closed");
		}
	}

	fn next_id(&self, table: &CallTable) -> u32 {
		loop {
			let id = self.last_id.fetch_add(1, Ordering::Relaxed);
			if !table.pending.contains_key(&id) && !table.abandoned.contains(&id) {
				return id;
			}
		}
	}

	/// Runs the message loop until the endpoint closes or [`close`](Self::close) is called.
	pub async fn run(self: &Arc<Self>) {
		let Some(parts) = self.transport.lock().take() else {
			warn!(target = "sqlview.rpc", label = %self.label, "connection is already running");
			return;
		};
		let Some(mut outbound_rx) = self.outbound_rx.lock().take() else {
			return;
		};
		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;

		let label = self.label.clone();
		let reader_handle = tokio::spawn(async move {
			if let Err(err) = receiver.run().await {
				warn!(target = "sqlview.transport", label = %label, error = %err, "transport read error");
			}
		});

		let label = self.label.clone();
		let writer_closing = self.closing.clone();
		let writer_handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					biased;
					packet = outbound_rx.recv() => {
						let Some(packet) = packet else { break };
						if let Err(err) = sender.send(packet).await {
							warn!(target = "sqlview.transport", label = %label, error = %err, "transport write error");
							writer_closing.cancel();
							break;
						}
					}
					_ = writer_closing.cancelled() => break,
				}
			}
		});

		loop {
			tokio::select! {
				biased;
				_ = self.closing.cancelled() => break,
				packet = message_rx.recv() => match packet {
					Some(packet) => self.handle_packet(packet),
					None => {
						debug!(target = "sqlview.rpc", label = %self.label, "peer closed the endpoint");
						break;
					}
				},
			}
		}

		self.shutdown();
		let _ = writer_handle.await;
		reader_handle.abort();
	}

	fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::AcqRel) {
			return;
		}
		self.closing.cancel();

		let pending: Vec<Callback> = {
			let mut table = self.calls.table.lock();
			table.abandoned.clear();
			table.pending.drain().map(|(_, tx)| tx).collect()
		};
		let failed = pending.len();
		for tx in pending {
			let _ = tx.send(Err(Error::TransportClosed));
		}

		self.incoming.clear();
		self.objects.clear();
		debug!(target = "sqlview.rpc", label = %self.label, failed_calls = failed, "connection closed");
		self.closed.cancel();
	}

	/// Handles one incoming packet (test-only entry point).
	#[cfg(test)]
	pub(crate) fn dispatch(self: &Arc<Self>, packet: Packet) {
		self.handle_packet(packet)
	}

	fn handle_packet(self: &Arc<Self>, packet: Packet) {
		let Packet { message, buffers, .. } = packet;
		match message {
			Message::Response(response) => self.handle_response(response, buffers),
			Message::Call(call) => self.handle_call(call, buffers),
			Message::Cancel { id } => match self.incoming.get(&id) {
				Some(token) => {
					trace!(target = "sqlview.rpc", label = %self.label, id, "peer canceled call");
					token.cancel();
				}
				None => trace!(target = "sqlview.rpc", label = %self.label, id, "cancel for finished call"),
			},
			Message::Release { target } => {
				if !self.objects.release(target) {
					trace!(target = "sqlview.rpc", label = %self.label, object = %target, "release of unknown object");
				}
			}
		}
	}

	fn handle_response(&self, response: Response, buffers: Vec<bytes::Bytes>) {
		let callback = {
			let mut table = self.calls.table.lock();
			match table.pending.remove(&response.id) {
				Some(tx) => Some(tx),
				None => {
					if table.abandoned.remove(&response.id) {
						trace!(target = "sqlview.rpc", label = %self.label, id = response.id, "dropping response to abandoned call");
					} else {
						warn!(target = "sqlview.rpc", label = %self.label, id = response.id, "response to unknown call id");
					}
					None
				}
			}
		};
		let Some(tx) = callback else { return };

		let result = match response.error {
			Some(error) => Err(Error::from_payload(error)),
			None => Ok(Payload::from_wire(response.result.unwrap_or(Value::Null), buffers)),
		};
		let _ = tx.send(result);
	}

	fn handle_call(self: &Arc<Self>, call: Call, buffers: Vec<bytes::Bytes>) {
		let Call {
			id,
			target,
			method,
			params,
			cancellable,
		} = call;

		let Some(object) = self.objects.get(target) else {
			debug!(target = "sqlview.rpc", label = %self.label, id, object = %target, method = %method, "call to unknown object");
			self.respond(id, Err(Error::Protocol(format!("no object {target} is exposed"))));
			return;
		};

		let cancel = self.closing.child_token();
		if cancellable {
			self.incoming.insert(id, cancel.clone());
		}

		let request = Request {
			method,
			payload: Payload::from_wire(params, buffers),
			cancel: cancel.clone(),
			connection: Arc::clone(self),
		};
		let connection = Arc::clone(self);
		tokio::spawn(async move {
			let result = tokio::select! {
				biased;
				_ = cancel.cancelled() => Err(Error::Canceled),
				result = object.dispatch(request) => result,
			};
			connection.incoming.remove(&id);
			connection.respond(id, result);
		});
	}

	fn respond(&self, id: u32, result: Result<Payload>) {
		let packet = match result {
			Ok(payload) => {
				let (value, buffers) = payload.into_wire();
				Packet::with_buffers(Message::Response(Response::ok(id, value)), buffers)
			}
			Err(err) => {
				debug!(target = "sqlview.rpc", label = %self.label, id, error = %err, "call failed");
				Packet::new(Message::Response(Response::err(id, err.to_payload())))
			}
		};
		if self.calls.send(packet).is_err() {
			trace!(target = "sqlview.rpc", label = %self.label, id, "response dropped; connection closed");
		}
	}
}

/// Keeps an object exposed; dropping it withdraws the object.
pub struct ExposedGuard {
	reference: RemoteRef,
	connection: Arc<Connection>,
}

impl ExposedGuard {
	pub fn reference(&self) -> RemoteRef {
		self.reference
	}
}

impl Drop for ExposedGuard {
	fn drop(&mut self) {
		self.connection.objects.release(self.reference.id);
	}
}
