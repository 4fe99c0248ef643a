//! Endpoint transports.
//!
//! A transport is split into a sending half ([`Transport`]), a receiving half
//! ([`TransportReceiver`]) that pumps decoded packets into an unbounded channel,
//! and that channel's receiver. [`TransportParts`] bundles the three so a
//! [`Connection`](crate::Connection) can own them.
//!
//! Implementations:
//! - [`memory`]: in-process pair; buffers are moved, never copied
//! - [`pipe`]: length-prefixed frames over any byte stream (child process stdio)
//! - [`bus`]: several logical endpoints multiplexed over one transport

use std::future::Future;
use std::pin::Pin;

use sqlview_protocol::Packet;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod bus;
pub mod memory;
pub mod pipe;


pub use bus::MessageBus;
pub use pipe::{
	DEFAULT_MAX_FRAME_LEN, FRAME_OVERHEAD, PipeTransport, PipeTransportReceiver, PipeTransportSender, frame_limit_for,
};

/// Boxed future used by the object-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sending half of an endpoint.
///
/// Packets must be delivered to the peer in the order they are sent.
pub trait Transport: Send {
	/// Sends one packet. An error means the peer can no longer be reached.
	fn send(&mut self, packet: Packet) -> BoxFuture<'_, Result<()>>;
}

/// Receiving half of an endpoint.
///
/// `run` reads until the peer goes away, forwarding every decoded packet to the
/// channel whose receiver sits in [`TransportParts::message_rx`]. It returns
/// `Ok(())` on a clean end of stream.
pub trait TransportReceiver: Send {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Everything a connection needs to talk over one endpoint.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Packet>,
}

/// Receiver for transports that deliver straight into the message channel.
pub(crate) struct DirectReceiver;

impl TransportReceiver for DirectReceiver {
	fn run(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
		Box::pin(async { Ok(()) })
	}
}
