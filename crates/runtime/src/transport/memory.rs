//! In-process endpoint pair.
//!
//! Packets are handed to the peer as-is, so transferred buffers keep their
//! backing storage. Dropping one side's sender ends the other side's inbound
//! channel, which the peer observes as the transport closing.

use sqlview_protocol::Packet;
use tokio::sync::mpsc;

use super::{BoxFuture, DirectReceiver, Transport, TransportParts};
use crate::error::{Error, Result};

/// Sending half of an in-process endpoint.
pub struct MemorySender {
	peer: mpsc::UnboundedSender<Packet>,
}

impl Transport for MemorySender {
	fn send(&mut self, packet: Packet) -> BoxFuture<'_, Result<()>> {
		let result = self.peer.send(packet).map_err(|_| Error::TransportClosed);
		Box::pin(async move { result })
	}
}

/// Creates two connected endpoints.
pub fn pair() -> (TransportParts, TransportParts) {
	let (left_tx, left_rx) = mpsc::unbounded_channel();
	let (right_tx, right_rx) = mpsc::unbounded_channel();

	let left = TransportParts {
		sender: Box::new(MemorySender { peer: right_tx }),
		receiver: Box::new(DirectReceiver),
		message_rx: left_rx,
	};
	let right = TransportParts {
		sender: Box::new(MemorySender { peer: left_tx }),
		receiver: Box::new(DirectReceiver),
		message_rx: right_rx,
	};

	(left, right)
}
