//! Logical endpoints multiplexed over one physical transport.
//!
//! A UI host typically has a single message channel per rendering context, yet
//! several independent conversations run over it. Each logical endpoint is
//! identified by a [`ChannelToken`] fixed at subscription time: outgoing
//! packets are stamped with it and incoming packets are routed by it. Traffic
//! carrying an unknown token (or none) is unrelated and ignored.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlview_protocol::{ChannelToken, Packet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxFuture, DirectReceiver, Transport, TransportParts};
use crate::error::{Error, Result};

type Routes = Arc<Mutex<HashMap<ChannelToken, mpsc::UnboundedSender<Packet>>>>;

/// Router owning one physical transport.
pub struct MessageBus {
	routes: Routes,
	outbound: mpsc::UnboundedSender<Packet>,
	shutdown: CancellationToken,
}

impl MessageBus {
	/// Takes over `parts` and starts routing. Must be called inside a tokio runtime.
	pub fn spawn(parts: TransportParts) -> Self {
		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;
		let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
		let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Packet>();
		let shutdown = CancellationToken::new();

		tokio::spawn(async move {
			if let Err(err) = receiver.run().await {
				warn!(target = "sqlview.transport", error = %err, "bus transport read error");
			}
		});

		let writer_shutdown = shutdown.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					biased;
					packet = outbound_rx.recv() => match packet {
						Some(packet) => {
							if let Err(err) = sender.send(packet).await {
								warn!(target = "sqlview.transport", error = %err, "bus transport write error");
								writer_shutdown.cancel();
								break;
							}
						}
						None => break,
					},
					_ = writer_shutdown.cancelled() => break,
				}
			}
		});

		let router_routes = Arc::clone(&routes);
		let router_shutdown = shutdown.clone();
		tokio::spawn(async move {
			loop {
				let packet = tokio::select! {
					biased;
					_ = router_shutdown.cancelled() => break,
					packet = message_rx.recv() => match packet {
						Some(packet) => packet,
						None => break,
					},
				};

				let Some(token) = packet.channel.clone() else {
					debug!(target = "sqlview.transport", kind = packet.message.kind(), "ignoring packet without channel token");
					continue;
				};

				let route = router_routes.lock().get(&token).cloned();
				match route {
					Some(tx) => {
						if tx.send(packet).is_err() {
							router_routes.lock().remove(&token);
						}
					}
					None => {
						debug!(target = "sqlview.transport", %token, "ignoring packet for unknown channel");
					}
				}
			}

			let mut routes = router_routes.lock();
			router_shutdown.cancel();
			routes.clear();
			debug!(target = "sqlview.transport", "bus router stopped");
		});

		Self {
			routes,
			outbound,
			shutdown,
		}
	}

	/// Opens the logical endpoint identified by `token`.
	///
	/// A token can be subscribed once at a time; it stays bound to the returned
	/// endpoint until [`unsubscribe`](Self::unsubscribe) or bus shutdown.
	pub fn subscribe(&self, token: ChannelToken) -> Result<TransportParts> {
		let mut routes = self.routes.lock();
		if self.shutdown.is_cancelled() {
			return Err(Error::TransportClosed);
		}
		if routes.contains_key(&token) {
			return Err(Error::Protocol(format!("channel token {token} is already subscribed")));
		}

		let (tx, rx) = mpsc::unbounded_channel();
		routes.insert(token.clone(), tx);
		debug!(target = "sqlview.transport", %token, "bus channel subscribed");

		Ok(TransportParts {
			sender: Box::new(BusSender {
				token,
				outbound: self.outbound.clone(),
			}),
			receiver: Box::new(DirectReceiver),
			message_rx: rx,
		})
	}

	/// Ends the logical endpoint; its connection observes the transport closing.
	pub fn unsubscribe(&self, token: &ChannelToken) -> bool {
		self.routes.lock().remove(token).is_some()
	}

	pub fn channel_count(&self) -> usize {
		self.routes.lock().len()
	}

	/// Stops routing and closes every logical endpoint.
	pub fn shutdown(&self) {
		let mut routes = self.routes.lock();
		self.shutdown.cancel();
		routes.clear();
	}
}

struct BusSender {
	token: ChannelToken,
	outbound: mpsc::UnboundedSender<Packet>,
}

impl Transport for BusSender {
	fn send(&mut self, mut packet: Packet) -> BoxFuture<'_, Result<()>> {
		packet.channel = Some(self.token.clone());
		let result = self.outbound.send(packet).map_err(|_| Error::TransportClosed);
		Box::pin(async move { result })
	}
}
