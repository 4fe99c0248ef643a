use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlview_protocol::{BufferRef, ErrorKind, ErrorPayload, TransferBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::*;

use crate::transport::{BoxFuture, PipeTransport, memory};

#[derive(Default)]
struct TestService {
	cancelled: Arc<AtomicUsize>,
}

#[derive(Serialize, Deserialize)]
struct DelayParams {
	ms: u64,
	value: String,
}

#[derive(Serialize, Deserialize)]
struct Upload {
	bytes: BufferRef,
}

#[derive(Serialize, Deserialize)]
struct CallbackParams {
	source: RemoteRef,
}

impl TestService {
	async fn handle(&self, mut request: Request) -> Result<Payload> {
		match request.method.as_str() {
			"echo" => Ok(request.payload),
			"delay" => {
				let params: DelayParams = request.params()?;
				tokio::time::sleep(Duration::from_millis(params.ms)).await;
				Ok(Payload::encode(&params.value)?)
			}
			"byte_len" => {
				let params: Upload = request.params()?;
				let bytes = request.take_buffer(params.bytes)?;
				Ok(Payload::encode(&bytes.len())?)
			}
			"wait_for_cancel" => {
				let token = request.cancel.clone();
				let cancelled = Arc::clone(&self.cancelled);
				tokio::spawn(async move {
					token.cancelled().await;
					cancelled.fetch_add(1, Ordering::SeqCst);
				});
				std::future::pending().await
			}
			"call_back" => {
				let params: CallbackParams = request.params()?;
				let source = request.channel(params.source);
				let answer: String = source.send("echo", "ping").await?;
				Ok(Payload::encode(&answer)?)
			}
			"fail" => Err(Error::remote("SqliteFailure", "no such table: t")),
			_ => Err(request.unknown_method()),
		}
	}
}

impl Dispatch for TestService {
	fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Payload>> {
		Box::pin(self.handle(request))
	}
}

fn connected_pair() -> (Arc<Connection>, Arc<Connection>, Arc<AtomicUsize>) {
	let (left, right) = memory::pair();
	let client = Connection::spawn(left, "client");
	let server = Connection::spawn(right, "server");
	let service = TestService::default();
	let cancelled = Arc::clone(&service.cancelled);
	server.expose_root(Arc::new(service));
	(client, server, cancelled)
}

/// Client connection whose peer is driven by hand.
fn raw_peer() -> (Arc<Connection>, TransportParts) {
	let (left, right) = memory::pair();
	(Connection::spawn(left, "client"), right)
}

async fn next_message(raw: &mut TransportParts) -> Message {
	tokio::time::timeout(Duration::from_secs(2), raw.message_rx.recv())
		.await
		.expect("timed out waiting for a packet")
		.expect("endpoint closed")
		.message
}

async fn next_call(raw: &mut TransportParts) -> Call {
	match next_message(raw).await {
		Message::Call(call) => call,
		other => panic!("Expected Call, got {}", other.kind()),
	}
}

async fn reply(raw: &mut TransportParts, call: &Call, value: Value) {
	raw.sender
		.send(Packet::new(Message::Response(Response::ok(call.id, value))))
		.await
		.unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
	tokio::time::timeout(Duration::from_secs(2), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("condition was not reached in time");
}

#[test]
fn test_request_id_increments() {
	let (left, _right) = memory::pair();
	let connection = Connection::new(left);

	let id1 = connection.last_id.fetch_add(1, Ordering::SeqCst);
	let id2 = connection.last_id.fetch_add(1, Ordering::SeqCst);
	let id3 = connection.last_id.fetch_add(1, Ordering::SeqCst);

	assert_eq!(id1, 0);
	assert_eq!(id2, 1);
	assert_eq!(id3, 2);
}

#[test]
fn test_next_id_skips_ids_in_flight() {
	let (left, _right) = memory::pair();
	let connection = Connection::new(left);

	let (tx, _rx) = oneshot::channel();
	let mut table = CallTable::default();
	table.pending.insert(0, tx);
	table.abandoned.insert(1);

	assert_eq!(connection.next_id(&table), 2);
}

#[tokio::test]
async fn test_dispatch_response_success() {
	let (left, _right) = memory::pair();
	let connection = Arc::new(Connection::new(left));

	let (tx, rx) = oneshot::channel();
	connection.calls.table.lock().pending.insert(7, tx);

	connection.dispatch(Packet::new(Message::Response(Response::ok(7, json!({"rows": 3})))));

	let payload = rx.await.unwrap().unwrap();
	assert_eq!(payload.value()["rows"], 3);
	assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_dispatch_response_error() {
	let (left, _right) = memory::pair();
	let connection = Arc::new(Connection::new(left));

	let (tx, rx) = oneshot::channel();
	connection.calls.table.lock().pending.insert(3, tx);

	connection.dispatch(Packet::new(Message::Response(Response::err(
		3,
		ErrorPayload {
			kind: ErrorKind::Threw,
			message: "file is 300 MiB".to_string(),
			name: Some("ImportTooLarge".to_string()),
			stack: None,
			data: Some(json!({"size": 300, "limit": 256})),
		},
	))));

	let err = rx.await.unwrap().unwrap_err();
	assert_eq!(err.error_name(), Some("ImportTooLarge"));
	assert_eq!(err.remote_data().unwrap()["limit"], 256);
}

#[tokio::test]
async fn test_call_with_transferred_buffer() {
	let (client, _server, _) = connected_pair();

	let mut buffer = TransferBuffer::new(vec![0u8; 1024]);
	let mut payload = Payload::empty();
	let bytes = payload.transfer(&mut buffer).unwrap();
	let payload = payload.with_value(&Upload { bytes }).unwrap();

	let result = client.root().call("byte_len", payload, None).await.unwrap();

	assert_eq!(result.decode::<usize>().unwrap(), 1024);
	assert!(buffer.is_detached());
}

#[tokio::test]
async fn test_detached_buffer_is_a_protocol_error() {
	let mut buffer = TransferBuffer::new(Bytes::from_static(b"SQLite format 3"));
	let mut payload = Payload::empty();
	payload.transfer(&mut buffer).unwrap();

	let err: Error = payload.transfer(&mut buffer).unwrap_err().into();
	assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_responses_resolve_out_of_order() {
	let (client, _server, _) = connected_pair();
	let root = client.root();

	let slow_params = DelayParams {
		ms: 50,
		value: "slow".to_string(),
	};
	let fast_params = DelayParams {
		ms: 0,
		value: "fast".to_string(),
	};
	let slow = root.send::<_, String>("delay", &slow_params);
	let fast = root.send::<_, String>("delay", &fast_params);

	let (slow, fast) = tokio::join!(slow, fast);
	assert_eq!(slow.unwrap(), "slow");
	assert_eq!(fast.unwrap(), "fast");
	assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_remote_error_keeps_name() {
	let (client, _server, _) = connected_pair();

	let err = client.root().send::<_, Value>("fail", &json!({})).await.unwrap_err();

	assert_eq!(err.error_name(), Some("SqliteFailure"));
	assert!(err.to_string().contains("no such table"));
}

#[tokio::test]
async fn test_unknown_method_and_object_are_protocol_errors() {
	let (client, _server, _) = connected_pair();

	let err = client.root().send::<_, Value>("nope", &json!({})).await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "got {err:?}");

	let missing = client.channel(RemoteRef { id: ObjectId(99) });
	let err = missing.send::<_, Value>("echo", &json!(1)).await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn test_cancel_resolves_immediately_and_callee_observes_it() {
	let (client, _server, cancelled) = connected_pair();
	let token = CancellationToken::new();

	let root = client.root();
	let call_token = token.clone();
	let call = tokio::spawn(async move { root.call("wait_for_cancel", Payload::empty(), Some(&call_token)).await });

	eventually(|| client.pending_calls() == 1).await;
	token.cancel();

	let result = call.await.unwrap();
	assert!(matches!(result, Err(Error::Canceled)));
	assert_eq!(client.pending_calls(), 0);

	eventually(|| cancelled.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_already_cancelled_token_sends_nothing() {
	let (client, mut raw) = raw_peer();
	let token = CancellationToken::new();
	token.cancel();

	let result = client.root().call("echo", Payload::empty(), Some(&token)).await;

	assert!(matches!(result, Err(Error::Canceled)));
	assert!(raw.message_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_late_response_after_cancel_is_dropped() {
	let (client, mut raw) = raw_peer();
	let token = CancellationToken::new();

	let root = client.root();
	let call_token = token.clone();
	let call = tokio::spawn(async move { root.call("get_page", Payload::empty(), Some(&call_token)).await });

	let first = next_call(&mut raw).await;
	assert!(first.cancellable);
	token.cancel();
	assert!(matches!(call.await.unwrap(), Err(Error::Canceled)));

	assert!(matches!(next_message(&mut raw).await, Message::Cancel { id } if id == first.id));
	reply(&mut raw, &first, json!("too late")).await;

	let root = client.root();
	let second = tokio::spawn(async move { root.send::<_, String>("get_count", &json!({})).await });
	let call = next_call(&mut raw).await;
	assert_ne!(call.id, first.id);
	reply(&mut raw, &call, json!("fresh")).await;

	assert_eq!(second.await.unwrap().unwrap(), "fresh");
	assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_dispose_releases_exactly_once() {
	let (client, mut raw) = raw_peer();
	let channel = client.channel(RemoteRef { id: ObjectId(5) });

	for i in 0..3 {
		let proxy = channel.clone();
		let call = tokio::spawn(async move { proxy.send::<_, Value>("echo", &json!(i)).await });
		let request = next_call(&mut raw).await;
		assert_eq!(request.target, ObjectId(5));
		reply(&mut raw, &request, request.params.clone()).await;
		assert_eq!(call.await.unwrap().unwrap(), json!(i));
	}

	let clone = channel.clone();
	channel.dispose();
	channel.dispose();
	assert!(clone.is_disposed());
	drop(clone);
	drop(channel);

	assert!(matches!(next_message(&mut raw).await, Message::Release { target } if target == ObjectId(5)));
	let extra = tokio::time::timeout(Duration::from_millis(50), raw.message_rx.recv()).await;
	assert!(extra.is_err(), "expected no further packets");
	assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_disposed_proxy_rejects_calls() {
	let (client, _raw) = raw_peer();
	let channel = client.channel(RemoteRef { id: ObjectId(2) });
	channel.dispose();

	let err = channel.send::<_, Value>("echo", &json!(1)).await.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_dropping_root_proxy_sends_no_release() {
	let (client, mut raw) = raw_peer();
	let root = client.root();
	root.dispose();
	drop(root);

	let extra = tokio::time::timeout(Duration::from_millis(50), raw.message_rx.recv()).await;
	assert!(extra.is_err());
}

#[tokio::test]
async fn test_release_withdraws_exposed_object() {
	let (client, server, _) = connected_pair();
	let reference = server.expose(Arc::new(TestService::default()));
	assert_eq!(server.exposed_objects(), 2);

	let proxy = client.channel(reference);
	assert_eq!(proxy.send::<_, i64>("echo", &5).await.unwrap(), 5);
	proxy.dispose();

	eventually(|| server.exposed_objects() == 1).await;
}

#[tokio::test]
async fn test_remote_reference_calls_back_into_caller() {
	let (client, _server, _) = connected_pair();
	let guard = client.expose_scoped(Arc::new(TestService::default()));

	let answer: String = client
		.root()
		.send("call_back", &CallbackParams {
			source: guard.reference(),
		})
		.await
		.unwrap();

	assert_eq!(answer, "ping");
	drop(guard);
	assert_eq!(client.exposed_objects(), 0);
}

#[tokio::test]
async fn test_close_fails_every_pending_call_once() {
	let (client, _raw) = raw_peer();

	let calls: Vec<_> = (0..3)
		.map(|_| {
			let root = client.root();
			tokio::spawn(async move { root.send::<_, Value>("get_page", &json!({})).await })
		})
		.collect();

	eventually(|| client.pending_calls() == 3).await;
	client.close();

	for call in calls {
		assert!(matches!(call.await.unwrap(), Err(Error::TransportClosed)));
	}
	client.closed().await;
	assert_eq!(client.pending_calls(), 0);

	let err = client.root().send::<_, Value>("get_page", &json!({})).await.unwrap_err();
	assert!(err.is_transport_closed());
}

#[tokio::test]
async fn test_peer_going_away_fails_pending_calls() {
	let (client, raw) = raw_peer();

	let root = client.root();
	let call = tokio::spawn(async move { root.send::<_, Value>("get_count", &json!({})).await });
	eventually(|| client.pending_calls() == 1).await;

	drop(raw);

	assert!(matches!(call.await.unwrap(), Err(Error::TransportClosed)));
	client.closed().await;
	assert!(client.is_closed());
}

/// Client connection over a pipe; the returned streams are the peer's read and write ends.
fn piped_client() -> (Arc<Connection>, DuplexStream, DuplexStream) {
	let (client_read, peer_write) = tokio::io::duplex(64 * 1024);
	let (client_write, peer_read) = tokio::io::duplex(64 * 1024);
	let (transport, message_rx) = PipeTransport::new(client_write, client_read);
	let client = Connection::spawn(transport.into_transport_parts(message_rx), "client");
	(client, peer_read, peer_write)
}

/// Reads one frame off the pipe and returns the id of the call it carries.
async fn read_call_id(peer_read: &mut DuplexStream) -> u64 {
	let frame_len = peer_read.read_u32_le().await.unwrap() as usize;
	let mut frame = vec![0u8; frame_len];
	peer_read.read_exact(&mut frame).await.unwrap();
	let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
	let header: Value = serde_json::from_slice(&frame[4..4 + header_len]).unwrap();
	assert_eq!(header["message"]["type"], "call");
	header["message"]["id"].as_u64().unwrap()
}

async fn write_frame(peer_write: &mut DuplexStream, header: &[u8], block: &[u8]) {
	peer_write
		.write_all(&((4 + header.len() + block.len()) as u32).to_le_bytes())
		.await
		.unwrap();
	peer_write.write_all(&(header.len() as u32).to_le_bytes()).await.unwrap();
	peer_write.write_all(header).await.unwrap();
	peer_write.write_all(block).await.unwrap();
}

#[tokio::test]
async fn test_response_with_unresolvable_buffer_fails_its_call() {
	let (client, mut peer_read, mut peer_write) = piped_client();

	let root = client.root();
	let call = tokio::spawn(async move { root.send::<_, Value>("get_blob", &json!({})).await });
	let id = read_call_id(&mut peer_read).await;

	let header = json!({
		"message": {"type": "response", "id": id, "result": {"$buffer": 0}},
		"buffers": [{"offset": 0, "length": 4096}],
	});
	write_frame(&mut peer_write, &serde_json::to_vec(&header).unwrap(), b"tiny").await;

	let err = tokio::time::timeout(Duration::from_secs(2), call)
		.await
		.expect("call was never settled")
		.unwrap()
		.unwrap_err();
	assert!(matches!(err, Error::Protocol(_)), "unexpected error: {err}");
	assert_eq!(client.pending_calls(), 0);
	assert!(!client.is_closed());
}

#[tokio::test]
async fn test_unreadable_frame_closes_the_connection() {
	let (client, mut peer_read, mut peer_write) = piped_client();

	let root = client.root();
	let call = tokio::spawn(async move { root.send::<_, Value>("get_page", &json!({})).await });
	read_call_id(&mut peer_read).await;

	write_frame(&mut peer_write, b"{not json", b"").await;

	let result = tokio::time::timeout(Duration::from_secs(2), call)
		.await
		.expect("call was never settled")
		.unwrap();
	assert!(matches!(result, Err(Error::TransportClosed)));
	client.closed().await;
	assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_before_run_completes_shutdown() {
	let (left, _right) = memory::pair();
	let connection = Connection::new(left);
	connection.expose_root(Arc::new(TestService::default()));

	connection.close();

	connection.closed().await;
	assert_eq!(connection.exposed_objects(), 0);
}

#[test]
fn test_object_store_identity_and_root() {
	let store = ObjectStore::new();
	let object: Arc<dyn Dispatch> = Arc::new(TestService::default());

	let first = store.insert(Arc::clone(&object));
	let second = store.insert(Arc::clone(&object));
	assert_eq!(first, second);
	assert_eq!(store.len(), 1);
	assert_eq!(store.refs(first), 2);

	store.set_root(Arc::new(TestService::default()));
	assert!(!store.release(ObjectId::ROOT));
	assert!(store.contains(ObjectId::ROOT));

	assert!(store.release(first));
	assert!(store.contains(first));
	assert!(store.release(first));
	assert!(!store.contains(first));
	assert!(!store.release(first));
	assert_ne!(store.insert(object), first);
}

#[tokio::test]
async fn test_shared_object_survives_one_holders_release() {
	let (left, right) = memory::pair();
	let owner = Connection::spawn(left, "owner");
	let peer = Connection::spawn(right, "peer");

	let service: Arc<dyn Dispatch> = Arc::new(TestService::default());
	let first = owner.expose(Arc::clone(&service));
	let second = owner.expose(service);
	assert_eq!(first, second);

	drop(peer.channel(first));
	eventually(|| owner.objects.refs(first.id) == 1).await;

	let proxy = peer.channel(second);
	let echoed: String = proxy.send("echo", &"still here").await.unwrap();
	assert_eq!(echoed, "still here");

	drop(proxy);
	eventually(|| owner.exposed_objects() == 0).await;
}
