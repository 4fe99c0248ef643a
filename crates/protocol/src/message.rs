//! Envelope messages exchanged over an endpoint.
//!
//! Every packet carries exactly one [`Message`]:
//!
//! 1. Caller sends [`Message::Call`] with a fresh correlation id
//! 2. Callee answers with [`Message::Response`] carrying the same id
//! 3. Caller may send [`Message::Cancel`] while the call is in flight
//! 4. Caller sends [`Message::Release`] once it no longer needs a remote object

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an exposed object within the registry of the side that exposed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
	/// The object a peer exposes before any other, reachable without a reference.
	pub const ROOT: ObjectId = ObjectId(0);

	pub fn is_root(self) -> bool {
		self == Self::ROOT
	}
}

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "obj#{}", self.0)
	}
}

/// Identity token of a logical endpoint on a shared physical transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelToken(Arc<str>);

impl ChannelToken {
	pub fn new(token: impl AsRef<str>) -> Self {
		Self(Arc::from(token.as_ref()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Request to invoke `method` on the callee's object `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
	/// Correlation id, unique among the caller's in-flight calls.
	pub id: u32,
	/// Object the method is invoked on.
	pub target: ObjectId,
	/// Method name as routed by the callee's service adapter.
	pub method: String,
	/// JSON arguments; binary arguments appear as buffer references.
	#[serde(default)]
	pub params: Value,
	/// Whether the caller may send a [`Message::Cancel`] for this call.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub cancellable: bool,
}

/// Outcome of a [`Call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// Correlation id of the call being answered.
	pub id: u32,
	/// Success result (mutually exclusive with error)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	/// Error result (mutually exclusive with result)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
}

impl Response {
	pub fn ok(id: u32, result: Value) -> Self {
		Self {
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn err(id: u32, error: ErrorPayload) -> Self {
		Self {
			id,
			result: None,
			error: Some(error),
		}
	}
}

/// Broad class of a failed call as seen by the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// The handler raised an error.
	#[default]
	Threw,
	/// The handler stopped because the call was canceled.
	Canceled,
	/// The call itself was malformed (unknown object, bad params, missing buffer).
	Protocol,
}

/// Serializable description of a handler error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
	#[serde(default)]
	pub kind: ErrorKind,
	/// Error message
	pub message: String,
	/// Error type name (e.g., "ImportTooLarge", "SqliteFailure")
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	/// Optional backtrace or causal chain
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,
	/// Structured details needed to rebuild the error on the caller side.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

/// Discriminated union of protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
	Call(Call),
	Response(Response),
	/// The caller abandoned call `id`.
	Cancel { id: u32 },
	/// The caller dropped its proxy for `target`.
	Release { target: ObjectId },
}

impl Message {
	pub fn kind(&self) -> &'static str {
		match self {
			Message::Call(_) => "call",
			Message::Response(_) => "response",
			Message::Cancel { .. } => "cancel",
			Message::Release { .. } => "release",
		}
	}
}

/// One unit of delivery on an endpoint: a message plus its transfer list.
///
/// `buffers` travel beside the JSON body; the body refers to them by index
/// through [`BufferRef`](crate::BufferRef).
#[derive(Debug, Clone)]
pub struct Packet {
	/// Logical endpoint this packet belongs to on a multiplexed transport.
	pub channel: Option<ChannelToken>,
	pub message: Message,
	pub buffers: Vec<Bytes>,
}

impl Packet {
	pub fn new(message: Message) -> Self {
		Self {
			channel: None,
			message,
			buffers: Vec::new(),
		}
	}

	pub fn with_buffers(message: Message, buffers: Vec<Bytes>) -> Self {
		Self {
			channel: None,
			message,
			buffers,
		}
	}

	/// Total size of the transferred buffers in bytes.
	pub fn buffer_len(&self) -> usize {
		self.buffers.iter().map(Bytes::len).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn call_serializes_with_type_tag() {
		let message = Message::Call(Call {
			id: 7,
			target: ObjectId::ROOT,
			method: "get_page".to_string(),
			params: serde_json::json!({"table": "users"}),
			cancellable: true,
		});

		let value = serde_json::to_value(&message).unwrap();
		assert_eq!(value["type"], "call");
		assert_eq!(value["id"], 7);
		assert_eq!(value["target"], 0);
		assert_eq!(value["cancellable"], true);
	}

	#[test]
	fn non_cancellable_flag_is_omitted() {
		let message = Message::Call(Call {
			id: 1,
			target: ObjectId(3),
			method: "close".to_string(),
			params: Value::Null,
			cancellable: false,
		});

		let value = serde_json::to_value(&message).unwrap();
		assert!(value.get("cancellable").is_none());
	}

	#[test]
	fn response_error_defaults_kind_to_threw() {
		let json = r#"{"type": "response", "id": 4, "error": {"message": "boom"}}"#;
		let message: Message = serde_json::from_str(json).unwrap();

		match message {
			Message::Response(response) => {
				let error = response.error.unwrap();
				assert_eq!(error.kind, ErrorKind::Threw);
				assert_eq!(error.message, "boom");
				assert!(response.result.is_none());
			}
			other => panic!("Expected Response, got {other:?}"),
		}
	}

	#[test]
	fn cancel_and_release_round_trip_through_json() {
		let cancel: Message = serde_json::from_str(r#"{"type": "cancel", "id": 9}"#).unwrap();
		assert!(matches!(cancel, Message::Cancel { id: 9 }));

		let release: Message = serde_json::from_str(r#"{"type": "release", "target": 5}"#).unwrap();
		assert!(matches!(release, Message::Release { target: ObjectId(5) }));
	}

	#[test]
	fn unknown_message_type_is_rejected() {
		let result = serde_json::from_str::<Message>(r#"{"type": "event", "id": 1}"#);
		assert!(result.is_err());
	}
}
