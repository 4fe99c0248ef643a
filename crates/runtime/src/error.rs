//! Error types for the sqlview runtime.

use serde_json::Value;
use sqlview_protocol::{ErrorKind, ErrorPayload, PayloadError};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a peer.
#[derive(Debug, Error)]
pub enum Error {
	/// The peer went away or the connection was torn down while a call was pending.
	#[error("Transport closed")]
	TransportClosed,

	/// The callee's handler raised an error.
	#[error("{name}: {message}")]
	Remote {
		/// Error type name (e.g., "ImportTooLarge", "SqliteFailure")
		name: String,
		/// Human-readable error message
		message: String,
		/// Causal chain reported by the callee (if available)
		stack: Option<String>,
		/// Structured details attached by the callee
		data: Option<Value>,
	},

	/// The caller or callee aborted the call.
	#[error("Call canceled")]
	Canceled,

	/// Malformed message, unknown correlation id or object, or a bad transfer directive.
	#[error("Protocol violation: {0}")]
	Protocol(String),

	/// Framing or delivery failure below the message layer.
	#[error("Transport error: {0}")]
	Transport(String),

	/// The worker executable could not be located.
	#[error("Worker executable not found. Set SQLVIEW_WORKER_PATH or install the sqlview binary.")]
	WorkerNotFound,

	/// Failed to launch the worker process.
	#[error("Failed to launch worker: {0}")]
	LaunchFailed(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl From<PayloadError> for Error {
	fn from(err: PayloadError) -> Self {
		match err {
			PayloadError::Json(e) => Error::Json(e),
			other => Error::Protocol(other.to_string()),
		}
	}
}

impl Error {
	/// Builds a remote error as a handler would raise it.
	pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
		Error::Remote {
			name: name.into(),
			message: message.into(),
			stack: None,
			data: None,
		}
	}

	/// Returns the error name if this is a Remote error.
	pub fn error_name(&self) -> Option<&str> {
		match self {
			Error::Remote { name, .. } => Some(name),
			_ => None,
		}
	}

	/// Returns the structured data if this is a Remote error that carries some.
	pub fn remote_data(&self) -> Option<&Value> {
		match self {
			Error::Remote { data, .. } => data.as_ref(),
			_ => None,
		}
	}

	pub fn is_canceled(&self) -> bool {
		matches!(self, Error::Canceled)
	}

	/// Returns true if the peer is gone, either locally observed or reported by a forwarding callee.
	pub fn is_transport_closed(&self) -> bool {
		match self {
			Error::TransportClosed => true,
			Error::Remote { name, .. } => name == "TransportClosed",
			_ => false,
		}
	}

	/// Stable name used when this error crosses the wire.
	fn wire_name(&self) -> &str {
		match self {
			Error::TransportClosed => "TransportClosed",
			Error::Remote { name, .. } => name,
			Error::Canceled => "Canceled",
			Error::Protocol(_) => "ProtocolViolation",
			Error::Transport(_) => "TransportError",
			Error::WorkerNotFound => "WorkerNotFound",
			Error::LaunchFailed(_) => "LaunchFailed",
			Error::Io(_) => "IoError",
			Error::Json(_) => "JsonError",
		}
	}

	/// Converts a handler error into its serializable description.
	pub fn to_payload(&self) -> ErrorPayload {
		let kind = match self {
			Error::Canceled => ErrorKind::Canceled,
			Error::Protocol(_) => ErrorKind::Protocol,
			_ => ErrorKind::Threw,
		};
		let (message, stack, data) = match self {
			Error::Remote {
				message, stack, data, ..
			} => (message.clone(), stack.clone(), data.clone()),
			other => (other.to_string(), None, None),
		};

		ErrorPayload {
			kind,
			message,
			name: Some(self.wire_name().to_string()),
			stack,
			data,
		}
	}

	/// Rebuilds a caller-side error from a response's error description.
	pub fn from_payload(payload: ErrorPayload) -> Self {
		match payload.kind {
			ErrorKind::Canceled => Error::Canceled,
			ErrorKind::Protocol => Error::Protocol(payload.message),
			ErrorKind::Threw => Error::Remote {
				name: payload.name.unwrap_or_else(|| "Error".to_string()),
				message: payload.message,
				stack: payload.stack,
				data: payload.data,
			},
		}
	}
}
