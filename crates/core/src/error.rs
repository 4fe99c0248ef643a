//! Error types for sessions, documents and the typed interfaces.
//!
//! Domain errors cross an endpoint as [`sqlview_runtime::Error::Remote`]
//! carrying the variant name and structured `data`; client stubs rebuild the
//! same variant on the calling side, so `ImportTooLarge` raised by a worker is
//! matched as `Error::ImportTooLarge` by the host.

use serde_json::{Value, json};
use sqlview_protocol::PayloadError;
use sqlview_runtime::Error as RpcError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Transport, protocol, cancellation or an unrecognized remote error.
	#[error(transparent)]
	Rpc(RpcError),

	#[error("database is {size} bytes, larger than the {limit} byte limit")]
	ImportTooLarge { size: u64, limit: u64 },

	#[error("import failed: {0}")]
	ImportFailed(String),

	#[error("worker crashed: {0}")]
	WorkerCrashed(String),

	#[error("session is closed")]
	SessionClosed,

	#[error("session failed: {0}")]
	SessionFailed(String),

	/// The database rejected a read (unknown table or column, malformed filter).
	#[error("query failed: {0}")]
	Query(String),

	#[error("surface not found: {0}")]
	SurfaceNotFound(String),

	#[error("document not found: {0}")]
	DocumentNotFound(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

/// What a caller can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Only this read failed; retrying it may succeed.
	Recoverable,
	/// The worker or session is gone; refresh or reopen the document.
	SessionBroken,
	/// The file exceeds the configured size ceiling.
	TooLarge,
}

impl From<RpcError> for Error {
	fn from(err: RpcError) -> Self {
		Self::from_rpc(err)
	}
}

impl From<PayloadError> for Error {
	fn from(err: PayloadError) -> Self {
		Error::Rpc(err.into())
	}
}

fn detail(data: Option<&Value>, message: &str) -> String {
	data.and_then(|d| d.get("detail"))
		.and_then(Value::as_str)
		.unwrap_or(message)
		.to_string()
}

impl Error {
	pub fn class(&self) -> ErrorClass {
		match self {
			Error::ImportTooLarge { .. } => ErrorClass::TooLarge,
			Error::ImportFailed(_) | Error::WorkerCrashed(_) | Error::SessionClosed | Error::SessionFailed(_) => {
				ErrorClass::SessionBroken
			}
			Error::Rpc(err) if err.is_transport_closed() => ErrorClass::SessionBroken,
			_ => ErrorClass::Recoverable,
		}
	}

	pub fn is_canceled(&self) -> bool {
		matches!(self, Error::Rpc(err) if err.is_canceled())
	}

	pub fn is_transport_closed(&self) -> bool {
		matches!(self, Error::Rpc(err) if err.is_transport_closed())
	}

	/// Converts into the error a service adapter sends back to the caller.
	pub fn into_rpc(self) -> RpcError {
		let message = self.to_string();
		let (name, data) = match self {
			Error::Rpc(err) => return err,
			Error::ImportTooLarge { size, limit } => ("ImportTooLarge", json!({"size": size, "limit": limit})),
			Error::ImportFailed(d) => ("ImportFailed", json!({"detail": d})),
			Error::WorkerCrashed(d) => ("WorkerCrashed", json!({"detail": d})),
			Error::SessionClosed => ("SessionClosed", Value::Null),
			Error::SessionFailed(d) => ("SessionFailed", json!({"detail": d})),
			Error::Query(d) => ("QueryFailed", json!({"detail": d})),
			Error::SurfaceNotFound(d) => ("SurfaceNotFound", json!({"detail": d})),
			Error::DocumentNotFound(d) => ("DocumentNotFound", json!({"detail": d})),
			Error::Io(_) => ("IoError", Value::Null),
			Error::Json(_) => ("JsonError", Value::Null),
		};

		RpcError::Remote {
			name: name.to_string(),
			message,
			stack: None,
			data: (!data.is_null()).then_some(data),
		}
	}

	/// Rebuilds a domain error from what a callee reported.
	pub fn from_rpc(err: RpcError) -> Self {
		let (name, message, stack, data) = match err {
			RpcError::Remote {
				name,
				message,
				stack,
				data,
			} => (name, message, stack, data),
			other => return Error::Rpc(other),
		};

		let field = |key: &str| data.as_ref().and_then(|d| d.get(key)).and_then(Value::as_u64);
		let rebuilt = match name.as_str() {
			"ImportTooLarge" => match (field("size"), field("limit")) {
				(Some(size), Some(limit)) => Some(Error::ImportTooLarge { size, limit }),
				_ => None,
			},
			"ImportFailed" => Some(Error::ImportFailed(detail(data.as_ref(), &message))),
			"WorkerCrashed" => Some(Error::WorkerCrashed(detail(data.as_ref(), &message))),
			"SessionClosed" => Some(Error::SessionClosed),
			"SessionFailed" => Some(Error::SessionFailed(detail(data.as_ref(), &message))),
			"QueryFailed" => Some(Error::Query(detail(data.as_ref(), &message))),
			"SurfaceNotFound" => Some(Error::SurfaceNotFound(detail(data.as_ref(), &message))),
			"DocumentNotFound" => Some(Error::DocumentNotFound(detail(data.as_ref(), &message))),
			_ => None,
		};

		rebuilt.unwrap_or(Error::Rpc(RpcError::Remote {
			name,
			message,
			stack,
			data,
		}))
	}
}
