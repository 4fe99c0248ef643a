//! Call arguments and results with an explicit transfer list.
//!
//! A [`Payload`] is a JSON value plus the binary buffers it refers to. Binary
//! data never goes through JSON: it is moved into the payload's transfer list
//! and the JSON carries a [`BufferRef`] (`{"$buffer": n}`) in its place. Remote
//! objects passed by reference appear as a [`RemoteRef`] (`{"$ref": id}`).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::ObjectId;

/// Errors raised while building or reading a [`Payload`].
#[derive(Debug, Error)]
pub enum PayloadError {
	/// A transfer directive was applied to a buffer that was already moved out.
	#[error("buffer is detached; it was already transferred")]
	Detached,

	/// A buffer reference names no buffer in the transfer list.
	#[error("buffer reference {0} does not name a transferred buffer")]
	MissingBuffer(u32),

	/// A buffer reference was resolved twice.
	#[error("buffer {0} was already taken from the payload")]
	BufferTaken(u32),

	#[error("payload JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Index of a buffer in the enclosing payload's transfer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
	#[serde(rename = "$buffer")]
	pub index: u32,
}

/// Reference to an object exposed by the sender of the enclosing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
	#[serde(rename = "$ref")]
	pub id: ObjectId,
}

/// A byte buffer that can be moved into exactly one payload.
///
/// Once transferred the buffer is detached: its length reads as zero and a
/// second transfer fails with [`PayloadError::Detached`].
#[derive(Debug, Default)]
pub struct TransferBuffer {
	bytes: Option<Bytes>,
}

impl TransferBuffer {
	pub fn new(bytes: impl Into<Bytes>) -> Self {
		Self {
			bytes: Some(bytes.into()),
		}
	}

	pub fn is_detached(&self) -> bool {
		self.bytes.is_none()
	}

	pub fn len(&self) -> usize {
		self.bytes.as_ref().map_or(0, Bytes::len)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Moves the bytes out, leaving the buffer detached.
	pub fn detach(&mut self) -> Result<Bytes, PayloadError> {
		self.bytes.take().ok_or(PayloadError::Detached)
	}
}

impl From<Bytes> for TransferBuffer {
	fn from(bytes: Bytes) -> Self {
		Self::new(bytes)
	}
}

impl From<Vec<u8>> for TransferBuffer {
	fn from(bytes: Vec<u8>) -> Self {
		Self::new(bytes)
	}
}

/// JSON value plus transfer list.
#[derive(Debug, Clone, Default)]
pub struct Payload {
	value: Value,
	buffers: Vec<Option<Bytes>>,
}

impl Payload {
	/// A `null` payload with no buffers.
	pub fn empty() -> Self {
		Self::default()
	}

	/// Serializes `value` into a payload with no buffers.
	pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, PayloadError> {
		Ok(Self {
			value: serde_json::to_value(value)?,
			buffers: Vec::new(),
		})
	}

	/// Rebuilds a payload received from the wire.
	pub fn from_wire(value: Value, buffers: Vec<Bytes>) -> Self {
		Self {
			value,
			buffers: buffers.into_iter().map(Some).collect(),
		}
	}

	/// Moves `buffer` into the transfer list, detaching it.
	///
	/// This is the only way bytes enter a payload's transfer list.
	pub fn transfer(&mut self, buffer: &mut TransferBuffer) -> Result<BufferRef, PayloadError> {
		let bytes = buffer.detach()?;
		let index = self.buffers.len() as u32;
		self.buffers.push(Some(bytes));
		Ok(BufferRef { index })
	}

	/// Replaces the JSON body, keeping the transfer list.
	pub fn with_value<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, PayloadError> {
		self.value = serde_json::to_value(value)?;
		Ok(self)
	}

	pub fn value(&self) -> &Value {
		&self.value
	}

	/// Deserializes the JSON body.
	pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
		Ok(T::deserialize(&self.value)?)
	}

	/// Resolves a buffer reference, moving the bytes out of the payload.
	pub fn take_buffer(&mut self, buffer: BufferRef) -> Result<Bytes, PayloadError> {
		let slot = self
			.buffers
			.get_mut(buffer.index as usize)
			.ok_or(PayloadError::MissingBuffer(buffer.index))?;
		slot.take().ok_or(PayloadError::BufferTaken(buffer.index))
	}

	/// Resolves an optional buffer reference.
	pub fn take_optional(&mut self, buffer: Option<BufferRef>) -> Result<Option<Bytes>, PayloadError> {
		buffer.map(|b| self.take_buffer(b)).transpose()
	}

	pub fn buffer_count(&self) -> usize {
		self.buffers.len()
	}

	/// Splits into the wire representation. Buffers already taken are sent empty.
	pub fn into_wire(self) -> (Value, Vec<Bytes>) {
		let buffers = self.buffers.into_iter().map(Option::unwrap_or_default).collect();
		(self.value, buffers)
	}
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;

	use super::*;

	#[derive(Serialize, Deserialize)]
	struct Upload {
		name: String,
		bytes: BufferRef,
	}

	#[test]
	fn transfer_detaches_source_buffer() {
		let mut buffer = TransferBuffer::new(vec![1u8, 2, 3]);
		let mut payload = Payload::empty();

		let reference = payload.transfer(&mut buffer).unwrap();

		assert_eq!(reference.index, 0);
		assert!(buffer.is_detached());
		assert_eq!(buffer.len(), 0);
	}

	#[test]
	fn transferring_detached_buffer_is_an_error() {
		let mut buffer = TransferBuffer::new(vec![1u8]);
		let mut payload = Payload::empty();
		payload.transfer(&mut buffer).unwrap();

		let err = payload.transfer(&mut buffer).unwrap_err();
		assert!(matches!(err, PayloadError::Detached));
		assert_eq!(payload.buffer_count(), 1);
	}

	#[test]
	fn buffer_reference_serializes_as_marker_object() {
		let mut payload = Payload::empty();
		let bytes = payload.transfer(&mut TransferBuffer::new(Bytes::from_static(b"abc"))).unwrap();
		let payload = payload
			.with_value(&Upload {
				name: "a.db".to_string(),
				bytes,
			})
			.unwrap();

		assert_eq!(payload.value()["bytes"]["$buffer"], 0);
	}

	#[test]
	fn take_buffer_resolves_once() {
		let mut payload = Payload::from_wire(serde_json::json!({"bytes": {"$buffer": 0}}), vec![Bytes::from_static(b"xyz")]);
		let upload: Upload = payload.decode().unwrap();

		assert_eq!(payload.take_buffer(upload.bytes).unwrap(), Bytes::from_static(b"xyz"));
		assert!(matches!(payload.take_buffer(upload.bytes), Err(PayloadError::BufferTaken(0))));
	}

	#[test]
	fn dangling_buffer_reference_is_rejected() {
		let mut payload = Payload::from_wire(Value::Null, Vec::new());
		let err = payload.take_buffer(BufferRef { index: 2 }).unwrap_err();
		assert!(matches!(err, PayloadError::MissingBuffer(2)));
	}

	#[test]
	fn remote_ref_uses_ref_marker() {
		let value = serde_json::to_value(RemoteRef { id: ObjectId(12) }).unwrap();
		assert_eq!(value, serde_json::json!({"$ref": 12}));
	}
}
