//! Pull-based byte streams that can be passed by reference.
//!
//! A [`ByteSource`] is handed to a peer as a remote object: the peer pulls
//! chunks through [`RemoteByteSource`] and releases it when done. Used for
//! imports above the streaming threshold and for large initial payloads.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sqlview_protocol::methods::stream;
use sqlview_protocol::{ChunkResult, Payload, ReadChunkParams, TransferBuffer};
use sqlview_runtime::{BoxFuture, Channel, Dispatch, Request};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Source of a byte stream, read front to back.
#[async_trait]
pub trait ByteSource: Send + Sync {
	/// Returns up to `max_len` bytes, or `None` once the stream is exhausted.
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>>;
}

/// Reads a whole source into one buffer, failing once it grows past `limit`.
pub async fn read_to_end(source: &dyn ByteSource, chunk_size: usize, limit: u64) -> Result<Bytes> {
	let mut out = BytesMut::new();
	while let Some(chunk) = source.read_chunk(chunk_size).await? {
		out.extend_from_slice(&chunk);
		if out.len() as u64 > limit {
			return Err(Error::ImportTooLarge {
				size: out.len() as u64,
				limit,
			});
		}
	}
	Ok(out.freeze())
}

/// Stream over an in-memory buffer; chunks are zero-copy slices.
pub struct BytesSource {
	remaining: Mutex<Bytes>,
}

impl BytesSource {
	pub fn new(bytes: Bytes) -> Self {
		Self {
			remaining: Mutex::new(bytes),
		}
	}
}

#[async_trait]
impl ByteSource for BytesSource {
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
		let mut remaining = self.remaining.lock();
		if remaining.is_empty() {
			return Ok(None);
		}
		let take = max_len.clamp(1, remaining.len());
		Ok(Some(remaining.split_to(take)))
	}
}

/// Stream over any async reader, such as an open file.
pub struct ReaderSource<R> {
	reader: tokio::sync::Mutex<R>,
}

impl<R> ReaderSource<R> {
	pub fn new(reader: R) -> Self {
		Self {
			reader: tokio::sync::Mutex::new(reader),
		}
	}
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> ByteSource for ReaderSource<R> {
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
		let mut reader = self.reader.lock().await;
		let mut buf = BytesMut::zeroed(max_len.max(1));
		let mut filled = 0;
		while filled < buf.len() {
			let n = reader.read(&mut buf[filled..]).await?;
			if n == 0 {
				break;
			}
			filled += n;
		}
		if filled == 0 {
			return Ok(None);
		}
		buf.truncate(filled);
		Ok(Some(buf.freeze()))
	}
}

/// Caps every chunk of `inner` at `max_chunk` bytes, whatever the reader asks for.
pub(crate) struct CappedSource {
	inner: Box<dyn ByteSource>,
	max_chunk: usize,
}

impl CappedSource {
	pub(crate) fn new(inner: Box<dyn ByteSource>, max_chunk: usize) -> Self {
		Self {
			inner,
			max_chunk: max_chunk.max(1),
		}
	}
}

#[async_trait]
impl ByteSource for CappedSource {
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
		self.inner.read_chunk(max_len.min(self.max_chunk)).await
	}
}

/// Yields exactly `size` bytes of `inner`; a source that runs dry early fails.
///
/// Bytes past `size` are never handed out.
pub(crate) struct SizedSource {
	inner: Box<dyn ByteSource>,
	size: u64,
	remaining: Mutex<u64>,
}

impl SizedSource {
	pub(crate) fn new(inner: Box<dyn ByteSource>, size: u64) -> Self {
		Self {
			inner,
			size,
			remaining: Mutex::new(size),
		}
	}
}

#[async_trait]
impl ByteSource for SizedSource {
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
		let remaining = *self.remaining.lock();
		if remaining == 0 {
			return Ok(None);
		}
		let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(max_len.max(1));
		let Some(chunk) = self.inner.read_chunk(want).await? else {
			return Err(Error::SessionFailed(format!(
				"file ended after {} of {} bytes",
				self.size - remaining,
				self.size
			)));
		};
		let chunk = chunk.slice(..chunk.len().min(want));
		*self.remaining.lock() -= chunk.len() as u64;
		Ok(Some(chunk))
	}
}

/// Client stub for a byte source exposed by the peer.
///
/// Dropping it releases the remote source.
pub struct RemoteByteSource {
	channel: Channel,
}

impl RemoteByteSource {
	pub fn new(channel: Channel) -> Self {
		Self { channel }
	}
}

#[async_trait]
impl ByteSource for RemoteByteSource {
	async fn read_chunk(&self, max_len: usize) -> Result<Option<Bytes>> {
		let params = ReadChunkParams {
			max_len: u32::try_from(max_len).unwrap_or(u32::MAX),
		};
		let mut result = self.channel.call(stream::READ_CHUNK, Payload::encode(&params)?, None).await?;
		let chunk: ChunkResult = result.decode()?;
		Ok(result.take_optional(chunk.chunk)?)
	}
}

/// Service adapter exposing a [`ByteSource`].
pub struct ByteSourceService {
	source: Box<dyn ByteSource>,
}

impl ByteSourceService {
	pub fn new(source: Box<dyn ByteSource>) -> Arc<Self> {
		Arc::new(Self { source })
	}

	async fn handle(&self, request: Request) -> Result<Payload> {
		match request.method.as_str() {
			stream::READ_CHUNK => {
				let params: ReadChunkParams = request.params()?;
				let mut payload = Payload::empty();
				let chunk = self
					.source
					.read_chunk(params.max_len as usize)
					.await?
					.map(|bytes| payload.transfer(&mut TransferBuffer::new(bytes)))
					.transpose()?;
				Ok(payload.with_value(&ChunkResult { chunk })?)
			}
			_ => Err(request.unknown_method().into()),
		}
	}
}

impl Dispatch for ByteSourceService {
	fn dispatch(&self, request: Request) -> BoxFuture<'_, sqlview_runtime::Result<Payload>> {
		Box::pin(async move { self.handle(request).await.map_err(Error::into_rpc) })
	}
}

#[cfg(test)]
mod tests {
	use sqlview_runtime::Connection;
	use sqlview_runtime::transport::memory;

	use super::*;

	#[tokio::test]
	async fn bytes_source_yields_slices_then_ends() {
		let source = BytesSource::new(Bytes::from_static(b"abcdefg"));

		assert_eq!(source.read_chunk(3).await.unwrap().unwrap(), Bytes::from_static(b"abc"));
		assert_eq!(source.read_chunk(3).await.unwrap().unwrap(), Bytes::from_static(b"def"));
		assert_eq!(source.read_chunk(3).await.unwrap().unwrap(), Bytes::from_static(b"g"));
		assert!(source.read_chunk(3).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn reader_source_fills_chunks() {
		let data: &[u8] = b"0123456789";
		let source = ReaderSource::new(data);

		let all = read_to_end(&source, 4, 100).await.unwrap();
		assert_eq!(all, Bytes::from_static(b"0123456789"));
	}

	#[tokio::test]
	async fn capped_source_never_hands_out_more_than_its_cap() {
		let source = CappedSource::new(Box::new(BytesSource::new(Bytes::from_static(b"abcdefg"))), 2);

		assert_eq!(source.read_chunk(100).await.unwrap().unwrap(), Bytes::from_static(b"ab"));
		assert_eq!(source.read_chunk(1).await.unwrap().unwrap(), Bytes::from_static(b"c"));
		assert_eq!(read_to_end(&source, 100, 100).await.unwrap(), Bytes::from_static(b"defg"));
	}

	#[tokio::test]
	async fn sized_source_stops_at_its_size_and_fails_short_reads() {
		let longer = SizedSource::new(Box::new(BytesSource::new(Bytes::from_static(b"abcdefg"))), 4);
		assert_eq!(read_to_end(&longer, 3, 100).await.unwrap(), Bytes::from_static(b"abcd"));

		let shorter = SizedSource::new(Box::new(BytesSource::new(Bytes::from_static(b"ab"))), 4);
		let err = read_to_end(&shorter, 3, 100).await.unwrap_err();
		assert!(matches!(err, Error::SessionFailed(ref msg) if msg.contains("2 of 4")), "got {err:?}");
	}

	#[tokio::test]
	async fn read_to_end_enforces_limit() {
		let source = BytesSource::new(Bytes::from(vec![0u8; 64]));
		let err = read_to_end(&source, 16, 40).await.unwrap_err();
		assert!(matches!(err, Error::ImportTooLarge { limit: 40, .. }));
	}

	#[tokio::test]
	async fn remote_source_pulls_chunks_and_releases() {
		let (left, right) = memory::pair();
		let owner = Connection::spawn(left, "owner");
		let reader = Connection::spawn(right, "reader");

		let reference = owner.expose(ByteSourceService::new(Box::new(BytesSource::new(Bytes::from(vec![7u8; 10_000])))));
		assert_eq!(owner.exposed_objects(), 1);

		let remote = RemoteByteSource::new(reader.channel(reference));
		let all = read_to_end(&remote, 4096, 1 << 20).await.unwrap();
		assert_eq!(all.len(), 10_000);
		assert!(all.iter().all(|b| *b == 7));

		drop(remote);
		tokio::time::timeout(std::time::Duration::from_secs(2), async {
			while owner.exposed_objects() != 0 {
				tokio::time::sleep(std::time::Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
	}
}
