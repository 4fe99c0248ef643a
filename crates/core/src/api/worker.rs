//! Interface of the isolated database worker.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sqlview_protocol::methods::worker;
use sqlview_protocol::{
	BlobQuery, BufferRef, BufferResult, CountQuery, ImportBufferParams, ImportOptions, ImportStreamParams, NameParams,
	Page, PageQuery, Payload, Row, RowQuery, TableInfo, TransferBuffer,
};
use sqlview_runtime::{BoxFuture, Channel, Dispatch, Request};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::stream::{ByteSource, ByteSourceService, RemoteByteSource};
use crate::error::{Error, Result};

/// Operations a database worker serves.
///
/// Imports are issued only by the session that owns the worker. Reads are
/// stateless, may run concurrently and honor `cancel`.
#[async_trait]
pub trait WorkerApi: Send + Sync {
	async fn import_from_buffer(&self, name: &str, bytes: Bytes, wal: Option<Bytes>, options: ImportOptions) -> Result<()>;

	/// Imports by pulling chunks from `source`; `size` is the announced length.
	async fn import_from_stream(
		&self,
		name: &str,
		source: Box<dyn ByteSource>,
		size: u64,
		wal: Option<Bytes>,
		options: ImportOptions,
	) -> Result<()>;

	async fn list_tables(&self, name: &str, cancel: &CancellationToken) -> Result<Vec<TableInfo>>;

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page>;

	async fn get_count(&self, query: CountQuery, cancel: &CancellationToken) -> Result<u64>;

	async fn get_by_row_id(&self, query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>>;

	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes>;

	/// Serializes the named database into a single self-contained file image.
	async fn export_database(&self, name: &str, cancel: &CancellationToken) -> Result<Bytes>;

	/// Drops every imported database.
	async fn close(&self) -> Result<()>;
}

/// Client stub calling a worker over a connection.
#[derive(Clone, Debug)]
pub struct WorkerClient {
	channel: Channel,
}

impl WorkerClient {
	pub fn new(channel: Channel) -> Self {
		Self { channel }
	}

	pub fn channel(&self) -> &Channel {
		&self.channel
	}

	async fn read<P, R>(&self, method: &str, params: &P, cancel: &CancellationToken) -> Result<R>
	where
		P: serde::Serialize + Sync,
		R: serde::de::DeserializeOwned,
	{
		let result = self.channel.call(method, Payload::encode(params)?, Some(cancel)).await?;
		Ok(result.decode()?)
	}

	async fn read_buffer<P: serde::Serialize + Sync>(&self, method: &str, params: &P, cancel: &CancellationToken) -> Result<Bytes> {
		let mut result = self.channel.call(method, Payload::encode(params)?, Some(cancel)).await?;
		let reply: BufferResult = result.decode()?;
		Ok(result.take_buffer(reply.bytes)?)
	}
}

#[async_trait]
impl WorkerApi for WorkerClient {
	async fn import_from_buffer(&self, name: &str, bytes: Bytes, wal: Option<Bytes>, options: ImportOptions) -> Result<()> {
		let mut payload = Payload::empty();
		let bytes = payload.transfer(&mut TransferBuffer::new(bytes))?;
		let wal = transfer_optional(&mut payload, wal)?;
		let payload = payload.with_value(&ImportBufferParams {
			name: name.to_string(),
			bytes,
			wal,
			options,
		})?;
		self.channel.call(worker::IMPORT_FROM_BUFFER, payload, None).await?;
		Ok(())
	}

	async fn import_from_stream(
		&self,
		name: &str,
		source: Box<dyn ByteSource>,
		size: u64,
		wal: Option<Bytes>,
		options: ImportOptions,
	) -> Result<()> {
		let exposed = self.channel.connection().expose_scoped(ByteSourceService::new(source));

		let mut payload = Payload::empty();
		let wal = transfer_optional(&mut payload, wal)?;
		let payload = payload.with_value(&ImportStreamParams {
			name: name.to_string(),
			source: exposed.reference(),
			size,
			wal,
			options,
		})?;
		self.channel.call(worker::IMPORT_FROM_STREAM, payload, None).await?;
		Ok(())
	}

	async fn list_tables(&self, name: &str, cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		let params = NameParams { name: name.to_string() };
		self.read(worker::LIST_TABLES, &params, cancel).await
	}

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page> {
		self.read(worker::GET_PAGE, &query, cancel).await
	}

	async fn get_count(&self, query: CountQuery, cancel: &CancellationToken) -> Result<u64> {
		self.read(worker::GET_COUNT, &query, cancel).await
	}

	async fn get_by_row_id(&self, query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>> {
		self.read(worker::GET_BY_ROW_ID, &query, cancel).await
	}

	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes> {
		self.read_buffer(worker::GET_BLOB, &query, cancel).await
	}

	async fn export_database(&self, name: &str, cancel: &CancellationToken) -> Result<Bytes> {
		let params = NameParams { name: name.to_string() };
		self.read_buffer(worker::EXPORT_DATABASE, &params, cancel).await
	}

	async fn close(&self) -> Result<()> {
		self.channel.call(worker::CLOSE, Payload::empty(), None).await?;
		Ok(())
	}
}

/// Service adapter routing worker calls to a [`WorkerApi`] implementation.
pub struct WorkerService {
	inner: Arc<dyn WorkerApi>,
}

impl WorkerService {
	pub fn new(inner: Arc<dyn WorkerApi>) -> Arc<Self> {
		Arc::new(Self { inner })
	}

	async fn handle(&self, mut request: Request) -> Result<Payload> {
		let cancel = request.cancel.clone();
		match request.method.as_str() {
			worker::IMPORT_FROM_BUFFER => {
				let params: ImportBufferParams = request.params()?;
				let bytes = request.take_buffer(params.bytes)?;
				let wal = request.take_optional(params.wal)?;
				debug!(target = "sqlview.worker", name = %params.name, size = bytes.len(), wal = wal.is_some(), "import from buffer");
				self.inner.import_from_buffer(&params.name, bytes, wal, params.options).await?;
				Ok(Payload::empty())
			}
			worker::IMPORT_FROM_STREAM => {
				let params: ImportStreamParams = request.params()?;
				let wal = request.take_optional(params.wal)?;
				let source = RemoteByteSource::new(request.channel(params.source));
				debug!(target = "sqlview.worker", name = %params.name, size = params.size, "import from stream");
				self.inner
					.import_from_stream(&params.name, Box::new(source), params.size, wal, params.options)
					.await?;
				Ok(Payload::empty())
			}
			worker::LIST_TABLES => {
				let params: NameParams = request.params()?;
				Ok(Payload::encode(&self.inner.list_tables(&params.name, &cancel).await?)?)
			}
			worker::GET_PAGE => {
				let query: PageQuery = request.params()?;
				Ok(Payload::encode(&self.inner.get_page(query, &cancel).await?)?)
			}
			worker::GET_COUNT => {
				let query: CountQuery = request.params()?;
				Ok(Payload::encode(&self.inner.get_count(query, &cancel).await?)?)
			}
			worker::GET_BY_ROW_ID => {
				let query: RowQuery = request.params()?;
				Ok(Payload::encode(&self.inner.get_by_row_id(query, &cancel).await?)?)
			}
			worker::GET_BLOB => {
				let query: BlobQuery = request.params()?;
				buffer_result(self.inner.get_blob(query, &cancel).await?)
			}
			worker::EXPORT_DATABASE => {
				let params: NameParams = request.params()?;
				buffer_result(self.inner.export_database(&params.name, &cancel).await?)
			}
			worker::CLOSE => {
				self.inner.close().await?;
				Ok(Payload::empty())
			}
			_ => Err(request.unknown_method().into()),
		}
	}
}

/// Result payload transferring `bytes` instead of copying them into JSON.
pub(crate) fn buffer_result(bytes: Bytes) -> Result<Payload> {
	let mut payload = Payload::empty();
	let bytes = payload.transfer(&mut TransferBuffer::new(bytes))?;
	Ok(payload.with_value(&BufferResult { bytes })?)
}

fn transfer_optional(payload: &mut Payload, bytes: Option<Bytes>) -> Result<Option<BufferRef>> {
	Ok(bytes
		.map(|bytes| payload.transfer(&mut TransferBuffer::new(bytes)))
		.transpose()?)
}

impl Dispatch for WorkerService {
	fn dispatch(&self, request: Request) -> BoxFuture<'_, sqlview_runtime::Result<Payload>> {
		Box::pin(async move { self.handle(request).await.map_err(Error::into_rpc) })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffer_result_moves_bytes_into_the_transfer_list() {
		let mut payload = buffer_result(Bytes::from_static(b"SQLite format 3")).unwrap();

		assert_eq!(payload.buffer_count(), 1);
		assert_eq!(payload.value()["bytes"]["$buffer"], 0);
		let reply: BufferResult = payload.decode().unwrap();
		assert_eq!(payload.take_buffer(reply.bytes).unwrap(), Bytes::from_static(b"SQLite format 3"));
	}

	#[test]
	fn absent_wal_adds_no_buffer() {
		let mut payload = Payload::empty();
		assert!(transfer_optional(&mut payload, None).unwrap().is_none());
		assert_eq!(payload.buffer_count(), 0);

		let wal = transfer_optional(&mut payload, Some(Bytes::from_static(b"wal"))).unwrap();
		assert_eq!(wal, Some(BufferRef { index: 0 }));
		assert_eq!(payload.buffer_count(), 1);
	}
}
