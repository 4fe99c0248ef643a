//! Host facade served to UI surfaces.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sqlview_protocol::methods::{host, worker};
use sqlview_protocol::{
	BlobQuery, BufferResult, ContentRef, CountQuery, DownloadParams, InitialPayload, NameParams, Page, PageQuery,
	Payload, Row, RowQuery, TableInfo, TransferBuffer,
};
use sqlview_runtime::{BoxFuture, Channel, Connection, Dispatch, Request};
use tokio_util::sync::CancellationToken;

use super::stream::{ByteSource, ByteSourceService, RemoteByteSource};
use super::worker::buffer_result;
use crate::error::{Error, Result};

/// Raw document bytes as handed to a surface.
pub enum Content {
	Inline(Bytes),
	Stream(Box<dyn ByteSource>),
}

impl fmt::Debug for Content {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Content::Inline(bytes) => f.debug_tuple("Inline").field(&bytes.len()).finish(),
			Content::Stream(_) => f.write_str("Stream"),
		}
	}
}

/// Everything a surface needs to render a document.
#[derive(Debug)]
pub struct InitialContent {
	pub filename: String,
	pub generation: u64,
	pub size: u64,
	pub editable: bool,
	pub size_limit: u64,
	pub content: Content,
}

/// Operations the host offers a UI surface.
///
/// Reads mirror the worker's; the host routes them to the current session
/// generation of the surface's document.
#[async_trait]
pub trait HostApi: Send + Sync {
	async fn get_initial_payload(&self) -> Result<InitialContent>;

	/// Reloads the document from disk and returns the new payload.
	async fn request_refresh(&self) -> Result<InitialContent>;

	/// Saves bytes produced by the surface, optionally opening the result.
	async fn download_binary(&self, bytes: Bytes, suggested_name: &str, open_after: bool) -> Result<()>;

	async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableInfo>>;

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page>;

	async fn get_count(&self, query: CountQuery, cancel: &CancellationToken) -> Result<u64>;

	async fn get_by_row_id(&self, query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>>;

	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes>;

	async fn export_database(&self, cancel: &CancellationToken) -> Result<Bytes>;
}

/// Client stub used by a surface to call its host.
#[derive(Clone, Debug)]
pub struct HostClient {
	channel: Channel,
}

impl HostClient {
	pub fn new(channel: Channel) -> Self {
		Self { channel }
	}

	/// Stub for the root object of the host side of `connection`.
	pub fn connect(connection: &Arc<Connection>) -> Self {
		Self::new(connection.root())
	}

	fn initial_content(&self, mut result: Payload) -> Result<InitialContent> {
		let payload: InitialPayload = result.decode()?;
		let content = match payload.content {
			ContentRef::Inline { bytes } => Content::Inline(result.take_buffer(bytes)?),
			ContentRef::Stream { source } => {
				Content::Stream(Box::new(RemoteByteSource::new(self.channel.connection().channel(source))))
			}
		};
		Ok(InitialContent {
			filename: payload.filename,
			generation: payload.generation,
			size: payload.size,
			editable: payload.editable,
			size_limit: payload.size_limit,
			content,
		})
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
impl HostApi for HostClient {
	async fn get_initial_payload(&self) -> Result<InitialContent> {
		let result = self.channel.call(host::GET_INITIAL_PAYLOAD, Payload::empty(), None).await?;
		self.initial_content(result)
	}

	async fn request_refresh(&self) -> Result<InitialContent> {
		let result = self.channel.call(host::REQUEST_REFRESH, Payload::empty(), None).await?;
		self.initial_content(result)
	}

	async fn download_binary(&self, bytes: Bytes, suggested_name: &str, open_after: bool) -> Result<()> {
		let mut payload = Payload::empty();
		let bytes = payload.transfer(&mut TransferBuffer::new(bytes))?;
		let payload = payload.with_value(&DownloadParams {
			bytes,
			suggested_name: suggested_name.to_string(),
			open_after,
		})?;
		self.channel.call(host::DOWNLOAD_BINARY, payload, None).await?;
		Ok(())
	}

	async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		self.read(worker::LIST_TABLES, &NameParams { name: String::new() }, cancel).await
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

	async fn export_database(&self, cancel: &CancellationToken) -> Result<Bytes> {
		self.read_buffer(worker::EXPORT_DATABASE, &NameParams { name: String::new() }, cancel)
			.await
	}
}

/// Service adapter exposing a [`HostApi`] to a surface.
pub struct HostService {
	inner: Arc<dyn HostApi>,
}

impl HostService {
	pub fn new(inner: Arc<dyn HostApi>) -> Arc<Self> {
		Arc::new(Self { inner })
	}

	fn initial_payload(request: &Request, content: InitialContent) -> Result<Payload> {
		let mut payload = Payload::empty();
		let content_ref = match content.content {
			Content::Inline(bytes) => ContentRef::Inline {
				bytes: payload.transfer(&mut TransferBuffer::new(bytes))?,
			},
			// Stays exposed until the surface releases its proxy.
			Content::Stream(source) => ContentRef::Stream {
				source: request.connection.expose(ByteSourceService::new(source)),
			},
		};
		Ok(payload.with_value(&InitialPayload {
			filename: content.filename,
			generation: content.generation,
			size: content.size,
			editable: content.editable,
			size_limit: content.size_limit,
			content: content_ref,
		})?)
	}

	async fn handle(&self, mut request: Request) -> Result<Payload> {
		let cancel = request.cancel.clone();
		match request.method.as_str() {
			host::GET_INITIAL_PAYLOAD => {
				let content = self.inner.get_initial_payload().await?;
				Self::initial_payload(&request, content)
			}
			host::REQUEST_REFRESH => {
				let content = self.inner.request_refresh().await?;
				Self::initial_payload(&request, content)
			}
			host::DOWNLOAD_BINARY => {
				let params: DownloadParams = request.params()?;
				let bytes = request.take_buffer(params.bytes)?;
				self.inner
					.download_binary(bytes, &params.suggested_name, params.open_after)
					.await?;
				Ok(Payload::empty())
			}
			worker::LIST_TABLES => Ok(Payload::encode(&self.inner.list_tables(&cancel).await?)?),
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
			worker::EXPORT_DATABASE => buffer_result(self.inner.export_database(&cancel).await?),
			_ => Err(request.unknown_method().into()),
		}
	}
}

impl Dispatch for HostService {
	fn dispatch(&self, request: Request) -> BoxFuture<'_, sqlview_runtime::Result<Payload>> {
		Box::pin(async move { self.handle(request).await.map_err(Error::into_rpc) })
	}
}
