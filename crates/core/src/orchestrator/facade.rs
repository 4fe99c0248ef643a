use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use sqlview_protocol::{BlobQuery, CountQuery, Page, PageQuery, Row, RowQuery, TableInfo};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Inner;
use crate::api::{HostApi, InitialContent};
use crate::error::{Error, Result};
use crate::registry::SurfaceId;
use crate::session::Session;

/// What one surface sees of the host: its document's current generation.
pub(super) struct HostFacade {
	orchestrator: Weak<Inner>,
	uri: String,
	surface: SurfaceId,
}

impl HostFacade {
	pub(super) fn new(orchestrator: Weak<Inner>, uri: &str, surface: SurfaceId) -> Self {
		Self {
			orchestrator,
			uri: uri.to_string(),
			surface,
		}
	}

	fn inner(&self) -> Result<Arc<Inner>> {
		self.orchestrator.upgrade().ok_or(Error::SessionClosed)
	}

	fn session(&self) -> Result<Session> {
		Ok(self.inner()?.document(&self.uri)?.session().clone())
	}
}

#[async_trait]
impl HostApi for HostFacade {
	async fn get_initial_payload(&self) -> Result<InitialContent> {
		let inner = self.inner()?;
		let session = inner.document(&self.uri)?.session().clone();
		session.initial_content(inner.editable()).await
	}

	async fn request_refresh(&self) -> Result<InitialContent> {
		let inner = self.inner()?;
		inner.refresh(&self.uri, Some(&self.surface)).await?;
		let session = inner.document(&self.uri)?.session().clone();
		session.initial_content(inner.editable()).await
	}

	async fn download_binary(&self, bytes: Bytes, suggested_name: &str, open_after: bool) -> Result<()> {
		let inner = self.inner()?;
		let size = bytes.len();
		let path = inner.ctx.files.save_download(bytes, suggested_name).await?;
		info!(target = "sqlview.session", surface = %self.surface, path = %path.display(), size, open_after, "download saved");
		Ok(())
	}

	async fn list_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableInfo>> {
		self.session()?.list_tables(cancel).await
	}

	async fn get_page(&self, query: PageQuery, cancel: &CancellationToken) -> Result<Page> {
		self.session()?.get_page(query, cancel).await
	}

	async fn get_count(&self, query: CountQuery, cancel: &CancellationToken) -> Result<u64> {
		self.session()?.get_count(query, cancel).await
	}

	async fn get_by_row_id(&self, query: RowQuery, cancel: &CancellationToken) -> Result<Option<Row>> {
		self.session()?.get_by_row_id(query, cancel).await
	}

	async fn get_blob(&self, query: BlobQuery, cancel: &CancellationToken) -> Result<Bytes> {
		self.session()?.get_blob(query, cancel).await
	}

	async fn export_database(&self, cancel: &CancellationToken) -> Result<Bytes> {
		self.session()?.export_database(cancel).await
	}
}
