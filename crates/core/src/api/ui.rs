//! Interface a UI surface serves back to the host.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sqlview_protocol::methods::ui;
use sqlview_protocol::{BufferResult, ForceUpdateParams, Payload};
use sqlview_runtime::{BoxFuture, Channel, Dispatch, Request};

use super::worker::buffer_result;
use crate::error::{Error, Result};

#[async_trait]
pub trait UiApi: Send + Sync {
	/// Tells the surface its document changed; it should fetch a fresh payload.
	async fn force_update(&self, filename: &str) -> Result<()>;

	/// Returns the surface's view state, used as a backup of the document.
	async fn get_serialized_state_for_save(&self) -> Result<Bytes>;
}

/// Client stub the host uses to reach a surface.
#[derive(Clone, Debug)]
pub struct UiClient {
	channel: Channel,
}

impl UiClient {
	pub fn new(channel: Channel) -> Self {
		Self { channel }
	}
}

#[async_trait]
impl UiApi for UiClient {
	async fn force_update(&self, filename: &str) -> Result<()> {
		let params = ForceUpdateParams {
			filename: filename.to_string(),
		};
		self.channel.send_no_result(ui::FORCE_UPDATE, &params).await?;
		Ok(())
	}

	async fn get_serialized_state_for_save(&self) -> Result<Bytes> {
		let mut result = self
			.channel
			.call(ui::GET_SERIALIZED_STATE_FOR_SAVE, Payload::empty(), None)
			.await?;
		let reply: BufferResult = result.decode()?;
		Ok(result.take_buffer(reply.bytes)?)
	}
}

pub struct UiService {
	inner: Arc<dyn UiApi>,
}

impl UiService {
	pub fn new(inner: Arc<dyn UiApi>) -> Arc<Self> {
		Arc::new(Self { inner })
	}

	async fn handle(&self, request: Request) -> Result<Payload> {
		match request.method.as_str() {
			ui::FORCE_UPDATE => {
				let params: ForceUpdateParams = request.params()?;
				self.inner.force_update(&params.filename).await?;
				Ok(Payload::empty())
			}
			ui::GET_SERIALIZED_STATE_FOR_SAVE => buffer_result(self.inner.get_serialized_state_for_save().await?),
			_ => Err(request.unknown_method().into()),
		}
	}
}

impl Dispatch for UiService {
	fn dispatch(&self, request: Request) -> BoxFuture<'_, sqlview_runtime::Result<Payload>> {
		Box::pin(async move { self.handle(request).await.map_err(Error::into_rpc) })
	}
}
