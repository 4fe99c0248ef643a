//! Serving a worker over a byte stream.

use std::sync::Arc;

use sqlview::WorkerService;
use sqlview_runtime::Connection;
use sqlview_runtime::transport::PipeTransport;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::worker::SqliteWorker;

/// Serves a fresh [`SqliteWorker`] as the root object until the peer hangs up.
///
/// `reader` carries frames from the host, `writer` carries replies back.
pub async fn serve<R, W>(reader: R, writer: W)
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	serve_worker(SqliteWorker::new(), reader, writer).await
}

/// Serves `worker` as the root object until the peer hangs up.
pub async fn serve_worker<R, W>(worker: Arc<SqliteWorker>, reader: R, writer: W)
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin + Send + 'static,
{
	let (transport, message_rx) = PipeTransport::new(writer, reader);
	let connection = Arc::new(Connection::with_label(transport.into_transport_parts(message_rx), "worker"));
	connection.expose_root(WorkerService::new(worker));

	info!(target = "sqlview.worker", pid = std::process::id(), "worker serving");
	connection.run().await;
	info!(target = "sqlview.worker", "worker stopped");
}

/// Serves over the process's stdin and stdout. Stdout must carry nothing else.
pub async fn serve_stdio() {
	serve(tokio::io::stdin(), tokio::io::stdout()).await
}
