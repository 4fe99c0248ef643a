//! A worker served over a framed byte stream, driven by the typed client.

use std::time::Duration;

use bytes::Bytes;
use sqlview::{BytesSource, Error, WorkerApi, WorkerClient, WorkerHandle};
use sqlview_protocol::{CellValue, CountQuery, ImportOptions, PageQuery};
use sqlview_runtime::Connection;
use sqlview_runtime::transport::PipeTransport;
use sqlview_worker::SqliteWorker;
use tokio_util::sync::CancellationToken;

fn fixture(rows: usize) -> Bytes {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("fixture.db");
	{
		let conn = rusqlite::Connection::open(&path).unwrap();
		conn.execute_batch(
			"CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
			 CREATE VIEW forever AS
			   WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c;",
		)
		.unwrap();
		for i in 1..=rows {
			conn.execute("INSERT INTO items (id, name) VALUES (?1, ?2)", rusqlite::params![i as i64, format!("row{i}")])
				.unwrap();
		}
	}
	Bytes::from(std::fs::read(&path).unwrap())
}

struct Harness {
	client: WorkerClient,
	connection: std::sync::Arc<Connection>,
	server: tokio::task::JoinHandle<()>,
}

fn start() -> Harness {
	let (host_end, worker_end) = tokio::io::duplex(64 * 1024);

	let (worker_read, worker_write) = tokio::io::split(worker_end);
	let server = tokio::spawn(sqlview_worker::serve(worker_read, worker_write));

	let (host_read, host_write) = tokio::io::split(host_end);
	let (transport, message_rx) = PipeTransport::new(host_write, host_read);
	let connection = Connection::spawn(transport.into_transport_parts(message_rx), "host");

	Harness {
		client: WorkerClient::new(connection.root()),
		connection,
		server,
	}
}

fn options(max_size: u64) -> ImportOptions {
	ImportOptions {
		max_size,
		read_only: true,
	}
}

#[tokio::test]
async fn buffer_import_and_reads_cross_the_pipe() {
	let harness = start();
	let client = &harness.client;
	let cancel = CancellationToken::new();

	client
		.import_from_buffer("app.db", fixture(120), None, options(1 << 30))
		.await
		.unwrap();

	let page = client
		.get_page(
			PageQuery {
				name: "app.db".to_string(),
				table: "items".to_string(),
				offset: 100,
				limit: 50,
				order_by: None,
				filter: None,
			},
			&cancel,
		)
		.await
		.unwrap();
	assert_eq!(page.rows.len(), 20);
	assert_eq!(page.rows[0].values[1], CellValue::Text("row101".to_string()));

	let exported = client.export_database("app.db", &cancel).await.unwrap();
	assert_eq!(&exported[..6], b"SQLite");
}

#[tokio::test]
async fn stream_import_pulls_from_the_host() {
	let harness = start();
	let bytes = fixture(2000);
	let size = bytes.len() as u64;

	harness
		.client
		.import_from_stream("big.db", Box::new(BytesSource::new(bytes)), size, None, options(1 << 30))
		.await
		.unwrap();
	assert_eq!(harness.connection.exposed_objects(), 0);

	let count = harness
		.client
		.get_count(
			CountQuery {
				name: "big.db".to_string(),
				table: "items".to_string(),
				filter: None,
			},
			&CancellationToken::new(),
		)
		.await
		.unwrap();
	assert_eq!(count, 2000);
}

#[tokio::test]
async fn domain_errors_keep_their_shape() {
	let harness = start();

	let err = harness
		.client
		.import_from_buffer("app.db", fixture(10), None, options(100))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::ImportTooLarge { limit: 100, .. }), "got {err:?}");

	let err = harness
		.client
		.list_tables("missing.db", &CancellationToken::new())
		.await
		.unwrap_err();
	assert!(matches!(err, Error::Query(_)), "got {err:?}");
}

#[tokio::test]
async fn cancel_travels_to_the_worker() {
	let harness = start();
	harness
		.client
		.import_from_buffer("app.db", fixture(5), None, options(1 << 30))
		.await
		.unwrap();

	let cancel = CancellationToken::new();
	let call = {
		let client = harness.client.clone();
		let cancel = cancel.clone();
		tokio::spawn(async move {
			client
				.get_count(
					CountQuery {
						name: "app.db".to_string(),
						table: "forever".to_string(),
						filter: None,
					},
					&cancel,
				)
				.await
		})
	};

	tokio::time::sleep(Duration::from_millis(100)).await;
	cancel.cancel();
	let err = tokio::time::timeout(Duration::from_secs(2), call)
		.await
		.unwrap()
		.unwrap()
		.unwrap_err();
	assert!(err.is_canceled(), "got {err:?}");
}

#[tokio::test]
async fn worker_stops_when_the_host_hangs_up() {
	let harness = start();
	harness.client.close().await.unwrap();
	harness.connection.close();
	drop(harness.client);

	tokio::time::timeout(Duration::from_secs(2), harness.server)
		.await
		.unwrap()
		.unwrap();
}

#[tokio::test]
async fn released_handle_removes_the_imported_copy() {
	let worker = SqliteWorker::new();
	let (host_end, worker_end) = tokio::io::duplex(64 * 1024);
	let (worker_read, worker_write) = tokio::io::split(worker_end);
	let server = tokio::spawn(sqlview_worker::serve_worker(
		std::sync::Arc::clone(&worker),
		worker_read,
		worker_write,
	));

	let (host_read, host_write) = tokio::io::split(host_end);
	let (transport, message_rx) = PipeTransport::new(host_write, host_read);
	let connection = Connection::spawn(transport.into_transport_parts(message_rx), "app.db#1");
	let handle = WorkerHandle::remote("app.db#1", connection, None);

	handle
		.api()
		.import_from_buffer("app.db", fixture(50), None, options(1 << 30))
		.await
		.unwrap();
	let dir = worker.data_dir().unwrap().to_path_buf();
	assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

	// Released the way a replaced generation is: dropped, never terminated.
	drop(handle);

	tokio::time::timeout(Duration::from_secs(2), server)
		.await
		.unwrap()
		.unwrap();
	assert!(worker.databases().is_empty());
	assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

	drop(worker);
	assert!(!dir.exists());
}
