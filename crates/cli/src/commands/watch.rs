//! `sqlview watch`: follow a file on disk.
//!
//! Filesystem events for the database (or its WAL) are debounced and turned
//! into `file_changed` on the orchestrator. The refresh fans `force_update`
//! out to the attached surfaces, this process included, and the page is
//! printed again when that update arrives.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use sqlview::HostApi;
use sqlview::protocol::PageQuery;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CliError, Result};
use crate::output::{OutputFormat, ResultBuilder, print_result};
use crate::viewer::Viewer;

/// Quiet period after the last event before a change is reported.
const DEBOUNCE: Duration = Duration::from_millis(250);

pub async fn run(mut viewer: Viewer, query: PageQuery, format: OutputFormat) -> Result<()> {
	let outcome = follow(&mut viewer, &query, format).await;
	viewer.close().await;
	outcome
}

async fn follow(viewer: &mut Viewer, query: &PageQuery, format: OutputFormat) -> Result<()> {
	let initial = viewer.host().get_initial_payload().await?;
	info!(target = "sqlview.files", file = %initial.filename, size = initial.size, generation = initial.generation, "watching");
	print_page(viewer, query, initial.generation, format).await?;

	let mut changes = FileWatcher::start(viewer.path())?;
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			changed = changes.next() => {
				if changed.is_none() {
					break;
				}
				match viewer.orchestrator().file_changed(viewer.uri()).await {
					Ok(()) => debug!(target = "sqlview.files", "file reloaded"),
					// The session stays failed until the next change fixes the file.
					Err(err) => {
						warn!(target = "sqlview.files", error = %err, "reload failed");
						eprintln!("reload failed: {err}");
					}
				}
			}
			update = viewer.next_update() => {
				if update.is_none() {
					break;
				}
				let payload = viewer.host().get_initial_payload().await?;
				print_page(viewer, query, payload.generation, format).await?;
			}
		}
	}
	Ok(())
}

async fn print_page(viewer: &Viewer, query: &PageQuery, generation: u64, format: OutputFormat) -> Result<()> {
	let started = Instant::now();
	let page = viewer.host().get_page(query.clone(), &CancellationToken::new()).await?;
	if format == OutputFormat::Text {
		println!("== {} (generation {generation}) ==", query.table);
	}
	let result = ResultBuilder::new("watch")
		.started_at(started)
		.inputs(json!({ "table": query.table, "generation": generation }))
		.data(page)
		.build();
	print_result(&result, format);
	Ok(())
}

fn wal_of(path: &Path) -> PathBuf {
	let mut wal = path.as_os_str().to_owned();
	wal.push("-wal");
	PathBuf::from(wal)
}

fn is_relevant(event: &Event, targets: &[PathBuf]) -> bool {
	matches!(
		event.kind,
		EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
	) && event.paths.iter().any(|p| targets.contains(p))
}

/// Forwards one signal per burst of raw events, once `quiet` has passed without any.
async fn debounce(mut raw: mpsc::UnboundedReceiver<()>, settled: mpsc::UnboundedSender<()>, quiet: Duration) {
	while raw.recv().await.is_some() {
		loop {
			match tokio::time::timeout(quiet, raw.recv()).await {
				Ok(Some(())) => continue,
				Ok(None) | Err(_) => break,
			}
		}
		if settled.send(()).is_err() {
			return;
		}
	}
}

/// Watches the directory holding a database for changes to it or its WAL.
struct FileWatcher {
	_watcher: RecommendedWatcher,
	settled: mpsc::UnboundedReceiver<()>,
}

impl FileWatcher {
	fn start(path: &Path) -> Result<Self> {
		let dir = path
			.parent()
			.ok_or_else(|| CliError::InvalidInput(format!("{} has no parent directory", path.display())))?
			.to_path_buf();
		let targets = vec![path.to_path_buf(), wal_of(path)];

		let (raw_tx, raw_rx) = mpsc::unbounded_channel();
		let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| match event {
			Ok(event) if is_relevant(&event, &targets) => {
				let _ = raw_tx.send(());
			}
			Ok(_) => {}
			Err(err) => warn!(target = "sqlview.files", error = %err, "watch error"),
		})?;
		watcher.watch(&dir, RecursiveMode::NonRecursive)?;

		let (settled_tx, settled) = mpsc::unbounded_channel();
		tokio::spawn(debounce(raw_rx, settled_tx, DEBOUNCE));
		debug!(target = "sqlview.files", dir = %dir.display(), "file watcher started");

		Ok(Self {
			_watcher: watcher,
			settled,
		})
	}

	/// Next settled change; `None` once the watcher is gone.
	async fn next(&mut self) -> Option<()> {
		self.settled.recv().await
	}
}

#[cfg(test)]
mod tests {
	use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind};

	use super::*;

	fn event(kind: EventKind, path: &str) -> Event {
		Event::new(kind).add_path(PathBuf::from(path))
	}

	#[test]
	fn only_the_database_and_its_wal_count() {
		let targets = vec![PathBuf::from("/data/app.db"), wal_of(Path::new("/data/app.db"))];

		assert!(is_relevant(
			&event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/data/app.db"),
			&targets
		));
		assert!(is_relevant(
			&event(EventKind::Create(CreateKind::File), "/data/app.db-wal"),
			&targets
		));
		assert!(!is_relevant(
			&event(EventKind::Modify(ModifyKind::Any), "/data/other.db"),
			&targets
		));
		assert!(!is_relevant(
			&event(EventKind::Access(AccessKind::Any), "/data/app.db"),
			&targets
		));
	}

	#[tokio::test]
	async fn bursts_collapse_into_one_change() {
		let quiet = Duration::from_millis(100);
		let (raw_tx, raw_rx) = mpsc::unbounded_channel();
		let (settled_tx, mut settled) = mpsc::unbounded_channel();
		tokio::spawn(debounce(raw_rx, settled_tx, quiet));

		for _ in 0..5 {
			raw_tx.send(()).unwrap();
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		tokio::time::sleep(quiet * 3).await;
		assert_eq!(settled.try_recv(), Ok(()));
		assert!(settled.try_recv().is_err());

		raw_tx.send(()).unwrap();
		tokio::time::sleep(quiet * 3).await;
		assert_eq!(settled.try_recv(), Ok(()));

		drop(raw_tx);
		assert_eq!(settled.recv().await, None);
	}
}
