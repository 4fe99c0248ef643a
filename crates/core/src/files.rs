//! Access to document files.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::api::{ByteSource, ReaderSource};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
	pub size: u64,
	pub modified: Option<SystemTime>,
}

/// Reads documents and stores downloads on behalf of the orchestrator.
#[async_trait]
pub trait FileProvider: Send + Sync {
	async fn stat(&self, uri: &str) -> Result<FileStat>;

	async fn read(&self, uri: &str) -> Result<Bytes>;

	/// Opens the file for chunked reading.
	async fn open_stream(&self, uri: &str) -> Result<Box<dyn ByteSource>>;

	/// Reads the write-ahead log next to the database, if there is one.
	async fn read_wal(&self, uri: &str) -> Result<Option<Bytes>>;

	/// Stores bytes produced by a surface and returns where they went.
	async fn save_download(&self, bytes: Bytes, suggested_name: &str) -> Result<PathBuf>;
}

/// [`FileProvider`] over the local filesystem; URIs are paths.
#[derive(Debug, Clone)]
pub struct LocalFiles {
	download_dir: PathBuf,
}

impl LocalFiles {
	pub fn new(download_dir: impl Into<PathBuf>) -> Self {
		Self {
			download_dir: download_dir.into(),
		}
	}

	/// Downloads go to the user's download directory, else the working directory.
	pub fn with_default_downloads() -> Self {
		Self::new(dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")))
	}

	pub fn download_dir(&self) -> &Path {
		&self.download_dir
	}
}

fn wal_path(uri: &str) -> PathBuf {
	PathBuf::from(format!("{uri}-wal"))
}

/// Keeps only the final path component so a surface cannot escape the download directory.
fn sanitize_name(name: &str) -> String {
	let base = Path::new(name)
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("")
		.trim();
	if base.is_empty() || base == ".." {
		"download.bin".to_string()
	} else {
		base.to_string()
	}
}

#[async_trait]
impl FileProvider for LocalFiles {
	async fn stat(&self, uri: &str) -> Result<FileStat> {
		let meta = tokio::fs::metadata(uri).await?;
		Ok(FileStat {
			size: meta.len(),
			modified: meta.modified().ok(),
		})
	}

	async fn read(&self, uri: &str) -> Result<Bytes> {
		Ok(Bytes::from(tokio::fs::read(uri).await?))
	}

	async fn open_stream(&self, uri: &str) -> Result<Box<dyn ByteSource>> {
		let file = tokio::fs::File::open(uri).await?;
		Ok(Box::new(ReaderSource::new(file)))
	}

	async fn read_wal(&self, uri: &str) -> Result<Option<Bytes>> {
		match tokio::fs::read(wal_path(uri)).await {
			Ok(bytes) if bytes.is_empty() => Ok(None),
			Ok(bytes) => Ok(Some(Bytes::from(bytes))),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(err) => Err(err.into()),
		}
	}

	async fn save_download(&self, bytes: Bytes, suggested_name: &str) -> Result<PathBuf> {
		tokio::fs::create_dir_all(&self.download_dir).await?;
		let path = self.download_dir.join(sanitize_name(suggested_name));
		tokio::fs::write(&path, &bytes).await?;
		debug!(target = "sqlview.files", path = %path.display(), size = bytes.len(), "saved download");
		Ok(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::read_to_end;

	#[tokio::test]
	async fn stat_read_and_stream_agree() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.db");
		std::fs::write(&path, vec![3u8; 5000]).unwrap();
		let uri = path.to_str().unwrap();
		let files = LocalFiles::new(dir.path().join("downloads"));

		assert_eq!(files.stat(uri).await.unwrap().size, 5000);
		assert_eq!(files.read(uri).await.unwrap().len(), 5000);

		let stream = files.open_stream(uri).await.unwrap();
		let all = read_to_end(stream.as_ref(), 1024, 10_000).await.unwrap();
		assert_eq!(all.len(), 5000);
	}

	#[tokio::test]
	async fn wal_sidecar_is_optional() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.db");
		std::fs::write(&path, b"db").unwrap();
		let uri = path.to_str().unwrap();
		let files = LocalFiles::new(dir.path());

		assert!(files.read_wal(uri).await.unwrap().is_none());

		std::fs::write(dir.path().join("a.db-wal"), b"wal").unwrap();
		assert_eq!(files.read_wal(uri).await.unwrap().unwrap(), Bytes::from_static(b"wal"));
	}

	#[tokio::test]
	async fn downloads_stay_in_their_directory() {
		let dir = tempfile::tempdir().unwrap();
		let files = LocalFiles::new(dir.path().join("out"));

		let saved = files
			.save_download(Bytes::from_static(b"x"), "../../etc/export.db")
			.await
			.unwrap();
		assert_eq!(saved, dir.path().join("out").join("export.db"));
		assert_eq!(std::fs::read(&saved).unwrap(), b"x");

		let fallback = files.save_download(Bytes::from_static(b"y"), "").await.unwrap();
		assert!(fallback.ends_with("download.bin"));
	}
}
