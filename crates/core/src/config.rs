//! Host configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const MIB: u64 = 1024 * 1024;

/// Where database workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
	/// Inside the host process, over an in-memory transport.
	#[default]
	InProcess,
	/// In a child process per session, over its stdio.
	Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Largest database accepted for import, in bytes.
	pub max_import_size: u64,
	/// Files above this size are imported as a stream instead of one buffer.
	pub stream_threshold: u64,
	pub stream_chunk_size: usize,
	/// Whether documents may be opened editable (still subject to entitlements).
	pub editable: bool,
	pub worker: WorkerMode,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_import_size: 256 * MIB,
			stream_threshold: 32 * MIB,
			stream_chunk_size: MIB as usize,
			editable: false,
			worker: WorkerMode::default(),
		}
	}
}

impl Config {
	/// Default location: `<config dir>/sqlview/config.json`.
	pub fn default_path() -> Option<PathBuf> {
		dirs::config_dir().map(|dir| dir.join("sqlview").join("config.json"))
	}

	/// Loads `path`, or the default location when `path` is `None`.
	///
	/// An explicit path must exist; a missing default file yields defaults.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		match path {
			Some(path) => Self::from_file(path),
			None => match Self::default_path() {
				Some(path) if path.is_file() => Self::from_file(&path),
				_ => Ok(Self::default()),
			},
		}
	}

	pub fn from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)?;
		let config = serde_json::from_str(&content)?;
		tracing::debug!(target = "sqlview.config", path = %path.display(), "loaded config");
		Ok(config)
	}

	/// Chunk size clamped so a chunk never exceeds the threshold itself.
	pub(crate) fn chunk_size(&self) -> usize {
		let threshold = usize::try_from(self.stream_threshold).unwrap_or(usize::MAX);
		self.stream_chunk_size.clamp(1, threshold.max(1))
	}
}
