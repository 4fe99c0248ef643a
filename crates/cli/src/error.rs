use std::path::PathBuf;

use sqlview::ErrorClass;
use thiserror::Error;

use crate::output::{CommandError, ErrorCode};

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Sqlview(#[from] sqlview::Error),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("failed to write {path}")]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("file watcher failed: {0}")]
	Watch(#[from] notify::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

fn sqlview_code(err: &sqlview::Error) -> ErrorCode {
	use sqlview::Error;

	match err {
		Error::ImportTooLarge { .. } => ErrorCode::ImportTooLarge,
		Error::ImportFailed(_) => ErrorCode::ImportFailed,
		Error::Query(_) => ErrorCode::QueryFailed,
		Error::DocumentNotFound(_) | Error::SurfaceNotFound(_) => ErrorCode::InvalidInput,
		Error::Io(_) => ErrorCode::IoError,
		err if err.is_canceled() => ErrorCode::Canceled,
		err if err.class() == ErrorClass::SessionBroken => ErrorCode::SessionError,
		_ => ErrorCode::InternalError,
	}
}

impl CliError {
	/// Converts this error to a CommandError for structured output
	pub fn to_command_error(&self) -> CommandError {
		let (code, details) = match self {
			CliError::Sqlview(err) => {
				let details = match err {
					sqlview::Error::ImportTooLarge { size, limit } => {
						Some(serde_json::json!({ "size": size, "limit": limit }))
					}
					_ => None,
				};
				(sqlview_code(err), details)
			}
			CliError::InvalidInput(_) => (ErrorCode::InvalidInput, None),
			CliError::Write { path, .. } => (ErrorCode::IoError, Some(serde_json::json!({ "path": path }))),
			CliError::Watch(_) | CliError::Io(_) => (ErrorCode::IoError, None),
			CliError::Json(_) | CliError::Anyhow(_) => (ErrorCode::InternalError, None),
		};

		let message = match self {
			// Keep the whole context chain; the top line alone is rarely enough.
			CliError::Anyhow(err) => format!("{err:#}"),
			CliError::Write { path, source } => format!("failed to write {}: {source}", path.display()),
			other => other.to_string(),
		};

		CommandError { code, message, details }
	}
}
