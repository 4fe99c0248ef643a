//! Worker process management
//!
//! Locates and launches the isolated worker executable and wires its stdio
//! into a [`PipeTransport`]. The worker serves one connection over its
//! stdin/stdout; stderr is inherited so its logs reach the host's terminal.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{PipeTransport, TransportParts};

/// Environment variable overriding the worker executable.
pub const WORKER_PATH_ENV: &str = "SQLVIEW_WORKER_PATH";

/// Subcommand the bundled binary uses to run as a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	pub env: Vec<(OsString, OsString)>,
	/// Largest frame accepted from the worker; the pipe default when unset.
	pub max_frame_len: Option<usize>,
}

impl WorkerCommand {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: Vec::new(),
			max_frame_len: None,
		}
	}

	pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}

	pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
		self.max_frame_len = Some(max_frame_len);
		self
	}
}

/// Get the command that starts a worker.
///
/// Lookup order:
/// 1. `SQLVIEW_WORKER_PATH` (a dedicated worker executable, run without arguments)
/// 2. The current executable with the `worker` subcommand
///
/// # Errors
///
/// Returns `Error::WorkerNotFound` if neither can be resolved.
pub fn locate_worker() -> Result<WorkerCommand> {
	resolve_worker(std::env::var_os(WORKER_PATH_ENV), std::env::current_exe().ok())
}

fn resolve_worker(override_path: Option<OsString>, current_exe: Option<PathBuf>) -> Result<WorkerCommand> {
	if let Some(path) = override_path.filter(|p| !p.is_empty()) {
		let path = PathBuf::from(path);
		if !path.exists() {
			debug!(target = "sqlview.worker", path = %path.display(), "{WORKER_PATH_ENV} points to a missing file");
			return Err(Error::WorkerNotFound);
		}
		return Ok(WorkerCommand::new(path));
	}

	current_exe
		.map(|exe| WorkerCommand::new(exe).arg(WORKER_SUBCOMMAND))
		.ok_or(Error::WorkerNotFound)
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
	/// The worker child process
	pub process: Child,
}

impl WorkerProcess {
	/// Launch a worker and return the transport speaking to it.
	///
	/// The child is killed if the returned handle is dropped.
	///
	/// # Errors
	///
	/// Returns `Error::LaunchFailed` if the process fails to start or exits immediately.
	pub async fn launch(command: &WorkerCommand) -> Result<(Self, TransportParts)> {
		let mut cmd = Command::new(&command.program);
		cmd.args(&command.args)
			.envs(command.env.iter().map(|(k, v)| (k, v)))
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true);

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::LaunchFailed(format!("Failed to spawn {}: {e}", command.program.display())))?;

		// Check if process started successfully
		tokio::time::sleep(Duration::from_millis(100)).await;

		match child.try_wait() {
			Ok(Some(status)) => {
				return Err(Error::LaunchFailed(format!(
					"Worker process exited immediately with status: {status}"
				)));
			}
			Ok(None) => {}
			Err(e) => {
				return Err(Error::LaunchFailed(format!("Failed to check process status: {e}")));
			}
		}

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| Error::LaunchFailed("worker stdin was not captured".to_string()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| Error::LaunchFailed("worker stdout was not captured".to_string()))?;

		let (mut transport, message_rx) = PipeTransport::new(stdin, stdout);
		if let Some(max_frame_len) = command.max_frame_len {
			transport = transport.with_max_frame_len(max_frame_len);
		}
		debug!(target = "sqlview.worker", pid = ?child.id(), program = %command.program.display(), "worker launched");

		Ok((Self { process: child }, transport.into_transport_parts(message_rx)))
	}

	pub fn id(&self) -> Option<u32> {
		self.process.id()
	}

	/// Waits briefly for the worker to exit on its own, then kills it.
	///
	/// A worker exits once its stdin closes, so callers close the connection first.
	pub async fn shutdown(mut self) -> Result<()> {
		match tokio::time::timeout(Duration::from_secs(2), self.process.wait()).await {
			Ok(Ok(status)) => {
				debug!(target = "sqlview.worker", %status, "worker exited");
				Ok(())
			}
			Ok(Err(e)) => Err(Error::LaunchFailed(format!("Failed to wait for worker: {e}"))),
			Err(_) => self.kill().await,
		}
	}

	/// Force kill the worker process.
	pub async fn kill(mut self) -> Result<()> {
		self.process
			.kill()
			.await
			.map_err(|e| Error::LaunchFailed(format!("Failed to kill worker: {e}")))?;
		let _ = self.process.wait().await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use sqlview_protocol::{Message, Packet};

	use super::*;

	#[test]
	fn test_override_path_wins() {
		let exe = std::env::current_exe().unwrap();
		let command = resolve_worker(Some(exe.clone().into_os_string()), Some(PathBuf::from("/bin/other"))).unwrap();
		assert_eq!(command.program, exe);
		assert!(command.args.is_empty());
	}

	#[test]
	fn test_missing_override_is_not_found() {
		let result = resolve_worker(Some(OsString::from("/definitely/not/here/sqlview-worker")), None);
		assert!(matches!(result, Err(Error::WorkerNotFound)));
	}

	#[test]
	fn test_falls_back_to_current_exe_subcommand() {
		let command = resolve_worker(None, Some(PathBuf::from("/usr/bin/sqlview"))).unwrap();
		assert_eq!(command.program, PathBuf::from("/usr/bin/sqlview"));
		assert_eq!(command.args, vec![OsString::from(WORKER_SUBCOMMAND)]);
	}

	#[test]
	fn test_empty_override_is_ignored() {
		let command = resolve_worker(Some(OsString::new()), Some(PathBuf::from("/usr/bin/sqlview"))).unwrap();
		assert_eq!(command.args.len(), 1);
	}

	#[tokio::test]
	async fn test_launch_missing_program_fails() {
		let result = WorkerProcess::launch(&WorkerCommand::new("/definitely/not/here/sqlview-worker")).await;
		assert!(matches!(result, Err(Error::LaunchFailed(_))));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_frames_round_trip_through_child_stdio() {
		// `cat` echoes every frame back unchanged.
		let (process, mut parts) = WorkerProcess::launch(&WorkerCommand::new("cat")).await.unwrap();
		tokio::spawn(parts.receiver.run());

		parts
			.sender
			.send(Packet::new(Message::Release {
				target: sqlview_protocol::ObjectId(3),
			}))
			.await
			.unwrap();

		let echoed = parts.message_rx.recv().await.unwrap();
		assert!(matches!(echoed.message, Message::Release { target } if target.0 == 3));

		drop(parts.sender);
		process.shutdown().await.unwrap();
	}
}
