use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the stderr subscriber. `RUST_LOG` wins over `verbosity`.
///
/// Stdout is left alone: commands print results there and the worker
/// subcommand uses it as its RPC pipe.
pub fn init_logging(verbosity: u8) {
	// 0 = errors only, RPC chatter off
	// 1 (-v) = info for the host, warn for the RPC runtime
	// 2+ (-vv) = debug everywhere
	let filter = match verbosity {
		0 => "error,sqlview_runtime=off",
		1 => "info,sqlview_runtime=warn",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
