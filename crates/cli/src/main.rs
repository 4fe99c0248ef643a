mod cli;
mod commands;
mod error;
mod logging;
mod output;
mod viewer;

use clap::Parser;

use crate::cli::Cli;
use crate::error::CliError;
use crate::output::{OutputFormat, print_failure};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let format = cli.format;
	let command = commands::command_name(&cli.command);

	if let Err(err) = commands::dispatch(cli).await {
		handle_error(command, err, format);
		std::process::exit(1);
	}
}

fn handle_error(command: &str, err: CliError, format: OutputFormat) {
	tracing::debug!(command, error = ?err, "command failed");
	print_failure(command, err.to_command_error(), format);
}
