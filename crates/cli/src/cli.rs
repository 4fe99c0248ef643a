use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Args, Parser, Subcommand};

use crate::output::OutputFormat;

/// Cargo-like help colors.
fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
		.valid(AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(name = "sqlview")]
#[command(about = "Browse SQLite files through an isolated worker")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format
	#[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
	pub format: OutputFormat,

	/// Configuration file (defaults to the user config directory)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Run the worker in its own process
	#[arg(long, global = true)]
	pub isolated: bool,

	/// Largest file to import, in bytes
	#[arg(long, global = true, value_name = "BYTES")]
	pub max_size: Option<u64>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// List tables and views with their columns
	Tables {
		file: PathBuf,
	},

	/// Print a window of rows
	Page {
		file: PathBuf,
		table: String,
		#[command(flatten)]
		window: WindowArgs,
	},

	/// Count rows, optionally filtered
	Count {
		file: PathBuf,
		table: String,
		/// Filter as COLUMN=PATTERN (SQL LIKE)
		#[arg(long, value_name = "COLUMN=PATTERN")]
		filter: Option<String>,
	},

	/// Print one row by rowid
	Row {
		file: PathBuf,
		table: String,
		rowid: i64,
	},

	/// Fetch the full contents of one cell
	Blob {
		file: PathBuf,
		table: String,
		rowid: i64,
		column: String,
		/// Write the bytes here instead of the downloads directory
		#[arg(short, long, value_name = "FILE")]
		output: Option<PathBuf>,
	},

	/// Write a self-contained copy of the database (WAL folded in)
	Export {
		file: PathBuf,
		#[arg(short, long, value_name = "FILE")]
		output: PathBuf,
	},

	/// Keep a table on screen and reprint it whenever the file changes
	Watch {
		file: PathBuf,
		table: String,
		#[command(flatten)]
		window: WindowArgs,
	},

	/// Serve a worker over stdin/stdout (used by --isolated)
	#[command(hide = true)]
	Worker,
}

#[derive(Args, Debug, Clone)]
pub struct WindowArgs {
	/// Rows to skip
	#[arg(long, default_value_t = 0)]
	pub offset: u64,

	/// Rows to return
	#[arg(short = 'n', long, default_value_t = 50)]
	pub limit: u32,

	/// Sort by this column
	#[arg(long, value_name = "COLUMN")]
	pub order: Option<String>,

	/// Sort descending
	#[arg(long, requires = "order")]
	pub desc: bool,

	/// Filter as COLUMN=PATTERN (SQL LIKE)
	#[arg(long, value_name = "COLUMN=PATTERN")]
	pub filter: Option<String>,
}
