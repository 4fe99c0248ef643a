//! The isolated database worker.
//!
//! [`SqliteWorker`] implements [`sqlview::WorkerApi`] on top of SQLite. It can
//! run inside the host (see [`sqlview::InProcessLauncher`]) or in its own
//! process, where [`serve_stdio`] answers the host over stdin and stdout.

mod query;
mod serve;
mod worker;

pub use query::QueryError;
pub use serve::{serve, serve_stdio, serve_worker};
pub use worker::SqliteWorker;
