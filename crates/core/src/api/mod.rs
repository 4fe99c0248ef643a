//! Typed interfaces carried over connections.
//!
//! Each interface has a trait, a client stub that implements it by calling a
//! [`Channel`](sqlview_runtime::Channel), and a service adapter that exposes
//! any implementation as a [`Dispatch`](sqlview_runtime::Dispatch) object.

pub mod host;
pub mod stream;
pub mod ui;
pub mod worker;

pub use host::{Content, HostApi, HostClient, HostService, InitialContent};
pub use stream::{ByteSource, ByteSourceService, BytesSource, ReaderSource, RemoteByteSource, read_to_end};
pub use ui::{UiApi, UiClient, UiService};
pub use worker::{WorkerApi, WorkerClient, WorkerService};
