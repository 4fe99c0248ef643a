//! Wire types for the sqlview RPC protocol.
//!
//! This crate contains the serde-serializable types exchanged between the
//! host, the database worker and UI surfaces. These types represent the
//! "protocol layer" - the shapes of data as they appear on an endpoint.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization and buffer bookkeeping
//! - **Transport agnostic**: A [`Packet`] is the same whether it travels through
//!   an in-process channel or a length-prefixed pipe
//! - **Stable**: Changes only when the wire protocol changes
//!
//! The request/response machinery lives in `sqlview-runtime`; the typed
//! interfaces built on top of these shapes live in `sqlview`.

pub mod api;
pub mod message;
pub mod payload;

pub use api::*;
pub use message::*;
pub use payload::*;
