//! Cross-context RPC runtime for sqlview.
//!
//! Two execution contexts that share no memory (the host and the isolated
//! worker, or the host and a sandboxed UI surface) talk through an endpoint.
//! This crate turns an endpoint into a symmetric RPC connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐                                   ┌──────────────┐
//! │   Channel    │── Call{id, target, method} ──────▶│  ObjectStore │
//! │   (proxy)    │                                   │   Dispatch   │
//! │              │◀────────────── Response{id} ──────│  (service)   │
//! └──────┬───────┘                                   └──────┬───────┘
//!        │            Connection (correlation,              │
//!        │             cancellation, release)               │
//! ┌──────┴───────────────────────────────────────────────────┴───────┐
//! │  Transport: memory pair │ pipe frames (worker stdio) │ bus token │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Connection`]: correlation ids, pending calls, exposed objects, shutdown
//! - [`Channel`]: caller-side proxy for one remote object, released exactly once
//! - [`Dispatch`]: callee-side entry point implemented by service adapters
//! - [`TransportParts`]: the sending and receiving halves of an endpoint
//! - [`WorkerProcess`]: launches the worker executable behind a pipe transport

pub mod channel;
pub mod connection;
pub mod error;
pub mod service;
pub mod transport;
pub mod worker_process;

pub use channel::Channel;
pub use connection::{Connection, ExposedGuard, ObjectStore};
pub use error::{Error, Result};
pub use service::{Dispatch, Request};
pub use transport::{BoxFuture, MessageBus, Transport, TransportParts, TransportReceiver};
pub use worker_process::{WorkerCommand, WorkerProcess, locate_worker};
