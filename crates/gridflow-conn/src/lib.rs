//! gridflow-conn - connection and framing layer for the gridflow engine.
//!
//! Gridflow processes (workers, the scheduler) exchange length-prefixed,
//! typed binary messages over local stream sockets. This crate is the
//! transport and framing substrate under that control protocol: it frames
//! and validates messages, serializes outbound writes through a batched
//! single-flight flush queue, and pumps inbound frames to a handler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Control protocol (RPC)          │  not this crate
//! ├─────────────────────────────────────────┤
//! │   Connection: write queue + read loop    │  connection
//! ├─────────────────────────────────────────┤
//! │   Framing: cookie + type + length        │  frame
//! ├─────────────────────────────────────────┤
//! │   StreamSocket: unix | loopback tcp      │  socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: [`ConnectionError`], [`ConnectionResult`], protocol constants
//! - [`frame`]: wire header codec ([`frame::FrameHeader`])
//! - [`socket`]: [`StreamSocket`], endpoint parsing, [`connect_with_retry`]
//! - [`handshake`]: one-time [`Registration`] announcement
//! - [`connection`]: [`Connection`] (sync/async framed I/O, read loop)
//! - [`scanner`]: [`scan_for_disconnects`] liveness sweep
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use gridflow_conn::{
//!     connect_with_retry, ConnectOptions, Connection, ConnectionConfig, Registration,
//! };
//!
//! let socket = connect_with_retry("/run/gridflow/scheduler.sock", ConnectOptions::default())
//!     .await?;
//! let conn = Connection::new(socket, ConnectionConfig::default().with_debug_label("worker"));
//!
//! conn.register(MessageType::Register as i64, &Registration::new("gridflow-worker/0.1.0"))
//!     .await?;
//! conn.process_messages(
//!     Arc::new(|conn, message_type, payload| { /* dispatch */ }),
//!     Arc::new(|conn, err| { /* close, retry, or escalate */ }),
//! );
//! ```
//!
//! # Guarantees
//!
//! - Async write completions fire exactly once, in enqueue order, never
//!   interleaved across flush batches.
//! - At most one flush and one read are in flight per connection.
//! - A connection that hits a transport error is sticky-broken: queued and
//!   future writes fail fast without touching the transport.
//! - Message ordering holds within a single connection only.

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod scanner;
pub mod socket;

pub use connection::{
    Connection, ConnectionConfig, ConnectionErrorHandler, MessageHandler, DEFAULT_WRITE_BATCH_MAX,
};
pub use error::{
    ConnectionError, ConnectionResult, DEFAULT_COOKIE, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use handshake::Registration;
pub use scanner::scan_for_disconnects;
pub use socket::{connect_with_retry, ConnectOptions, Endpoint, StreamSocket};
