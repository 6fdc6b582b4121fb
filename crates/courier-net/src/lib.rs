//! # courier-net
//!
//! The async runtime layer of courier, a service-to-service messaging
//! substrate: TLS plumbing, the per-connection engine, client handles, and
//! the service runtime that dispatches inbound messages to registered
//! action handlers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Action handlers                 │  user callbacks
//! ├─────────────────────────────────────────┤
//! │          Service dispatcher              │  action → handler
//! ├─────────────────────────────────────────┤
//! │        Connection engine                 │  reader task + write mutex
//! ├─────────────────────────────────────────┤
//! │          Packet codec                    │  courier-core
//! ├─────────────────────────────────────────┤
//! │          TLS transport                   │  rustls
//! └─────────────────────────────────────────┘
//! ```
//!
//! Each connection runs a single reader task that reassembles packets into
//! logical messages and publishes them on a bounded delivery channel;
//! writes from any task are serialized by a mutex over the write half.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod connection;
pub mod service;
pub mod stats;
pub mod tls;

pub use client::{Client, ClientError};
pub use config::Config;
pub use connection::{Connection, ConnectionError, DELIVERY_QUEUE_DEPTH};
pub use service::{ActionHandler, CLIENT_IDLE_TIMEOUT, Service, ServiceError};
pub use stats::{ServiceStats, gather_stats, stats_loop};
pub use tls::{TlsConfig, TlsError};
