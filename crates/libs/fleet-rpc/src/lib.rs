//! # fleet-rpc
//!
//! The duplex RPC engine behind every fleet service.
//!
//! Both sides of a TCP connection can call methods on the other and await a
//! typed response; frames are CRLF-delimited JSON envelopes (see
//! `fleet-wire`) correlated by request id, never by arrival order.
//!
//! - [`Connection`] — one socket, independent read/write serialization,
//!   idempotent teardown, connect/disconnect observers
//! - [`Dispatcher`] + [`MethodRegistry`] — permission-gated inbound
//!   dispatch, one cancellable task per request
//! - [`RpcClient`] — outbound calls with pending-call correlation and a
//!   background auto-reconnect loop
//! - [`Service`] — the host: listener, per-peer dispatchers, shared
//!   outbound managers, built-in `ping`
//!
//! ```ignore
//! let mut registry = MethodRegistry::new();
//! registry.register("print", |params, context| async move { /* … */ });
//!
//! let service = Service::new("PrintingService", 0, directory, registry)?;
//! service.run().await?;
//! ```

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod service;

pub use client::RpcClient;
pub use connection::Connection;
pub use dispatch::{CallContext, Dispatcher, HandlerError, MethodRegistry, METHOD_NOT_FOUND};
pub use error::RpcError;
pub use service::{IdentityProvider, Service, DEFAULT_AUTO_RETRY};
