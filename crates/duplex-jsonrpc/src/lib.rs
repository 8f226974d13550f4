//! # Full-Duplex JSON-RPC 2.0 Peer Engine
//!
//! A symmetric pair of JSON-RPC 2.0 endpoints over a message-oriented byte
//! channel, with the standard extensions a long-lived connection needs:
//! bidirectional calls (server push and callbacks), cooperative
//! cancellation, batch processing, and context metadata propagation.
//!
//! ## Architecture
//!
//! - [`Channel`] — the framing transport, consumed as a trait: it delivers
//!   and accepts whole frames, each one complete JSON value.
//! - [`Server`] — the dispatcher/scheduler: pumps inbound frames, parses
//!   them with the wire crate, and runs user handlers with bounded
//!   concurrency while honoring ordering, batching, and cancellation rules.
//! - [`Client`] — the call tracker: assigns outbound ids, multiplexes
//!   in-flight calls, and routes server-initiated traffic to user hooks.
//! - [`Context`] — per-call context threaded across the wire: deadline,
//!   opaque metadata, auth token, and a cancellation handle.
//! - [`Local`] — an in-process client/server pair over direct channels,
//!   used heavily by the test suites.
//!
//! Handlers return domain values or [`RpcError`]; the dispatcher owns the
//! conversion to wire envelopes, including panic recovery.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duplex_jsonrpc::{Context, Local, LocalOptions, MethodMap};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), duplex_jsonrpc::RpcError> {
//! let mut map = MethodMap::new();
//! map.insert_fn("ping", |_ctx, _req| async { Ok(json!("pong")) });
//!
//! let loc = Local::new(Arc::new(map), LocalOptions::default());
//! let pong: String = loc.client.call_result(&Context::new(), "ping", None).await?;
//! assert_eq!(pong, "pong");
//! loc.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod context;
pub mod handler;
pub mod local;
pub mod metrics;
pub mod options;
pub mod server;

#[cfg(test)]
mod tests;

// The wire layer is part of the public API surface: handlers and hooks
// traffic in its types.
pub use duplex_jsonrpc_wire as wire;
pub use duplex_jsonrpc_wire::{ErrorCode, ErrorObject, Request, Response, RpcError};

pub use channel::{direct, Channel, ChannelError, Direct, Network};
pub use client::{CallSpec, Client};
pub use context::{Context, DoneCause};
pub use handler::{Assigner, Handler, HandlerFn, MethodMap};
pub use local::{Local, LocalOptions};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{ClientOptions, RequestLogger, ServerOptions};
pub use server::{Server, ServerInfo, ServerStatus};

/// Reserved method-name prefix intercepted by the server's built-ins unless
/// explicitly disabled.
pub const RESERVED_PREFIX: &str = "rpc.";

/// Built-in method returning a [`ServerInfo`] snapshot.
pub const RPC_SERVER_INFO: &str = "rpc.serverInfo";

/// Built-in notification requesting cancellation of pending request ids.
pub const RPC_CANCEL: &str = "rpc.cancel";
