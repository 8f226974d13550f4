//! Configuration for both endpoint roles.
//!
//! Plain structs with `Default` and `with_*` builders. Hooks are shared
//! closures so options can be cloned into the endpoint's internal state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::metrics::Metrics;
use crate::wire::{Request, Response, RpcError};

/// Server hook: decodes context metadata out of the raw parameters before
/// dispatch, returning the refined context and the unwrapped parameters.
pub type DecodeContextHook = Arc<
    dyn Fn(Context, &str, Option<Value>) -> Result<(Context, Option<Value>), RpcError>
        + Send
        + Sync,
>;

/// Server hook: vets a request after context setup and before handler
/// invocation. A returned error fails the request without invoking the
/// handler.
pub type CheckRequestHook = Arc<dyn Fn(&Context, &Request) -> Result<(), RpcError> + Send + Sync>;

/// Client hook: transforms outbound parameters, typically wrapping them in
/// a context carrier envelope.
pub type EncodeContextHook =
    Arc<dyn Fn(&Context, &str, Option<Value>) -> Result<Option<Value>, RpcError> + Send + Sync>;

/// Client hook: receives server push notifications.
pub type NotifyHook = Arc<dyn Fn(Request) + Send + Sync>;

/// Client hook: answers server callbacks. Panics in the hook are recovered
/// and reported to the server as internal errors.
pub type CallbackHook =
    Arc<dyn Fn(Context, Request) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Client hook: observes a call whose context ended before its response
/// arrived. Receives the synthesized error response for the call.
pub type CancelHook = Arc<dyn Fn(&Response) + Send + Sync>;

/// Records the receipt of requests and the delivery of responses,
/// synchronously with request processing.
pub trait RequestLogger: Send + Sync {
    /// Called for each request received, prior to invoking its handler.
    fn log_request(&self, ctx: &Context, req: &Request);

    /// Called for each response produced, immediately before it is queued
    /// for the wire. The inbound request is recoverable from the context.
    fn log_response(&self, ctx: &Context, rsp: &Response);
}

/// Options controlling a [`crate::Server`]. The default value is sensible:
/// strict version checking, no push, built-ins enabled, concurrency bound
/// to the hardware.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub rpc_log: Option<Arc<dyn RequestLogger>>,
    /// Tolerate requests without the `"jsonrpc":"2.0"` marker.
    pub allow_v1: bool,
    /// Permit server-initiated notifications and callbacks. When false the
    /// push operations report errors.
    pub allow_push: bool,
    /// Pass `rpc.*` methods through to the assigner instead of the
    /// built-ins.
    pub disable_builtin: bool,
    /// Maximum concurrently executing handlers. Zero means the number of
    /// hardware threads.
    pub concurrency: usize,
    pub decode_context: Option<DecodeContextHook>,
    pub check_request: Option<CheckRequestHook>,
    /// Share a metrics collector across servers. Absent, each server gets
    /// a fresh one.
    pub metrics: Option<Arc<Metrics>>,
    /// Reported as the server start time; absent, the moment `start` was
    /// called.
    pub start_time: Option<DateTime<Utc>>,
}

impl ServerOptions {
    pub fn with_rpc_log(mut self, log: Arc<dyn RequestLogger>) -> Self {
        self.rpc_log = Some(log);
        self
    }

    pub fn with_allow_v1(mut self, allow: bool) -> Self {
        self.allow_v1 = allow;
        self
    }

    pub fn with_allow_push(mut self, allow: bool) -> Self {
        self.allow_push = allow;
        self
    }

    pub fn with_disable_builtin(mut self, disable: bool) -> Self {
        self.disable_builtin = disable;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    pub fn with_decode_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Context, &str, Option<Value>) -> Result<(Context, Option<Value>), RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.decode_context = Some(Arc::new(hook));
        self
    }

    pub fn with_check_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &Request) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.check_request = Some(Arc::new(hook));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        if self.concurrency >= 1 {
            self.concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Options controlling a [`crate::Client`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Tolerate responses without the `"jsonrpc":"2.0"` marker.
    pub allow_v1: bool,
    /// Do not send `rpc.cancel` notifications when the context for an
    /// in-flight request terminates.
    pub disable_cancel: bool,
    pub encode_context: Option<EncodeContextHook>,
    /// Receives server push notifications. Absent, they are logged and
    /// discarded. At most one invocation is active at a time.
    pub on_notify: Option<NotifyHook>,
    /// Answers server callbacks. Absent, they are logged and discarded.
    /// At most one invocation is active at a time.
    pub on_callback: Option<CallbackHook>,
    /// Observes cancelled calls. Setting this suppresses the automatic
    /// `rpc.cancel` send, as `disable_cancel` does.
    pub on_cancel: Option<CancelHook>,
}

impl ClientOptions {
    pub fn with_allow_v1(mut self, allow: bool) -> Self {
        self.allow_v1 = allow;
        self
    }

    pub fn with_disable_cancel(mut self, disable: bool) -> Self {
        self.disable_cancel = disable;
        self
    }

    pub fn with_encode_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &str, Option<Value>) -> Result<Option<Value>, RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.encode_context = Some(Arc::new(hook));
        self
    }

    pub fn with_on_notify<F>(mut self, hook: F) -> Self
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        self.on_notify = Some(Arc::new(hook));
        self
    }

    pub fn with_on_callback<F>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Request) -> BoxFuture<'static, Result<Value, RpcError>>
            + Send
            + Sync
            + 'static,
    {
        self.on_callback = Some(Arc::new(hook));
        self
    }

    pub fn with_on_cancel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(hook));
        self
    }

    /// Whether the client sends `rpc.cancel` for terminated contexts: on by
    /// default, off when disabled explicitly or when an `on_cancel` hook
    /// takes over.
    pub(crate) fn allow_cancel(&self) -> bool {
        !self.disable_cancel && self.on_cancel.is_none()
    }
}
