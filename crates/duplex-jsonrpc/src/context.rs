//! Per-call request context: deadline, metadata, auth token, cancellation.
//!
//! A [`Context`] travels with every call on both sides of the wire. The
//! client encodes its deadline, metadata, and auth token into the carrier
//! envelope before send; the server decodes them back and installs the
//! inbound request and a metrics handle for handlers to recover.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::wire::carrier::{self, CarrierParts};
use crate::wire::{Request, RpcError};

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneCause {
    /// Explicitly cancelled by the caller or the peer.
    Cancelled,
    /// The deadline expired.
    DeadlineExceeded,
}

impl DoneCause {
    /// The protocol error surfaced to a waiter whose context ended.
    pub fn as_error(self) -> RpcError {
        match self {
            DoneCause::Cancelled => RpcError::cancelled("request cancelled"),
            DoneCause::DeadlineExceeded => RpcError::deadline_exceeded(),
        }
    }
}

/// Shared cancellation cell. Cloning shares state: any holder may cancel,
/// all holders observe it. The first recorded cause wins.
#[derive(Clone)]
struct CancelCell {
    tx: Arc<watch::Sender<Option<DoneCause>>>,
    rx: watch::Receiver<Option<DoneCause>>,
}

impl CancelCell {
    fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx: Arc::new(tx), rx }
    }

    fn set(&self, cause: DoneCause) {
        self.tx.send_if_modified(|v| {
            if v.is_none() {
                *v = Some(cause);
                true
            } else {
                false
            }
        });
    }

    fn cause(&self) -> Option<DoneCause> {
        *self.rx.borrow()
    }
}

/// A cloneable request context. Clones share the cancellation state; the
/// value fields (deadline, metadata, auth, installed request and metrics)
/// are copied, so `with_*` builders refine a context without disturbing
/// other holders.
#[derive(Clone)]
pub struct Context {
    cancel: CancelCell,
    deadline: Option<DateTime<Utc>>,
    meta: Option<Value>,
    auth: Option<Vec<u8>>,
    inbound: Option<Arc<Request>>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            cancel: CancelCell::new(),
            deadline: None,
            meta: None,
            auth: None,
            inbound: None,
            metrics: None,
        }
    }

    fn cell(&self) -> &CancelCell {
        &self.cancel
    }

    /// Sets an absolute deadline. If a deadline is already set, the earlier
    /// of the two is kept.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Sets a deadline relative to now. Timeouts too large to represent
    /// leave the context unbounded.
    pub fn with_timeout(self, timeout: std::time::Duration) -> Self {
        match chrono::Duration::from_std(timeout) {
            Ok(delta) => self.with_deadline(Utc::now() + delta),
            Err(_) => self,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Cancels the context. Idempotent; the first recorded cause wins.
    pub fn cancel(&self) {
        self.cell().set(DoneCause::Cancelled);
    }

    /// Reports why the context ended, or `None` while it is still live. A
    /// passed deadline counts as ended even if nothing awaited it.
    pub fn done_cause(&self) -> Option<DoneCause> {
        if let Some(cause) = self.cell().cause() {
            return Some(cause);
        }
        match self.deadline {
            Some(dl) if dl <= Utc::now() => Some(DoneCause::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_cause().is_some()
    }

    /// Waits until the context ends, by cancellation or deadline, and
    /// returns the cause. Safe to call repeatedly and concurrently.
    pub async fn done(&self) -> DoneCause {
        let mut rx = self.cell().rx.clone();
        if let Some(cause) = self.done_cause() {
            return cause;
        }
        let deadline_sleep = async {
            match self.deadline {
                Some(dl) => {
                    let remaining = (dl - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(remaining).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_sleep);
        loop {
            tokio::select! {
                _ = &mut deadline_sleep => {
                    self.cell().set(DoneCause::DeadlineExceeded);
                    return self.cell().cause().unwrap_or(DoneCause::DeadlineExceeded);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return DoneCause::Cancelled;
                    }
                    if let Some(cause) = *rx.borrow() {
                        return cause;
                    }
                }
            }
        }
    }

    /// Attaches opaque metadata to travel in the carrier envelope.
    pub fn with_metadata<T: Serialize>(mut self, meta: &T) -> Result<Self, RpcError> {
        self.meta = Some(serde_json::to_value(meta)?);
        Ok(self)
    }

    pub(crate) fn with_raw_metadata(mut self, meta: Option<Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Recovers metadata previously attached (or received over the wire).
    /// `Ok(None)` means no metadata is present.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Result<Option<T>, RpcError> {
        match &self.meta {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| RpcError::internal(format!("decoding context metadata: {e}"))),
        }
    }

    /// Attaches an opaque auth token to travel in the carrier envelope.
    pub fn with_auth_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.auth = Some(token.into());
        self
    }

    pub fn auth_token(&self) -> Option<&[u8]> {
        self.auth.as_deref()
    }

    pub(crate) fn with_inbound(mut self, req: Request) -> Self {
        self.inbound = Some(Arc::new(req));
        self
    }

    /// The inbound request being handled, installed by the dispatcher.
    pub fn inbound_request(&self) -> Option<&Request> {
        self.inbound.as_deref()
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The server's metrics collector, installed by the dispatcher.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("done", &self.done_cause())
            .field("has_meta", &self.meta.is_some())
            .field("has_auth", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

/// Encodes a context and parameters into a carrier envelope. Suitable as a
/// client `encode_context` hook; the method name is accepted for parity
/// with the hook signature but does not affect the envelope.
pub fn encode_context(
    ctx: &Context,
    _method: &str,
    params: Option<Value>,
) -> Result<Option<Value>, RpcError> {
    let parts = CarrierParts {
        deadline: ctx.deadline,
        meta: ctx.meta.clone(),
        auth: ctx.auth.clone(),
    };
    carrier::encode(&parts, params).map(Some)
}

/// Decodes a carrier envelope into a refined context and the unwrapped
/// parameters. Suitable as a server `decode_context` hook. Input that is
/// not a carrier passes through with the context unchanged.
pub fn decode_context(
    ctx: Context,
    _method: &str,
    params: Option<Value>,
) -> Result<(Context, Option<Value>), RpcError> {
    let (parts, payload) = carrier::decode(params)?;
    let Some(parts) = parts else {
        return Ok((ctx, payload));
    };
    let mut ctx = ctx;
    if let Some(dl) = parts.deadline {
        ctx = ctx.with_deadline(dl);
    }
    if parts.meta.is_some() {
        ctx = ctx.with_raw_metadata(parts.meta);
    }
    if let Some(token) = parts.auth {
        ctx = ctx.with_auth_token(token);
    }
    Ok((ctx, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_new_context_is_live() {
        let ctx = Context::new();
        assert!(!ctx.is_done());
        assert!(ctx.done_cause().is_none());
    }

    #[test]
    fn test_cancel_is_idempotent_and_shared() {
        let ctx = Context::new();
        let clone = ctx.clone();
        ctx.cancel();
        ctx.cancel();
        assert_eq!(clone.done_cause(), Some(DoneCause::Cancelled));
    }

    #[tokio::test]
    async fn test_recorded_cause_is_sticky() {
        let ctx = Context::new();
        ctx.cancel();
        let ctx = ctx.with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(ctx.done_cause(), Some(DoneCause::Cancelled));
        assert_eq!(ctx.done().await, DoneCause::Cancelled);
    }

    #[test]
    fn test_passed_deadline_reports_done() {
        let ctx = Context::new().with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(ctx.done_cause(), Some(DoneCause::DeadlineExceeded));
    }

    #[test]
    fn test_earlier_deadline_is_kept() {
        let near = Utc::now() + chrono::Duration::seconds(5);
        let far = Utc::now() + chrono::Duration::seconds(60);
        let ctx = Context::new().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
        let ctx = Context::new().with_deadline(far).with_deadline(near);
        assert_eq!(ctx.deadline(), Some(near));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let ctx = Context::new();
        let clone = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clone.cancel();
        });
        let cause = tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("done() should resolve after cancel");
        assert_eq!(cause, DoneCause::Cancelled);
    }

    #[tokio::test]
    async fn test_done_resolves_on_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(10));
        let cause = tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("done() should resolve at the deadline");
        assert_eq!(cause, DoneCause::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_done_immediate_when_already_cancelled() {
        let ctx = Context::new();
        ctx.cancel();
        tokio::time::timeout(Duration::from_millis(10), ctx.done())
            .await
            .expect("done() should resolve immediately");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Meta {
        name: String,
        marbles: i32,
    }

    #[test]
    fn test_metadata_round_trip_through_carrier() {
        let input = Meta {
            name: "Hieronymus Bosch".into(),
            marbles: 3,
        };
        let base = Context::new();
        assert_eq!(base.metadata_as::<Meta>().unwrap(), None);

        let ctx = Context::new().with_metadata(&input).unwrap();
        assert_eq!(ctx.metadata_as::<Meta>().unwrap().as_ref(), Some(&input));

        // Simulate transmission: encode, then decode into a fresh context.
        let envelope = encode_context(&ctx, "dummy", None).unwrap();
        let (decoded, params) = decode_context(Context::new(), "dummy", envelope).unwrap();
        assert!(params.is_none());
        assert_eq!(decoded.metadata_as::<Meta>().unwrap(), Some(input));
    }

    #[test]
    fn test_auth_token_round_trip_through_carrier() {
        let ctx = Context::new().with_auth_token(b"my magic token".as_slice());
        let envelope = encode_context(&ctx, "dummy", Some(json!([1, 2, 3]))).unwrap();
        let (decoded, params) = decode_context(Context::new(), "dummy", envelope).unwrap();
        assert_eq!(decoded.auth_token(), Some(b"my magic token".as_slice()));
        assert_eq!(params, Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_decode_context_passthrough_keeps_context() {
        let (ctx, params) =
            decode_context(Context::new(), "dummy", Some(json!(["a", "b", "c"]))).unwrap();
        assert!(ctx.deadline().is_none());
        assert_eq!(params, Some(json!(["a", "b", "c"])));
    }

    #[test]
    fn test_decode_context_adopts_deadline() {
        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let source = Context::new().with_deadline(deadline);
        let envelope = encode_context(&source, "dummy", None).unwrap();
        let (decoded, _) = decode_context(Context::new(), "dummy", envelope).unwrap();
        assert_eq!(decoded.deadline(), Some(deadline));
    }
}
