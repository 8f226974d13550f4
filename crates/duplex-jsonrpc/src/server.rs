//! Server side of a peer: the dispatcher/scheduler.
//!
//! A single reader task owns the channel's receive side. Each inbound frame
//! is parsed into batch members; members dispatch to handlers on spawned
//! tasks gated by a concurrency semaphore, so two requests on one
//! connection may execute in parallel while the reader keeps pumping.
//! Responses to a batch are collected and emitted as one frame once every
//! member completes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::context::Context;
use crate::handler::{Assigner, Handler};
use crate::metrics::Metrics;
use crate::options::ServerOptions;
use crate::wire::{self, ParsedRequest, Reply, Request, Response, RpcError};
use crate::{RESERVED_PREFIX, RPC_CANCEL, RPC_SERVER_INFO};

/// A snapshot of server vitals, as returned by the built-in
/// `rpc.serverInfo` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Known method names, sorted and deduplicated.
    pub methods: Vec<String>,
    pub counters: BTreeMap<String, i64>,
    pub max_values: BTreeMap<String, i64>,
    pub start_time: DateTime<Utc>,
    pub uptime_secs: f64,
}

/// How a server run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    /// The server was stopped locally via [`Server::stop`].
    pub stopped: bool,
    /// The channel reported an orderly end of stream.
    pub closed: bool,
    /// The transport failure that terminated the run, if any.
    pub err: Option<String>,
}

impl ServerStatus {
    /// True when the run ended without a transport failure.
    pub fn ok(&self) -> bool {
        self.err.is_none()
    }
}

/// The server half of a peer. Cheap to clone through its shared core;
/// dropping the handle does not stop the reader, [`Server::stop`] or
/// channel closure does.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
    done_rx: watch::Receiver<Option<ServerStatus>>,
}

struct ServerCore {
    assigner: Arc<dyn Assigner>,
    channel: Arc<dyn Channel>,
    opts: ServerOptions,
    metrics: Arc<Metrics>,
    start_time: DateTime<Utc>,
    sem: Arc<Semaphore>,
    /// Contexts of requests currently being serviced, keyed by canonical
    /// id text, for cancellation by id.
    inflight: Mutex<HashMap<String, Context>>,
    /// Waiters for replies to server-initiated callbacks.
    push_calls: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    push_id: AtomicI64,
    /// Serializes frame writes so concurrent handler responses and pushes
    /// never interleave.
    write_lock: AsyncMutex<()>,
    stop_tx: watch::Sender<bool>,
}

enum Target {
    ServerInfo,
    Cancel,
    User(Arc<dyn Handler>),
}

impl Server {
    /// Starts servicing the channel with the given assigner and returns
    /// the running server.
    pub fn start(
        assigner: Arc<dyn Assigner>,
        channel: impl Channel,
        options: ServerOptions,
    ) -> Server {
        let (stop_tx, stop_rx) = watch::channel(false);
        let metrics = options
            .metrics
            .clone()
            .unwrap_or_else(|| Arc::new(Metrics::new()));
        let concurrency = options.effective_concurrency();
        let core = Arc::new(ServerCore {
            assigner,
            channel: Arc::new(channel),
            start_time: options.start_time.unwrap_or_else(Utc::now),
            metrics,
            sem: Arc::new(Semaphore::new(concurrency)),
            inflight: Mutex::new(HashMap::new()),
            push_calls: Mutex::new(HashMap::new()),
            push_id: AtomicI64::new(1),
            write_lock: AsyncMutex::new(()),
            stop_tx,
            opts: options,
        });
        let (done_tx, done_rx) = watch::channel(None);
        info!(concurrency, "server starting");
        tokio::spawn(read_loop(core.clone(), stop_rx, done_tx));
        Server { core, done_rx }
    }

    /// Signals the reader to stop accepting new work. In-flight handlers
    /// are cancelled and drained; observe completion with [`Server::wait`].
    pub fn stop(&self) {
        let _ = self.core.stop_tx.send(true);
    }

    /// Blocks until the server terminates and returns its final status.
    /// Safe to call repeatedly and concurrently.
    pub async fn wait(&self) -> ServerStatus {
        let mut rx = self.done_rx.clone();
        loop {
            let status = rx.borrow().clone();
            if let Some(status) = status {
                return status;
            }
            if rx.changed().await.is_err() {
                return ServerStatus {
                    stopped: false,
                    closed: false,
                    err: Some("server reader vanished".into()),
                };
            }
        }
    }

    /// Cancels the pending or in-flight request with the given id, given as
    /// canonical JSON text (`1`, `"abc"`). A no-op for unknown ids.
    pub fn cancel_request(&self, id: &str) {
        self.core.cancel_by_key(id);
    }

    /// The snapshot served by the built-in `rpc.serverInfo` method.
    pub fn server_info(&self) -> ServerInfo {
        self.core.server_info()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.core.metrics
    }

    /// Sends a server push notification to the client. Requires
    /// `allow_push`.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if !self.core.opts.allow_push {
            return Err(RpcError::internal("server push is not enabled"));
        }
        let frame = wire::encode_requests(&[Request::notification(method, params)])?;
        self.core.send_frame(&frame).await
    }

    /// Issues a server-initiated callback and waits for the client's reply.
    /// Requires `allow_push`. The context governs cancellation and
    /// deadline of the wait.
    pub async fn callback(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, RpcError> {
        let core = &self.core;
        if !core.opts.allow_push {
            return Err(RpcError::internal("server push is not enabled"));
        }
        let id = Value::from(core.push_id.fetch_add(1, Ordering::Relaxed));
        let key = wire::id_key(&id);
        let (tx, rx) = oneshot::channel();
        core.push_calls
            .lock()
            .expect("push-call lock poisoned")
            .insert(key.clone(), tx);

        let frame = wire::encode_requests(&[Request::call(id, method, params)])?;
        if let Err(err) = core.send_frame(&frame).await {
            core.push_calls
                .lock()
                .expect("push-call lock poisoned")
                .remove(&key);
            return Err(err);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(rsp) => match rsp.err() {
                    Some(err) => Err(err),
                    None => Ok(rsp),
                },
                Err(_) => Err(RpcError::cancelled("server stopped before callback reply")),
            },
            cause = ctx.done() => {
                core.push_calls
                    .lock()
                    .expect("push-call lock poisoned")
                    .remove(&key);
                Err(cause.as_error())
            }
        }
    }
}

async fn read_loop(
    core: Arc<ServerCore>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<Option<ServerStatus>>,
) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    let status = loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                break ServerStatus { stopped: true, closed: false, err: None };
            }
            // Reap finished handler tasks as we go.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            frame = core.channel.recv() => match frame {
                Ok(bytes) => {
                    core.metrics.count_and_set_max("rpc.bytesRead", bytes.len() as i64);
                    core.handle_frame(bytes, &mut tasks).await;
                }
                Err(ChannelError::Closed) => {
                    break ServerStatus { stopped: false, closed: true, err: None };
                }
                Err(err) => {
                    warn!(error = %err, "server channel failed");
                    break ServerStatus { stopped: false, closed: false, err: Some(err.to_string()) };
                }
            }
        }
    };

    // Stop intake, cancel the contexts of in-flight handlers, and wait for
    // them to return. Their responses still go out if the channel is alive.
    {
        let inflight = core.inflight.lock().expect("inflight lock poisoned");
        for ctx in inflight.values() {
            ctx.cancel();
        }
    }
    while tasks.join_next().await.is_some() {}

    // Abandon outstanding callback waiters; dropping the senders resolves
    // them with an error.
    core.push_calls
        .lock()
        .expect("push-call lock poisoned")
        .clear();

    let _ = core.channel.close().await;
    info!(
        stopped = status.stopped,
        closed = status.closed,
        err = status.err.as_deref().unwrap_or(""),
        "server terminated"
    );
    let _ = done_tx.send(Some(status));
}

impl ServerCore {
    async fn handle_frame(self: &Arc<Self>, bytes: Vec<u8>, tasks: &mut JoinSet<()>) {
        let (members, batch) = match wire::split_frame(&bytes) {
            Ok(split) => split,
            Err(err) => {
                self.metrics.count("rpc.errors", 1);
                self.send_responses(&[Response::error(Value::Null, &err)], false)
                    .await;
                return;
            }
        };
        if members.is_empty() {
            self.metrics.count("rpc.errors", 1);
            let err = RpcError::invalid_request("empty request batch");
            self.send_responses(&[Response::error(Value::Null, &err)], false)
                .await;
            return;
        }

        // Replies to our own callbacks share the read side with requests;
        // peel them off before request parsing.
        let mut items: Vec<ParsedRequest> = Vec::new();
        for member in members {
            if let Some(member) = self.deliver_push_reply(member) {
                items.push(ParsedRequest::from_value(member, self.opts.allow_v1));
            }
        }
        if items.is_empty() {
            return;
        }
        self.metrics.count("rpc.requests", items.len() as i64);

        let expected = items
            .iter()
            .filter(|item| item.error.is_some() || !item.request.is_notification())
            .count();
        let collector = (expected > 0).then(|| Arc::new(ResponseCollector::new(expected, batch)));

        for item in items {
            // Members that failed parsing answer directly, without a
            // handler or a concurrency slot.
            if let Some(err) = item.error {
                self.metrics.count("rpc.errors", 1);
                let id = item.request.id().cloned().unwrap_or(Value::Null);
                if let Some(collector) = &collector {
                    collector.push(self, Response::error(id, &err)).await;
                }
                continue;
            }

            // Cancellation must run even when every concurrency slot is
            // held by the very handlers it is meant to release, so the
            // built-in notification form is serviced inline.
            if !self.opts.disable_builtin
                && item.request.method() == RPC_CANCEL
                && item.request.is_notification()
            {
                if let Err(err) = self.builtin_cancel(&item.request) {
                    debug!(error = %err, "rpc.cancel notification rejected");
                }
                continue;
            }

            let Ok(permit) = self.sem.clone().acquire_owned().await else {
                break;
            };
            let core = self.clone();
            let collector = collector.clone();
            let req = item.request;
            tasks.spawn(async move {
                core.dispatch(req, collector, permit).await;
            });
        }
    }

    /// Routes a response-shaped member to its callback waiter. Returns the
    /// member back when it is not one.
    fn deliver_push_reply(&self, member: Value) -> Option<Value> {
        let is_reply = member.as_object().is_some_and(|obj| {
            !obj.contains_key("method")
                && (obj.contains_key("result") || obj.contains_key("error"))
                && obj.get("id").is_some_and(|id| !id.is_null())
        });
        if !is_reply {
            return Some(member);
        }
        let reply = match Reply::from_value(member.clone()) {
            Ok(reply) => reply,
            Err(_) => return Some(member),
        };
        let key = reply.id.as_ref().map(wire::id_key).unwrap_or_default();
        let waiter = self
            .push_calls
            .lock()
            .expect("push-call lock poisoned")
            .remove(&key);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply.into_response());
                None
            }
            None => {
                warn!(id = %key, "dropping reply for unknown callback id");
                None
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        req: Request,
        collector: Option<Arc<ResponseCollector>>,
        _permit: OwnedSemaphorePermit,
    ) {
        let is_note = req.is_notification();
        let id = req.id().cloned();
        let key = req.id_key();
        debug!(method = %req.method(), notification = is_note, "dispatching request");

        let base = Context::new()
            .with_metrics(self.metrics.clone())
            .with_inbound(req.clone());
        let (ctx, req) = match self.decode_context(base, req) {
            Ok(pair) => pair,
            Err(err) => {
                self.respond(&collector, is_note, id, None, Err(err)).await;
                return;
            }
        };

        if let Some(key) = &key {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .insert(key.clone(), ctx.clone());
        }

        let result = self.invoke(&ctx, &req).await;
        self.respond(&collector, is_note, id, Some(&ctx), result)
            .await;

        if let Some(key) = &key {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(key);
        }
    }

    /// Applies the decode-context hook, swapping the request's parameters
    /// for the unwrapped payload.
    fn decode_context(
        &self,
        ctx: Context,
        req: Request,
    ) -> Result<(Context, Request), RpcError> {
        let Some(hook) = &self.opts.decode_context else {
            return Ok((ctx, req));
        };
        let (ctx, params) = hook(ctx, req.method(), req.params().cloned())?;
        Ok((ctx, req.with_params(params)))
    }

    async fn invoke(self: &Arc<Self>, ctx: &Context, req: &Request) -> Result<Value, RpcError> {
        if let Some(log) = &self.opts.rpc_log {
            log.log_request(ctx, req);
        }
        if let Some(check) = &self.opts.check_request {
            check(ctx, req)?;
        }
        match self.resolve(req.method())? {
            Target::ServerInfo => Ok(serde_json::to_value(self.server_info())?),
            Target::Cancel => self.builtin_cancel(req),
            Target::User(handler) => {
                let invocation = handler.handle(ctx.clone(), req.clone());
                match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic_message(&panic);
                        error!(method = %req.method(), panic = %msg, "handler panicked");
                        Err(RpcError::internal(format!("handler panicked: {msg}")))
                    }
                }
            }
        }
    }

    /// Reserved `rpc.*` names route to the built-ins unless disabled.
    fn resolve(&self, method: &str) -> Result<Target, RpcError> {
        if !self.opts.disable_builtin && method.starts_with(RESERVED_PREFIX) {
            return match method {
                RPC_SERVER_INFO => Ok(Target::ServerInfo),
                RPC_CANCEL => Ok(Target::Cancel),
                _ => Err(RpcError::method_not_found(method)),
            };
        }
        self.assigner
            .assign(method)
            .map(Target::User)
            .ok_or_else(|| RpcError::method_not_found(method))
    }

    /// The `rpc.cancel` built-in. Only usable as a notification; the call
    /// form reports the method unknown.
    fn builtin_cancel(&self, req: &Request) -> Result<Value, RpcError> {
        if !req.is_notification() {
            return Err(RpcError::method_not_found(RPC_CANCEL));
        }
        let ids: Option<Vec<Value>> = req.params_as()?;
        for id in ids.unwrap_or_default() {
            self.cancel_by_key(&wire::id_key(&id));
        }
        Ok(Value::Null)
    }

    fn cancel_by_key(&self, key: &str) {
        let inflight = self.inflight.lock().expect("inflight lock poisoned");
        if let Some(ctx) = inflight.get(key) {
            ctx.cancel();
            debug!(id = %key, "cancelled request by client order");
        }
    }

    async fn respond(
        &self,
        collector: &Option<Arc<ResponseCollector>>,
        is_note: bool,
        id: Option<Value>,
        ctx: Option<&Context>,
        result: Result<Value, RpcError>,
    ) {
        if is_note {
            if let Err(err) = result {
                self.metrics.count("rpc.errors", 1);
                debug!(error = %err, "notification handler failed");
            }
            return;
        }
        let id = id.unwrap_or(Value::Null);
        let rsp = match result {
            Ok(value) => Response::result(id, value),
            Err(err) => {
                self.metrics.count("rpc.errors", 1);
                Response::error(id, &err)
            }
        };
        if let (Some(log), Some(ctx)) = (&self.opts.rpc_log, ctx) {
            log.log_response(ctx, &rsp);
        }
        if let Some(collector) = collector {
            collector.push(self, rsp).await;
        }
    }

    async fn send_responses(&self, responses: &[Response], batch: bool) {
        match wire::encode_responses(responses, batch) {
            Ok(frame) => {
                if let Err(err) = self.send_frame(&frame).await {
                    warn!(error = %err, "sending responses failed");
                }
            }
            Err(err) => warn!(error = %err, "encoding responses failed"),
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), RpcError> {
        let _write = self.write_lock.lock().await;
        self.channel
            .send(frame)
            .await
            .map_err(|err| RpcError::internal(format!("channel send: {err}")))?;
        self.metrics
            .count_and_set_max("rpc.bytesWritten", frame.len() as i64);
        Ok(())
    }

    fn server_info(&self) -> ServerInfo {
        let snap = self.metrics.snapshot();
        ServerInfo {
            methods: self.assigner.names(),
            counters: snap.counters,
            max_values: snap.max_values,
            start_time: self.start_time,
            uptime_secs: (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0,
        }
    }
}

/// Accumulates the responses of one inbound frame and emits them as a
/// single write once the last member completes.
struct ResponseCollector {
    batch: bool,
    state: Mutex<CollectorState>,
}

struct CollectorState {
    remaining: usize,
    responses: Vec<Response>,
}

impl ResponseCollector {
    fn new(expected: usize, batch: bool) -> Self {
        Self {
            batch,
            state: Mutex::new(CollectorState {
                remaining: expected,
                responses: Vec::with_capacity(expected),
            }),
        }
    }

    async fn push(&self, core: &ServerCore, rsp: Response) {
        let done = {
            let mut state = self.state.lock().expect("collector lock poisoned");
            state.responses.push(rsp);
            state.remaining -= 1;
            state.remaining == 0
        };
        if done {
            let responses =
                std::mem::take(&mut self.state.lock().expect("collector lock poisoned").responses);
            core.send_responses(&responses, self.batch).await;
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_message(boxed.as_ref()), "kaput");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(17_i32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_status_ok() {
        let status = ServerStatus {
            stopped: true,
            closed: false,
            err: None,
        };
        assert!(status.ok());
        let status = ServerStatus {
            stopped: false,
            closed: false,
            err: Some("io".into()),
        };
        assert!(!status.ok());
    }
}
