//! Client side of a peer: the call tracker.
//!
//! Outbound calls get monotonically increasing ids, never reused within a
//! client's lifetime, and a pending entry holding a one-shot completion
//! channel. A single reader task owns the channel's receive side and
//! multiplexes inbound frames: responses are matched to waiters by id,
//! server push notifications and callbacks route to the configured hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::context::{Context, DoneCause};
use crate::options::ClientOptions;
use crate::server::{panic_message, ServerInfo};
use crate::wire::{self, Reply, Request, Response, RpcError};
use crate::{RPC_CANCEL, RPC_SERVER_INFO};

type Waiter = oneshot::Sender<Result<Response, RpcError>>;

/// One entry of a [`Client::batch`]: a call, or a notification which
/// produces no response slot.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub method: String,
    pub params: Option<Value>,
    pub notify: bool,
}

impl CallSpec {
    pub fn call(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: false,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: true,
        }
    }
}

/// The client half of a peer. Cheap to clone; all clones share the same
/// connection and pending-call state.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

struct ClientCore {
    channel: Arc<dyn Channel>,
    opts: ClientOptions,
    /// Pending calls keyed by canonical id text. `None` once the client
    /// has terminated: new calls then fail fast.
    pending: Mutex<Option<HashMap<String, Waiter>>>,
    next_id: AtomicI64,
    /// Serializes frame writes against callback replies and cancellations.
    write_lock: AsyncMutex<()>,
    /// Serializes callback hook invocations: at most one active at a time.
    callback_gate: AsyncMutex<()>,
    reader_done: watch::Receiver<bool>,
}

impl Client {
    /// Starts a client servicing the channel and returns it.
    pub fn new(channel: impl Channel, options: ClientOptions) -> Client {
        let (done_tx, done_rx) = watch::channel(false);
        let core = Arc::new(ClientCore {
            channel: Arc::new(channel),
            opts: options,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicI64::new(1),
            write_lock: AsyncMutex::new(()),
            callback_gate: AsyncMutex::new(()),
            reader_done: done_rx,
        });
        info!("client starting");
        tokio::spawn(read_loop(core.clone(), done_tx));
        Client { core }
    }

    /// Issues a call and waits for its response.
    ///
    /// An error response from the server surfaces as `Err`; a successful
    /// response is returned whole for the caller to deserialize. If the
    /// context ends first the call resolves with the context's cause, and
    /// unless disabled an `rpc.cancel` notification tells the server to
    /// abandon the work.
    pub async fn call(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, RpcError> {
        let core = &self.core;
        if let Some(cause) = ctx.done_cause() {
            return Err(cause.as_error());
        }
        let params = core.encode_params(ctx, method, params)?;
        let id = core.next_id();
        let key = wire::id_key(&id);
        let mut rx = core.register(&key)?;

        let frame = wire::encode_requests(&[Request::call(id.clone(), method, params)])?;
        if let Err(err) = core.send_frame(&frame).await {
            core.unregister(&key);
            return Err(err);
        }
        debug!(method, id = %key, "call issued");

        match race(ctx, &mut rx).await {
            WaitOutcome::Reply(reply) => deliver(reply),
            WaitOutcome::Ended(cause) => core.resolve_cancelled(cause, id, &key, rx).await,
        }
    }

    /// Issues a call and deserializes its result.
    pub async fn call_result<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, RpcError> {
        self.call(ctx, method, params).await?.result_as()
    }

    /// Sends a notification. No id is assigned and no response will come.
    pub async fn notify(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RpcError> {
        let core = &self.core;
        if let Some(cause) = ctx.done_cause() {
            return Err(cause.as_error());
        }
        let params = core.encode_params(ctx, method, params)?;
        let frame = wire::encode_requests(&[Request::notification(method, params)])?;
        core.send_frame(&frame).await
    }

    /// Sends a batch in one frame and waits for every non-notification
    /// member.
    ///
    /// The responses come back in spec order, error responses included
    /// rather than short-circuiting, so one failed member does not hide
    /// its siblings. A one-element batch goes out unwrapped, as a bare
    /// object. If the context ends first, all still-outstanding ids are
    /// cancelled with a single `rpc.cancel` notification.
    pub async fn batch(
        &self,
        ctx: &Context,
        specs: Vec<CallSpec>,
    ) -> Result<Vec<Response>, RpcError> {
        let core = &self.core;
        if let Some(cause) = ctx.done_cause() {
            return Err(cause.as_error());
        }

        let mut requests = Vec::with_capacity(specs.len());
        let mut waiters = Vec::new();
        for spec in specs {
            let params = core.encode_params(ctx, &spec.method, spec.params)?;
            if spec.notify {
                requests.push(Request::notification(spec.method, params));
            } else {
                let id = core.next_id();
                let key = wire::id_key(&id);
                let rx = match core.register(&key) {
                    Ok(rx) => rx,
                    Err(err) => {
                        core.unregister_all(&waiters);
                        return Err(err);
                    }
                };
                requests.push(Request::call(id.clone(), spec.method, params));
                waiters.push(PendingMember { id, key, rx });
            }
        }

        let frame = wire::encode_requests(&requests)?;
        if let Err(err) = core.send_frame(&frame).await {
            core.unregister_all(&waiters);
            return Err(err);
        }

        let mut responses = Vec::with_capacity(waiters.len());
        let mut members = waiters.into_iter();
        while let Some(mut member) = members.next() {
            match race(ctx, &mut member.rx).await {
                WaitOutcome::Reply(Ok(outcome)) => responses.push(
                    outcome.unwrap_or_else(|err| Response::error(member.id.clone(), &err)),
                ),
                WaitOutcome::Reply(Err(_)) => responses.push(Response::error(
                    member.id.clone(),
                    &RpcError::cancelled("client channel terminated"),
                )),
                WaitOutcome::Ended(cause) => {
                    let mut remaining = vec![member];
                    remaining.extend(members);
                    core.cancel_members(cause, remaining).await;
                    return Err(cause.as_error());
                }
            }
        }
        Ok(responses)
    }

    /// Calls the built-in `rpc.serverInfo` method.
    pub async fn rpc_server_info(&self, ctx: &Context) -> Result<ServerInfo, RpcError> {
        self.call_result(ctx, RPC_SERVER_INFO, None).await
    }

    /// Terminates the client: the reader stops, every pending call
    /// resolves with a cancellation-kind error, and the channel is closed.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.core.channel.close().await;
        let mut done = self.core.reader_done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// A batch member still awaiting its response.
struct PendingMember {
    id: Value,
    key: String,
    rx: oneshot::Receiver<Result<Response, RpcError>>,
}

/// The outcome of waiting on a pending reply against the caller's context.
enum WaitOutcome {
    Reply(Result<Result<Response, RpcError>, oneshot::error::RecvError>),
    Ended(DoneCause),
}

async fn race(
    ctx: &Context,
    rx: &mut oneshot::Receiver<Result<Response, RpcError>>,
) -> WaitOutcome {
    tokio::select! {
        reply = rx => WaitOutcome::Reply(reply),
        cause = ctx.done() => WaitOutcome::Ended(cause),
    }
}

fn deliver(reply: Result<Result<Response, RpcError>, oneshot::error::RecvError>) -> Result<Response, RpcError> {
    match reply {
        Ok(Ok(rsp)) => match rsp.err() {
            Some(err) => Err(err),
            None => Ok(rsp),
        },
        Ok(Err(err)) => Err(err),
        Err(_) => Err(RpcError::cancelled("client channel terminated")),
    }
}

impl ClientCore {
    fn next_id(&self) -> Value {
        Value::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn encode_params(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        match &self.opts.encode_context {
            Some(hook) => hook(ctx, method, params),
            None => Ok(params),
        }
    }

    fn register(&self, key: &str) -> Result<oneshot::Receiver<Result<Response, RpcError>>, RpcError> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let Some(map) = pending.as_mut() else {
            return Err(RpcError::cancelled("client is closed"));
        };
        let (tx, rx) = oneshot::channel();
        map.insert(key.to_string(), tx);
        Ok(rx)
    }

    /// Removes a pending entry, reporting whether it was still present.
    fn unregister(&self, key: &str) -> bool {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending
            .as_mut()
            .map(|map| map.remove(key).is_some())
            .unwrap_or(false)
    }

    fn unregister_all(&self, members: &[PendingMember]) {
        for member in members {
            self.unregister(&member.key);
        }
    }

    /// The caller's context ended before the response arrived.
    ///
    /// If the reader delivered the response in the same instant, the entry
    /// is already gone and the response wins. Otherwise the entry is
    /// dropped, the server is told to abandon the work (unless cancel
    /// notifications are disabled or an `on_cancel` hook took over), and
    /// the caller gets the context's cause.
    async fn resolve_cancelled(
        &self,
        cause: DoneCause,
        id: Value,
        key: &str,
        mut rx: oneshot::Receiver<Result<Response, RpcError>>,
    ) -> Result<Response, RpcError> {
        if !self.unregister(key) {
            return deliver((&mut rx).await);
        }
        debug!(id = %key, cause = ?cause, "call abandoned by caller");
        if self.opts.allow_cancel() && !*self.reader_done.borrow() {
            self.send_rpc_cancel(std::slice::from_ref(&id)).await;
        }
        let err = cause.as_error();
        if let Some(hook) = &self.opts.on_cancel {
            hook(&Response::error(id, &err));
        }
        Err(err)
    }

    async fn cancel_members(&self, cause: DoneCause, members: Vec<PendingMember>) {
        let mut abandoned = Vec::new();
        for member in members {
            if self.unregister(&member.key) {
                abandoned.push(member.id);
            }
        }
        if abandoned.is_empty() {
            return;
        }
        debug!(count = abandoned.len(), cause = ?cause, "batch abandoned by caller");
        if self.opts.allow_cancel() && !*self.reader_done.borrow() {
            self.send_rpc_cancel(&abandoned).await;
        }
        if let Some(hook) = &self.opts.on_cancel {
            let err = cause.as_error();
            for id in abandoned {
                hook(&Response::error(id, &err));
            }
        }
    }

    /// Tells the server to abandon the given ids. Sent outside the
    /// encode-context hook: this is protocol traffic, not a user call.
    async fn send_rpc_cancel(&self, ids: &[Value]) {
        let note = Request::notification(RPC_CANCEL, Some(Value::Array(ids.to_vec())));
        match wire::encode_requests(&[note]) {
            Ok(frame) => {
                if let Err(err) = self.send_frame(&frame).await {
                    debug!(error = %err, "sending rpc.cancel failed");
                }
            }
            Err(err) => debug!(error = %err, "encoding rpc.cancel failed"),
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), RpcError> {
        let _write = self.write_lock.lock().await;
        self.channel
            .send(frame)
            .await
            .map_err(|err| RpcError::cancelled(format!("channel send: {err}")))
    }
}

async fn read_loop(core: Arc<ClientCore>, done_tx: watch::Sender<bool>) {
    let mut callbacks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            Some(_) = callbacks.join_next(), if !callbacks.is_empty() => {}
            frame = core.channel.recv() => match frame {
                Ok(bytes) => core.accept_frame(bytes, &mut callbacks),
                Err(err) => {
                    debug!(error = %err, "client channel ended");
                    break;
                }
            }
        }
    }

    // Fail every pending call; the map is retired so new calls fail fast.
    let entries = core
        .pending
        .lock()
        .expect("pending lock poisoned")
        .take()
        .unwrap_or_default();
    for (key, tx) in entries {
        debug!(id = %key, "failing pending call at shutdown");
        let _ = tx.send(Err(RpcError::cancelled("client channel terminated")));
    }
    while callbacks.join_next().await.is_some() {}
    let _ = done_tx.send(true);
}

impl ClientCore {
    fn accept_frame(self: &Arc<Self>, bytes: Vec<u8>, callbacks: &mut JoinSet<()>) {
        let replies = match wire::parse_replies(&bytes) {
            Ok(replies) => replies,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame from server");
                return;
            }
        };
        for reply in replies {
            if reply.is_push() {
                self.accept_push(reply, callbacks);
            } else {
                self.accept_response(reply);
            }
        }
    }

    fn accept_response(&self, reply: Reply) {
        let Some(id) = reply.id.clone() else {
            warn!("dropping response with no id");
            return;
        };
        let key = wire::id_key(&id);
        let waiter = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.as_mut().and_then(|map| map.remove(&key))
        };
        let Some(tx) = waiter else {
            warn!(id = %key, "dropping response for unknown request id");
            return;
        };
        let outcome = if reply.version_ok(self.opts.allow_v1) {
            Ok(reply.into_response())
        } else {
            Err(RpcError::invalid_version())
        };
        let _ = tx.send(outcome);
    }

    fn accept_push(self: &Arc<Self>, reply: Reply, callbacks: &mut JoinSet<()>) {
        let method = reply.method.clone().unwrap_or_default();
        match reply.id.clone() {
            None => match &self.opts.on_notify {
                Some(hook) => hook(Request::notification(method, reply.params)),
                None => debug!(method, "discarding server notification"),
            },
            Some(id) => match self.opts.on_callback.clone() {
                Some(hook) => {
                    let core = self.clone();
                    let params = reply.params;
                    callbacks.spawn(async move {
                        core.run_callback(hook, id, method, params).await;
                    });
                }
                None => debug!(method, "discarding server callback"),
            },
        }
    }

    /// Runs a callback hook and always sends a reply, recovering panics so
    /// the server is never left waiting.
    async fn run_callback(
        self: Arc<Self>,
        hook: crate::options::CallbackHook,
        id: Value,
        method: String,
        params: Option<Value>,
    ) {
        let _serial = self.callback_gate.lock().await;
        let req = Request::call(id.clone(), method.as_str(), params);
        // Build the future inside the guarded block so a hook that panics
        // before yielding one is caught the same way.
        let invocation = async move { hook(Context::new(), req).await };
        let rsp = match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(value)) => Response::result(id, value),
            Ok(Err(err)) => Response::error(id, &err),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(method, panic = %msg, "callback handler panicked");
                Response::error(
                    id,
                    &RpcError::internal(format!("panic in callback handler: {msg}")),
                )
            }
        };
        match wire::encode_responses(&[rsp], false) {
            Ok(frame) => {
                if let Err(err) = self.send_frame(&frame).await {
                    debug!(error = %err, "sending callback reply failed");
                }
            }
            Err(err) => warn!(error = %err, "encoding callback reply failed"),
        }
    }
}
