//! Handler and assigner seams between the dispatcher and user code.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::context::Context;
use crate::wire::{Request, RpcError};

/// Handles a single request.
///
/// The returned value must be JSON-serializable; errors control the
/// response code sent back to the caller, defaulting to internal error for
/// anything the dispatcher cannot classify. The context carries the
/// decoded deadline, metadata, and auth token, plus two server-installed
/// values a handler may recover: the inbound request
/// ([`Context::inbound_request`]) and the server metrics collector
/// ([`Context::metrics`]).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: Context, req: Request) -> Result<Value, RpcError>;
}

/// Maps a method name to its handler, or reports the method unknown.
pub trait Assigner: Send + Sync {
    /// Returns the handler for the named method, or `None`.
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>>;

    /// All known method names, ordered lexicographically without
    /// duplicates.
    fn names(&self) -> Vec<String>;
}

/// Adapts a closure producing a boxed future into a [`Handler`]. Most
/// callers want [`MethodMap::insert_fn`], which boxes a plain async
/// closure on the way in.
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(Context, Request) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(Context, Request) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync,
{
    async fn handle(&self, ctx: Context, req: Request) -> Result<Value, RpcError> {
        (self.f)(ctx, req).await
    }
}

/// A static method table: the everyday [`Assigner`].
///
/// Backed by an ordered map so [`Assigner::names`] is sorted and duplicate
/// free by construction.
#[derive(Default)]
pub struct MethodMap {
    methods: BTreeMap<String, Arc<dyn Handler>>,
}

impl MethodMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous registration of the
    /// same name.
    pub fn insert(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.methods.insert(method.into(), handler);
    }

    /// Registers an async closure as the handler for `method`.
    pub fn insert_fn<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.insert(
            method,
            Arc::new(HandlerFn::new(move |ctx, req| f(ctx, req).boxed())),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }
}

impl Assigner for MethodMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}
