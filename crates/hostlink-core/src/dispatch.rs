//! Method dispatch.
//!
//! Handlers are registered on a [`DispatchTableBuilder`] at startup and frozen
//! into an immutable [`DispatchTable`] that connections share. A handler
//! failure, including a panic, is turned into an error result at this
//! boundary and never reaches the connection loop.

use crate::connection::ConnectionId;
use crate::protocol::{Request, RequestId, Response, RpcError};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    pub method: String,
    pub id: Option<RequestId>,
}

impl RequestContext {
    pub fn new(connection_id: ConnectionId, method: impl Into<String>) -> Self {
        Self {
            connection_id,
            method: method.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }
}

/// A request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn call(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value, RpcError> {
        (self.f)(ctx, params).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    FnHandler { f }
}

/// Collects handlers before the table is frozen.
#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any earlier registration.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        let method = method.into();
        if self.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            warn!(method = %method, "Replacing existing handler");
        }
        self
    }

    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(method, handler_fn(f))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

/// Immutable map of method name to handler.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    /// A table that answers every request with `MethodNotFound`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Run the handler for `ctx.method`.
    pub async fn dispatch(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let Some(handler) = self.handlers.get(&ctx.method).cloned() else {
            debug!(method = %ctx.method, "Method not found");
            return Err(RpcError::method_not_found(&ctx.method));
        };

        let method = ctx.method.clone();
        match AssertUnwindSafe(handler.call(ctx, params)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(method = %method, reason = %reason, "Handler panicked");
                Err(RpcError::internal(format!(
                    "Handler for {} failed: {}",
                    method, reason
                )))
            }
        }
    }

    /// Dispatch a Request and build the single Response it is owed.
    pub async fn handle_request(&self, connection_id: ConnectionId, request: Request) -> Response {
        let Request { method, params, id } = request;
        let ctx = RequestContext::new(connection_id, method).with_id(id.clone());

        match self.dispatch(ctx, params).await {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::error(Some(id), error),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("methods", &self.methods())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unexpected panic".to_string()
    }
}
