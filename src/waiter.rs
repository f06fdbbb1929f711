//! Handler registry: a waiter resolves normalized method names to async
//! closures with one of two fixed shapes.
//!
//! Server-side handlers receive the originating connection plus the input
//! mapping; client-side handlers receive the input mapping alone.  Both
//! return `(output mapping, error)` -- expressed here as a `Result` whose
//! error stringifies onto the wire.

use crate::codec::{JsonMap, normalize};
use crate::connection::Connection;
use crate::error;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Error type handlers may fail with; its string form travels in the
/// result envelope's `err` field.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFn<Ctx> =
    Arc<dyn Fn(Ctx, JsonMap) -> BoxFuture<'static, Result<JsonMap, HandlerError>> + Send + Sync>;

/// A waiter registered on the server; handlers see the caller's connection.
pub type ServerWaiter = Waiter<Arc<Connection>>;

/// A waiter registered on a client; handlers see only the input mapping
/// (the unit context is the "no connection" shape of the contract).
pub type ClientWaiter = Waiter<()>;

/// A named bundle of method handlers.
///
/// Built once before the runtime starts and shared read-only afterwards,
/// so lookups need no locking.
pub struct Waiter<Ctx> {
    methods: HashMap<String, HandlerFn<Ctx>>,
}

impl<Ctx: Send + 'static> Waiter<Ctx> {
    pub fn new() -> Self {
        Waiter {
            methods: HashMap::new(),
        }
    }

    /// Register `handler` under `name`.  The name is normalized, so
    /// `handle("SetUserInfo", ...)` and a call to `set_user_info` meet.
    pub fn handle<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Ctx, JsonMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonMap, HandlerError>> + Send + 'static,
    {
        self.methods
            .insert(normalize(name), Arc::new(move |ctx, input| Box::pin(handler(ctx, input))));
        self
    }

    /// Run the handler registered under `method`, or fail with the
    /// `method not found` wire string.  Handler errors are stringified.
    pub(crate) async fn dispatch(
        &self,
        ctx: Ctx,
        method: &str,
        input: JsonMap,
    ) -> Result<JsonMap, String> {
        match self.methods.get(&normalize(method)) {
            Some(handler) => handler(ctx, input).await.map_err(|e| e.to_string()),
            None => Err(error::METHOD_NOT_FOUND.to_owned()),
        }
    }
}

impl<Ctx: Send + 'static> Default for Waiter<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}
