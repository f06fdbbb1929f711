//! Server runtime: the upgrade endpoint, admission pipeline, and the
//! per-connection reader loop.
//!
//! Admission runs before the upgrade completes: bcrypt-verify the `token`
//! query parameter against the shared secret, consult the replay guard,
//! then run user middleware in registration order.  Any failure answers a
//! bare 401 -- the reason is logged server-side, never leaked to the peer.

use crate::call::DEFAULT_CALL_TIMEOUT;
use crate::codec::{self, BEAT, DEFAULT_TICKER_SECS, ResultEnvelope};
use crate::connection::{Connection, ConnectionCallback};
use crate::context::Context;
use crate::error::{self, RpcError};
use crate::manager::Manager;
use crate::replay::{Admission, DEFAULT_REPLAY_CAPACITY, ReplayGuard};
use crate::waiter::{HandlerError, ServerWaiter};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type MiddlewareFn =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Fluent server configuration.  Attach waiters, middleware, and
/// lifecycle callbacks, then [`bind`](Server::bind) or
/// [`start`](Server::start).
pub struct Server {
    port: u16,
    path: String,
    secret: String,
    ticker_secs: u64,
    call_timeout: Duration,
    replay_capacity: usize,
    waiters: HashMap<String, Arc<ServerWaiter>>,
    middleware: Vec<MiddlewareFn>,
    on_connect: Option<Arc<ConnectionCallback>>,
    on_close: Option<Arc<ConnectionCallback>>,
}

struct Shared {
    secret: String,
    waiters: HashMap<String, Arc<ServerWaiter>>,
    middleware: Vec<MiddlewareFn>,
    on_connect: Option<Arc<ConnectionCallback>>,
    on_close: Option<Arc<ConnectionCallback>>,
    replay: ReplayGuard,
    manager: Arc<Manager>,
    call_timeout: Duration,
}

impl Server {
    /// A server answering on `port` (0 picks a free port) whose admission
    /// tokens must be bcrypt hashes of `secret`.
    pub fn new(port: u16, secret: impl Into<String>) -> Self {
        Server {
            port,
            path: "/".to_owned(),
            secret: secret.into(),
            ticker_secs: DEFAULT_TICKER_SECS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            waiters: HashMap::new(),
            middleware: Vec::new(),
            on_connect: None,
            on_close: None,
        }
    }

    /// Upgrade endpoint path, default `/`.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Expected client heartbeat period in seconds; the reaper runs one
    /// second slower, tolerating a single missed window.
    pub fn ticker(mut self, secs: u64) -> Self {
        self.ticker_secs = secs;
        self
    }

    /// Window an outbound server-to-client call waits for its result.
    pub fn call_timeout(mut self, window: Duration) -> Self {
        self.call_timeout = window;
        self
    }

    /// Number of admission tokens the replay guard remembers.
    pub fn replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Expose `waiter`'s handlers under `name` (normalized).
    pub fn register_waiter(mut self, name: &str, waiter: ServerWaiter) -> Self {
        self.waiters.insert(codec::normalize(name), Arc::new(waiter));
        self
    }

    /// Append an admission middleware; middleware run in registration
    /// order and any error aborts the upgrade.
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.middleware
            .push(Arc::new(move |ctx| Box::pin(middleware(ctx))));
        self
    }

    /// Callback fired after a connection is admitted and registered.
    pub fn on_connect<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |conn| Box::pin(callback(conn))));
        self
    }

    /// Callback fired once per connection as it closes.
    pub fn on_close<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |conn| Box::pin(callback(conn))));
        self
    }

    /// Bind the listener and start serving in a background task.
    ///
    /// Returns a handle exposing the bound address and the manager, so
    /// tests can run several servers in one process and callers can
    /// broadcast from outside handler code.
    pub async fn bind(self) -> Result<RunningServer, RpcError> {
        let manager = Manager::new(Duration::from_secs(self.ticker_secs + 1));
        let shared = Arc::new(Shared {
            secret: self.secret,
            waiters: self.waiters,
            middleware: self.middleware,
            on_connect: self.on_connect,
            on_close: self.on_close,
            replay: ReplayGuard::new(self.replay_capacity),
            manager: manager.clone(),
            call_timeout: self.call_timeout,
        });
        let router = Router::new()
            .route(&self.path, get(ws_handler))
            .with_state(shared);
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "rpc server listening");
        let task = tokio::spawn(async move { axum::serve(listener, router).await });
        Ok(RunningServer { manager, addr, task })
    }

    /// Bind and serve until the listener fails.
    pub async fn start(self) -> Result<(), RpcError> {
        self.bind().await?.join().await
    }
}

/// A bound, serving server.
pub struct RunningServer {
    manager: Arc<Manager>,
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The manager owning this server's connections: `online()`,
    /// `group_count()`, and the `send_to_*` fan-out helpers live here.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Block until the serve task exits.
    pub async fn join(self) -> Result<(), RpcError> {
        self.task
            .await
            .map_err(|e| RpcError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Stop accepting and drop the listener.  Established connections
    /// are closed as their reader tasks observe the dead socket.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn ws_handler(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let context = Arc::new(Context::new(method, uri, headers));
    if let Err(reason) = admit(&shared, &context).await {
        warn!(%reason, "upgrade rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| run_connection(socket, shared, context))
}

/// The admission pipeline: secret check, replay check, then user
/// middleware in registration order.
async fn admit(shared: &Shared, context: &Arc<Context>) -> Result<(), String> {
    let token = context.query_value("token").unwrap_or_default();
    match bcrypt::verify(&shared.secret, token) {
        Ok(true) => {}
        _ => return Err("hash mismatch".to_owned()),
    }
    if shared.replay.admit(token) == Admission::Duplicate {
        return Err("key has been used".to_owned());
    }
    for middleware in &shared.middleware {
        middleware(context.clone()).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Reader loop: one task per connection owns all socket reads.  Every
/// inbound frame marks the beat; `@` is echoed without dispatch; payload
/// frames are handed to their own handler task.
async fn run_connection(socket: WebSocket, shared: Arc<Shared>, context: Arc<Context>) {
    let (sink, mut stream) = socket.split();
    let conn = Connection::new(
        sink,
        shared.manager.clone(),
        shared.on_close.clone(),
        shared.call_timeout,
        context,
    );
    shared.manager.enqueue_register(conn.clone()).await;
    if let Some(on_connect) = &shared.on_connect {
        on_connect(conn.clone()).await;
    }
    info!(conn_id = %conn.id(), "connection established");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                conn.mark_beat();
                if text.as_str() == BEAT {
                    let _ = conn.send_text(BEAT).await;
                } else {
                    spawn_dispatch(shared.clone(), conn.clone(), text.as_bytes().to_vec());
                }
            }
            Ok(Message::Binary(frame)) => {
                conn.mark_beat();
                spawn_dispatch(shared.clone(), conn.clone(), frame.to_vec());
            }
            Ok(Message::Ping(payload)) => {
                conn.mark_beat();
                let _ = conn.send_message(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "read failed");
                break;
            }
            Ok(_) => {}
        }
    }
    conn.close().await;
}

/// One task per inbound payload frame: results are routed to the waiting
/// call, calls are dispatched through the registry and answered on the
/// same socket.  Handlers therefore interleave freely, and a panicking
/// handler takes down only its own task.
fn spawn_dispatch(shared: Arc<Shared>, conn: Arc<Connection>, frame: Vec<u8>) {
    tokio::spawn(async move {
        if let Some(result) = codec::decode_result(&frame) {
            conn.deliver_result(result).await;
        } else if let Some(mut call) = codec::decode_call(&frame) {
            let input = std::mem::take(&mut call.input);
            let outcome = match shared.waiters.get(&codec::normalize(&call.waiter)) {
                Some(waiter) => waiter.dispatch(conn.clone(), &call.method, input).await,
                None => Err(error::NO_WAITER.to_owned()),
            };
            let reply = ResultEnvelope::reply_to(&call, outcome);
            if let Err(e) = conn.send_envelope(&reply).await {
                debug!(conn_id = %conn.id(), error = %e, "failed to send call result");
            }
        } else {
            debug!(conn_id = %conn.id(), "dropping undecodable frame");
        }
    });
}
