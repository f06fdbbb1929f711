//! Client runtime: dial, classify, dispatch, heartbeat, and the
//! client-side half of the call orchestrator.
//!
//! Every dial computes a fresh bcrypt hash of the shared secret -- a new
//! salt each time, which is exactly what lets the server's replay guard
//! admit reconnects while rejecting copied URLs.  A lost link is redialed
//! lazily by the next `call`; an explicit `close` is permanent.

use crate::call::{DEFAULT_CALL_TIMEOUT, await_result, correlation_suffix};
use crate::codec::{self, BEAT, CallEnvelope, DEFAULT_TICKER_SECS, JsonMap, ResultEnvelope};
use crate::error::{self, RpcError};
use crate::waiter::ClientWaiter;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Callback fired once per lost connection.
pub type DisconnectCallback = dyn Fn(ClientHandle) + Send + Sync;

/// Cost 10 keeps a dial well under 100 ms of hashing.
const ADMISSION_HASH_COST: u32 = 10;

/// Mint a single-use admission token: a freshly salted bcrypt hash of
/// the shared secret, unique per invocation.
pub fn admission_token(secret: &str) -> Result<String, RpcError> {
    bcrypt::hash(secret, ADMISSION_HASH_COST).map_err(|e| RpcError::Connect(e.to_string()))
}

/// Fluent client configuration.  Attach waiters and callbacks, then
/// [`start`](Client::start) to dial and obtain a [`ClientHandle`].
pub struct Client {
    host: String,
    path: String,
    secret: String,
    ticker: Duration,
    call_timeout: Duration,
    waiters: HashMap<String, Arc<ClientWaiter>>,
    on_disconnect: Vec<Arc<DisconnectCallback>>,
}

impl Client {
    /// A client for the server at `host` (e.g. `"127.0.0.1:9000"`)
    /// sharing `secret`.
    pub fn new(host: impl Into<String>, secret: impl Into<String>) -> Self {
        Client {
            host: host.into(),
            path: "/".to_owned(),
            secret: secret.into(),
            ticker: Duration::from_secs(DEFAULT_TICKER_SECS),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            waiters: HashMap::new(),
            on_disconnect: Vec::new(),
        }
    }

    /// Upgrade endpoint path on the server, default `/`.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Heartbeat period in seconds.
    pub fn ticker(mut self, secs: u64) -> Self {
        self.ticker = Duration::from_secs(secs);
        self
    }

    /// Window an outbound call waits for its result.
    pub fn call_timeout(mut self, window: Duration) -> Self {
        self.call_timeout = window;
        self
    }

    /// Expose `waiter`'s handlers under `name` for server-initiated calls.
    pub fn register_waiter(mut self, name: &str, waiter: ClientWaiter) -> Self {
        self.waiters.insert(codec::normalize(name), Arc::new(waiter));
        self
    }

    /// Register a callback fired once whenever the link is lost.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientHandle) + Send + Sync + 'static,
    {
        self.on_disconnect.push(Arc::new(callback));
        self
    }

    /// Dial the server.  Fails if the first connection cannot be
    /// established; afterwards the handle redials on demand.
    pub async fn start(self) -> Result<ClientHandle, RpcError> {
        let (err_tx, err_rx) = mpsc::channel(4);
        let shared = Arc::new(ClientShared {
            host: self.host,
            path: self.path,
            secret: self.secret,
            ticker: self.ticker,
            call_timeout: self.call_timeout,
            waiters: self.waiters,
            on_disconnect: self.on_disconnect,
            link: Mutex::new(None),
            back_gate: Mutex::new(None),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            err_tx,
            err_rx: Mutex::new(err_rx),
        });
        {
            let mut gate = shared.back_gate.lock().await;
            shared.ensure_link(&mut gate).await?;
        }
        Ok(ClientHandle { shared })
    }
}

/// Handle to a started client.  Cloneable; all clones share one link.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    /// Invoke `waiter.method` on the server and await its result.
    ///
    /// Single-flight: a second call blocks until the first completes or
    /// times out.  A dropped link is redialed first, with a fresh
    /// admission token.
    pub async fn call(
        &self,
        waiter: &str,
        method: &str,
        input: JsonMap,
    ) -> Result<JsonMap, RpcError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let mut gate = self.shared.back_gate.lock().await;
        self.shared.ensure_link(&mut gate).await?;
        let rx = gate.as_mut().ok_or(RpcError::Disconnect)?;
        let suffix = correlation_suffix();
        let envelope = CallEnvelope::new(waiter, method, input, &suffix);
        let frame = codec::encode(&envelope)?;
        self.shared.send_any(Message::Binary(frame.into())).await?;
        await_result(
            rx,
            &envelope.waiter,
            &envelope.method,
            &suffix,
            self.shared.call_timeout,
        )
        .await
    }

    /// Close permanently: no further dials, `wait` resolves clean.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut link = self.shared.link.lock().await;
            if let Some(mut active) = link.take() {
                let _ = active.write.close().await;
            }
        }
        let _ = self.shared.err_tx.try_send(Ok(()));
        info!("client closed");
    }

    /// Block until the client ends: `Ok` after an explicit close,
    /// `Err(disconnect)` when the peer or transport fails.
    pub async fn wait(&self) -> Result<(), RpcError> {
        let mut err_rx = self.shared.err_rx.lock().await;
        err_rx.recv().await.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct Link {
    write: WsSink,
    generation: u64,
}

struct ClientShared {
    host: String,
    path: String,
    secret: String,
    ticker: Duration,
    call_timeout: Duration,
    waiters: HashMap<String, Arc<ClientWaiter>>,
    on_disconnect: Vec<Arc<DisconnectCallback>>,
    /// The write half of the live socket.  This is the single write
    /// mutex: payloads, call results, and heartbeats all pass through it.
    link: Mutex<Option<Link>>,
    /// Receiver for result frames; holding this lock is the
    /// single-flight permit, and the dialing path replaces its contents.
    back_gate: Mutex<Option<mpsc::Receiver<ResultEnvelope>>>,
    closed: AtomicBool,
    generation: AtomicU64,
    err_tx: mpsc::Sender<Result<(), RpcError>>,
    err_rx: Mutex<mpsc::Receiver<Result<(), RpcError>>>,
}

impl ClientShared {
    /// Dial if no link is up.  Callers must hold the back gate, which
    /// serializes dials and receives the fresh result channel.
    async fn ensure_link(
        self: &Arc<Self>,
        gate: &mut Option<mpsc::Receiver<ResultEnvelope>>,
    ) -> Result<(), RpcError> {
        if self.link.lock().await.is_some() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let token = admission_token(&self.secret)?;
        let url = format!("ws://{}{}?token={}", self.host, self.path, token);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RpcError::Connect(e.to_string()))?;
        let (write, read) = stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (back_tx, back_rx) = mpsc::channel(8);
        let (call_tx, call_rx) = mpsc::channel(32);
        {
            let mut link = self.link.lock().await;
            // A close that raced the dial wins; do not install the link.
            if self.closed.load(Ordering::SeqCst) {
                return Err(RpcError::Closed);
            }
            *link = Some(Link { write, generation });
        }
        *gate = Some(back_rx);
        tokio::spawn(read_loop(self.clone(), read, back_tx, call_tx, generation));
        tokio::spawn(dispatch_loop(self.clone(), call_rx, generation));
        tokio::spawn(heartbeat_loop(self.clone(), generation));
        info!(generation, host = %self.host, "client connected");
        Ok(())
    }

    /// Write one frame on whatever link is current.
    async fn send_any(self: &Arc<Self>, message: Message) -> Result<(), RpcError> {
        let (generation, result) = {
            let mut link = self.link.lock().await;
            match link.as_mut() {
                Some(active) => (active.generation, active.write.send(message).await),
                None => return Err(RpcError::Disconnect),
            }
        };
        if let Err(e) = result {
            self.fail_link(generation).await;
            return Err(RpcError::Ws(e.to_string()));
        }
        Ok(())
    }

    /// Write one frame, but only while `generation` is still the live
    /// link -- background tasks use this so a stale task never writes
    /// into a newer connection.
    async fn send_current(self: &Arc<Self>, generation: u64, message: Message) -> Result<(), RpcError> {
        let result = {
            let mut link = self.link.lock().await;
            match link.as_mut() {
                Some(active) if active.generation == generation => {
                    active.write.send(message).await
                }
                _ => return Err(RpcError::Disconnect),
            }
        };
        if let Err(e) = result {
            self.fail_link(generation).await;
            return Err(RpcError::Ws(e.to_string()));
        }
        Ok(())
    }

    /// First failure observer for a generation tears the link down,
    /// fires the disconnect callbacks, and resolves `wait`.  Later
    /// observers (the link already gone or replaced) do nothing, so the
    /// callbacks fire exactly once per lost connection.
    async fn fail_link(self: &Arc<Self>, generation: u64) {
        let was_current = {
            let mut link = self.link.lock().await;
            match &*link {
                Some(active) if active.generation == generation => {
                    *link = None;
                    true
                }
                _ => false,
            }
        };
        if !was_current || self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(generation, "connection lost");
        let handle = ClientHandle {
            shared: self.clone(),
        };
        for callback in &self.on_disconnect {
            callback(handle.clone());
        }
        let _ = self.err_tx.try_send(Err(RpcError::Disconnect));
    }
}

/// Reader: owns socket reads for one link.  Results go to the waiting
/// caller, inbound calls queue for the dispatcher, `@` echoes are
/// consumed silently.
async fn read_loop(
    shared: Arc<ClientShared>,
    mut read: SplitStream<WsStream>,
    back_tx: mpsc::Sender<ResultEnvelope>,
    call_tx: mpsc::Sender<CallEnvelope>,
    generation: u64,
) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.as_str() == BEAT {
                    continue;
                }
                route_frame(text.as_bytes(), &back_tx, &call_tx).await;
            }
            Ok(Message::Binary(frame)) => route_frame(&frame, &back_tx, &call_tx).await,
            Ok(Message::Ping(payload)) => {
                let _ = shared.send_current(generation, Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(error = %e, "client read failed");
                break;
            }
            Ok(_) => {}
        }
    }
    shared.fail_link(generation).await;
}

async fn route_frame(
    frame: &[u8],
    back_tx: &mpsc::Sender<ResultEnvelope>,
    call_tx: &mpsc::Sender<CallEnvelope>,
) {
    if let Some(result) = codec::decode_result(frame) {
        // Full buffer means no call is consuming; strays are droppable.
        let _ = back_tx.try_send(result);
    } else if let Some(call) = codec::decode_call(frame) {
        let _ = call_tx.send(call).await;
    } else {
        debug!("dropping undecodable frame");
    }
}

/// Dispatcher: drains server-initiated calls serially, runs the local
/// waiter, and answers on the same socket.
async fn dispatch_loop(
    shared: Arc<ClientShared>,
    mut call_rx: mpsc::Receiver<CallEnvelope>,
    generation: u64,
) {
    while let Some(mut call) = call_rx.recv().await {
        let input = std::mem::take(&mut call.input);
        let outcome = match shared.waiters.get(&codec::normalize(&call.waiter)) {
            Some(waiter) => waiter.dispatch((), &call.method, input).await,
            None => Err(error::NO_WAITER.to_owned()),
        };
        let reply = ResultEnvelope::reply_to(&call, outcome);
        let frame = match codec::encode(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode call result");
                continue;
            }
        };
        if shared
            .send_current(generation, Message::Binary(frame.into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Heartbeat: one `@` per ticker period through the shared write mutex,
/// so a beat never interleaves mid-frame with a payload.
async fn heartbeat_loop(shared: Arc<ClientShared>, generation: u64) {
    if shared.ticker.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(shared.ticker);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if shared
            .send_current(generation, Message::Text(BEAT.to_owned().into()))
            .await
            .is_err()
        {
            return;
        }
    }
}
