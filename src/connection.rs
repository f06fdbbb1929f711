//! One live server-side endpoint.
//!
//! A connection owns the write half of its socket behind a single mutex --
//! payloads, call results, and heartbeat echoes all serialize through it,
//! so frames never interleave on the wire.  The read half stays with the
//! per-connection reader task in the server runtime.
//!
//! Closing is idempotent and owned: only the close path here touches the
//! result-channel sender, so a close never races a concurrent send.

use crate::call::{await_result, correlation_suffix};
use crate::codec::{self, CallEnvelope, JsonMap, ResultEnvelope};
use crate::context::Context;
use crate::error::RpcError;
use crate::manager::Manager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Callback fired when a connection is established or torn down.
pub type ConnectionCallback = dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync;

type WsSink = SplitSink<WebSocket, Message>;

struct UserInfo {
    attrs: JsonMap,
    primary: String,
}

pub struct Connection {
    id: String,
    writer: Mutex<WsSink>,
    beat: AtomicBool,
    closed: AtomicBool,
    group: AtomicI64,
    user: RwLock<Option<UserInfo>>,
    /// Routed into by the reader when a result frame arrives; taken (and
    /// thereby closed) exclusively by the close path.
    result_tx: Mutex<Option<mpsc::Sender<ResultEnvelope>>>,
    /// Receiver half of the result channel.  Holding this lock is the
    /// single-flight permit for outbound calls on this connection.
    call_gate: Mutex<mpsc::Receiver<ResultEnvelope>>,
    call_timeout: Duration,
    manager: Arc<Manager>,
    on_close: Option<Arc<ConnectionCallback>>,
    context: Arc<Context>,
}

impl Connection {
    pub(crate) fn new(
        sink: WsSink,
        manager: Arc<Manager>,
        on_close: Option<Arc<ConnectionCallback>>,
        call_timeout: Duration,
        context: Arc<Context>,
    ) -> Arc<Self> {
        let (result_tx, result_rx) = mpsc::channel(8);
        Arc::new(Connection {
            id: Uuid::new_v4().to_string(),
            writer: Mutex::new(sink),
            beat: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            group: AtomicI64::new(0),
            user: RwLock::new(None),
            result_tx: Mutex::new(Some(result_tx)),
            call_gate: Mutex::new(result_rx),
            call_timeout,
            manager,
            on_close,
            context,
        })
    }

    /// Stable identifier for this connection, unique per process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Group this connection belongs to; 0 means ungrouped.
    pub fn group_id(&self) -> i64 {
        self.group.load(Ordering::SeqCst)
    }

    /// The admission context the connection was upgraded with.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The manager owning this connection; exposes the broadcast surface.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_beat(&self) {
        self.beat.store(true, Ordering::SeqCst);
    }

    /// Clear the beat flag, returning whether it was set.  Used by the
    /// reaper: a connection whose flag was already clear missed its
    /// whole window and is evicted.
    pub(crate) fn take_beat(&self) -> bool {
        self.beat.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_group(&self, gid: i64) {
        self.group.store(gid, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Send a raw application message as one frame.
    pub async fn send(self: &Arc<Self>, msg: impl Into<Vec<u8>>) -> Result<(), RpcError> {
        let bytes: Vec<u8> = msg.into();
        self.send_message(Message::Binary(bytes.into())).await
    }

    pub(crate) async fn send_text(self: &Arc<Self>, text: &str) -> Result<(), RpcError> {
        self.send_message(Message::Text(text.to_owned().into())).await
    }

    /// All frame emissions funnel through here: one mutex, one socket
    /// write at a time.  A write error closes the connection.
    pub(crate) async fn send_message(self: &Arc<Self>, msg: Message) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(msg).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "write failed, closing connection");
                self.close().await;
                Err(RpcError::Ws(e.to_string()))
            }
        }
    }

    pub(crate) async fn send_envelope<T: serde::Serialize>(
        self: &Arc<Self>,
        envelope: &T,
    ) -> Result<(), RpcError> {
        let frame = codec::encode(envelope)?;
        self.send(frame).await
    }

    // -----------------------------------------------------------------------
    // Outbound calls (server -> client)
    // -----------------------------------------------------------------------

    /// Invoke `waiter.method` on the peer and await its result.
    ///
    /// At most one call is in flight per connection; a second caller
    /// blocks until the first completes or times out.
    pub async fn call(
        self: &Arc<Self>,
        waiter: &str,
        method: &str,
        input: JsonMap,
    ) -> Result<JsonMap, RpcError> {
        let mut gate = self.call_gate.lock().await;
        let suffix = correlation_suffix();
        let envelope = CallEnvelope::new(waiter, method, input, &suffix);
        self.send_envelope(&envelope).await?;
        await_result(
            &mut gate,
            &envelope.waiter,
            &envelope.method,
            &suffix,
            self.call_timeout,
        )
        .await
    }

    /// Route an inbound result frame to whatever call is awaiting it.
    /// Stray results (no call in flight) are buffered then dropped.
    pub(crate) async fn deliver_result(&self, result: ResultEnvelope) {
        let sender = self.result_tx.lock().await.clone();
        if let Some(tx) = sender {
            let _ = tx.try_send(result);
        }
    }

    // -----------------------------------------------------------------------
    // User metadata and uid binding
    // -----------------------------------------------------------------------

    /// Attach user attributes.  When `primary` names a key present in
    /// `attrs`, its value becomes this connection's uid binding.
    pub async fn set_user_info(self: &Arc<Self>, attrs: JsonMap, primary: &str) {
        {
            let mut user = self.user.write().await;
            *user = Some(UserInfo {
                attrs: attrs.clone(),
                primary: primary.to_owned(),
            });
        }
        if !primary.is_empty() {
            if let Some(value) = attrs.get(primary) {
                self.manager.bind_uid(crate::manager::uid_key(value), self.clone()).await;
            }
        }
    }

    pub async fn user_info(&self) -> Option<JsonMap> {
        self.user.read().await.as_ref().map(|u| u.attrs.clone())
    }

    pub(crate) async fn user_snapshot(&self) -> Option<(JsonMap, String)> {
        self.user
            .read()
            .await
            .as_ref()
            .map(|u| (u.attrs.clone(), u.primary.clone()))
    }

    /// Bind an explicit uid to this connection, replacing any holder.
    pub async fn bind_uid(self: &Arc<Self>, uid: impl Into<String>) {
        self.manager.bind_uid(uid.into(), self.clone()).await;
    }

    pub async fn unbind_uid(&self, uid: &str) {
        self.manager.unbind_uid(uid).await;
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Join a group; `gid <= 0` is a no-op.  A grouped connection leaves
    /// its current group first, so membership never leaks across groups.
    pub async fn join_group(self: &Arc<Self>, gid: i64) {
        self.manager.join_group(self, gid).await;
    }

    /// Leave the current group, if any.  The departure that would empty a
    /// group deletes it.
    pub async fn leave_group(self: &Arc<Self>) {
        self.manager.leave_group(self).await;
    }

    /// Fan a raw message out to every member of this connection's group.
    pub async fn send_to_group(self: &Arc<Self>, msg: &[u8]) {
        self.manager.send_to_group(self.group_id(), msg).await;
    }

    /// Same as [`send_to_group`](Self::send_to_group), skipping self.
    pub async fn send_to_group_except_self(self: &Arc<Self>, msg: &[u8]) {
        self.manager
            .send_to_group_except(self.group_id(), Some(self.id()), msg)
            .await;
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Tear the connection down: close the socket once, fire the user
    /// close callback, resolve any in-flight call with `disconnect`, and
    /// hand the connection to the manager for unregistration.  Safe to
    /// call from any path; only the first caller does the work.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.close().await;
        }
        if let Some(on_close) = &self.on_close {
            on_close(self.clone()).await;
        }
        // Dropping the sender closes the result channel, so a pending
        // `call` observes `disconnect` instead of hanging to timeout.
        self.result_tx.lock().await.take();
        self.manager.enqueue_unregister(self.clone()).await;
        debug!(conn_id = %self.id, "connection closed");
    }
}
