//! Connection manager: the live-connection set, group index, uid index,
//! heartbeat reaper, and the broadcast surface.
//!
//! Membership mutations flow through register/unregister channels drained
//! by a single pump task, so bookkeeping (online count, group eviction,
//! uid release) is serialized even though reads and fan-out iterate the
//! set concurrently.  Every manager is owned by its server instance --
//! multiple servers in one process never share state.

use crate::connection::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Canonical uid-index key for a user-attribute value.
pub(crate) fn uid_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Default)]
struct Group {
    members: HashMap<String, Arc<Connection>>,
    count: i64,
}

pub struct Manager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    groups: RwLock<HashMap<i64, Group>>,
    uids: RwLock<HashMap<String, Arc<Connection>>>,
    online: AtomicI64,
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
}

impl Manager {
    /// Build a manager and spawn its pump and reaper tasks.  Both hold
    /// only weak references, so dropping the last `Arc<Manager>` (e.g. a
    /// test server going away) winds the tasks down.
    pub(crate) fn new(reaper_period: Duration) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        let manager = Arc::new(Manager {
            connections: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            uids: RwLock::new(HashMap::new()),
            online: AtomicI64::new(0),
            register_tx,
            unregister_tx,
        });
        tokio::spawn(membership_pump(
            Arc::downgrade(&manager),
            register_rx,
            unregister_rx,
        ));
        tokio::spawn(reaper(Arc::downgrade(&manager), reaper_period));
        manager
    }

    /// Current number of registered connections.
    pub fn online(&self) -> i64 {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) async fn enqueue_register(&self, conn: Arc<Connection>) {
        let _ = self.register_tx.send(conn).await;
    }

    pub(crate) async fn enqueue_unregister(&self, conn: Arc<Connection>) {
        let _ = self.unregister_tx.send(conn).await;
    }

    async fn handle_register(&self, conn: Arc<Connection>) {
        self.connections
            .write()
            .await
            .insert(conn.id().to_owned(), conn.clone());
        let online = self.online.fetch_add(1, Ordering::SeqCst) + 1;
        info!(conn_id = %conn.id(), online, "connection registered");
    }

    async fn handle_unregister(&self, conn: Arc<Connection>) {
        let removed = self.connections.write().await.remove(conn.id()).is_some();
        if !removed {
            return;
        }
        self.leave_group(&conn).await;
        let online = self.online.fetch_sub(1, Ordering::SeqCst) - 1;
        self.release_primary_uid(&conn).await;
        info!(conn_id = %conn.id(), online, "connection unregistered");
    }

    /// Release the uid binding named by the connection's primary key --
    /// but only while it still points at this connection, so a uid
    /// rebound by a newer connection is left alone.
    async fn release_primary_uid(&self, conn: &Arc<Connection>) {
        let Some((attrs, primary)) = conn.user_snapshot().await else {
            return;
        };
        if primary.is_empty() {
            return;
        }
        let Some(value) = attrs.get(&primary) else {
            return;
        };
        let key = uid_key(value);
        let mut uids = self.uids.write().await;
        if uids.get(&key).is_some_and(|held| Arc::ptr_eq(held, conn)) {
            uids.remove(&key);
        }
    }

    // -----------------------------------------------------------------------
    // Uid index
    // -----------------------------------------------------------------------

    pub(crate) async fn bind_uid(&self, uid: String, conn: Arc<Connection>) {
        debug!(uid = %uid, conn_id = %conn.id(), "uid bound");
        self.uids.write().await.insert(uid, conn);
    }

    pub(crate) async fn unbind_uid(&self, uid: &str) {
        self.uids.write().await.remove(uid);
    }

    /// Connection currently bound to `uid`, if any.
    pub async fn uid_connection(&self, uid: &str) -> Option<Arc<Connection>> {
        self.uids.read().await.get(uid).cloned()
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Member count of `gid`; 0 when the group does not exist.
    pub async fn group_count(&self, gid: i64) -> i64 {
        self.groups.read().await.get(&gid).map_or(0, |g| g.count)
    }

    pub(crate) async fn join_group(&self, conn: &Arc<Connection>, gid: i64) {
        if gid <= 0 {
            return;
        }
        if conn.group_id() > 0 {
            self.leave_group(conn).await;
        }
        let mut groups = self.groups.write().await;
        let group = groups.entry(gid).or_default();
        if group
            .members
            .insert(conn.id().to_owned(), conn.clone())
            .is_none()
        {
            group.count += 1;
        }
        conn.set_group(gid);
        debug!(conn_id = %conn.id(), gid, members = group.count, "joined group");
    }

    pub(crate) async fn leave_group(&self, conn: &Arc<Connection>) {
        let gid = conn.group_id();
        if gid <= 0 {
            return;
        }
        conn.set_group(0);
        let mut groups = self.groups.write().await;
        let emptied = match groups.get_mut(&gid) {
            Some(group) => {
                if group.members.remove(conn.id()).is_some() {
                    group.count -= 1;
                }
                group.count <= 0
            }
            None => false,
        };
        if emptied {
            if let Some(group) = groups.remove(&gid) {
                for member in group.members.values() {
                    member.set_group(0);
                }
            }
            debug!(gid, "group emptied and removed");
        }
    }

    /// Disband `gid`: clear every member's group id, then drop the group.
    pub async fn remove_group(&self, gid: i64) {
        if gid <= 0 {
            return;
        }
        if let Some(group) = self.groups.write().await.remove(&gid) {
            for member in group.members.values() {
                member.set_group(0);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Deliver `msg` to every current connection exactly once.
    pub async fn send_to_all(&self, msg: &[u8]) {
        for conn in self.snapshot().await {
            let _ = conn.send(msg.to_vec()).await;
        }
    }

    /// Deliver `msg` to every connection except `conn`.
    pub async fn send_to_all_except(&self, conn: &Arc<Connection>, msg: &[u8]) {
        for peer in self.snapshot().await {
            if !Arc::ptr_eq(&peer, conn) {
                let _ = peer.send(msg.to_vec()).await;
            }
        }
    }

    /// Deliver `msg` to every connection that belongs to no group.
    pub async fn send_to_ungrouped(&self, msg: &[u8]) {
        for conn in self.snapshot().await {
            if conn.group_id() <= 0 {
                let _ = conn.send(msg.to_vec()).await;
            }
        }
    }

    /// Deliver `msg` to every member of `gid`.
    pub async fn send_to_group(&self, gid: i64, msg: &[u8]) {
        self.send_to_group_except(gid, None, msg).await;
    }

    pub(crate) async fn send_to_group_except(&self, gid: i64, except: Option<&str>, msg: &[u8]) {
        if gid <= 0 {
            return;
        }
        let members: Vec<Arc<Connection>> = {
            let groups = self.groups.read().await;
            match groups.get(&gid) {
                Some(group) => group
                    .members
                    .iter()
                    .filter(|(id, _)| except != Some(id.as_str()))
                    .map(|(_, conn)| conn.clone())
                    .collect(),
                None => return,
            }
        };
        for conn in members {
            let _ = conn.send(msg.to_vec()).await;
        }
    }

    /// Deliver `msg` to the connection bound to `uid`, if any.
    pub async fn send_to_uid(&self, uid: &str, msg: &[u8]) {
        if let Some(conn) = self.uid_connection(uid).await {
            let _ = conn.send(msg.to_vec()).await;
        }
    }

    /// Deliver `msg` to one specific connection.
    pub async fn send_to_client(&self, conn: &Arc<Connection>, msg: &[u8]) {
        let _ = conn.send(msg.to_vec()).await;
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }
}

/// Serializes register/unregister.  Register is polled first: a
/// connection's register is always enqueued before any unregister for it,
/// so biased polling preserves that order when both are pending.
async fn membership_pump(
    manager: Weak<Manager>,
    mut register_rx: mpsc::Receiver<Arc<Connection>>,
    mut unregister_rx: mpsc::Receiver<Arc<Connection>>,
) {
    loop {
        tokio::select! {
            biased;
            registered = register_rx.recv() => match (registered, manager.upgrade()) {
                (Some(conn), Some(manager)) => manager.handle_register(conn).await,
                _ => break,
            },
            unregistered = unregister_rx.recv() => match (unregistered, manager.upgrade()) {
                (Some(conn), Some(manager)) => manager.handle_unregister(conn).await,
                _ => break,
            },
        }
    }
    debug!("membership pump stopped");
}

/// Scan all connections every period: a connection whose beat flag is
/// still clear missed the whole window and is closed; everyone else has
/// their flag cleared for the next round.
async fn reaper(manager: Weak<Manager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let connections = manager.snapshot().await;
        drop(manager);
        for conn in connections {
            if !conn.take_beat() {
                warn!(conn_id = %conn.id(), "heartbeat missed, evicting");
                conn.close().await;
            }
        }
    }
    debug!("reaper stopped");
}
