//! Process-wide set of live connections.
//!
//! The registry only holds the thread-safe half of each connection. Worker
//! threads insert a connection when they adopt its socket and remove it once
//! its state machine reaches `Destroyed`.

use super::cookie::{ConnectionShared, ConnectionSnapshot};
use super::machine::State;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counters for connection handling.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections refused because the limit was reached
    pub connections_rejected: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// The connection dump.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDump {
    pub total: usize,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<u64, Arc<ConnectionShared>>>,
    stats: ConnectionStats,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn insert(&self, conn: Arc<ConnectionShared>) {
        self.conns.lock().unwrap().insert(conn.id(), conn);
        self.stats.connection_opened();
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ConnectionShared>> {
        let removed = self.conns.lock().unwrap().remove(&id);
        if removed.is_some() {
            self.stats.connection_closed();
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<ConnectionShared>> {
        self.conns.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the connections on `thread` whose bucket matches `bucket`
    /// and which are not parked on an engine call.
    ///
    /// Those are the connections a worker has to kick so they notice that
    /// their bucket is going away. Parked ones notice on resume.
    pub fn signal_idle_clients(&self, thread: usize, bucket: impl Fn(usize) -> bool) -> Vec<u64> {
        self.conns
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.thread() == thread && !c.is_ewouldblock())
            .filter(|c| c.bucket_index().map(&bucket).unwrap_or(false))
            .map(|c| c.id())
            .collect()
    }

    /// Number of live connections still bound to bucket `index`.
    pub fn associations(&self, index: usize) -> usize {
        self.conns
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.bucket_index() == Some(index) && c.state() != State::Destroyed)
            .count()
    }

    /// Snapshots every connection, ordered by id.
    pub fn dump(&self) -> ConnectionDump {
        let mut connections: Vec<ConnectionSnapshot> = self
            .conns
            .lock()
            .unwrap()
            .values()
            .map(|c| c.snapshot())
            .collect();
        connections.sort_by_key(|c| c.id);
        ConnectionDump {
            total: connections.len(),
            connections,
        }
    }

    /// The dump as a JSON document.
    pub fn dump_json(&self) -> String {
        serde_json::to_string(&self.dump()).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64, thread: usize, bucket: Option<usize>) -> Arc<ConnectionShared> {
        let shared = Arc::new(ConnectionShared::new(id, thread, -1, None));
        shared.set_bucket_index(bucket);
        shared
    }

    #[test]
    fn test_insert_remove() {
        let registry = ConnectionRegistry::new();
        registry.insert(conn(1, 0, None));
        registry.insert(conn(2, 1, None));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.stats().active_connections.load(Ordering::Relaxed), 2);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(registry.stats().connections_accepted.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_signal_skips_parked_and_other_threads() {
        let registry = ConnectionRegistry::new();
        registry.insert(conn(1, 0, Some(3)));
        registry.insert(conn(2, 0, Some(3)));
        registry.insert(conn(3, 1, Some(3)));
        registry.insert(conn(4, 0, Some(0)));
        registry.get(2).unwrap().set_ewouldblock(true);

        let ids = registry.signal_idle_clients(0, |idx| idx == 3);
        assert_eq!(ids, vec![1]);
        assert_eq!(registry.associations(3), 3);
        assert_eq!(registry.associations(0), 1);
    }

    #[test]
    fn test_dump_json() {
        let registry = ConnectionRegistry::new();
        registry.insert(conn(9, 0, Some(0)));
        let json: serde_json::Value = serde_json::from_str(&registry.dump_json()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["connections"][0]["id"], 9);
        assert_eq!(json["connections"][0]["state"], "waiting");
        assert_eq!(json["connections"][0]["refcount"], 1);
    }
}
