//! Per-thread bucket statistics.
//!
//! Each bucket owns one [`ThreadStats`] per worker thread plus one for
//! administrative threads, so the hot path only ever touches counters no
//! other worker writes to.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one (bucket, thread) pair.
#[derive(Debug, Default)]
pub struct ThreadStats {
    pub cmd_total: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub cmd_set: AtomicU64,
    pub delete_hits: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Times a connection gave up the thread with input still pending
    pub conn_yields: AtomicU64,
    pub rbufs_allocated: AtomicU64,
    pub rbufs_loaned: AtomicU64,
    pub rbufs_existing: AtomicU64,
    pub wbufs_allocated: AtomicU64,
    pub wbufs_loaned: AtomicU64,
    pub wbufs_existing: AtomicU64,
}

/// A plain snapshot of one or more [`ThreadStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cmd_total: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub cmd_set: u64,
    pub delete_hits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub conn_yields: u64,
    pub rbufs_allocated: u64,
    pub rbufs_loaned: u64,
    pub rbufs_existing: u64,
    pub wbufs_allocated: u64,
    pub wbufs_loaned: u64,
    pub wbufs_existing: u64,
}

impl ThreadStats {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            cmd_total: load(&self.cmd_total),
            get_hits: load(&self.get_hits),
            get_misses: load(&self.get_misses),
            cmd_set: load(&self.cmd_set),
            delete_hits: load(&self.delete_hits),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            conn_yields: load(&self.conn_yields),
            rbufs_allocated: load(&self.rbufs_allocated),
            rbufs_loaned: load(&self.rbufs_loaned),
            rbufs_existing: load(&self.rbufs_existing),
            wbufs_allocated: load(&self.wbufs_allocated),
            wbufs_loaned: load(&self.wbufs_loaned),
            wbufs_existing: load(&self.wbufs_existing),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.cmd_total,
            &self.get_hits,
            &self.get_misses,
            &self.cmd_set,
            &self.delete_hits,
            &self.bytes_read,
            &self.bytes_written,
            &self.conn_yields,
            &self.rbufs_allocated,
            &self.rbufs_loaned,
            &self.rbufs_existing,
            &self.wbufs_allocated,
            &self.wbufs_loaned,
            &self.wbufs_existing,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatsSnapshot {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.cmd_total += other.cmd_total;
        self.get_hits += other.get_hits;
        self.get_misses += other.get_misses;
        self.cmd_set += other.cmd_set;
        self.delete_hits += other.delete_hits;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.conn_yields += other.conn_yields;
        self.rbufs_allocated += other.rbufs_allocated;
        self.rbufs_loaned += other.rbufs_loaned;
        self.rbufs_existing += other.rbufs_existing;
        self.wbufs_allocated += other.wbufs_allocated;
        self.wbufs_loaned += other.wbufs_loaned;
        self.wbufs_existing += other.wbufs_existing;
    }

    /// Emits every counter through `add_stat`.
    pub fn emit(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let pairs: [(&str, u64); 14] = [
            ("cmd_total", self.cmd_total),
            ("get_hits", self.get_hits),
            ("get_misses", self.get_misses),
            ("cmd_set", self.cmd_set),
            ("delete_hits", self.delete_hits),
            ("bytes_read", self.bytes_read),
            ("bytes_written", self.bytes_written),
            ("conn_yields", self.conn_yields),
            ("rbufs_allocated", self.rbufs_allocated),
            ("rbufs_loaned", self.rbufs_loaned),
            ("rbufs_existing", self.rbufs_existing),
            ("wbufs_allocated", self.wbufs_allocated),
            ("wbufs_loaned", self.wbufs_loaned),
            ("wbufs_existing", self.wbufs_existing),
        ];
        for (name, value) in pairs {
            add_stat(name, &value.to_string());
        }
    }
}
