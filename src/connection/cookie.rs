//! The thread-safe half of a connection.
//!
//! A [`Connection`](super::Connection) never leaves its worker thread.
//! Everything that other threads may touch (the registry, engines, admin
//! threads) lives in [`ConnectionShared`] and is reached through a
//! [`Cookie`].

use super::machine::State;
use crate::config::Priority;
use crate::engine::EngineStatus;
use crate::server::worker::WorkerShared;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Bucket index of a connection that is not associated with any bucket.
pub const UNBOUND: i64 = -1;

/// Connection state visible from any thread.
pub struct ConnectionShared {
    id: u64,
    thread: usize,
    descriptor: i64,
    peer: Option<SocketAddr>,
    /// Registry membership plus one per outstanding asynchronous holder
    refcount: AtomicU32,
    state: AtomicU8,
    bucket_index: AtomicI64,
    ewouldblock: AtomicBool,
    /// Status delivered by `notify_io_complete`, consumed on resume
    aiostat: Mutex<Option<EngineStatus>>,
    /// 0 means "use the server default"
    priority: AtomicU8,
}

impl fmt::Debug for ConnectionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionShared")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("state", &self.state())
            .field("refcount", &self.refcount())
            .field("bucket_index", &self.bucket_index())
            .finish()
    }
}

impl ConnectionShared {
    pub fn new(id: u64, thread: usize, descriptor: i64, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            thread,
            descriptor,
            peer,
            refcount: AtomicU32::new(1),
            state: AtomicU8::new(State::Waiting as u8),
            bucket_index: AtomicI64::new(UNBOUND),
            ewouldblock: AtomicBool::new(false),
            aiostat: Mutex::new(None),
            priority: AtomicU8::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn descriptor(&self) -> i64 {
        self.descriptor
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// The bound bucket, `None` while unbound.
    pub fn bucket_index(&self) -> Option<usize> {
        let idx = self.bucket_index.load(Ordering::Acquire);
        (idx >= 0).then_some(idx as usize)
    }

    pub(crate) fn set_bucket_index(&self, index: Option<usize>) {
        let value = index.map(|i| i as i64).unwrap_or(UNBOUND);
        self.bucket_index.store(value, Ordering::Release);
    }

    pub fn is_ewouldblock(&self) -> bool {
        self.ewouldblock.load(Ordering::Acquire)
    }

    pub(crate) fn set_ewouldblock(&self, value: bool) {
        self.ewouldblock.store(value, Ordering::Release);
    }

    pub fn has_aiostat(&self) -> bool {
        self.aiostat.lock().unwrap().is_some()
    }

    pub(crate) fn set_aiostat(&self, status: EngineStatus) {
        *self.aiostat.lock().unwrap() = Some(status);
    }

    pub(crate) fn take_aiostat(&self) -> Option<EngineStatus> {
        self.aiostat.lock().unwrap().take()
    }

    /// Priority chosen by the engine, if any.
    pub fn priority(&self) -> Option<Priority> {
        match self.priority.load(Ordering::Relaxed) {
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    fn set_priority(&self, priority: Priority) {
        let tag = match priority {
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        };
        self.priority.store(tag, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            thread: self.thread,
            descriptor: self.descriptor,
            peer: self.peer.map(|p| p.to_string()),
            state: self.state().name(),
            refcount: self.refcount(),
            bucket_index: self.bucket_index.load(Ordering::Relaxed),
            ewouldblock: self.is_ewouldblock(),
            priority: self.priority(),
        }
    }
}

/// JSON view of one connection, used by the connection dump.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub thread: usize,
    pub descriptor: i64,
    pub peer: Option<String>,
    pub state: &'static str,
    pub refcount: u32,
    pub bucket_index: i64,
    pub ewouldblock: bool,
    pub priority: Option<Priority>,
}

/// Opaque handle identifying a connection to engines and background
/// threads.
///
/// Whoever receives `WouldBlock` from an engine expects exactly one
/// [`notify_io_complete`](Cookie::notify_io_complete) for it. Holders that
/// keep a cookie beyond the call that handed it to them must
/// [`reserve`](Cookie::reserve) it and [`release`](Cookie::release) it
/// when done, so the connection is not torn down underneath them.
#[derive(Clone)]
pub struct Cookie {
    conn: Arc<ConnectionShared>,
    worker: Arc<WorkerShared>,
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("conn", &self.conn.id)
            .field("thread", &self.conn.thread)
            .finish()
    }
}

impl Cookie {
    pub(crate) fn new(conn: Arc<ConnectionShared>, worker: Arc<WorkerShared>) -> Self {
        Self { conn, worker }
    }

    pub fn id(&self) -> u64 {
        self.conn.id
    }

    pub fn connection(&self) -> &Arc<ConnectionShared> {
        &self.conn
    }

    /// Completes a previously blocked engine call.
    ///
    /// Stores `status` and queues the connection on its worker's pending
    /// I/O list. Safe to call from any thread.
    pub fn notify_io_complete(&self, status: EngineStatus) {
        self.conn.set_aiostat(status);
        self.worker.schedule(self.conn.id);
    }

    /// Takes an extra reference on the connection.
    pub fn reserve(&self) {
        self.conn.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference taken with [`reserve`](Cookie::reserve).
    ///
    /// The connection is queued on its worker afterwards, so one waiting in
    /// `PendingClose` re-checks whether it may finish closing.
    pub fn release(&self) {
        let previous = self.conn.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 1, "released a connection that was not reserved");
        self.worker.schedule(self.conn.id);
    }

    /// Changes how many requests the connection may run per event.
    pub fn set_priority(&self, priority: Priority) {
        self.conn.set_priority(priority);
    }
}

#[cfg(test)]
pub(crate) fn test_cookie(id: u64) -> Cookie {
    let (worker, _events) = WorkerShared::new(0);
    Cookie::new(Arc::new(ConnectionShared::new(id, 0, -1, None)), worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;

    #[test]
    fn test_refcount_starts_at_one() {
        let cookie = test_cookie(1);
        assert_eq!(cookie.connection().refcount(), 1);
        cookie.reserve();
        cookie.reserve();
        assert_eq!(cookie.connection().refcount(), 3);
        cookie.release();
        cookie.release();
        assert_eq!(cookie.connection().refcount(), 1);
    }

    #[test]
    fn test_notify_stores_status() {
        let cookie = test_cookie(7);
        assert!(!cookie.connection().has_aiostat());
        cookie.notify_io_complete(Err(EngineError::TempFail));
        assert!(cookie.connection().has_aiostat());
        assert_eq!(
            cookie.connection().take_aiostat(),
            Some(Err(EngineError::TempFail))
        );
        assert!(!cookie.connection().has_aiostat());
    }

    #[test]
    fn test_bucket_index_roundtrip() {
        let shared = ConnectionShared::new(1, 0, -1, None);
        assert_eq!(shared.bucket_index(), None);
        shared.set_bucket_index(Some(0));
        assert_eq!(shared.bucket_index(), Some(0));
        shared.set_bucket_index(None);
        assert_eq!(shared.snapshot().bucket_index, UNBOUND);
    }

    #[test]
    fn test_priority() {
        let cookie = test_cookie(3);
        assert_eq!(cookie.connection().priority(), None);
        cookie.set_priority(Priority::Low);
        assert_eq!(cookie.connection().priority(), Some(Priority::Low));
    }
}
