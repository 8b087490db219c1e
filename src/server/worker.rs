//! Worker threads.
//!
//! Each worker is a std thread running a current-thread tokio runtime with a
//! [`LocalSet`]. It owns the [`Connection`]s it was handed by the dispatcher
//! and runs their state machines whenever:
//!
//! - a readiness future registered by the connection fires
//! - an engine or admin thread completes a blocked call (pending I/O list)
//! - a bucket is being deleted and idle clients must notice
//! - the server shuts down
//!
//! ```text
//!  dispatcher ──NewConnection──▶ ┌──────────────────────────┐
//!  readiness task ──Ready──────▶ │  Worker (LocalSet)       │
//!  notify_io_complete ─PendingIo▶│    conns: id ─▶ Slot     │
//!  bucket delete ─BucketDeletion▶│    pool: BufferPool      │
//!                                └──────────────────────────┘
//! ```

use crate::bucket::{BucketState, ThreadStats};
use crate::connection::{
    BufferPool, Connection, ConnectionShared, Cookie, EventMask, State, TcpTransport, Transport,
};
use crate::server::ServerContext;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, info, trace, warn};

/// Messages delivered to a worker thread.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A freshly accepted socket to adopt
    NewConnection(std::net::TcpStream),
    /// A connection's registered readiness fired
    Ready {
        id: u64,
        generation: u64,
        mask: EventMask,
    },
    /// The pending I/O list is non-empty
    PendingIo,
    /// Idle connections bound to dying buckets must be woken
    BucketDeletion,
    Shutdown,
}

/// The part of a worker other threads talk to.
#[derive(Debug)]
pub struct WorkerShared {
    index: usize,
    /// Connections to run because of an async completion or release
    pending_io: Mutex<Vec<u64>>,
    events: UnboundedSender<WorkerEvent>,
    /// Bucket deletions in progress
    deleting_buckets: AtomicUsize,
}

impl WorkerShared {
    pub fn new(index: usize) -> (Arc<Self>, UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            index,
            pending_io: Mutex::new(Vec::new()),
            events,
            deleting_buckets: AtomicUsize::new(0),
        });
        (shared, rx)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Queues connection `id` on the pending I/O list. The worker is only
    /// signalled when the list goes from empty to non-empty.
    pub fn schedule(&self, id: u64) {
        let mut pending = self.pending_io.lock().unwrap();
        if pending.contains(&id) {
            return;
        }
        let wake = pending.is_empty();
        pending.push(id);
        drop(pending);

        if wake {
            // The worker is gone during shutdown
            let _ = self.events.send(WorkerEvent::PendingIo);
        }
    }

    fn take_pending(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending_io.lock().unwrap())
    }

    /// Delivers an event. Returns false if the worker has exited.
    pub fn send(&self, event: WorkerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn deleting_buckets(&self) -> usize {
        self.deleting_buckets.load(Ordering::Acquire)
    }

    pub fn begin_bucket_deletion(&self) {
        self.deleting_buckets.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_bucket_deletion(&self) {
        self.deleting_buckets.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What a connection's state machine sees of its worker while it runs.
pub struct WorkerContext<'a> {
    pub server: &'a Arc<ServerContext>,
    pub worker: &'a Arc<WorkerShared>,
    pub pool: &'a mut BufferPool,
}

impl<'a> WorkerContext<'a> {
    pub fn thread(&self) -> usize {
        self.worker.index()
    }

    /// This thread's counters for bucket `index`.
    pub fn bucket_stats(&self, index: usize) -> Option<&'a ThreadStats> {
        let server: &'a ServerContext = self.server;
        server.buckets.thread_stats(index, self.worker.index())
    }
}

struct Slot {
    conn: Connection,
    /// Local task waiting for the registered readiness
    watcher: Option<JoinHandle<()>>,
}

impl Slot {
    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// The state owned by a worker thread.
struct Worker {
    server: Arc<ServerContext>,
    shared: Arc<WorkerShared>,
    pool: BufferPool,
    conns: HashMap<u64, Slot>,
    shutting_down: bool,
}

impl Worker {
    fn new(server: Arc<ServerContext>, shared: Arc<WorkerShared>) -> Self {
        let pool = BufferPool::new(server.settings.buffer_size);
        Self {
            server,
            shared,
            pool,
            conns: HashMap::new(),
            shutting_down: false,
        }
    }

    /// The event loop. Must run inside a `LocalSet`.
    async fn run(mut self, mut events: UnboundedReceiver<WorkerEvent>) {
        debug!(thread = self.shared.index(), "Worker started");

        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::NewConnection(stream) => self.adopt(stream),
                WorkerEvent::Ready {
                    id,
                    generation,
                    mask,
                } => {
                    let Some(slot) = self.conns.get_mut(&id) else {
                        continue;
                    };
                    if slot.conn.generation() != generation {
                        trace!(conn = id, "Stale readiness event");
                        continue;
                    }
                    trace!(conn = id, ?mask, "Readiness");
                    slot.watcher = None;
                    self.run_connection(id);
                }
                WorkerEvent::PendingIo => {
                    for id in self.shared.take_pending() {
                        if let Some(slot) = self.conns.get(&id) {
                            let shared = slot.conn.cookie().connection();
                            if shared.has_aiostat() {
                                shared.set_ewouldblock(false);
                            }
                            self.run_connection(id);
                        }
                    }
                }
                WorkerEvent::BucketDeletion => {
                    let buckets = &self.server.buckets;
                    let ids = self
                        .server
                        .connections
                        .signal_idle_clients(self.shared.index(), |index| {
                            buckets.state(index) == Some(BucketState::Destroying)
                        });
                    for id in ids {
                        self.run_connection(id);
                    }
                }
                WorkerEvent::Shutdown => {
                    self.shutting_down = true;
                    let ids: Vec<u64> = self.conns.keys().copied().collect();
                    for id in ids {
                        self.run_connection(id);
                    }
                }
            }

            if self.shutting_down && self.conns.is_empty() {
                break;
            }
        }

        debug!(thread = self.shared.index(), "Worker stopped");
    }

    /// Takes ownership of an accepted socket and runs its first event.
    fn adopt(&mut self, stream: std::net::TcpStream) {
        if self.shutting_down {
            return;
        }
        let stream = match stream
            .set_nonblocking(true)
            .and_then(|_| TcpStream::from_std(stream))
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(thread = self.shared.index(), error = %e, "Failed to adopt connection");
                return;
            }
        };

        let transport = TcpTransport::new(stream);
        let id = self.server.next_connection_id();
        let shared = Arc::new(ConnectionShared::new(
            id,
            self.shared.index(),
            transport.descriptor(),
            transport.peer_addr(),
        ));
        let cookie = Cookie::new(Arc::clone(&shared), Arc::clone(&self.shared));
        let conn = Connection::new(cookie, Box::new(transport), &self.server);
        self.server.connections.insert(shared);

        debug!(
            conn = id,
            thread = self.shared.index(),
            peer = ?conn.cookie().connection().peer(),
            "Connection adopted"
        );
        self.conns.insert(id, Slot { conn, watcher: None });
        self.run_connection(id);
    }

    /// Runs one event for connection `id` and re-arms its readiness task.
    fn run_connection(&mut self, id: u64) {
        let Some(slot) = self.conns.get_mut(&id) else {
            return;
        };

        let mut ctx = WorkerContext {
            server: &self.server,
            worker: &self.shared,
            pool: &mut self.pool,
        };
        slot.conn.run_event(&mut ctx);

        if slot.conn.state() == State::Destroyed {
            slot.stop_watching();
            self.conns.remove(&id);
            self.server.connections.remove(id);
            return;
        }

        if let Some((mask, generation)) = slot.conn.take_registration() {
            slot.stop_watching();
            if let Some(ready) = slot.conn.readiness(mask) {
                let shared = Arc::clone(&self.shared);
                slot.watcher = Some(tokio::task::spawn_local(async move {
                    // Errors surface on the next read or write
                    let mask = ready.await.unwrap_or(EventMask::READ | EventMask::WRITE);
                    shared.send(WorkerEvent::Ready {
                        id,
                        generation,
                        mask,
                    });
                }));
            }
        } else if slot.conn.is_closed() {
            slot.stop_watching();
        }
    }
}

/// Handle to a running worker thread.
pub struct WorkerThread {
    shared: Arc<WorkerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    /// Starts worker `index`.
    pub fn spawn(index: usize, server: Arc<ServerContext>) -> io::Result<Self> {
        let (shared, events) = WorkerShared::new(index);
        let worker_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(thread = index, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                // Connections are thread-bound, so the worker is built here
                let worker = Worker::new(server, worker_shared);
                let local = LocalSet::new();
                runtime.block_on(local.run_until(worker.run(events)));
            })?;

        info!(thread = index, "Worker thread started");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Waits for the thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(thread = self.shared.index(), "Worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_schedule_signals_once() {
        let (shared, mut events) = WorkerShared::new(3);
        shared.schedule(1);
        shared.schedule(2);
        shared.schedule(1);

        assert!(matches!(events.try_recv(), Ok(WorkerEvent::PendingIo)));
        assert!(events.try_recv().is_err());
        assert_eq!(shared.take_pending(), vec![1, 2]);

        shared.schedule(2);
        assert!(matches!(events.try_recv(), Ok(WorkerEvent::PendingIo)));
    }

    #[test]
    fn test_schedule_wakes_idle_worker() {
        let (shared, mut events) = WorkerShared::new(0);
        let mut recv = task::spawn(events.recv());
        assert_pending!(recv.poll());

        shared.schedule(7);
        assert!(recv.is_woken());
        assert!(matches!(assert_ready!(recv.poll()), Some(WorkerEvent::PendingIo)));
    }

    #[test]
    fn test_deletion_counter() {
        let (shared, _events) = WorkerShared::new(0);
        assert_eq!(shared.deleting_buckets(), 0);
        shared.begin_bucket_deletion();
        shared.begin_bucket_deletion();
        shared.end_bucket_deletion();
        assert_eq!(shared.deleting_buckets(), 1);
    }

    #[test]
    fn test_schedule_after_worker_exit() {
        let (shared, events) = WorkerShared::new(0);
        drop(events);
        shared.schedule(5);
        assert!(!shared.send(WorkerEvent::Shutdown));
    }
}
