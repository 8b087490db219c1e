//! Bucket Table and Lifecycle
//!
//! A bucket is a named engine instance. The table is a fixed array of slots;
//! slot 0 permanently hosts the no-bucket engine that unbound connections
//! talk to.
//!
//! ## Slot Lifecycle
//!
//! ```text
//!            create (table lock)          engine built
//!   ┌──────┐ ───────────────────▶ ┌──────────┐ ─────────▶ ┌──────────────┐
//!   │ None │                      │ Creating │            │ Initializing │
//!   └──────┘ ◀──────┐             └──────────┘            └──────┬───────┘
//!      ▲            │ init failed                                │ initialize ok
//!      │            └────────────────────────────────────────────┤
//!      │ destroy done                                            ▼
//!   ┌────────────┐       delete                              ┌───────┐
//!   │ Destroying │ ◀──────────────────────────────────────── │ Ready │
//!   └────────────┘   (waits until clients == 0)              └───────┘
//! ```
//!
//! Only `Ready` buckets accept new associations. Engine construction,
//! `initialize` and `destroy` always run without any table or slot lock held.
//!
//! ## Deletion Handshake
//!
//! Deleting a bucket flips it to `Destroying` so new associations fail,
//! then asks every worker thread to wake the idle connections bound to it.
//! Those connections notice the dying bucket, close and disassociate; the
//! last one signals the slot's condition variable. The deleter re-sends the
//! wake-up on every poll interval until the client count reaches zero.

mod api;
pub mod collections;
pub mod stats;

pub use api::{EngineEvent, EngineEventType, EventCallback, ServerApi, ServerApiError};
pub use collections::{Collections, CollectionsError, Manifest};
pub use stats::{StatsSnapshot, ThreadStats};

use crate::engine::{new_engine_instance, BucketType, Engine, EngineError, NoBucketEngine};
use crate::protocol::{Status, MAX_BUCKET_NAME_LENGTH};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Index of the permanent no-bucket slot.
pub const NO_BUCKET_INDEX: usize = 0;

/// Name new connections try to associate with.
pub const DEFAULT_BUCKET_NAME: &str = "default";

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    None,
    Creating,
    Initializing,
    Ready,
    Destroying,
}

/// Errors from bucket administration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("invalid bucket name")]
    InvalidName,

    #[error("bucket already exists")]
    AlreadyExists,

    #[error("too many buckets")]
    TooManyBuckets,

    #[error("no such bucket")]
    NotFound,

    #[error("bucket is not ready")]
    NotReady,

    #[error("unknown bucket type: {0}")]
    UnknownType(String),

    #[error("failed to initialize bucket: {0}")]
    InitFailed(EngineError),

    #[error(transparent)]
    Collections(#[from] CollectionsError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<BucketError> for Status {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::InvalidName | BucketError::Collections(_) => Status::Invalid,
            BucketError::AlreadyExists | BucketError::NotReady => Status::KeyExists,
            BucketError::TooManyBuckets => Status::TooBig,
            BucketError::NotFound => Status::KeyNotFound,
            BucketError::UnknownType(_) | BucketError::InitFailed(_) => Status::NotStored,
            BucketError::Engine(e) => e.into(),
        }
    }
}

/// Bucket administration results travel back to the requesting connection
/// as an engine completion status.
impl From<BucketError> for EngineError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::InvalidName | BucketError::Collections(_) => EngineError::Invalid,
            BucketError::AlreadyExists | BucketError::NotReady => EngineError::KeyExists,
            BucketError::TooManyBuckets => EngineError::TooBig,
            BucketError::NotFound => EngineError::KeyNotFound,
            BucketError::UnknownType(_) | BucketError::InitFailed(_) => EngineError::NotStored,
            BucketError::Engine(e) => e,
        }
    }
}

/// Checks length and character set of a bucket name.
pub fn is_valid_bucket_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_BUCKET_NAME_LENGTH as usize
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'%'))
}

/// Coordination with the worker threads during bucket deletion.
pub trait DeletionListener {
    /// Tells every worker that a bucket is being deleted.
    fn initiate_bucket_deletion(&self);

    /// Asks every worker to wake idle connections bound to dying buckets.
    fn notify_bucket_deletion(&self);

    /// Tells every worker the deletion finished.
    fn complete_bucket_deletion(&self);

    /// Number of live connections still bound to `index`.
    fn associations(&self, index: usize) -> usize;
}

/// The mutable part of a slot, guarded by the slot mutex.
struct BucketSlot {
    state: BucketState,
    name: String,
    bucket_type: Option<BucketType>,
    engine: Option<Arc<dyn Engine>>,
    clients: u32,
}

impl BucketSlot {
    fn empty() -> Self {
        Self {
            state: BucketState::None,
            name: String::new(),
            bucket_type: None,
            engine: None,
            clients: 0,
        }
    }

    fn clear(&mut self) {
        self.state = BucketState::None;
        self.name.clear();
        self.bucket_type = None;
        self.engine = None;
    }
}

/// One slot of the table.
pub struct Bucket {
    slot: Mutex<BucketSlot>,
    drained: Condvar,
    stats: Box<[ThreadStats]>,
    disconnect_handlers: Mutex<Vec<EventCallback>>,
    collections: RwLock<Collections>,
}

impl Bucket {
    fn new(num_threads: usize) -> Self {
        Self {
            slot: Mutex::new(BucketSlot::empty()),
            drained: Condvar::new(),
            stats: (0..=num_threads).map(|_| ThreadStats::default()).collect(),
            disconnect_handlers: Mutex::new(Vec::new()),
            collections: RwLock::new(Collections::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketSlot> {
        self.slot.lock().unwrap()
    }

    pub fn state(&self) -> BucketState {
        self.lock().state
    }
}

/// A connection's claim on a bucket. Returned by [`BucketTable::associate`]
/// and given back through [`BucketTable::disassociate`].
#[derive(Clone)]
pub struct Association {
    pub index: usize,
    pub engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("index", &self.index)
            .field("type", &self.engine.bucket_type())
            .finish()
    }
}

/// JSON view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketDetails {
    pub index: usize,
    pub state: BucketState,
    pub clients: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: Option<BucketType>,
}

/// The fixed-size table of buckets.
pub struct BucketTable {
    buckets: Box<[Bucket]>,
    /// Serialises the name scan and slot reservation of create and delete
    lock: Mutex<()>,
    log_level_handlers: Mutex<Vec<(usize, EventCallback)>>,
    num_threads: usize,
    deletion_poll: Duration,
    engines_destroyed: AtomicU64,
}

impl BucketTable {
    /// Creates a table with `max_buckets` slots and installs the no-bucket
    /// engine in slot 0.
    ///
    /// # Arguments
    ///
    /// * `max_buckets` - Number of slots, slot 0 included
    /// * `num_threads` - Worker threads; stats get one extra admin entry
    /// * `deletion_poll` - How long delete waits between drain checks
    pub fn new(max_buckets: usize, num_threads: usize, deletion_poll: Duration) -> Self {
        let buckets: Box<[Bucket]> = (0..max_buckets.max(1))
            .map(|_| Bucket::new(num_threads))
            .collect();

        {
            let mut slot = buckets[NO_BUCKET_INDEX].lock();
            slot.state = BucketState::Ready;
            slot.bucket_type = Some(BucketType::NoBucket);
            slot.engine = Some(Arc::new(NoBucketEngine::new()));
        }

        Self {
            buckets,
            lock: Mutex::new(()),
            log_level_handlers: Mutex::new(Vec::new()),
            num_threads,
            deletion_poll,
            engines_destroyed: AtomicU64::new(0),
        }
    }

    pub fn max_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn state(&self, index: usize) -> Option<BucketState> {
        self.bucket(index).map(Bucket::state)
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.state(index) == Some(BucketState::Ready)
    }

    pub fn clients(&self, index: usize) -> u32 {
        self.bucket(index).map(|b| b.lock().clients).unwrap_or(0)
    }

    /// Number of engine instances destroyed since the table was created.
    pub fn engines_destroyed(&self) -> u64 {
        self.engines_destroyed.load(Ordering::Relaxed)
    }

    fn destroy_engine(&self, engine: &dyn Engine, force: bool) {
        engine.destroy(force);
        self.engines_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Indices of every slot currently being destroyed.
    pub fn destroying(&self) -> Vec<usize> {
        (0..self.buckets.len())
            .filter(|&idx| self.state(idx) == Some(BucketState::Destroying))
            .collect()
    }

    /// Creates a bucket.
    ///
    /// The table lock is held only while the name is checked and a free
    /// slot is reserved; the engine is built and initialized afterwards.
    ///
    /// # Returns
    ///
    /// The index of the new bucket.
    pub fn create(
        &self,
        name: &str,
        config: &str,
        bucket_type: BucketType,
    ) -> Result<usize, BucketError> {
        if !is_valid_bucket_name(name) {
            return Err(BucketError::InvalidName);
        }
        let collections = Collections::from_bucket_config(config).map_err(|e| {
            warn!(bucket = %name, error = %e, "Rejecting collection configuration");
            BucketError::Collections(e)
        })?;

        let index = {
            let _guard = self.lock.lock().unwrap();
            let mut free = None;
            for (idx, bucket) in self.buckets.iter().enumerate().skip(1) {
                let slot = bucket.lock();
                if slot.state != BucketState::None && slot.name == name {
                    return Err(BucketError::AlreadyExists);
                }
                if free.is_none() && slot.state == BucketState::None {
                    free = Some(idx);
                }
            }
            let idx = free.ok_or(BucketError::TooManyBuckets)?;

            let mut slot = self.buckets[idx].lock();
            slot.state = BucketState::Creating;
            slot.name = name.to_string();
            slot.bucket_type = Some(bucket_type);
            idx
        };

        info!(bucket = %name, index, %bucket_type, "Creating bucket");

        let engine = match new_engine_instance(bucket_type) {
            Ok(engine) => engine,
            Err(e) => {
                self.buckets[index].lock().clear();
                warn!(bucket = %name, error = %e, "Failed to create engine");
                return Err(BucketError::Engine(e));
            }
        };

        {
            let mut slot = self.buckets[index].lock();
            slot.engine = Some(Arc::clone(&engine));
            slot.state = BucketState::Initializing;
        }

        if let Err(e) = engine.initialize(config, &ServerApi::new(self, index)) {
            self.buckets[index].lock().state = BucketState::Destroying;
            self.destroy_engine(engine.as_ref(), false);
            self.reset_slot(index);
            warn!(bucket = %name, error = %e, "Failed to initialize bucket");
            return Err(BucketError::InitFailed(e));
        }

        *self.buckets[index].collections.write().unwrap() = collections;
        self.buckets[index].lock().state = BucketState::Ready;
        info!(bucket = %name, index, "Bucket ready");
        Ok(index)
    }

    /// Binds a connection to the named `Ready` bucket, falling back to the
    /// no-bucket slot when there is none.
    pub fn associate(&self, name: &str) -> Association {
        for (index, bucket) in self.buckets.iter().enumerate().skip(1) {
            let mut slot = bucket.lock();
            if slot.state == BucketState::Ready && slot.name == name {
                if let Some(engine) = slot.engine.clone() {
                    slot.clients += 1;
                    return Association { index, engine };
                }
            }
        }
        self.associate_no_bucket()
    }

    /// Binds a connection to slot 0.
    pub fn associate_no_bucket(&self) -> Association {
        let mut slot = self.buckets[NO_BUCKET_INDEX].lock();
        slot.clients += 1;
        let engine = match slot.engine.clone() {
            Some(engine) => engine,
            None => {
                let engine: Arc<dyn Engine> = Arc::new(NoBucketEngine::new());
                slot.engine = Some(Arc::clone(&engine));
                engine
            }
        };
        Association {
            index: NO_BUCKET_INDEX,
            engine,
        }
    }

    /// Releases a connection's claim on a bucket, waking a pending delete
    /// when the last client leaves.
    pub fn disassociate(&self, association: Association) {
        let bucket = &self.buckets[association.index];
        let mut slot = bucket.lock();
        if slot.clients == 0 {
            error!(bucket = association.index, "Disassociate with no clients");
        }
        slot.clients = slot.clients.saturating_sub(1);
        if slot.clients == 0 && slot.state == BucketState::Destroying {
            bucket.drained.notify_all();
        }
    }

    /// First half of a delete: flips the bucket from `Ready` to `Destroying`.
    ///
    /// # Returns
    ///
    /// The index of the bucket now being destroyed.
    pub fn begin_delete(&self, name: &str) -> Result<usize, BucketError> {
        let _guard = self.lock.lock().unwrap();
        for (index, bucket) in self.buckets.iter().enumerate().skip(1) {
            let mut slot = bucket.lock();
            if slot.state != BucketState::None && slot.name == name {
                if slot.state != BucketState::Ready {
                    return Err(BucketError::NotReady);
                }
                slot.state = BucketState::Destroying;
                info!(bucket = %name, index, "Delete bucket, waiting for clients to disconnect");
                return Ok(index);
            }
        }
        Err(BucketError::NotFound)
    }

    /// Undoes [`begin_delete`](Self::begin_delete) when the deletion cannot
    /// go ahead.
    ///
    /// # Returns
    ///
    /// `true` if the bucket was `Destroying` and is `Ready` again.
    pub fn abort_delete(&self, index: usize) -> bool {
        let _guard = self.lock.lock().unwrap();
        let Some(bucket) = self.bucket(index) else {
            return false;
        };
        let mut slot = bucket.lock();
        if index == NO_BUCKET_INDEX || slot.state != BucketState::Destroying {
            return false;
        }
        slot.state = BucketState::Ready;
        warn!(bucket = %slot.name, index, "Delete bucket aborted");
        true
    }

    /// Second half of a delete: drains clients, destroys the engine and
    /// frees the slot. Blocks the calling thread.
    pub fn finish_delete(&self, index: usize, force: bool, listener: &dyn DeletionListener) {
        let bucket = &self.buckets[index];

        listener.initiate_bucket_deletion();

        let mut slot = bucket.lock();
        while slot.clients > 0 {
            info!(
                bucket = %slot.name,
                clients = slot.clients,
                "Delete bucket, still waiting for clients"
            );
            drop(slot);
            listener.notify_bucket_deletion();
            slot = bucket.lock();
            if slot.clients == 0 {
                break;
            }
            slot = bucket
                .drained
                .wait_timeout(slot, self.deletion_poll)
                .unwrap()
                .0;
        }
        let name = slot.name.clone();
        let engine = slot.engine.clone();
        drop(slot);

        listener.complete_bucket_deletion();

        let remaining = listener.associations(index);
        if remaining != 0 {
            error!(bucket = %name, remaining, "Connections still bound to deleted bucket");
            debug_assert_eq!(remaining, 0, "connections still bound to deleted bucket");
        }

        info!(bucket = %name, force, "Delete bucket, shutting down engine");
        if let Some(engine) = engine {
            self.destroy_engine(engine.as_ref(), force);
        }

        self.reset_slot(index);
        info!(bucket = %name, "Bucket deleted");
    }

    /// Deletes a bucket: [`begin_delete`](Self::begin_delete) followed by
    /// [`finish_delete`](Self::finish_delete).
    pub fn delete(
        &self,
        name: &str,
        force: bool,
        listener: &dyn DeletionListener,
    ) -> Result<(), BucketError> {
        let index = self.begin_delete(name)?;
        self.finish_delete(index, force, listener);
        Ok(())
    }

    /// Clears stats, callbacks and identity of a slot and marks it free.
    fn reset_slot(&self, index: usize) {
        let bucket = &self.buckets[index];
        for stats in bucket.stats.iter() {
            stats.reset();
        }
        bucket.disconnect_handlers.lock().unwrap().clear();
        *bucket.collections.write().unwrap() = Collections::default();
        self.log_level_handlers
            .lock()
            .unwrap()
            .retain(|(owner, _)| *owner != index);
        bucket.lock().clear();
    }

    /// Names of every `Ready` bucket, slot 0 excluded.
    pub fn list(&self) -> Vec<String> {
        self.buckets
            .iter()
            .skip(1)
            .filter_map(|bucket| {
                let slot = bucket.lock();
                (slot.state == BucketState::Ready).then(|| slot.name.clone())
            })
            .collect()
    }

    pub fn details(&self, index: usize) -> Option<BucketDetails> {
        let slot = self.bucket(index)?.lock();
        Some(BucketDetails {
            index,
            state: slot.state,
            clients: slot.clients,
            name: slot.name.clone(),
            bucket_type: slot.bucket_type,
        })
    }

    /// Details of every slot that is not free.
    pub fn details_all(&self) -> Vec<BucketDetails> {
        (0..self.buckets.len())
            .filter_map(|idx| self.details(idx))
            .filter(|d| d.state != BucketState::None)
            .collect()
    }

    /// Counters of `index` for `thread`. Threads at or beyond the worker
    /// count share the admin entry.
    pub fn thread_stats(&self, index: usize, thread: usize) -> Option<&ThreadStats> {
        let stats = &self.bucket(index)?.stats;
        stats.get(thread.min(self.num_threads))
    }

    /// Sum of every thread's counters for `index`.
    pub fn aggregate_stats(&self, index: usize) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        if let Some(bucket) = self.bucket(index) {
            for stats in bucket.stats.iter() {
                total.merge(&stats.snapshot());
            }
        }
        total
    }

    /// True if a document command of a connection bound to `index` may use
    /// `key`.
    pub fn key_in_collection(&self, index: usize, key: &[u8]) -> bool {
        self.bucket(index)
            .map(|bucket| bucket.collections.read().unwrap().accepts(key))
            .unwrap_or(true)
    }

    /// Replaces the collection set of bucket `index`.
    pub fn set_manifest(&self, index: usize, manifest: &Manifest) -> Result<(), BucketError> {
        if index == NO_BUCKET_INDEX || !self.is_ready(index) {
            return Err(BucketError::NotFound);
        }
        let bucket = &self.buckets[index];
        bucket.collections.write().unwrap().apply_manifest(manifest)?;
        info!(
            bucket = index,
            collections = manifest.collections.len(),
            "Collection manifest applied"
        );
        Ok(())
    }

    /// Runs the disconnect callbacks of bucket `index`.
    pub fn perform_disconnect_callbacks(&self, index: usize, cookie: &crate::connection::Cookie) {
        let Some(bucket) = self.bucket(index) else {
            return;
        };
        let handlers: Vec<EventCallback> = bucket.disconnect_handlers.lock().unwrap().clone();
        let event = EngineEvent::Disconnect(cookie);
        for handler in handlers {
            handler(&event);
        }
    }

    /// Runs every log level callback and forwards the level to every
    /// `Ready` engine.
    pub fn perform_log_level_callbacks(&self, level: tracing::Level) {
        let handlers: Vec<EventCallback> = self
            .log_level_handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        let event = EngineEvent::LogLevel(level);
        for handler in handlers {
            handler(&event);
        }
    }

    /// Destroys every remaining engine at process exit.
    ///
    /// Slots in a transient state are waited for first.
    pub fn shutdown_all(&self) {
        for (index, bucket) in self.buckets.iter().enumerate().skip(1) {
            let engine = loop {
                let mut slot = bucket.lock();
                match slot.state {
                    BucketState::Creating | BucketState::Initializing | BucketState::Destroying => {
                        drop(slot);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    BucketState::Ready => {
                        slot.state = BucketState::Destroying;
                        break slot.engine.clone();
                    }
                    BucketState::None => break None,
                }
            };
            if let Some(engine) = engine {
                info!(bucket = index, "Shutting down bucket");
                self.destroy_engine(engine.as_ref(), false);
                self.reset_slot(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// A listener with no workers: nothing to wake.
    #[derive(Default)]
    struct NoWorkers {
        initiated: AtomicUsize,
        notified: AtomicUsize,
        completed: AtomicUsize,
    }

    impl DeletionListener for NoWorkers {
        fn initiate_bucket_deletion(&self) {
            self.initiated.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_bucket_deletion(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
        fn complete_bucket_deletion(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn associations(&self, _index: usize) -> usize {
            0
        }
    }

    fn table() -> BucketTable {
        BucketTable::new(4, 2, Duration::from_millis(20))
    }

    #[test]
    fn test_slot_zero_is_nobucket() {
        let table = table();
        assert_eq!(table.state(0), Some(BucketState::Ready));
        let assoc = table.associate("anything");
        assert_eq!(assoc.index, NO_BUCKET_INDEX);
        assert_eq!(assoc.engine.bucket_type(), BucketType::NoBucket);
        assert_eq!(table.clients(0), 1);
        table.disassociate(assoc);
        assert_eq!(table.clients(0), 0);
    }

    #[test]
    fn test_create_and_duplicate() {
        let table = table();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        assert_eq!(idx, 1);
        assert!(table.is_ready(idx));
        assert_eq!(
            table.create("b1", "", BucketType::Memcached),
            Err(BucketError::AlreadyExists)
        );
        assert_eq!(table.list(), vec!["b1".to_string()]);
    }

    #[test]
    fn test_invalid_names() {
        let table = table();
        let long = "a".repeat(MAX_BUCKET_NAME_LENGTH as usize + 1);
        assert_eq!(
            table.create(&long, "", BucketType::Memcached),
            Err(BucketError::InvalidName)
        );
        assert_eq!(
            table.create("bad name", "", BucketType::Memcached),
            Err(BucketError::InvalidName)
        );
        assert_eq!(
            table.create("", "", BucketType::Memcached),
            Err(BucketError::InvalidName)
        );
        assert!(is_valid_bucket_name("a-b_c.d%e"));
        assert!(is_valid_bucket_name(&"a".repeat(MAX_BUCKET_NAME_LENGTH as usize)));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::from(BucketError::NotFound), EngineError::KeyNotFound);
        assert_eq!(EngineError::from(BucketError::NotReady), EngineError::KeyExists);
        assert_eq!(
            EngineError::from(BucketError::UnknownType("x".into())),
            EngineError::NotStored
        );
        assert_eq!(Status::from(BucketError::TooManyBuckets), Status::TooBig);
    }

    #[test]
    fn test_table_full() {
        let table = table();
        for name in ["a", "b", "c"] {
            table.create(name, "", BucketType::Memcached).unwrap();
        }
        assert_eq!(
            table.create("d", "", BucketType::Memcached),
            Err(BucketError::TooManyBuckets)
        );
    }

    #[test]
    fn test_init_failure_frees_slot() {
        let table = table();
        let err = table
            .create("b1", "cache_size=lots", BucketType::Memcached)
            .unwrap_err();
        assert_eq!(err, BucketError::InitFailed(EngineError::Invalid));
        assert_eq!(table.state(1), Some(BucketState::None));
        assert!(table.list().is_empty());

        // The name is free again
        assert!(table.create("b1", "", BucketType::Memcached).is_ok());
    }

    #[test]
    fn test_associate_only_ready() {
        let table = table();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();

        let assoc = table.associate("b1");
        assert_eq!(assoc.index, idx);
        assert_eq!(table.clients(idx), 1);

        assert_eq!(table.begin_delete("b1"), Ok(idx));
        // Destroying buckets refuse new clients
        let other = table.associate("b1");
        assert_eq!(other.index, NO_BUCKET_INDEX);

        table.disassociate(other);
        table.disassociate(assoc);
        table.finish_delete(idx, false, &NoWorkers::default());
    }

    #[test]
    fn test_delete_waits_for_clients() {
        let table = Arc::new(table());
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        let assoc = table.associate("b1");

        let listener = Arc::new(NoWorkers::default());
        let deleter = {
            let table = Arc::clone(&table);
            let listener = Arc::clone(&listener);
            thread::spawn(move || table.delete("b1", false, &*listener))
        };

        // Give the deleter a few poll rounds
        thread::sleep(Duration::from_millis(100));
        assert_eq!(table.state(idx), Some(BucketState::Destroying));
        assert!(listener.notified.load(Ordering::SeqCst) >= 1);

        table.disassociate(assoc);
        deleter.join().unwrap().unwrap();

        assert_eq!(table.state(idx), Some(BucketState::None));
        assert_eq!(table.clients(idx), 0);
        assert_eq!(listener.initiated.load(Ordering::SeqCst), 1);
        assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
        assert!(table.list().is_empty());
    }

    #[test]
    fn test_second_delete_fails() {
        let table = table();
        table.create("b1", "", BucketType::Memcached).unwrap();
        let listener = NoWorkers::default();

        assert!(table.delete("b1", false, &listener).is_ok());
        assert_eq!(
            table.delete("b1", false, &listener),
            Err(BucketError::NotFound)
        );
    }

    #[test]
    fn test_delete_while_destroying() {
        let table = table();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        table.begin_delete("b1").unwrap();
        assert_eq!(table.begin_delete("b1"), Err(BucketError::NotReady));
        assert_eq!(Status::from(BucketError::NotReady), Status::KeyExists);
        table.finish_delete(idx, false, &NoWorkers::default());
    }

    #[test]
    fn test_details_json() {
        let table = table();
        table.create("b1", "", BucketType::Memcached).unwrap();
        let details = table.details(1).unwrap();
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["name"], "b1");
        assert_eq!(json["state"], "ready");
        assert_eq!(json["type"], "memcached");
        assert_eq!(json["clients"], 0);
        assert_eq!(table.details_all().len(), 2);
    }

    #[test]
    fn test_log_level_callbacks_dropped_on_delete() {
        let table = table();
        table.create("b1", "", BucketType::Memcached).unwrap();
        assert_eq!(table.log_level_handlers.lock().unwrap().len(), 1);

        table.perform_log_level_callbacks(tracing::Level::DEBUG);
        table.delete("b1", false, &NoWorkers::default()).unwrap();
        assert!(table.log_level_handlers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_register_callback_requires_owner() {
        let table = table();
        let api = ServerApi::new(&table, 2);
        let result = api.register_callback(
            EngineEventType::OnDisconnect,
            Arc::new(|_: &EngineEvent<'_>| {}),
        );
        assert_eq!(result, Err(ServerApiError::NotOwner(2)));
    }

    #[test]
    fn test_stats_reset_on_delete() {
        let table = table();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        ThreadStats::incr(&table.thread_stats(idx, 0).unwrap().cmd_total);
        ThreadStats::incr(&table.thread_stats(idx, 99).unwrap().cmd_total);
        assert_eq!(table.aggregate_stats(idx).cmd_total, 2);

        table.delete("b1", false, &NoWorkers::default()).unwrap();
        assert_eq!(table.aggregate_stats(idx).cmd_total, 0);
    }

    #[test]
    fn test_shutdown_all() {
        let table = table();
        table.create("a", "", BucketType::Memcached).unwrap();
        table.create("b", "", BucketType::EWouldBlock).unwrap();
        table.shutdown_all();
        assert!(table.list().is_empty());
        assert_eq!(table.state(0), Some(BucketState::Ready));
    }

    #[test]
    fn test_abort_delete_restores_bucket() {
        let table = table();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        assert_eq!(table.begin_delete("b1"), Ok(idx));
        assert!(table.list().is_empty());

        assert!(table.abort_delete(idx));
        assert!(table.is_ready(idx));
        assert_eq!(table.list(), vec!["b1".to_string()]);
        assert!(!table.abort_delete(idx));
        assert!(!table.abort_delete(NO_BUCKET_INDEX));

        // The bucket can be associated and deleted as usual afterwards
        let assoc = table.associate("b1");
        assert_eq!(assoc.index, idx);
        table.disassociate(assoc);
        assert!(table.delete("b1", false, &NoWorkers::default()).is_ok());
        assert_eq!(table.engines_destroyed(), 1);
    }

    #[test]
    fn test_destroy_counted_once_per_engine() {
        let table = table();
        table.create("a", "", BucketType::Memcached).unwrap();
        table.create("b", "", BucketType::Memcached).unwrap();
        assert_eq!(table.engines_destroyed(), 0);

        table.delete("a", false, &NoWorkers::default()).unwrap();
        assert_eq!(table.engines_destroyed(), 1);
        assert!(table.delete("a", false, &NoWorkers::default()).is_err());
        assert_eq!(table.engines_destroyed(), 1);

        // A failed initialize destroys the half-built engine
        assert!(table
            .create("c", "cache_size=lots", BucketType::Memcached)
            .is_err());
        assert_eq!(table.engines_destroyed(), 2);

        table.shutdown_all();
        assert_eq!(table.engines_destroyed(), 3);
    }

    #[test]
    fn test_collection_config() {
        let table = table();
        let err = table
            .create("b1", "collection_mode=sometimes", BucketType::Memcached)
            .unwrap_err();
        assert!(matches!(err, BucketError::Collections(_)));
        assert_eq!(Status::from(err), Status::Invalid);
        assert_eq!(table.state(1), Some(BucketState::None));

        let idx = table
            .create(
                "b1",
                "collection_mode=strict;collection_set=beer;cache_size=1048576",
                BucketType::Memcached,
            )
            .unwrap();
        assert!(table.key_in_collection(idx, b"beer:ale"));
        assert!(!table.key_in_collection(idx, b"ale"));
        // Unbound connections and plain buckets accept any key
        assert!(table.key_in_collection(NO_BUCKET_INDEX, b"ale"));

        let manifest = Manifest {
            separator: None,
            collections: vec!["wine".to_string()],
        };
        table.set_manifest(idx, &manifest).unwrap();
        assert!(table.key_in_collection(idx, b"wine:red"));
        assert!(!table.key_in_collection(idx, b"beer:ale"));
        assert_eq!(
            table.set_manifest(NO_BUCKET_INDEX, &manifest),
            Err(BucketError::NotFound)
        );

        // Collections are forgotten with the bucket
        table.delete("b1", false, &NoWorkers::default()).unwrap();
        let idx = table.create("b1", "", BucketType::Memcached).unwrap();
        assert!(table.key_in_collection(idx, b"ale"));
    }
}
