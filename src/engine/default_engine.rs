//! In-Memory Cache Engine
//!
//! The backend behind `memcached` buckets: a sharded hash map with TTL
//! support, memory accounting and a bounded mutation log feeding streams.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ItemStore                            │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲                                   │ mutations
//!          │ cleanup_expired                   ▼
//!   ┌──────┴────────┐                  ┌───────────────┐
//!   │ ExpirySweeper │                  │  MutationLog  │──▶ stream consumers
//!   └───────────────┘                  └───────────────┘
//! ```
//!
//! ## Expiry Times
//!
//! Expiry follows the memcached convention: `0` never expires, values up to
//! thirty days are relative seconds, anything larger is an absolute Unix
//! timestamp.

use super::expiry::{ExpiryConfig, ExpirySweeper};
use super::{
    BucketType, Document, Engine, EngineError, EngineResult, EngineStatus, Item, StoreOperation,
    StreamEvent,
};
use crate::bucket::{EngineEvent, EngineEventType, ServerApi};
use crate::config::{parse_config, parse_number, Priority};
use crate::connection::Cookie;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Number of shards for the item store.
const NUM_SHARDS: usize = 64;

/// Relative expiry times larger than this are absolute timestamps.
const REALTIME_MAXDELTA: u32 = 60 * 60 * 24 * 30;

/// Tunables read from the bucket configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultEngineConfig {
    /// Memory limit for stored keys and values
    pub cache_size: u64,
    /// Largest value accepted by `allocate`
    pub item_size_max: usize,
    /// Mutations retained for stream consumers
    pub stream_log_size: usize,
    /// Unacknowledged stream bytes before a consumer is paused
    pub stream_window: u64,
    /// Base interval of the expiry sweeper
    pub expiry_interval: Duration,
    /// Scheduling priority given to stream consumers
    pub stream_priority: Priority,
}

impl Default for DefaultEngineConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 * 1024 * 1024,
            item_size_max: 1024 * 1024,
            stream_log_size: 4096,
            stream_window: 64 * 1024,
            expiry_interval: Duration::from_millis(100),
            stream_priority: Priority::Low,
        }
    }
}

impl DefaultEngineConfig {
    /// Builds a configuration from a `key=value;...` string.
    pub fn parse(config: &str) -> EngineResult<Self> {
        let mut out = Self::default();
        let entries = parse_config(config).map_err(|e| {
            warn!(error = %e, "Rejecting engine configuration");
            EngineError::Invalid
        })?;

        for (key, value) in entries {
            let result = match key.as_str() {
                "cache_size" => parse_number(&key, &value).map(|v| out.cache_size = v),
                "item_size_max" => parse_number(&key, &value).map(|v| out.item_size_max = v),
                "stream_log_size" => parse_number(&key, &value).map(|v| out.stream_log_size = v),
                "stream_window" => parse_number(&key, &value).map(|v| out.stream_window = v),
                "expiry_interval_ms" => parse_number(&key, &value)
                    .map(|v: u64| out.expiry_interval = Duration::from_millis(v.max(1))),
                "stream_priority" => value.parse::<Priority>().map(|v| out.stream_priority = v),
                // Handled by the bucket table
                k if k.starts_with(crate::bucket::collections::CONFIG_PREFIX) => Ok(()),
                _ => {
                    warn!(key = %key, "Ignoring unknown engine configuration key");
                    Ok(())
                }
            };
            result.map_err(|e| {
                warn!(error = %e, "Rejecting engine configuration");
                EngineError::Invalid
            })?;
        }
        Ok(out)
    }
}

/// A stored value with its metadata.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    flags: u32,
    cas: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }

    fn footprint(key: &[u8], value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }
}

/// Converts a protocol expiry time into a deadline.
fn expiry_deadline(exptime: u32) -> Option<Instant> {
    if exptime == 0 {
        return None;
    }
    if exptime <= REALTIME_MAXDELTA {
        return Some(Instant::now() + Duration::from_secs(exptime as u64));
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let delta = (exptime as u64).saturating_sub(now);
    Some(Instant::now() + Duration::from_secs(delta))
}

/// Point-in-time counters of an item store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemStoreStats {
    pub items: u64,
    pub mem_used: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub expired: u64,
}

/// The sharded key/value map shared with the expiry sweeper.
#[derive(Debug)]
pub struct ItemStore {
    shards: Vec<RwLock<HashMap<Bytes, Entry>>>,
    cas: AtomicU64,
    items: AtomicU64,
    mem_used: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    expired: AtomicU64,
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            cas: AtomicU64::new(0),
            items: AtomicU64::new(0),
            mem_used: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Bytes, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn next_cas(&self) -> u64 {
        self.cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn forget(&self, key: &[u8], entry: &Entry) {
        self.items.fetch_sub(1, Ordering::Relaxed);
        self.mem_used
            .fetch_sub(Entry::footprint(key, &entry.value), Ordering::Relaxed);
    }

    /// Looks up a key, removing it if it has expired.
    pub fn get(&self, key: &[u8]) -> Option<Document> {
        let shard = self.shard(key);

        // Fast path under the read lock
        {
            let data = shard.read().unwrap();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => {
                    self.get_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Document {
                        value: entry.value.clone(),
                        flags: entry.flags,
                        cas: entry.cas,
                    });
                }
                Some(_) => {}
                None => {
                    self.get_misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired under the read lock; another thread may have replaced it since
        let mut data = shard.write().unwrap();
        self.evict_if_expired(&mut data, key);
        match data.get(key) {
            Some(entry) => {
                self.get_hits.fetch_add(1, Ordering::Relaxed);
                Some(Document {
                    value: entry.value.clone(),
                    flags: entry.flags,
                    cas: entry.cas,
                })
            }
            None => {
                self.get_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Removes `key` from a locked shard if it has expired.
    fn evict_if_expired(&self, data: &mut HashMap<Bytes, Entry>, key: &[u8]) {
        let expired = data.get(key).map(Entry::is_expired).unwrap_or(false);
        if expired {
            if let Some((k, e)) = data.remove_entry(key) {
                self.forget(&k, &e);
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Stores a value according to `operation`.
    ///
    /// # Returns
    ///
    /// The CAS of the new value, or the reason it was not stored.
    pub fn store(
        &self,
        key: Bytes,
        value: Bytes,
        flags: u32,
        exptime: u32,
        cas: u64,
        operation: StoreOperation,
        cache_size: u64,
    ) -> EngineResult<u64> {
        let shard = self.shard(&key);
        let mut data = shard.write().unwrap();
        self.evict_if_expired(&mut data, &key);
        let existing = data.get(&key);

        match (operation, existing) {
            (StoreOperation::Add, Some(_)) => return Err(EngineError::KeyExists),
            (StoreOperation::Replace, None) => return Err(EngineError::KeyNotFound),
            (_, None) if cas != 0 => return Err(EngineError::KeyNotFound),
            (_, Some(entry)) if cas != 0 && entry.cas != cas => {
                return Err(EngineError::KeyExists)
            }
            _ => {}
        }

        let old = existing.map(|e| Entry::footprint(&key, &e.value)).unwrap_or(0);
        let new = Entry::footprint(&key, &value);
        let used = self.mem_used.load(Ordering::Relaxed);
        if used.saturating_sub(old) + new > cache_size {
            return Err(EngineError::NoMemory);
        }

        let new_cas = self.next_cas();
        let replaced = data.insert(
            key,
            Entry {
                value,
                flags,
                cas: new_cas,
                expires_at: expiry_deadline(exptime),
            },
        );
        if replaced.is_none() {
            self.items.fetch_add(1, Ordering::Relaxed);
        }
        self.mem_used.fetch_add(new, Ordering::Relaxed);
        self.mem_used.fetch_sub(old, Ordering::Relaxed);
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(new_cas)
    }

    /// Removes a key, optionally guarded by its CAS.
    pub fn remove(&self, key: &[u8], cas: u64) -> EngineStatus {
        let shard = self.shard(key);
        let mut data = shard.write().unwrap();
        self.evict_if_expired(&mut data, key);

        match data.get(key) {
            None => return Err(EngineError::KeyNotFound),
            Some(entry) if cas != 0 && entry.cas != cas => return Err(EngineError::KeyExists),
            Some(_) => {}
        }

        if let Some((k, e)) = data.remove_entry(key) {
            self.forget(&k, &e);
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drops every item.
    pub fn flush(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
        self.items.store(0, Ordering::Relaxed);
        self.mem_used.store(0, Ordering::Relaxed);
    }

    /// Approximate number of stored items.
    pub fn len(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired items from every shard.
    ///
    /// # Returns
    ///
    /// The number of items removed.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;
        let mut freed = 0u64;

        for shard in &self.shards {
            let mut data = shard.write().unwrap();
            data.retain(|key, entry| {
                if entry.is_expired() {
                    cleaned += 1;
                    freed += Entry::footprint(key, &entry.value);
                    false
                } else {
                    true
                }
            });
        }

        if cleaned > 0 {
            self.items.fetch_sub(cleaned, Ordering::Relaxed);
            self.mem_used.fetch_sub(freed, Ordering::Relaxed);
            self.expired.fetch_add(cleaned, Ordering::Relaxed);
        }
        cleaned
    }

    pub fn stats(&self) -> ItemStoreStats {
        ItemStoreStats {
            items: self.items.load(Ordering::Relaxed),
            mem_used: self.mem_used.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Mutation streams
// ============================================================================

/// Per-connection position in the mutation log.
#[derive(Debug, Clone, Copy, Default)]
struct StreamCursor {
    next_seqno: u64,
    unacked: u64,
}

/// Bounded log of recent mutations.
#[derive(Debug, Default)]
struct MutationLog {
    events: VecDeque<StreamEvent>,
    next_seqno: u64,
}

/// State shared between the engine and its disconnect callback.
#[derive(Default)]
struct Streams {
    log: Mutex<MutationLog>,
    cursors: Mutex<HashMap<u64, StreamCursor>>,
    /// Consumers parked until the next mutation, holding a reservation
    waiters: Mutex<HashMap<u64, Cookie>>,
}

impl Streams {
    fn append(&self, key: Bytes, value: Bytes, flags: u32, deleted: bool, capacity: usize) {
        {
            let mut log = self.log.lock().unwrap();
            log.next_seqno += 1;
            let seqno = log.next_seqno;
            log.events.push_back(StreamEvent {
                seqno,
                key,
                value,
                flags,
                deleted,
            });
            while log.events.len() > capacity {
                log.events.pop_front();
            }
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        let waiters: Vec<Cookie> = self.waiters.lock().unwrap().drain().map(|(_, c)| c).collect();
        for cookie in waiters {
            cookie.notify_io_complete(Ok(()));
            cookie.release();
        }
    }

    /// Parks `cookie` until new data arrives. Caller holds the log lock.
    fn park(&self, cookie: &Cookie) {
        let mut waiters = self.waiters.lock().unwrap();
        if !waiters.contains_key(&cookie.id()) {
            cookie.reserve();
            waiters.insert(cookie.id(), cookie.clone());
        }
    }

    fn unpark(&self, id: u64) {
        let parked = self.waiters.lock().unwrap().remove(&id);
        if let Some(cookie) = parked {
            cookie.release();
        }
    }

    fn disconnect(&self, id: u64) {
        self.cursors.lock().unwrap().remove(&id);
        self.unpark(id);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The `memcached` bucket backend.
pub struct DefaultEngine {
    store: Arc<ItemStore>,
    config: RwLock<DefaultEngineConfig>,
    sweeper: Mutex<Option<ExpirySweeper>>,
    streams: Arc<Streams>,
    verbosity: Arc<AtomicU8>,
}

impl std::fmt::Debug for DefaultEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultEngine")
            .field("items", &self.store.len())
            .field("config", &*self.config.read().unwrap())
            .finish()
    }
}

impl Default for DefaultEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn level_to_u8(level: tracing::Level) -> u8 {
    match level {
        tracing::Level::ERROR => 0,
        tracing::Level::WARN => 1,
        tracing::Level::INFO => 2,
        tracing::Level::DEBUG => 3,
        tracing::Level::TRACE => 4,
    }
}

impl DefaultEngine {
    pub fn new() -> Self {
        Self {
            store: Arc::new(ItemStore::new()),
            config: RwLock::new(DefaultEngineConfig::default()),
            sweeper: Mutex::new(None),
            streams: Arc::new(Streams::default()),
            verbosity: Arc::new(AtomicU8::new(level_to_u8(tracing::Level::INFO))),
        }
    }

    pub fn config(&self) -> DefaultEngineConfig {
        self.config.read().unwrap().clone()
    }
}

impl Engine for DefaultEngine {
    fn bucket_type(&self) -> BucketType {
        BucketType::Memcached
    }

    fn initialize(&self, config: &str, api: &ServerApi<'_>) -> EngineStatus {
        let parsed = DefaultEngineConfig::parse(config)?;

        let streams = Arc::clone(&self.streams);
        api.register_callback(
            EngineEventType::OnDisconnect,
            Arc::new(move |event: &EngineEvent<'_>| {
                if let EngineEvent::Disconnect(cookie) = event {
                    streams.disconnect(cookie.id());
                }
            }),
        )
        .map_err(|_| EngineError::Failed)?;

        let verbosity = Arc::clone(&self.verbosity);
        api.register_callback(
            EngineEventType::OnLogLevel,
            Arc::new(move |event: &EngineEvent<'_>| {
                if let EngineEvent::LogLevel(level) = event {
                    verbosity.store(level_to_u8(*level), Ordering::Relaxed);
                }
            }),
        )
        .map_err(|_| EngineError::Failed)?;

        let sweeper = ExpirySweeper::start(
            Arc::clone(&self.store),
            ExpiryConfig::with_base_interval(parsed.expiry_interval),
        );
        *self.sweeper.lock().unwrap() = Some(sweeper);

        info!(
            cache_size = parsed.cache_size,
            item_size_max = parsed.item_size_max,
            "Memcached engine initialized"
        );
        *self.config.write().unwrap() = parsed;
        Ok(())
    }

    fn destroy(&self, force: bool) {
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.stop();
        }
        let parked: Vec<u64> = self.streams.waiters.lock().unwrap().keys().copied().collect();
        for id in parked {
            self.streams.disconnect(id);
        }
        self.store.flush();
        debug!(force, "Memcached engine destroyed");
    }

    fn allocate(
        &self,
        _cookie: &Cookie,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u32,
    ) -> EngineResult<Item> {
        let config = self.config.read().unwrap();
        if nbytes > config.item_size_max {
            return Err(EngineError::TooBig);
        }
        if self.store.stats().mem_used + (key.len() + nbytes) as u64 > config.cache_size {
            return Err(EngineError::NoMemory);
        }
        Ok(Item {
            key: Bytes::copy_from_slice(key),
            value: BytesMut::with_capacity(nbytes),
            flags,
            exptime,
            nbytes,
        })
    }

    fn release(&self, _cookie: &Cookie, _item: Item) {}

    fn get(&self, _cookie: &Cookie, key: &[u8]) -> EngineResult<Document> {
        self.store.get(key).ok_or(EngineError::KeyNotFound)
    }

    fn store(
        &self,
        _cookie: &Cookie,
        item: &Item,
        cas: u64,
        operation: StoreOperation,
    ) -> EngineResult<u64> {
        if item.remaining() != 0 {
            return Err(EngineError::Invalid);
        }
        let (cache_size, log_size) = {
            let config = self.config.read().unwrap();
            (config.cache_size, config.stream_log_size)
        };
        let value = Bytes::copy_from_slice(&item.value);
        let new_cas = self.store.store(
            item.key.clone(),
            value.clone(),
            item.flags,
            item.exptime,
            cas,
            operation,
            cache_size,
        )?;
        self.streams
            .append(item.key.clone(), value, item.flags, false, log_size);
        Ok(new_cas)
    }

    fn remove(&self, _cookie: &Cookie, key: &[u8], cas: u64) -> EngineStatus {
        self.store.remove(key, cas)?;
        let log_size = self.config.read().unwrap().stream_log_size;
        self.streams
            .append(Bytes::copy_from_slice(key), Bytes::new(), 0, true, log_size);
        Ok(())
    }

    fn flush(&self, _cookie: &Cookie) -> EngineStatus {
        self.store.flush();
        Ok(())
    }

    fn get_stats(
        &self,
        _cookie: &Cookie,
        group: &str,
        add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineStatus {
        match group {
            "" => {
                let stats = self.store.stats();
                let config = self.config.read().unwrap();
                add_stat("curr_items", &stats.items.to_string());
                add_stat("mem_used", &stats.mem_used.to_string());
                add_stat("cache_size", &config.cache_size.to_string());
                add_stat("item_size_max", &config.item_size_max.to_string());
                add_stat("get_hits", &stats.get_hits.to_string());
                add_stat("get_misses", &stats.get_misses.to_string());
                add_stat("cmd_set", &stats.sets.to_string());
                add_stat("delete_hits", &stats.deletes.to_string());
                add_stat("expired", &stats.expired.to_string());
                add_stat(
                    "verbosity",
                    &self.verbosity.load(Ordering::Relaxed).to_string(),
                );
                Ok(())
            }
            "streams" => {
                let log = self.streams.log.lock().unwrap();
                let cursors = self.streams.cursors.lock().unwrap();
                add_stat("stream_consumers", &cursors.len().to_string());
                add_stat("stream_high_seqno", &log.next_seqno.to_string());
                add_stat("stream_log_items", &log.events.len().to_string());
                Ok(())
            }
            _ => Err(EngineError::KeyNotFound),
        }
    }

    fn set_log_level(&self, level: tracing::Level) {
        self.verbosity.store(level_to_u8(level), Ordering::Relaxed);
    }

    fn open_stream(&self, cookie: &Cookie, name: &[u8]) -> EngineStatus {
        cookie.set_priority(self.config.read().unwrap().stream_priority);
        let start = self.streams.log.lock().unwrap().next_seqno + 1;
        self.streams.cursors.lock().unwrap().insert(
            cookie.id(),
            StreamCursor {
                next_seqno: start,
                unacked: 0,
            },
        );
        debug!(
            conn = cookie.id(),
            stream = %String::from_utf8_lossy(name),
            start,
            "Stream opened"
        );
        Ok(())
    }

    fn stream_step(&self, cookie: &Cookie) -> EngineResult<Option<StreamEvent>> {
        let window = self.config.read().unwrap().stream_window;
        let log = self.streams.log.lock().unwrap();
        let mut cursors = self.streams.cursors.lock().unwrap();
        let cursor = cursors.get_mut(&cookie.id()).ok_or(EngineError::Invalid)?;

        if cursor.unacked >= window {
            drop(cursors);
            self.streams.park(cookie);
            return Ok(None);
        }

        let event = match log.events.front() {
            Some(front) => {
                let first = front.seqno;
                let next = cursor.next_seqno.max(first);
                log.events.get((next - first) as usize).cloned()
            }
            None => None,
        };

        match event {
            Some(event) => {
                cursor.next_seqno = event.seqno + 1;
                cursor.unacked +=
                    (crate::protocol::HEADER_LEN + event.key.len() + event.value.len()) as u64;
                Ok(Some(event))
            }
            None => {
                drop(cursors);
                self.streams.park(cookie);
                Ok(None)
            }
        }
    }

    fn stream_ack(&self, cookie: &Cookie, bytes: u32) -> EngineStatus {
        {
            let mut cursors = self.streams.cursors.lock().unwrap();
            let cursor = cursors.get_mut(&cookie.id()).ok_or(EngineError::Invalid)?;
            cursor.unacked = cursor.unacked.saturating_sub(bytes as u64);
        }
        self.streams.unpark(cookie.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const MB: u64 = 1024 * 1024;

    fn set(store: &ItemStore, key: &str, value: &str) -> EngineResult<u64> {
        store.store(
            Bytes::from(key.to_string()),
            Bytes::from(value.to_string()),
            0,
            0,
            0,
            StoreOperation::Set,
            MB,
        )
    }

    #[test]
    fn test_set_and_get() {
        let store = ItemStore::new();
        let cas = set(&store, "name", "Ariz").unwrap();

        let doc = store.get(b"name").unwrap();
        assert_eq!(doc.value, Bytes::from("Ariz"));
        assert_eq!(doc.cas, cas);
        assert_eq!(store.len(), 1);
        assert!(store.get(b"missing").is_none());
    }

    #[test]
    fn test_add_and_replace() {
        let store = ItemStore::new();
        let add = |v: &str| {
            store.store(
                Bytes::from("k"),
                Bytes::from(v.to_string()),
                0,
                0,
                0,
                StoreOperation::Add,
                MB,
            )
        };
        assert!(add("one").is_ok());
        assert_eq!(add("two"), Err(EngineError::KeyExists));

        let replace = store.store(
            Bytes::from("other"),
            Bytes::from("x"),
            0,
            0,
            0,
            StoreOperation::Replace,
            MB,
        );
        assert_eq!(replace, Err(EngineError::KeyNotFound));
    }

    #[test]
    fn test_cas_mismatch() {
        let store = ItemStore::new();
        let cas = set(&store, "k", "v1").unwrap();

        let stale = store.store(
            Bytes::from("k"),
            Bytes::from("v2"),
            0,
            0,
            cas + 100,
            StoreOperation::Set,
            MB,
        );
        assert_eq!(stale, Err(EngineError::KeyExists));

        assert_eq!(store.remove(b"k", cas + 100), Err(EngineError::KeyExists));
        assert!(store.remove(b"k", cas).is_ok());
        assert_eq!(store.remove(b"k", 0), Err(EngineError::KeyNotFound));
    }

    #[test]
    fn test_memory_limit() {
        let store = ItemStore::new();
        let big = "x".repeat(100);
        let result = store.store(
            Bytes::from("k"),
            Bytes::from(big),
            0,
            0,
            0,
            StoreOperation::Set,
            50,
        );
        assert_eq!(result, Err(EngineError::NoMemory));
        assert_eq!(store.stats().mem_used, 0);
    }

    #[test]
    fn test_mem_used_tracks_overwrites() {
        let store = ItemStore::new();
        set(&store, "k", "12345").unwrap();
        assert_eq!(store.stats().mem_used, 6);
        set(&store, "k", "1").unwrap();
        assert_eq!(store.stats().mem_used, 2);
        store.remove(b"k", 0).unwrap();
        assert_eq!(store.stats().mem_used, 0);
    }

    #[test]
    fn test_expiry() {
        let store = ItemStore::new();
        store
            .store(
                Bytes::from("temp"),
                Bytes::from("v"),
                0,
                1,
                0,
                StoreOperation::Set,
                MB,
            )
            .unwrap();
        assert!(store.get(b"temp").is_some());

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.cleanup_expired(), 1);
        assert!(store.get(b"temp").is_none());
        assert_eq!(store.stats().expired, 1);
    }

    #[test]
    fn test_absolute_expiry_in_past() {
        // An absolute timestamp well in the past expires immediately.
        let deadline = expiry_deadline(REALTIME_MAXDELTA + 1).unwrap();
        assert!(deadline <= Instant::now());
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(ItemStore::new());
        let mut handles = vec![];

        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let key = format!("key_{}_{}", i, j);
                    set(&store, &key, "v").unwrap();
                    assert!(store.get(key.as_bytes()).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 1000);
    }

    #[test]
    fn test_config_parse() {
        let cfg = DefaultEngineConfig::parse("cache_size=1024;item_size_max=10;bogus=1").unwrap();
        assert_eq!(cfg.cache_size, 1024);
        assert_eq!(cfg.item_size_max, 10);

        assert_eq!(
            DefaultEngineConfig::parse("cache_size=lots"),
            Err(EngineError::Invalid)
        );
        assert_eq!(
            DefaultEngineConfig::parse("garbage"),
            Err(EngineError::Invalid)
        );

        let cfg = DefaultEngineConfig::parse("stream_priority=high;collection_mode=strict").unwrap();
        assert_eq!(cfg.stream_priority, Priority::High);
        assert_eq!(
            DefaultEngineConfig::parse("stream_priority=urgent"),
            Err(EngineError::Invalid)
        );
    }

    #[test]
    fn test_open_stream_sets_priority() {
        use crate::bucket::BucketTable;
        use crate::connection::cookie::test_cookie;

        let table = BucketTable::new(4, 1, Duration::from_millis(10));
        table
            .create("mc", "stream_priority=medium", BucketType::Memcached)
            .unwrap();
        let engine = Arc::clone(&table.associate("mc").engine);

        let cookie = test_cookie(7);
        assert_eq!(cookie.connection().priority(), None);
        engine.open_stream(&cookie, b"replica").unwrap();
        assert_eq!(cookie.connection().priority(), Some(Priority::Medium));
    }
}
