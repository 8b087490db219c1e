//! Storage Engine Interface
//!
//! Every bucket is backed by an engine instance. The daemon only talks to
//! engines through the [`Engine`] trait, so backends can be swapped per
//! bucket without the connection layer knowing which one it is using.
//!
//! ## Asynchronous Completion
//!
//! Any data call may return [`EngineError::WouldBlock`]. The engine then owns
//! the obligation to call [`Cookie::notify_io_complete`] exactly once for that
//! call. The connection parks until the notification arrives and then runs
//! the same command again, this time consuming the stored completion status.
//!
//! ```text
//!   worker thread                       engine / background thread
//!   ─────────────                       ──────────────────────────
//!   get(cookie, key) ───────────────▶  Err(WouldBlock)
//!   park connection                     ... work ...
//!                    ◀───────────────  cookie.notify_io_complete(Ok)
//!   get(cookie, key) ───────────────▶  Ok(document)
//! ```
//!
//! ## Backends
//!
//! - [`nobucket::NoBucketEngine`]: slot 0, rejects every data command
//! - [`default_engine::DefaultEngine`]: sharded in-memory cache with TTL
//! - [`ewouldblock::EWouldBlockEngine`]: wraps the default engine and
//!   completes every data call asynchronously

pub mod default_engine;
pub mod ewouldblock;
pub mod expiry;
pub mod nobucket;

use crate::bucket::{Manifest, ServerApi};
use crate::connection::Cookie;
use crate::protocol::Status;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use default_engine::DefaultEngine;
pub use ewouldblock::EWouldBlockEngine;
pub use nobucket::NoBucketEngine;

/// Error codes an engine can return.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key exists")]
    KeyExists,

    #[error("not stored")]
    NotStored,

    #[error("item too big")]
    TooBig,

    #[error("out of memory")]
    NoMemory,

    #[error("invalid arguments")]
    Invalid,

    #[error("not supported")]
    NotSupported,

    /// The operation completes later through `notify_io_complete`
    #[error("operation would block")]
    WouldBlock,

    /// The connection must be closed
    #[error("disconnect requested")]
    Disconnect,

    #[error("temporary failure")]
    TempFail,

    #[error("no bucket selected")]
    NoBucket,

    #[error("engine failure")]
    Failed,
}

/// Result type for engine calls returning data.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for engine calls returning only a status.
pub type EngineStatus = Result<(), EngineError>;

impl From<EngineError> for Status {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::KeyNotFound => Status::KeyNotFound,
            EngineError::KeyExists => Status::KeyExists,
            EngineError::NotStored => Status::NotStored,
            EngineError::TooBig => Status::TooBig,
            EngineError::NoMemory => Status::NoMemory,
            EngineError::Invalid => Status::Invalid,
            EngineError::NotSupported => Status::NotSupported,
            EngineError::TempFail | EngineError::WouldBlock => Status::TempFail,
            EngineError::NoBucket => Status::NoBucket,
            EngineError::Disconnect | EngineError::Failed => Status::Internal,
        }
    }
}

/// Backend kinds that can be instantiated for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    NoBucket,
    Memcached,
    EWouldBlock,
}

impl BucketType {
    /// Maps the module name sent in a create-bucket request to a type.
    pub fn from_module(module: &str) -> Option<Self> {
        match module {
            "nobucket" | "nobucket.so" => Some(BucketType::NoBucket),
            "memcached" | "default_engine" | "default_engine.so" => Some(BucketType::Memcached),
            "ewouldblock" | "ewouldblock_engine" | "ewouldblock_engine.so" => {
                Some(BucketType::EWouldBlock)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BucketType::NoBucket => "nobucket",
            BucketType::Memcached => "memcached",
            BucketType::EWouldBlock => "ewouldblock",
        }
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation mode of a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Unconditional, or compare-and-swap when a CAS is supplied
    Set,
    /// Only if the key does not exist
    Add,
    /// Only if the key exists
    Replace,
}

/// An engine-allocated item whose value is filled in by the connection.
#[derive(Debug)]
pub struct Item {
    pub key: Bytes,
    pub value: BytesMut,
    pub flags: u32,
    pub exptime: u32,
    /// Number of value bytes the item was allocated for
    pub nbytes: usize,
}

impl Item {
    /// Bytes still missing from the value.
    pub fn remaining(&self) -> usize {
        self.nbytes - self.value.len()
    }
}

/// A value returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// One entry of an engine's mutation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub seqno: u64,
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub deleted: bool,
}

/// The capability set the daemon requires from a storage backend.
///
/// Engines are shared between all worker threads and must synchronise
/// internally. The `cookie` passed to every data call identifies the
/// requesting connection.
pub trait Engine: Send + Sync {
    fn bucket_type(&self) -> BucketType;

    /// Called once, outside the bucket table lock, before the bucket
    /// becomes `Ready`. `config` is the `key=value;...` configuration
    /// string from the create request.
    fn initialize(&self, config: &str, api: &ServerApi<'_>) -> EngineStatus;

    /// Releases every resource held by the engine. Called exactly once,
    /// after the last client has left the bucket.
    fn destroy(&self, force: bool);

    /// Allocates an item for a store whose value is still arriving.
    fn allocate(
        &self,
        cookie: &Cookie,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u32,
    ) -> EngineResult<Item>;

    /// Returns an item that will not be stored.
    fn release(&self, cookie: &Cookie, item: Item);

    fn get(&self, cookie: &Cookie, key: &[u8]) -> EngineResult<Document>;

    /// Stores a fully received item and returns its new CAS.
    fn store(
        &self,
        cookie: &Cookie,
        item: &Item,
        cas: u64,
        operation: StoreOperation,
    ) -> EngineResult<u64>;

    fn remove(&self, cookie: &Cookie, key: &[u8], cas: u64) -> EngineStatus;

    fn flush(&self, cookie: &Cookie) -> EngineStatus;

    /// Emits statistics for `group` ("" for the default group).
    fn get_stats(
        &self,
        cookie: &Cookie,
        group: &str,
        add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineStatus;

    fn set_log_level(&self, _level: tracing::Level) {}

    /// Turns the connection into a mutation stream consumer.
    fn open_stream(&self, _cookie: &Cookie, _name: &[u8]) -> EngineStatus {
        Err(EngineError::NotSupported)
    }

    /// Pulls the next event for a stream.
    ///
    /// `Ok(None)` means nothing is ready; the engine notifies the cookie
    /// once more events are available.
    fn stream_step(&self, _cookie: &Cookie) -> EngineResult<Option<StreamEvent>> {
        Err(EngineError::NotSupported)
    }

    /// Acknowledges `bytes` of stream data received by the client.
    fn stream_ack(&self, _cookie: &Cookie, _bytes: u32) -> EngineStatus {
        Err(EngineError::NotSupported)
    }

    /// Accepts a new collection manifest before the bucket switches to it.
    fn set_manifest(&self, _cookie: &Cookie, _manifest: &Manifest) -> EngineStatus {
        Ok(())
    }
}

/// Creates a fresh engine of the given type.
pub fn new_engine_instance(bucket_type: BucketType) -> EngineResult<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match bucket_type {
        BucketType::NoBucket => Arc::new(NoBucketEngine::new()),
        BucketType::Memcached => Arc::new(DefaultEngine::new()),
        BucketType::EWouldBlock => Arc::new(EWouldBlockEngine::new()),
    };
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_names() {
        assert_eq!(
            BucketType::from_module("memcached"),
            Some(BucketType::Memcached)
        );
        assert_eq!(
            BucketType::from_module("default_engine.so"),
            Some(BucketType::Memcached)
        );
        assert_eq!(
            BucketType::from_module("ewouldblock"),
            Some(BucketType::EWouldBlock)
        );
        assert_eq!(BucketType::from_module("couchstore"), None);
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(Status::from(EngineError::KeyNotFound), Status::KeyNotFound);
        assert_eq!(Status::from(EngineError::NoBucket), Status::NoBucket);
        assert_eq!(Status::from(EngineError::Failed), Status::Internal);
    }

    #[test]
    fn test_factory_types() {
        for ty in [
            BucketType::NoBucket,
            BucketType::Memcached,
            BucketType::EWouldBlock,
        ] {
            assert_eq!(new_engine_instance(ty).unwrap().bucket_type(), ty);
        }
    }
}
