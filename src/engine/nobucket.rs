//! The engine permanently installed in slot 0.
//!
//! Connections that have not selected a bucket are bound here; every data
//! command fails with `NoBucket`.

use super::{BucketType, Document, Engine, EngineError, EngineResult, EngineStatus, Item, StoreOperation};
use crate::bucket::{Manifest, ServerApi};
use crate::connection::Cookie;

#[derive(Debug, Default)]
pub struct NoBucketEngine;

impl NoBucketEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for NoBucketEngine {
    fn bucket_type(&self) -> BucketType {
        BucketType::NoBucket
    }

    fn initialize(&self, _config: &str, _api: &ServerApi<'_>) -> EngineStatus {
        Ok(())
    }

    fn destroy(&self, _force: bool) {}

    fn allocate(
        &self,
        _cookie: &Cookie,
        _key: &[u8],
        _nbytes: usize,
        _flags: u32,
        _exptime: u32,
    ) -> EngineResult<Item> {
        Err(EngineError::NoBucket)
    }

    fn release(&self, _cookie: &Cookie, _item: Item) {}

    fn get(&self, _cookie: &Cookie, _key: &[u8]) -> EngineResult<Document> {
        Err(EngineError::NoBucket)
    }

    fn store(
        &self,
        _cookie: &Cookie,
        _item: &Item,
        _cas: u64,
        _operation: StoreOperation,
    ) -> EngineResult<u64> {
        Err(EngineError::NoBucket)
    }

    fn remove(&self, _cookie: &Cookie, _key: &[u8], _cas: u64) -> EngineStatus {
        Err(EngineError::NoBucket)
    }

    fn flush(&self, _cookie: &Cookie) -> EngineStatus {
        Err(EngineError::NoBucket)
    }

    fn get_stats(
        &self,
        _cookie: &Cookie,
        _group: &str,
        _add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineStatus {
        Err(EngineError::NoBucket)
    }

    fn open_stream(&self, _cookie: &Cookie, _name: &[u8]) -> EngineStatus {
        Err(EngineError::NoBucket)
    }

    fn set_manifest(&self, _cookie: &Cookie, _manifest: &Manifest) -> EngineStatus {
        Err(EngineError::NoBucket)
    }
}
