//! The server interface handed to engines.
//!
//! An engine receives a [`ServerApi`] during `initialize`. It is scoped to
//! the slot the engine is being installed in and lets the engine subscribe
//! to server events.

use super::{BucketState, BucketTable};
use crate::connection::Cookie;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Events an engine can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEventType {
    /// A connection bound to the engine's bucket is closing
    OnDisconnect,
    /// The server log level changed (process wide)
    OnLogLevel,
}

/// An event delivered to a callback.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    Disconnect(&'a Cookie),
    LogLevel(tracing::Level),
}

/// A registered event callback.
pub type EventCallback = Arc<dyn Fn(&EngineEvent<'_>) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerApiError {
    /// The slot is not being set up or served by this engine
    #[error("bucket slot {0} is not owned by a live engine")]
    NotOwner(usize),
}

/// Handle scoped to one bucket slot.
pub struct ServerApi<'a> {
    table: &'a BucketTable,
    index: usize,
}

impl<'a> ServerApi<'a> {
    pub(crate) fn new(table: &'a BucketTable, index: usize) -> Self {
        Self { table, index }
    }

    /// The slot this handle is scoped to.
    pub fn bucket_index(&self) -> usize {
        self.index
    }

    /// Registers `callback` for `event`.
    ///
    /// Disconnect callbacks fire only for connections bound to this bucket;
    /// log level callbacks fire for every level change. Both are dropped
    /// when the bucket is deleted.
    pub fn register_callback(
        &self,
        event: EngineEventType,
        callback: EventCallback,
    ) -> Result<(), ServerApiError> {
        let bucket = self
            .table
            .bucket(self.index)
            .ok_or(ServerApiError::NotOwner(self.index))?;

        let state = bucket.state();
        if !matches!(state, BucketState::Initializing | BucketState::Ready) {
            return Err(ServerApiError::NotOwner(self.index));
        }

        match event {
            EngineEventType::OnDisconnect => {
                bucket.disconnect_handlers.lock().unwrap().push(callback);
            }
            EngineEventType::OnLogLevel => {
                self.table
                    .log_level_handlers
                    .lock()
                    .unwrap()
                    .push((self.index, callback));
            }
        }
        debug!(bucket = self.index, ?event, "Engine callback registered");
        Ok(())
    }
}
