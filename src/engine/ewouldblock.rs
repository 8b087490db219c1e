//! An engine that completes data operations asynchronously.
//!
//! Wraps [`DefaultEngine`] and answers the first attempt of every data call
//! with `WouldBlock`. A background thread then notifies the connection; the
//! retried call passes through to the wrapped engine. With `mode=error` the
//! notification carries the configured error instead.
//!
//! Configuration keys (anything else is handed to the wrapped engine):
//!
//! | key        | values                              | default     |
//! |------------|-------------------------------------|-------------|
//! | `mode`     | `always`, `off`, `error`            | `always`    |
//! | `error`    | `tempfail`, `nomem`, `notsupported` | `tempfail`  |
//! | `delay_ms` | delay before the notification       | `0`         |

use super::default_engine::DefaultEngine;
use super::{
    BucketType, Document, Engine, EngineError, EngineResult, EngineStatus, Item, StoreOperation,
    StreamEvent,
};
use crate::bucket::{EngineEvent, EngineEventType, Manifest, ServerApi};
use crate::config::{escape_config_value, parse_config, parse_number};
use crate::connection::Cookie;
use std::collections::HashSet;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Always,
    Off,
    Error(EngineError),
}

struct Completion {
    cookie: Cookie,
    due: Instant,
    status: EngineStatus,
}

pub struct EWouldBlockEngine {
    inner: DefaultEngine,
    mode: RwLock<Mode>,
    delay: RwLock<Duration>,
    /// Connections whose next call completes for real
    pending: Arc<Mutex<HashSet<u64>>>,
    notifier: Mutex<Option<Sender<Completion>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EWouldBlockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EWouldBlockEngine {
    pub fn new() -> Self {
        Self {
            inner: DefaultEngine::new(),
            mode: RwLock::new(Mode::Always),
            delay: RwLock::new(Duration::ZERO),
            pending: Arc::new(Mutex::new(HashSet::new())),
            notifier: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Decides whether this call blocks.
    ///
    /// Returns `Ok(())` when the call should run against the wrapped engine.
    fn intercept(&self, cookie: &Cookie) -> EngineStatus {
        let mode = *self.mode.read().unwrap();
        if mode == Mode::Off {
            return Ok(());
        }

        if self.pending.lock().unwrap().remove(&cookie.id()) {
            return Ok(());
        }

        let status = match mode {
            Mode::Error(err) => Err(err),
            _ => Ok(()),
        };

        let notifier = self.notifier.lock().unwrap();
        let Some(tx) = notifier.as_ref() else {
            return Err(EngineError::Failed);
        };

        // Errors are delivered through the notification, so only successful
        // completions arm the pass-through.
        if status.is_ok() {
            self.pending.lock().unwrap().insert(cookie.id());
        }
        let completion = Completion {
            cookie: cookie.clone(),
            due: Instant::now() + *self.delay.read().unwrap(),
            status,
        };
        if tx.send(completion).is_err() {
            self.pending.lock().unwrap().remove(&cookie.id());
            return Err(EngineError::Failed);
        }
        Err(EngineError::WouldBlock)
    }
}

fn parse_error(name: &str) -> Option<EngineError> {
    match name {
        "tempfail" => Some(EngineError::TempFail),
        "nomem" => Some(EngineError::NoMemory),
        "notsupported" => Some(EngineError::NotSupported),
        "notfound" => Some(EngineError::KeyNotFound),
        _ => None,
    }
}

impl Engine for EWouldBlockEngine {
    fn bucket_type(&self) -> BucketType {
        BucketType::EWouldBlock
    }

    fn initialize(&self, config: &str, api: &ServerApi<'_>) -> EngineStatus {
        let entries = parse_config(config).map_err(|_| EngineError::Invalid)?;

        let mut mode = Mode::Always;
        let mut error = EngineError::TempFail;
        let mut delay = Duration::ZERO;
        let mut passthrough = Vec::new();
        for (key, value) in &entries {
            match key.as_str() {
                "mode" => {
                    mode = match value.as_str() {
                        "always" => Mode::Always,
                        "off" => Mode::Off,
                        "error" => Mode::Error(error),
                        _ => return Err(EngineError::Invalid),
                    }
                }
                "error" => error = parse_error(value).ok_or(EngineError::Invalid)?,
                "delay_ms" => {
                    let ms: u64 = parse_number(key, value).map_err(|_| EngineError::Invalid)?;
                    delay = Duration::from_millis(ms);
                }
                _ => passthrough.push(format!("{}={}", key, escape_config_value(value))),
            }
        }
        if let Mode::Error(_) = mode {
            mode = Mode::Error(error);
        }

        self.inner.initialize(&passthrough.join(";"), api)?;

        // A connection that closes before retrying must not leave its id armed
        let pending = Arc::clone(&self.pending);
        api.register_callback(
            EngineEventType::OnDisconnect,
            Arc::new(move |event: &EngineEvent<'_>| {
                if let EngineEvent::Disconnect(cookie) = event {
                    pending.lock().unwrap().remove(&cookie.id());
                }
            }),
        )
        .map_err(|_| EngineError::Failed)?;

        let (tx, rx) = mpsc::channel::<Completion>();
        let handle = std::thread::Builder::new()
            .name("ewouldblock-notifier".to_string())
            .spawn(move || {
                for completion in rx {
                    let now = Instant::now();
                    if completion.due > now {
                        std::thread::sleep(completion.due - now);
                    }
                    completion.cookie.notify_io_complete(completion.status);
                }
            })
            .map_err(|e| {
                warn!(error = %e, "Failed to start notifier thread");
                EngineError::Failed
            })?;

        *self.mode.write().unwrap() = mode;
        *self.delay.write().unwrap() = delay;
        *self.notifier.lock().unwrap() = Some(tx);
        *self.handle.lock().unwrap() = Some(handle);
        debug!(?mode, ?delay, "EWouldBlock engine initialized");
        Ok(())
    }

    fn destroy(&self, force: bool) {
        // Dropping the sender lets the notifier drain its queue and exit.
        self.notifier.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.pending.lock().unwrap().clear();
        self.inner.destroy(force);
    }

    fn allocate(
        &self,
        cookie: &Cookie,
        key: &[u8],
        nbytes: usize,
        flags: u32,
        exptime: u32,
    ) -> EngineResult<Item> {
        self.inner.allocate(cookie, key, nbytes, flags, exptime)
    }

    fn release(&self, cookie: &Cookie, item: Item) {
        self.inner.release(cookie, item)
    }

    fn get(&self, cookie: &Cookie, key: &[u8]) -> EngineResult<Document> {
        self.intercept(cookie)?;
        self.inner.get(cookie, key)
    }

    fn store(
        &self,
        cookie: &Cookie,
        item: &Item,
        cas: u64,
        operation: StoreOperation,
    ) -> EngineResult<u64> {
        self.intercept(cookie)?;
        self.inner.store(cookie, item, cas, operation)
    }

    fn remove(&self, cookie: &Cookie, key: &[u8], cas: u64) -> EngineStatus {
        self.intercept(cookie)?;
        self.inner.remove(cookie, key, cas)
    }

    fn flush(&self, cookie: &Cookie) -> EngineStatus {
        self.intercept(cookie)?;
        self.inner.flush(cookie)
    }

    fn get_stats(
        &self,
        cookie: &Cookie,
        group: &str,
        add_stat: &mut dyn FnMut(&str, &str),
    ) -> EngineStatus {
        self.inner.get_stats(cookie, group, add_stat)
    }

    fn set_log_level(&self, level: tracing::Level) {
        self.inner.set_log_level(level)
    }

    fn open_stream(&self, cookie: &Cookie, name: &[u8]) -> EngineStatus {
        self.inner.open_stream(cookie, name)
    }

    fn stream_step(&self, cookie: &Cookie) -> EngineResult<Option<StreamEvent>> {
        self.inner.stream_step(cookie)
    }

    fn stream_ack(&self, cookie: &Cookie, bytes: u32) -> EngineStatus {
        self.inner.stream_ack(cookie, bytes)
    }

    fn set_manifest(&self, cookie: &Cookie, manifest: &Manifest) -> EngineStatus {
        self.intercept(cookie)?;
        self.inner.set_manifest(cookie, manifest)
    }
}
