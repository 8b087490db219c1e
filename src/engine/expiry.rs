//! Background Expiry Sweeper
//!
//! Lazy expiry only reclaims items that are read again. The sweeper runs on
//! its own thread for the lifetime of a bucket and removes expired items
//! that nobody touches any more.
//!
//! Engines are created and destroyed from administrative threads that have
//! no async runtime, so the sweeper is a plain OS thread woken by a channel
//! timeout rather than a runtime task.
//!
//! ## Adaptive Frequency
//!
//! If many items expire per pass the interval is halved (down to
//! `min_interval`); a pass that finds nothing doubles it (up to
//! `max_interval`).

use super::default_engine::ItemStore;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// If this fraction of items expired in one pass, speed up
    pub speedup_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
        }
    }
}

impl ExpiryConfig {
    pub fn with_base_interval(base_interval: Duration) -> Self {
        let defaults = Self::default();
        Self {
            base_interval,
            min_interval: defaults.min_interval.min(base_interval),
            max_interval: defaults.max_interval.max(base_interval),
            ..defaults
        }
    }
}

/// Handle to a running sweeper thread.
///
/// The thread stops when [`ExpirySweeper::stop`] is called or the handle
/// is dropped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirySweeper {
    /// Starts sweeping `store` in the background.
    ///
    /// # Arguments
    ///
    /// * `store` - The item store to sweep
    /// * `config` - Interval tuning
    pub fn start(store: Arc<ItemStore>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || {
                let mut interval = config.base_interval;
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            debug!("Expiry sweeper received shutdown signal");
                            return;
                        }
                    }
                    interval = sweep_once(&store, &config, interval);
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Lazy expiry still applies without the sweeper.
                warn!(error = %e, "Failed to start expiry sweeper");
                None
            }
        };

        Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(handle),
        }
    }

    /// Stops the sweeper and waits for its thread to exit.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one pass and returns the next interval.
fn sweep_once(store: &ItemStore, config: &ExpiryConfig, interval: Duration) -> Duration {
    let before = store.len();
    let expired = store.cleanup_expired();

    if expired > 0 {
        debug!(
            expired = expired,
            remaining = store.len(),
            "Expired items cleaned up"
        );
    }

    if before == 0 || expired == 0 {
        let next = (interval * 2).min(config.max_interval);
        trace!(next_interval_ms = next.as_millis() as u64, "Expiry sweeper backing off");
        return next;
    }

    let rate = expired as f64 / before as f64;
    if rate > config.speedup_threshold {
        (interval / 2).max(config.min_interval)
    } else {
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoreOperation;
    use bytes::Bytes;

    fn put(store: &ItemStore, key: &str, exptime: u32) {
        store
            .store(
                Bytes::from(key.to_string()),
                Bytes::from("value"),
                0,
                exptime,
                0,
                StoreOperation::Set,
                u64::MAX,
            )
            .unwrap();
    }

    #[test]
    fn test_sweeper_cleans_expired_items() {
        let store = Arc::new(ItemStore::new());
        for i in 0..10 {
            put(&store, &format!("key{}", i), 1);
        }
        put(&store, "persistent", 0);
        assert_eq!(store.len(), 11);

        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let sweeper = ExpirySweeper::start(Arc::clone(&store), config);

        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(store.len(), 1);
        assert!(store.get(b"persistent").is_some());

        sweeper.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let store = Arc::new(ItemStore::new());
        let sweeper = ExpirySweeper::start(store, ExpiryConfig::default());
        sweeper.stop();
        sweeper.stop();
    }

    #[test]
    fn test_interval_adapts() {
        let store = ItemStore::new();
        let config = ExpiryConfig::default();

        // Nothing to expire: back off
        let next = sweep_once(&store, &config, Duration::from_millis(100));
        assert_eq!(next, Duration::from_millis(200));

        let capped = sweep_once(&store, &config, Duration::from_millis(900));
        assert_eq!(capped, config.max_interval);
    }
}
