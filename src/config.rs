//! Server Settings and Engine Configuration Strings
//!
//! [`Settings`] carries everything the daemon needs at startup. It is built
//! from the command line in `main.rs`, adjusted with the `with_*` builder
//! methods and checked with [`Settings::validate`] before the server starts.
//!
//! Engines receive their own configuration as a `key=value;key=value`
//! string taken from the create-bucket request; [`parse_config`] splits it.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while validating settings or parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("malformed configuration entry: {0:?}")]
    Malformed(String),
}

/// Requests handled per readiness event before a connection must yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReqsPerEvent {
    pub default: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for ReqsPerEvent {
    fn default() -> Self {
        Self {
            default: 20,
            high: 50,
            medium: 5,
            low: 1,
        }
    }
}

/// Connection priority as set by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl std::str::FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(ConfigError::InvalidValue {
                key: "priority".to_string(),
                reason: format!("unknown priority {:?}", other),
            }),
        }
    }
}

impl ReqsPerEvent {
    pub fn for_priority(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// Daemon settings.
///
/// # Example
///
/// ```
/// use bucketd::config::Settings;
///
/// let settings = Settings::default()
///     .with_port(0)
///     .with_threads(2)
///     .with_max_buckets(10);
///
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Address to bind the listener to
    pub host: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Number of worker threads
    pub threads: usize,

    pub reqs_per_event: ReqsPerEvent,

    /// Connections above this limit are closed at accept time
    pub max_connections: usize,

    /// Size of the bucket table, including the no-bucket slot
    pub max_buckets: usize,

    /// Create a memcached bucket named "default" at startup
    pub default_bucket: bool,

    /// Initial size of network buffers
    pub buffer_size: usize,

    /// A read buffer that grew beyond this is shrunk back when idle
    pub buffer_shrink_threshold: usize,

    /// Largest fully buffered packet accepted
    pub max_packet_size: usize,

    /// How long bucket deletion waits between client-drain checks
    pub deletion_poll: Duration,
}

/// Default size of network buffers.
pub const DATA_BUFFER_SIZE: usize = 2048;

/// Maximum number of buckets, slot 0 included.
pub const MAX_NUM_BUCKETS: usize = 100;

impl Default for Settings {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            threads,
            reqs_per_event: ReqsPerEvent::default(),
            max_connections: 65_000,
            max_buckets: MAX_NUM_BUCKETS,
            default_bucket: false,
            buffer_size: DATA_BUFFER_SIZE,
            buffer_shrink_threshold: 64 * 1024,
            max_packet_size: crate::protocol::DEFAULT_MAX_PACKET_SIZE,
            deletion_poll: Duration::from_millis(1000),
        }
    }
}

impl Settings {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_reqs_per_event(mut self, reqs_per_event: ReqsPerEvent) -> Self {
        self.reqs_per_event = reqs_per_event;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    pub fn with_default_bucket(mut self, enabled: bool) -> Self {
        self.default_bucket = enabled;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_deletion_poll(mut self, interval: Duration) -> Self {
        self.deletion_poll = interval;
        self
    }

    /// Returns the `host:port` string for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks that every setting is within its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.threads == 0 || self.threads > 256 {
            return Err(invalid("threads", "must be between 1 and 256"));
        }
        let rpe = &self.reqs_per_event;
        if rpe.default == 0 || rpe.high == 0 || rpe.medium == 0 || rpe.low == 0 {
            return Err(invalid("reqs_per_event", "must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        if self.max_buckets < 2 || self.max_buckets > MAX_NUM_BUCKETS {
            return Err(invalid(
                "max_buckets",
                &format!("must be between 2 and {}", MAX_NUM_BUCKETS),
            ));
        }
        if self.buffer_size < crate::protocol::HEADER_LEN {
            return Err(invalid("buffer_size", "must hold at least a packet header"));
        }
        if self.buffer_shrink_threshold < self.buffer_size {
            return Err(invalid(
                "buffer_shrink_threshold",
                "must not be smaller than buffer_size",
            ));
        }
        if self.max_packet_size < self.buffer_size {
            return Err(invalid(
                "max_packet_size",
                "must not be smaller than buffer_size",
            ));
        }
        if self.deletion_poll.is_zero() {
            return Err(invalid("deletion_poll", "must be non-zero"));
        }
        Ok(())
    }
}

/// Splits an engine configuration string into key/value pairs.
///
/// Entries are separated by `;`, keys and values by the first `=`.
/// Whitespace around either side is ignored, as are empty entries. A
/// backslash escapes the next character, so `\;` puts a literal `;` in a
/// value.
///
/// # Example
///
/// ```
/// use bucketd::config::parse_config;
///
/// let cfg = parse_config("cache_size=1048576; item_size_max=1024").unwrap();
/// assert_eq!(cfg["cache_size"], "1048576");
///
/// let cfg = parse_config("collection_separator=\\;").unwrap();
/// assert_eq!(cfg["collection_separator"], ";");
/// ```
pub fn parse_config(config: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut out = HashMap::new();
    for entry in split_entries(config) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed(entry.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::Malformed(entry.to_string()));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Splits on unescaped `;` and resolves escapes.
fn split_entries(config: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = config.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            ';' => entries.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    entries.push(current);
    entries
}

/// Escapes a value so [`parse_config`] reads it back unchanged.
pub fn escape_config_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == ';' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Parses a numeric configuration value.
pub fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{:?} is not a number", value),
    })
}
