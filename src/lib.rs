//! # bucketd - A Multi-Bucket Key-Value Cache Daemon
//!
//! bucketd serves a memcached-style binary protocol over TCP. Clients are
//! spread over a fixed pool of worker threads, and storage is delegated to a
//! pluggable engine chosen per named bucket.
//!
//! ## Features
//!
//! - **Per-thread event loops**: each worker owns its connections and never
//!   blocks on any single one of them
//! - **Buffer loans**: network buffers are lent to active connections only
//! - **Buckets**: isolated engine instances created and deleted at runtime,
//!   safely against live connections
//! - **Asynchronous engines**: commands can park and resume on completion
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              bucketd                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ Dispatcher  │───>│   Worker    │───>│ Connection  │                  │
//! │  │ (Listener)  │    │  threads    │    │  machine    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Binary     │    │              CommandHandler                  │   │
//! │  │  Protocol   │    └──────────────────────┬───────────────────────┘   │
//! │  │  Parser     │                           ▼                           │
//! │  └─────────────┘    ┌──────────────────────────────────────────────┐   │
//! │                     │              BucketTable                     │   │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │                     │  │slot 0  │ │bucket 1│ │bucket 2│ │...N    │ │   │
//! │                     │  │NoBucket│ │Engine  │ │Engine  │ │        │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use bucketd::{Server, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::default().with_port(11211).with_default_bucket(true);
//!     let server = Server::bind(settings).await?;
//!     server.serve(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: binary header framing, opcodes, status codes, validators
//! - [`engine`]: the engine trait and the nobucket, memcached and
//!   ewouldblock backends
//! - [`bucket`]: the bucket table, lifecycle and per-thread statistics
//! - [`connection`]: buffers, the connection state machine, the registry
//! - [`commands`]: command execution
//! - [`server`]: worker threads, the dispatcher and shutdown
//! - [`config`]: settings and engine configuration strings

pub mod bucket;
pub mod commands;
pub mod config;
pub mod connection;
pub mod engine;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use bucket::{BucketError, BucketState, BucketTable};
pub use commands::{CommandHandler, Outcome};
pub use config::{Priority, ReqsPerEvent, Settings};
pub use connection::{Connection, ConnectionRegistry, Cookie, State};
pub use engine::{BucketType, Engine, EngineError};
pub use protocol::{Opcode, Request, Response, Status};
pub use server::{Server, ServerContext, ServerError};

/// The default port bucketd listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host bucketd binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of bucketd
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
