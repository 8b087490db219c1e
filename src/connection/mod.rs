//! Connection Module
//!
//! A client connection is split in two halves:
//!
//! - [`Connection`]: owned by exactly one worker thread. It holds the socket,
//!   the loaned buffers and the state machine that drives them.
//! - [`ConnectionShared`]: reference counted and visible from every thread.
//!   Engines, admin threads and the [`ConnectionRegistry`] only ever see this
//!   half, through a [`Cookie`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker thread                           │
//! │                                                             │
//! │  readiness ──▶ Connection::run_event ──▶ step() ... step()  │
//! │                     │          ▲                            │
//! │              loan   │          │ return                     │
//! │                     ▼          │                            │
//! │                ┌──────────────────┐                         │
//! │                │   BufferPool     │  one spare per kind     │
//! │                └──────────────────┘                         │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ Cookie
//!                               ▼
//!                 ┌──────────────────────────┐
//!                 │ ConnectionShared         │◀── ConnectionRegistry
//!                 │ refcount, aiostat, state │◀── engines / admin threads
//!                 └──────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Non-blocking state machine**: never awaits, yields on `WouldBlock`
//! - **Buffer loans**: idle connections hold no network buffers
//! - **Fairness**: a bounded number of requests per readiness event
//! - **Async engines**: commands park and resume on `notify_io_complete`

pub mod buffer;
pub mod cookie;
pub mod machine;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use buffer::{BufferLoan, BufferPool, NetBuf};
pub use cookie::{ConnectionShared, ConnectionSnapshot, Cookie};
pub use machine::{Connection, State};
pub use registry::{ConnectionDump, ConnectionRegistry, ConnectionStats};
pub use transport::{EventMask, Readiness, TcpTransport, Transport};

pub(crate) use machine::Nread;
