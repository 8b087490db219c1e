//! Command Handler Module
//!
//! Receives validated binary-protocol requests from the connection state
//! machine, executes them against the bound engine or the bucket table, and
//! queues the responses on the connection.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  FrameParser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Validate     │
//! │  - Dispatch     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Engine / Table  │  (engine, bucket modules)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Data Commands
//! - `GET`, `SET`, `ADD`, `REPLACE`, `DELETE`, `FLUSH`
//!
//! ### Server Commands
//! - `NOOP`, `VERSION`, `QUIT`, `STAT`, `VERBOSITY`
//!
//! ### Streams
//! - `OPEN_STREAM`, `STREAM_ACK`
//!
//! ### Bucket Administration
//! - `CREATE_BUCKET`, `DELETE_BUCKET`, `LIST_BUCKETS`, `SELECT_BUCKET`

pub mod handler;

// Re-export the main command handler
pub use handler::{CommandHandler, Outcome};
