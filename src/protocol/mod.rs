//! Binary Protocol Implementation
//!
//! Framing, encoding and validation for the binary request/response
//! protocol spoken by clients.
//!
//! ## Modules
//!
//! - `types`: header layout, opcodes, status codes, request/response types
//! - `parser`: incremental frame parser over a connection's read buffer
//! - `validate`: per-opcode header checks and the collection key check
//!
//! ## Example
//!
//! ```ignore
//! use bucketd::protocol::{FrameParser, Opcode, Request};
//!
//! let wire = Request::new(Opcode::Get).with_key("name").encode();
//! let (frame, consumed) = FrameParser::default().parse(&wire)?.unwrap();
//! ```

pub mod parser;
pub mod types;
pub mod validate;

// Re-export commonly used types for convenience
pub use parser::{Frame, FrameParser, ParseError, ParseResult, DEFAULT_MAX_PACKET_SIZE};
pub use types::{
    magic, Opcode, Request, RequestHeader, Response, ResponseHeader, Status, HEADER_LEN,
};
pub use validate::{requires_collection, validate, validate_collection_key, MAX_BUCKET_NAME_LENGTH};
