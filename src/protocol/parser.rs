//! Incremental Binary Frame Parser
//!
//! The parser looks at the bytes currently buffered for a connection and
//! either produces a frame, asks for more data, or reports a framing error
//! that makes the stream impossible to resynchronise.
//!
//! ## Return Convention
//!
//! - `Ok(Some((frame, consumed)))` - a frame is available, `consumed` bytes
//!   may be dropped from the front of the buffer
//! - `Ok(None)` - the frame is incomplete, read more
//! - `Err(ParseError)` - the connection must be closed
//!
//! ## Store Commands
//!
//! Set, Add and Replace carry values that may be much larger than the read
//! buffer. For those the parser stops after the key: the caller allocates an
//! item in the engine and streams the value straight into it.
//!
//! ```text
//!   [ header (24) | extras | key ]  [ value ....................... ]
//!   \__________ StoreHeader _____/  \__ copied by the nread state __/
//! ```

use crate::protocol::types::{magic, Opcode, Request, RequestHeader, HEADER_LEN};
use bytes::Bytes;
use thiserror::Error;

/// Errors that make the remainder of the byte stream meaningless.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The first byte of the header is not the request magic
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// The packet exceeds the configured maximum size
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Key and extras do not fit inside the declared body
    #[error("invalid lengths: keylen {keylen} + extlen {extlen} > bodylen {bodylen}")]
    InvalidLengths {
        keylen: u16,
        extlen: u8,
        bodylen: u32,
    },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Default upper bound on a fully buffered packet (20 MB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 20 * 1024 * 1024;

/// A parsed unit of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete, fully buffered request.
    Request(Request),

    /// The leading part of a store command; the value follows on the wire.
    StoreHeader {
        header: RequestHeader,
        extras: Bytes,
        key: Bytes,
    },
}

impl Frame {
    pub fn header(&self) -> &RequestHeader {
        match self {
            Frame::Request(req) => &req.header,
            Frame::StoreHeader { header, .. } => header,
        }
    }
}

/// Stateless frame parser.
///
/// # Example
///
/// ```ignore
/// let parser = FrameParser::new(DEFAULT_MAX_PACKET_SIZE);
/// if let Some((frame, consumed)) = parser.parse(&buffer)? {
///     buffer.advance(consumed);
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    max_packet_size: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl FrameParser {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Attempts to parse one frame from the front of `buf`.
    ///
    /// # Arguments
    ///
    /// * `buf` - The unconsumed bytes of the connection's read buffer
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        // Reject garbage as soon as the first byte arrives.
        if let Some(&first) = buf.first() {
            if first != magic::REQUEST {
                return Err(ParseError::InvalidMagic(first));
            }
        }

        let header = match RequestHeader::decode(buf) {
            Some(header) => header,
            None => return Ok(None),
        };

        let extlen = header.extlen as usize;
        let keylen = header.keylen as usize;
        if extlen + keylen > header.bodylen as usize {
            return Err(ParseError::InvalidLengths {
                keylen: header.keylen,
                extlen: header.extlen,
                bodylen: header.bodylen,
            });
        }

        let prefix_len = HEADER_LEN + extlen + keylen;
        let is_store = header.opcode().map(Opcode::is_store).unwrap_or(false);

        if is_store {
            if prefix_len > self.max_packet_size {
                return Err(ParseError::PacketTooLarge {
                    size: prefix_len,
                    max: self.max_packet_size,
                });
            }
            if buf.len() < prefix_len {
                return Ok(None);
            }
            let extras = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + extlen]);
            let key = Bytes::copy_from_slice(&buf[HEADER_LEN + extlen..prefix_len]);
            return Ok(Some((Frame::StoreHeader { header, extras, key }, prefix_len)));
        }

        let total = header.frame_len();
        if total > self.max_packet_size {
            return Err(ParseError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let extras = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + extlen]);
        let key = Bytes::copy_from_slice(&buf[HEADER_LEN + extlen..prefix_len]);
        let value = Bytes::copy_from_slice(&buf[prefix_len..total]);

        Ok(Some((
            Frame::Request(Request {
                header,
                extras,
                key,
                value,
            }),
            total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::Opcode;

    #[test]
    fn test_parse_complete_request() {
        let wire = Request::new(Opcode::Get).with_key("name").encode();
        let (frame, used) = FrameParser::default().parse(&wire).unwrap().unwrap();

        assert_eq!(used, wire.len());
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.opcode(), Some(Opcode::Get));
                assert_eq!(&req.key[..], b"name");
                assert!(req.value.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_parse_incomplete() {
        let wire = Request::new(Opcode::Get).with_key("name").encode();
        let parser = FrameParser::default();

        assert!(parser.parse(&[]).unwrap().is_none());
        assert!(parser.parse(&wire[..10]).unwrap().is_none());
        assert!(parser.parse(&wire[..wire.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_store_header_stops_before_value() {
        let wire = Request::new(Opcode::Set)
            .with_extras(vec![0u8; 8])
            .with_key("k")
            .with_value(vec![b'x'; 4096])
            .encode();

        let prefix = HEADER_LEN + 8 + 1;
        let (frame, used) = FrameParser::default()
            .parse(&wire[..prefix])
            .unwrap()
            .unwrap();

        assert_eq!(used, prefix);
        match frame {
            Frame::StoreHeader { header, key, .. } => {
                assert_eq!(&key[..], b"k");
                assert_eq!(header.value_len(), 4096);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_detected_on_first_byte() {
        let err = FrameParser::default().parse(b"G").unwrap_err();
        assert_eq!(err, ParseError::InvalidMagic(b'G'));
    }

    #[test]
    fn test_invalid_lengths() {
        let mut wire = Request::new(Opcode::Get).with_key("abc").encode();
        // bodylen = 1 while keylen = 3
        wire[8..12].copy_from_slice(&1u32.to_be_bytes());
        let err = FrameParser::default().parse(&wire).unwrap_err();
        assert!(matches!(err, ParseError::InvalidLengths { keylen: 3, .. }));
    }

    #[test]
    fn test_packet_too_large() {
        let wire = Request::new(Opcode::Get)
            .with_key("k")
            .with_value(vec![0u8; 100])
            .encode();
        let err = FrameParser::new(64).parse(&wire).unwrap_err();
        assert!(matches!(err, ParseError::PacketTooLarge { max: 64, .. }));
    }

    #[test]
    fn test_pipelined_frames() {
        let mut wire = Request::new(Opcode::Noop).with_opaque(1).encode();
        wire.extend_from_slice(&Request::new(Opcode::Noop).with_opaque(2).encode());

        let parser = FrameParser::default();
        let (first, used) = parser.parse(&wire).unwrap().unwrap();
        assert_eq!(first.header().opaque, 1);
        let (second, _) = parser.parse(&wire[used..]).unwrap().unwrap();
        assert_eq!(second.header().opaque, 2);
    }
}
