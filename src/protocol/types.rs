//! Binary Protocol Data Types
//!
//! Every packet starts with a fixed 24 byte header followed by a body made
//! of three consecutive sections: extras, key and value. All integers are
//! big endian.
//!
//! ## Header Layout
//!
//! ```text
//!   Byte/     0       |       1       |       2       |       3       |
//!      /              |               |               |               |
//!     |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!     +---------------+---------------+---------------+---------------+
//!    0| Magic         | Opcode        | Key length                    |
//!     +---------------+---------------+---------------+---------------+
//!    4| Extras length | Data type     | vbucket / status              |
//!     +---------------+---------------+---------------+---------------+
//!    8| Total body length                                             |
//!     +---------------+---------------+---------------+---------------+
//!   12| Opaque                                                        |
//!     +---------------+---------------+---------------+---------------+
//!   16| CAS                                                           |
//!     |                                                               |
//!     +---------------+---------------+---------------+---------------+
//! ```
//!
//! Requests carry the vbucket in bytes 6-7, responses carry the status.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the fixed packet header.
pub const HEADER_LEN: usize = 24;

/// Magic bytes identifying the packet direction.
pub mod magic {
    pub const REQUEST: u8 = 0x80;
    pub const RESPONSE: u8 = 0x81;
}

/// Raw datatype value; the only one accepted.
pub const DATATYPE_RAW: u8 = 0x00;

/// Command opcodes understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Quit = 0x07,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    Stat = 0x10,
    Verbosity = 0x1b,
    OpenStream = 0x50,
    StreamAck = 0x51,
    StreamMutation = 0x57,
    CreateBucket = 0x85,
    DeleteBucket = 0x86,
    ListBuckets = 0x87,
    SelectBucket = 0x89,
    SetManifest = 0xb9,
}

impl Opcode {
    /// Maps a raw opcode byte to a known command.
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x10 => Opcode::Stat,
            0x1b => Opcode::Verbosity,
            0x50 => Opcode::OpenStream,
            0x51 => Opcode::StreamAck,
            0x57 => Opcode::StreamMutation,
            0x85 => Opcode::CreateBucket,
            0x86 => Opcode::DeleteBucket,
            0x87 => Opcode::ListBuckets,
            0x89 => Opcode::SelectBucket,
            0xb9 => Opcode::SetManifest,
            _ => return None,
        };
        Some(opcode)
    }

    /// Commands whose value is streamed into an engine allocated item.
    pub fn is_store(self) -> bool {
        matches!(self, Opcode::Set | Opcode::Add | Opcode::Replace)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Get => "GET",
            Opcode::Set => "SET",
            Opcode::Add => "ADD",
            Opcode::Replace => "REPLACE",
            Opcode::Delete => "DELETE",
            Opcode::Quit => "QUIT",
            Opcode::Flush => "FLUSH",
            Opcode::Noop => "NOOP",
            Opcode::Version => "VERSION",
            Opcode::Stat => "STAT",
            Opcode::Verbosity => "VERBOSITY",
            Opcode::OpenStream => "OPEN_STREAM",
            Opcode::StreamAck => "STREAM_ACK",
            Opcode::StreamMutation => "STREAM_MUTATION",
            Opcode::CreateBucket => "CREATE_BUCKET",
            Opcode::DeleteBucket => "DELETE_BUCKET",
            Opcode::ListBuckets => "LIST_BUCKETS",
            Opcode::SelectBucket => "SELECT_BUCKET",
            Opcode::SetManifest => "SET_MANIFEST",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    TooBig = 0x03,
    Invalid = 0x04,
    NotStored = 0x05,
    UnknownCommand = 0x81,
    NoMemory = 0x82,
    NotSupported = 0x83,
    Internal = 0x84,
    Busy = 0x85,
    TempFail = 0x86,
    NoBucket = 0x8c,
}

impl Status {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        let status = match value {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::Invalid,
            0x05 => Status::NotStored,
            0x81 => Status::UnknownCommand,
            0x82 => Status::NoMemory,
            0x83 => Status::NotSupported,
            0x84 => Status::Internal,
            0x85 => Status::Busy,
            0x86 => Status::TempFail,
            0x8c => Status::NoBucket,
            _ => return None,
        };
        Some(status)
    }

    /// Human readable text sent as the body of error responses.
    pub fn description(self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::KeyNotFound => "Not found",
            Status::KeyExists => "Data exists for key",
            Status::TooBig => "Too large",
            Status::Invalid => "Invalid arguments",
            Status::NotStored => "Not stored",
            Status::UnknownCommand => "Unknown command",
            Status::NoMemory => "Out of memory",
            Status::NotSupported => "Not supported",
            Status::Internal => "Internal error",
            Status::Busy => "Server too busy",
            Status::TempFail => "Temporary failure",
            Status::NoBucket => "No bucket selected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub magic: u8,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Decodes a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Returns `None` if fewer bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut b = &buf[..HEADER_LEN];
        Some(Self {
            magic: b.get_u8(),
            opcode: b.get_u8(),
            keylen: b.get_u16(),
            extlen: b.get_u8(),
            datatype: b.get_u8(),
            vbucket: b.get_u16(),
            bodylen: b.get_u32(),
            opaque: b.get_u32(),
            cas: b.get_u64(),
        })
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.magic);
        out.put_u8(self.opcode);
        out.put_u16(self.keylen);
        out.put_u8(self.extlen);
        out.put_u8(self.datatype);
        out.put_u16(self.vbucket);
        out.put_u32(self.bodylen);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Length of the value section (body minus extras and key).
    pub fn value_len(&self) -> usize {
        (self.bodylen as usize).saturating_sub(self.keylen as usize + self.extlen as usize)
    }

    /// Total number of bytes occupied by the packet on the wire.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }
}

/// A complete request: header plus its body sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    /// Starts building a request for `opcode`.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            header: RequestHeader {
                magic: magic::REQUEST,
                opcode: opcode as u8,
                ..Default::default()
            },
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.header.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.header.cas = cas;
        self
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.header.opcode()
    }

    /// Encodes the request, fixing up the length fields from the sections.
    pub fn encode(&self) -> BytesMut {
        let mut header = self.header;
        header.keylen = self.key.len() as u16;
        header.extlen = self.extras.len() as u8;
        header.bodylen = (self.extras.len() + self.key.len() + self.value.len()) as u32;

        let mut out = BytesMut::with_capacity(header.frame_len());
        header.encode(&mut out);
        out.put_slice(&self.extras);
        out.put_slice(&self.key);
        out.put_slice(&self.value);
        out
    }
}

/// A response header as written by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub status: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(magic::RESPONSE);
        out.put_u8(self.opcode);
        out.put_u16(self.keylen);
        out.put_u8(self.extlen);
        out.put_u8(DATATYPE_RAW);
        out.put_u16(self.status);
        out.put_u32(self.bodylen);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }
}

/// A fully decoded response, used by clients and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    /// Decodes one response from the front of `buf`.
    ///
    /// Returns the response and the number of bytes it occupied, or `None`
    /// if the buffer does not yet hold a complete packet.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let header = RequestHeader::decode(buf)?;
        let total = header.frame_len();
        if header.magic != magic::RESPONSE || buf.len() < total {
            return None;
        }
        let body = &buf[HEADER_LEN..total];
        let extlen = header.extlen as usize;
        let keylen = header.keylen as usize;
        Some((
            Self {
                opcode: header.opcode,
                status: header.vbucket,
                opaque: header.opaque,
                cas: header.cas,
                extras: Bytes::copy_from_slice(&body[..extlen]),
                key: Bytes::copy_from_slice(&body[extlen..extlen + keylen]),
                value: Bytes::copy_from_slice(&body[extlen + keylen..]),
            },
            total,
        ))
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_u16(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success.as_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let req = Request::new(Opcode::Get).with_key("name").with_opaque(7);
        let bytes = req.encode();

        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(bytes[0], magic::REQUEST);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(&bytes[2..4], &[0, 4]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 4]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 7]);
        assert_eq!(&bytes[HEADER_LEN..], b"name");
    }

    #[test]
    fn test_body_sections() {
        let req = Request::new(Opcode::Set)
            .with_extras(vec![0u8; 8])
            .with_key("k")
            .with_value("value");
        let header = RequestHeader::decode(&req.encode()).unwrap();

        assert_eq!(header.extlen, 8);
        assert_eq!(header.keylen, 1);
        assert_eq!(header.bodylen, 14);
        assert_eq!(header.value_len(), 5);
        assert_eq!(header.frame_len(), HEADER_LEN + 14);
    }

    #[test]
    fn test_decode_requires_full_header() {
        assert!(RequestHeader::decode(&[magic::REQUEST; 23]).is_none());
    }

    #[test]
    fn test_response_decode() {
        let mut out = BytesMut::new();
        ResponseHeader {
            opcode: Opcode::Get as u8,
            keylen: 0,
            extlen: 4,
            status: Status::Success.as_u16(),
            bodylen: 9,
            opaque: 42,
            cas: 5,
        }
        .encode(&mut out);
        out.put_u32(0xcafe);
        out.put_slice(b"hello");

        let (resp, used) = Response::decode(&out).unwrap();
        assert_eq!(used, out.len());
        assert!(resp.is_success());
        assert_eq!(resp.opaque, 42);
        assert_eq!(resp.cas, 5);
        assert_eq!(&resp.value[..], b"hello");

        assert!(Response::decode(&out[..out.len() - 1]).is_none());
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(Opcode::from_u8(0x42), None);
        assert_eq!(Opcode::from_u8(0x89), Some(Opcode::SelectBucket));
        assert_eq!(Opcode::from_u8(0xb9), Some(Opcode::SetManifest));
        assert!(Opcode::Add.is_store());
        assert!(!Opcode::Get.is_store());
    }

    #[test]
    fn test_status_roundtrip_codes() {
        assert_eq!(Status::from_u16(0x8c), Some(Status::NoBucket));
        assert_eq!(Status::from_u16(0x1234), None);
        assert_eq!(Status::TooBig.to_string(), "Too large");
    }
}
