//! Per-opcode packet validators.
//!
//! [`validate`] only looks at the header. [`validate_collection_key`] runs
//! once the key is known and the bound bucket enforces collections. A failed
//! check produces a status that is sent back to the client; the connection
//! stays open.

use crate::protocol::types::{magic, Opcode, RequestHeader, Status, DATATYPE_RAW};

/// Upper bound on the key of a select-bucket request.
pub const MAX_SELECT_KEY_LEN: u16 = 1023;

/// Maximum length of a bucket name.
pub const MAX_BUCKET_NAME_LENGTH: u16 = 100;

/// Checks a request header against the rules for its opcode.
///
/// # Returns
///
/// The decoded opcode, `Err(Status::UnknownCommand)` for opcodes the server
/// does not implement, or `Err(Status::Invalid)` for malformed packets.
pub fn validate(header: &RequestHeader) -> Result<Opcode, Status> {
    let opcode = header.opcode().ok_or(Status::UnknownCommand)?;

    if header.magic != magic::REQUEST || header.datatype != DATATYPE_RAW {
        return Err(Status::Invalid);
    }

    let keylen = header.keylen;
    let extlen = header.extlen;
    let bodylen = header.bodylen;
    let no_cas = header.cas == 0;
    let empty = extlen == 0 && keylen == 0 && bodylen == 0;

    let valid = match opcode {
        Opcode::Get => extlen == 0 && keylen > 0 && bodylen == keylen as u32 && no_cas,
        Opcode::Delete => extlen == 0 && keylen > 0 && bodylen == keylen as u32,
        Opcode::Set | Opcode::Replace => extlen == 8 && keylen > 0,
        Opcode::Add => extlen == 8 && keylen > 0 && no_cas,
        Opcode::Quit | Opcode::Noop | Opcode::Version => empty && no_cas,
        Opcode::Flush => {
            (extlen == 0 || extlen == 4) && bodylen == extlen as u32 && keylen == 0 && no_cas
        }
        Opcode::Stat => extlen == 0 && bodylen == keylen as u32 && no_cas,
        Opcode::Verbosity => extlen == 4 && keylen == 0 && bodylen == 4 && no_cas,
        Opcode::OpenStream => extlen == 0 && keylen > 0 && bodylen == keylen as u32,
        Opcode::StreamAck => extlen == 4 && keylen == 0 && bodylen == 4,
        // Only ever sent by the server.
        Opcode::StreamMutation => false,
        Opcode::CreateBucket => {
            extlen == 0
                && keylen > 0
                && keylen <= MAX_BUCKET_NAME_LENGTH
                && bodylen > keylen as u32
        }
        Opcode::DeleteBucket => extlen == 0 && keylen > 0,
        Opcode::ListBuckets => empty && no_cas,
        Opcode::SelectBucket => {
            extlen == 0 && keylen <= MAX_SELECT_KEY_LEN && bodylen == keylen as u32
        }
        Opcode::SetManifest => extlen == 0 && keylen == 0 && bodylen > 0 && no_cas,
    };

    if valid {
        Ok(opcode)
    } else {
        Err(Status::Invalid)
    }
}

/// Whether `opcode` addresses a document by key, and so must name a
/// collection in buckets that enforce them.
pub fn requires_collection(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Get | Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Delete
    )
}

/// Checks that the key of a data command is prefixed with a known
/// collection.
///
/// # Arguments
///
/// * `opcode` - The validated opcode
/// * `key` - The request key
/// * `in_collection` - The bound bucket's collection check; only called for
///   opcodes that carry a document key
pub fn validate_collection_key<F>(opcode: Opcode, key: &[u8], in_collection: F) -> Result<(), Status>
where
    F: FnOnce(&[u8]) -> bool,
{
    if requires_collection(opcode) && !in_collection(key) {
        return Err(Status::Invalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::Request;

    fn header(req: Request) -> RequestHeader {
        RequestHeader::decode(&req.encode()).unwrap()
    }

    #[test]
    fn test_get_requires_key() {
        assert_eq!(
            validate(&header(Request::new(Opcode::Get).with_key("a"))),
            Ok(Opcode::Get)
        );
        assert_eq!(
            validate(&header(Request::new(Opcode::Get))),
            Err(Status::Invalid)
        );
        assert_eq!(
            validate(&header(Request::new(Opcode::Get).with_key("a").with_cas(1))),
            Err(Status::Invalid)
        );
    }

    #[test]
    fn test_store_requires_extras() {
        let set = Request::new(Opcode::Set).with_key("k").with_value("v");
        assert_eq!(validate(&header(set.clone())), Err(Status::Invalid));
        assert_eq!(
            validate(&header(set.with_extras(vec![0u8; 8]))),
            Ok(Opcode::Set)
        );

        let add = Request::new(Opcode::Add)
            .with_extras(vec![0u8; 8])
            .with_key("k")
            .with_cas(9);
        assert_eq!(validate(&header(add)), Err(Status::Invalid));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut h = header(Request::new(Opcode::Noop));
        h.opcode = 0x42;
        assert_eq!(validate(&h), Err(Status::UnknownCommand));
    }

    #[test]
    fn test_datatype_must_be_raw() {
        let mut h = header(Request::new(Opcode::Noop));
        h.datatype = 1;
        assert_eq!(validate(&h), Err(Status::Invalid));
    }

    #[test]
    fn test_create_bucket_rules() {
        let ok = Request::new(Opcode::CreateBucket)
            .with_key("b1")
            .with_value("memcached");
        assert_eq!(validate(&header(ok)), Ok(Opcode::CreateBucket));

        let no_body = Request::new(Opcode::CreateBucket).with_key("b1");
        assert_eq!(validate(&header(no_body)), Err(Status::Invalid));

        let long = Request::new(Opcode::CreateBucket)
            .with_key(vec![b'a'; 101])
            .with_value("memcached");
        assert_eq!(validate(&header(long)), Err(Status::Invalid));
    }

    #[test]
    fn test_admin_rules() {
        assert_eq!(
            validate(&header(Request::new(Opcode::ListBuckets))),
            Ok(Opcode::ListBuckets)
        );
        assert_eq!(
            validate(&header(Request::new(Opcode::ListBuckets).with_key("x"))),
            Err(Status::Invalid)
        );
        assert_eq!(
            validate(&header(Request::new(Opcode::SelectBucket).with_key("b1"))),
            Ok(Opcode::SelectBucket)
        );
        assert_eq!(
            validate(&header(
                Request::new(Opcode::SelectBucket)
                    .with_key("b1")
                    .with_value("x")
            )),
            Err(Status::Invalid)
        );
        assert_eq!(
            validate(&header(Request::new(Opcode::DeleteBucket))),
            Err(Status::Invalid)
        );
    }

    #[test]
    fn test_flush_and_verbosity() {
        assert_eq!(
            validate(&header(Request::new(Opcode::Flush))),
            Ok(Opcode::Flush)
        );
        assert_eq!(
            validate(&header(
                Request::new(Opcode::Flush).with_extras(vec![0u8; 2])
            )),
            Err(Status::Invalid)
        );
        assert_eq!(
            validate(&header(
                Request::new(Opcode::Verbosity).with_extras(vec![0u8; 4])
            )),
            Ok(Opcode::Verbosity)
        );
    }

    #[test]
    fn test_set_manifest_rules() {
        let ok = Request::new(Opcode::SetManifest).with_value("{}");
        assert_eq!(validate(&header(ok)), Ok(Opcode::SetManifest));
        assert_eq!(
            validate(&header(Request::new(Opcode::SetManifest))),
            Err(Status::Invalid)
        );
        let keyed = Request::new(Opcode::SetManifest)
            .with_key("k")
            .with_value("{}");
        assert_eq!(validate(&header(keyed)), Err(Status::Invalid));
    }

    #[test]
    fn test_collection_key() {
        let beer = |key: &[u8]| key.starts_with(b"beer:");
        assert_eq!(validate_collection_key(Opcode::Get, b"beer:ale", beer), Ok(()));
        assert_eq!(
            validate_collection_key(Opcode::Set, b"wine:red", beer),
            Err(Status::Invalid)
        );
        assert_eq!(
            validate_collection_key(Opcode::Delete, b"ale", beer),
            Err(Status::Invalid)
        );
        // Only document commands are checked
        assert_eq!(validate_collection_key(Opcode::Stat, b"ale", beer), Ok(()));
        assert_eq!(
            validate_collection_key(Opcode::SelectBucket, b"b1", beer),
            Ok(())
        );
    }
}
