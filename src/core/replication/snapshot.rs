// src/core/replication/snapshot.rs

//! The snapshot blob format used to bootstrap a new replica: `"REDIS001"`
//! magic, one record per non-empty logical database, `"EOF"` trailer. All
//! integers are big-endian. This layout is specific to this replication
//! protocol and does not match any published snapshot format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::core::engine::EncodedValue;
use crate::core::errors::CoreError;

const MAGIC: &[u8; 8] = b"REDIS001";
const TRAILER: &[u8; 3] = b"EOF";

/// Encodes the engine's full key set into the snapshot blob, grouping
/// entries by database so each db's `key_count` header is correct.
pub fn encode(entries: Vec<(u32, Bytes, EncodedValue)>) -> Bytes {
    let mut by_db: BTreeMap<u32, Vec<(Bytes, EncodedValue)>> = BTreeMap::new();
    for (db_index, key, value) in entries {
        by_db.entry(db_index).or_default().push((key, value));
    }

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    for (db_index, keys) in by_db {
        buf.put_u32(db_index);
        buf.put_u32(keys.len() as u32);
        for (key, value) in keys {
            buf.put_u32(key.len() as u32);
            buf.put_slice(&key);
            buf.put_u8(value.value_type);
            buf.put_u32(value.encoded.len() as u32);
            buf.put_slice(&value.encoded);
            match value.expiry_nanos {
                Some(nanos) => {
                    buf.put_u8(1);
                    buf.put_i64(nanos);
                }
                None => buf.put_u8(0),
            }
        }
    }
    buf.put_slice(TRAILER);
    buf.freeze()
}

/// Decodes a snapshot blob back into `(db_index, key, value)` triples.
pub fn decode(mut data: &[u8]) -> Result<Vec<(u32, Bytes, EncodedValue)>, CoreError> {
    if data.len() < MAGIC.len() + TRAILER.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(CoreError::Protocol("bad snapshot magic".into()));
    }
    data.advance(MAGIC.len());
    let body_len = data.len() - TRAILER.len();
    if &data[body_len..] != TRAILER {
        return Err(CoreError::Protocol("bad snapshot trailer".into()));
    }
    let mut body = &data[..body_len];
    let mut out = Vec::new();

    while !body.is_empty() {
        if body.len() < 8 {
            return Err(CoreError::Protocol("truncated snapshot db header".into()));
        }
        let db_index = body.get_u32();
        let key_count = body.get_u32();
        for _ in 0..key_count {
            let key_len = require_u32(&mut body)? as usize;
            let key = Bytes::copy_from_slice(require_slice(&mut body, key_len)?);
            let value_type = require_u8(&mut body)?;
            let encoded_len = require_u32(&mut body)? as usize;
            let encoded = Bytes::copy_from_slice(require_slice(&mut body, encoded_len)?);
            let has_expiry = require_u8(&mut body)?;
            let expiry_nanos = if has_expiry != 0 {
                Some(require_i64(&mut body)?)
            } else {
                None
            };
            out.push((
                db_index,
                key,
                EncodedValue {
                    value_type,
                    encoded,
                    expiry_nanos,
                },
            ));
        }
    }
    Ok(out)
}

fn require_u8(body: &mut &[u8]) -> Result<u8, CoreError> {
    if body.is_empty() {
        return Err(CoreError::Protocol("truncated snapshot".into()));
    }
    Ok(body.get_u8())
}

fn require_u32(body: &mut &[u8]) -> Result<u32, CoreError> {
    if body.len() < 4 {
        return Err(CoreError::Protocol("truncated snapshot".into()));
    }
    Ok(body.get_u32())
}

fn require_i64(body: &mut &[u8]) -> Result<i64, CoreError> {
    if body.len() < 8 {
        return Err(CoreError::Protocol("truncated snapshot".into()));
    }
    Ok(body.get_i64())
}

fn require_slice<'a>(body: &mut &'a [u8], len: usize) -> Result<&'a [u8], CoreError> {
    if body.len() < len {
        return Err(CoreError::Protocol("truncated snapshot".into()));
    }
    let (head, rest) = body.split_at(len);
    *body = rest;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let entries = vec![
            (
                0u32,
                Bytes::from_static(b"key_42"),
                EncodedValue {
                    value_type: 0,
                    encoded: Bytes::from_static(b"value_42"),
                    expiry_nanos: None,
                },
            ),
            (
                1u32,
                Bytes::from_static(b"k2"),
                EncodedValue {
                    value_type: 0,
                    encoded: Bytes::from_static(b"v2"),
                    expiry_nanos: Some(123456789),
                },
            ),
        ];
        let blob = encode(entries.clone());
        assert!(blob.starts_with(MAGIC));
        assert!(blob.ends_with(TRAILER));
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.len(), entries.len());
        for (db_index, key, value) in &entries {
            let found = decoded
                .iter()
                .find(|(d, k, _)| d == db_index && k == key)
                .unwrap();
            assert_eq!(found.2.encoded, value.encoded);
            assert_eq!(found.2.expiry_nanos, value.expiry_nanos);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(decode(b"NOTMAGIC!EOF").is_err());
    }
}
