//! Reserved key layout.
//!
//! Everything the engine persists lives under one of these prefixes:
//!
//! ```text
//! /<collectionID>/v/<dockey>/<fieldID>   materialized field value
//! /<collectionID>/p/<dockey>/<fieldID>   merge priority + tie-breaker for that value
//! /blocks/<multihash>                    raw commit blocks
//! /heads/<dockey>/<field>/<cid>          head markers (field name, or "C" for composite)
//! /schema/collection/<name>              collection descriptions
//! /system/seq/collection                 collection id counter
//! ```
//!
//! Keys are ASCII and sort lexicographically; range scans are half-open
//! `[prefix, prefix_end)`.

use cid::Cid;
use smallvec::SmallVec;

/// Field-id stand-in for the document-level composite series.
pub const COMPOSITE_FIELD: &str = "C";

pub const BLOCKS_PREFIX: &str = "/blocks/";
pub const HEADS_PREFIX: &str = "/heads/";
pub const SCHEMA_COLLECTION_PREFIX: &str = "/schema/collection/";
pub const SYSTEM_COLLECTION_SEQ: &str = "/system/seq/collection";

/// Short stack-allocated key buffer, most keys fit without spilling.
pub type Key = SmallVec<[u8; 64]>;

fn key_from(parts: &[&str]) -> Key {
    let mut key = Key::new();
    for part in parts {
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// `/<collection>/v/<dockey>/<fieldID>`
pub fn value_key(collection_id: u32, dockey: &str, field_id: u32) -> Key {
    key_from(&[
        "/",
        &collection_id.to_string(),
        "/v/",
        dockey,
        "/",
        &field_id.to_string(),
    ])
}

/// `/<collection>/v/` — every materialized value in the collection.
pub fn collection_value_prefix(collection_id: u32) -> Key {
    key_from(&["/", &collection_id.to_string(), "/v/"])
}

/// `/<collection>/v/<dockey>/` — every materialized value of one document.
pub fn doc_value_prefix(collection_id: u32, dockey: &str) -> Key {
    key_from(&["/", &collection_id.to_string(), "/v/", dockey, "/"])
}

/// `/<collection>/p/<dockey>/<fieldID>`
pub fn priority_key(collection_id: u32, dockey: &str, field_id: u32) -> Key {
    key_from(&[
        "/",
        &collection_id.to_string(),
        "/p/",
        dockey,
        "/",
        &field_id.to_string(),
    ])
}

/// Priority slot for the composite series of a document.
pub fn composite_priority_key(collection_id: u32, dockey: &str) -> Key {
    key_from(&["/", &collection_id.to_string(), "/p/", dockey, "/", COMPOSITE_FIELD])
}

/// Materialized document status (active or tombstoned).
pub fn composite_value_key(collection_id: u32, dockey: &str) -> Key {
    key_from(&["/", &collection_id.to_string(), "/v/", dockey, "/", COMPOSITE_FIELD])
}

/// `/blocks/<multihash>` — multihash digest rendered as lowercase hex.
pub fn block_key(cid: &Cid) -> Key {
    let mut key = key_from(&[BLOCKS_PREFIX]);
    let digest = cid.hash().to_bytes();
    let mut buf = [0u8; 2];
    for byte in digest {
        hex_byte(byte, &mut buf);
        key.extend_from_slice(&buf);
    }
    key
}

fn hex_byte(byte: u8, out: &mut [u8; 2]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out[0] = HEX[(byte >> 4) as usize];
    out[1] = HEX[(byte & 0x0f) as usize];
}

/// `/heads/<dockey>/<field>/<cid>`
pub fn head_key(dockey: &str, field: &str, cid: &Cid) -> Key {
    key_from(&[HEADS_PREFIX, dockey, "/", field, "/", &cid.to_string()])
}

/// `/heads/<dockey>/<field>/` — all current heads of one series.
pub fn head_prefix(dockey: &str, field: &str) -> Key {
    key_from(&[HEADS_PREFIX, dockey, "/", field, "/"])
}

/// `/schema/collection/<name>`
pub fn collection_description_key(name: &str) -> Key {
    key_from(&[SCHEMA_COLLECTION_PREFIX, name])
}

/// Exclusive upper bound of a prefix scan: the prefix with its last
/// non-`0xff` byte incremented and the tail truncated. `None` means the
/// prefix has no upper bound (all bytes `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == 0xff {
            end.pop();
        } else {
            *last += 1;
            return Some(end);
        }
    }
    None
}

/// Splits a materialized-value key back into `(dockey, field_id)`.
///
/// `key` must start with `collection_value_prefix(collection_id)`.
pub fn split_value_key<'a>(collection_id: u32, key: &'a [u8]) -> Option<(&'a str, &'a str)> {
    let prefix = collection_value_prefix(collection_id);
    let rest = key.strip_prefix(prefix.as_slice())?;
    let rest = std::str::from_utf8(rest).ok()?;
    let (dockey, field) = rest.split_once('/')?;
    Some((dockey, field))
}
