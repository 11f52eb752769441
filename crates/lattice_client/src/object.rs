//! Key identity and object payloads.
//!
//! Every operation in a transaction targets a `(table id, key hash)` pair.
//! The hash is not a perfect hash, so the full key bytes are kept alongside
//! the value in an `ObjectBuffer` and re-checked on lookup.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::{BufMut, Bytes, BytesMut};

/// Logical identifier for a table.
pub type TableId = u64;
/// 64-bit hash of a key, used for tablet routing and cache ordering.
pub type KeyHash = u64;

/// Hash a key for tablet routing and commit-cache ordering.
pub fn key_hash(key: &[u8]) -> KeyHash {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Materialised key+value payload for one cached operation.
///
/// Layout: `[ key_len: u16 LE ][ key bytes ][ value bytes ]`. Write ops ship
/// the whole buffer; read and remove ops ship only the key portion. The key
/// length is capped at `u16::MAX` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectBuffer {
    data: Bytes,
    key_len: u16,
}

impl ObjectBuffer {
    /// Build a buffer holding `key` followed by `value`.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        debug_assert!(key.len() <= usize::from(u16::MAX));
        let key_len = key.len() as u16;
        let mut data = BytesMut::with_capacity(2 + key.len() + value.len());
        data.put_u16_le(key_len);
        data.put_slice(key);
        data.put_slice(value);
        Self {
            data: data.freeze(),
            key_len,
        }
    }

    /// The key portion of the buffer.
    pub fn key(&self) -> &[u8] {
        &self.data[2..2 + usize::from(self.key_len)]
    }

    /// The value portion of the buffer (empty for key-only entries).
    pub fn value(&self) -> &[u8] {
        &self.data[2 + usize::from(self.key_len)..]
    }

    /// Total serialised size in bytes, as carried by a write op.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// The full serialised buffer.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}
