//! Entity stream produced by agents.
//!
//! Each entity is encoded as `key_len: u32 BE | key (UTF-8) | data_len: i32 BE | data`.
//! A `data_len` of `-1` marks the key as deleted and carries no data.

use crate::utils::PayloadError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Start of the code point range reserved for the engine's own bookkeeping keys.
pub const RESERVED_KEY_START: char = '\u{FF00}';

const DELETED: i32 = -1;

/// Keys starting in the reserved range, or containing the delimiter anywhere, are rejected.
pub fn is_reserved_key(key: &str) -> bool {
    key.chars().next().is_some_and(|c| c >= RESERVED_KEY_START) || key.contains(RESERVED_KEY_START)
}

/// Data sink handed to an agent for one `on_backup` call.
#[derive(Debug)]
pub struct PayloadWriter {
    buf: BytesMut,
    transport_flags: u32,
    quota: Option<u64>,
    entities: usize,
}

impl PayloadWriter {
    pub fn new(transport_flags: u32, quota: Option<u64>) -> Self {
        Self {
            buf: BytesMut::new(),
            transport_flags,
            quota,
            entities: 0,
        }
    }

    /// Flags advertised by the transport for this invocation
    pub fn transport_flags(&self) -> u32 {
        self.transport_flags
    }

    /// Advisory upper bound for the payload size, `None` when unbounded
    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    /// Fails without writing anything when the key or data exceeds its length prefix.
    pub fn write_entity(&mut self, key: &str, data: &[u8]) -> Result<(), PayloadError> {
        let key_len = key_len(key)?;
        let data_len = data_len(key, data.len())?;
        self.put_key(key_len, key);
        self.buf.put_i32(data_len);
        self.buf.put_slice(data);
        self.entities += 1;
        Ok(())
    }

    pub fn write_deletion(&mut self, key: &str) -> Result<(), PayloadError> {
        let key_len = key_len(key)?;
        self.put_key(key_len, key);
        self.buf.put_i32(DELETED);
        self.entities += 1;
        Ok(())
    }

    fn put_key(&mut self, key_len: u32, key: &str) {
        self.buf.put_u32(key_len);
        self.buf.put_slice(key.as_bytes());
    }

    pub fn entity_count(&self) -> usize {
        self.entities
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

fn key_len(key: &str) -> Result<u32, PayloadError> {
    u32::try_from(key.len()).map_err(|_| PayloadError::TooLarge {
        key: key.chars().take(32).collect(),
        len: key.len(),
    })
}

fn data_len(key: &str, len: usize) -> Result<i32, PayloadError> {
    i32::try_from(len).map_err(|_| PayloadError::TooLarge {
        key: key.to_string(),
        len,
    })
}

/// Buffer receiving the agent's new state blob.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

impl std::io::Write for StateWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub key: String,
    /// `None` for a deletion marker
    pub data: Option<Bytes>,
}

/// Decode a full entity stream.
pub fn decode(payload: &Bytes) -> Result<Vec<Entity>, PayloadError> {
    let total = payload.len();
    let mut cur = payload.clone();
    let mut entities = Vec::new();

    while cur.has_remaining() {
        let offset = total - cur.remaining();
        if cur.remaining() < 4 {
            return Err(PayloadError::Truncated(offset));
        }
        let key_len = cur.get_u32() as usize;
        if cur.remaining() < key_len + 4 {
            return Err(PayloadError::Truncated(offset));
        }
        let key_bytes = cur.split_to(key_len);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| PayloadError::InvalidKey(offset))?;

        let data_len = cur.get_i32();
        let data = if data_len == DELETED {
            None
        } else {
            let data_len = usize::try_from(data_len).map_err(|_| PayloadError::Truncated(offset))?;
            if cur.remaining() < data_len {
                return Err(PayloadError::Truncated(offset));
            }
            Some(cur.split_to(data_len))
        };

        entities.push(Entity { key, data });
    }

    Ok(entities)
}

/// Check a payload before it is handed to the transport. Returns the entity count.
pub fn validate(payload: &Bytes) -> Result<usize, PayloadError> {
    let entities = decode(payload)?;
    if let Some(bad) = entities.iter().find(|e| is_reserved_key(&e.key)) {
        return Err(PayloadError::ReservedKey(bad.key.clone()));
    }
    Ok(entities.len())
}
