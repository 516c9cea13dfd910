//! Shard Keys and Assignments
//!
//! Every queued event carries a 32-bit hash of its entity id. The hash space
//! `[0, 2^32)` is split into `total_shard_count` contiguous ranges, and an
//! agent that owns shard `i` drains exactly the events whose hash falls in
//! range `i`.
//!
//! ## Hash
//! 32-bit FNV-1a over the UTF-8 bytes of the entity id. Producers and every
//! consumer compute it in different processes and must agree bit for bit.
//!
//! ## Example
//! ```ignore
//! let hash = entity_id_hash("book-42");
//! let assignment = ShardAssignment::new(1, 3).unwrap();
//! if assignment.hash_range().contains(hash) {
//!     // this agent drains the event
//! }
//! ```

use crate::error::{CodecError, Result};
use crate::varint::{decode_varint_u64, encode_varint_u64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Size of the entity hash space (2^32)
pub const HASH_SPACE: u64 = 1 << 32;

/// Hash an entity id to its shard key (32-bit FNV-1a over UTF-8 bytes).
pub fn entity_id_hash(entity_id: &str) -> u32 {
    entity_id.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ *byte as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Half-open range `[start, end)` of entity hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u64,
    pub end: u64,
}

impl HashRange {
    pub fn contains(&self, hash: u32) -> bool {
        let hash = hash as u64;
        self.start <= hash && hash < self.end
    }

    /// The whole hash space
    pub fn full() -> Self {
        Self {
            start: 0,
            end: HASH_SPACE,
        }
    }
}

/// One shard out of `total_shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard_index: u32,
    pub total_shard_count: u32,
}

impl ShardAssignment {
    /// Returns `None` unless `shard_index < total_shard_count`.
    pub fn new(shard_index: u32, total_shard_count: u32) -> Option<Self> {
        (shard_index < total_shard_count).then_some(Self {
            shard_index,
            total_shard_count,
        })
    }

    /// Range of entity hashes owned by this shard.
    ///
    /// Ranges of all shards of the same total are contiguous, disjoint and
    /// cover the whole hash space.
    pub fn hash_range(&self) -> HashRange {
        let total = self.total_shard_count as u64;
        let index = self.shard_index as u64;
        HashRange {
            start: index * HASH_SPACE / total,
            end: (index + 1) * HASH_SPACE / total,
        }
    }
}

impl std::fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.shard_index, self.total_shard_count)
    }
}

const ASSIGNMENT_PAYLOAD_VERSION: u8 = 1;

/// Encode the assignment an agent is draining into its opaque row payload.
pub fn encode_assignment_payload(assignment: Option<ShardAssignment>) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(ASSIGNMENT_PAYLOAD_VERSION);
    match assignment {
        Some(assignment) => {
            buf.put_u8(1);
            encode_varint_u64(&mut buf, assignment.shard_index as u64);
            encode_varint_u64(&mut buf, assignment.total_shard_count as u64);
        }
        None => buf.put_u8(0),
    }
    buf.freeze()
}

/// Decode an agent row payload written by [`encode_assignment_payload`].
pub fn decode_assignment_payload(bytes: &[u8]) -> Result<Option<ShardAssignment>> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated("assignment header"));
    }
    let version = buf.get_u8();
    if version != ASSIGNMENT_PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let assignment = match buf.get_u8() {
        0 => None,
        1 => {
            let index = decode_u32(&mut buf)?;
            let total = decode_u32(&mut buf)?;
            Some(ShardAssignment::new(index, total).ok_or(CodecError::InvalidFlags(1))?)
        }
        other => return Err(CodecError::InvalidFlags(other)),
    };

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(assignment)
}

fn decode_u32(buf: &mut &[u8]) -> Result<u32> {
    let value = decode_varint_u64(buf)?;
    u32::try_from(value).map_err(|_| CodecError::VarintOverflow)
}
