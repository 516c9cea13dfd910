//! IndexSync Core
//!
//! Data model and binary codecs shared by every IndexSync crate:
//!
//! - [`payload`]: the dirtiness/routing payload carried by each queued event
//! - [`codec`]: compact, versioned binary encoding of that payload
//! - [`shard`]: entity hashing, shard assignments and their hash ranges
//! - [`varint`]: LEB128 varints used by both codecs

pub mod codec;
pub mod error;
pub mod payload;
pub mod shard;
pub mod varint;

pub use error::{CodecError, Result};
pub use payload::{
    DirtinessDescriptor, DocumentRouteDescriptor, DocumentRoutesDescriptor,
    IndexingQueueEventPayload,
};
pub use shard::{entity_id_hash, HashRange, ShardAssignment};
