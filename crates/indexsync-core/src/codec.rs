//! Event Payload Codec
//!
//! Compact binary encoding of [`IndexingQueueEventPayload`], stored in the
//! `payload` column of every queued event.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────┬───────┬───────────────┬────────────────────┬──────────────────┐
//! │ version │ flags │ current route │ previous routes    │ dirty paths      │
//! │  u8     │  u8   │ [str] if flag │ n, (u8 tag [str])* │ n, str* if flag  │
//! └─────────┴───────┴───────────────┴────────────────────┴──────────────────┘
//!
//! str   = varint length + UTF-8 bytes
//! flags = bit 0: has dirtiness
//!         bit 1: force_self_dirty
//!         bit 2: force_containing_dirty
//!         bit 3: update_because_of_contained
//!         bit 4: current route has a routing key
//! ```
//!
//! The format is versioned by its first byte. Decoding never panics: every
//! malformed input maps to a [`CodecError`], and trailing bytes are rejected
//! so that a corrupted row cannot decode into a plausible-looking payload.

use crate::error::{CodecError, Result};
use crate::payload::{
    DirtinessDescriptor, DocumentRouteDescriptor, DocumentRoutesDescriptor,
    IndexingQueueEventPayload,
};
use crate::varint::{decode_len, decode_string, encode_bytes, encode_varint_u64};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

/// Current payload format version
pub const FORMAT_VERSION: u8 = 1;

const FLAG_HAS_DIRTINESS: u8 = 1 << 0;
const FLAG_FORCE_SELF_DIRTY: u8 = 1 << 1;
const FLAG_FORCE_CONTAINING_DIRTY: u8 = 1 << 2;
const FLAG_BECAUSE_OF_CONTAINED: u8 = 1 << 3;
const FLAG_CURRENT_ROUTED: u8 = 1 << 4;
const KNOWN_FLAGS: u8 = 0b0001_1111;

const ROUTE_UNROUTED: u8 = 0;
const ROUTE_ROUTED: u8 = 1;

/// Encode a payload to bytes.
pub fn encode(payload: &IndexingQueueEventPayload) -> Bytes {
    let mut buf = BytesMut::with_capacity(estimated_size(payload));

    let mut flags = 0u8;
    if let Some(dirtiness) = &payload.dirtiness {
        flags |= FLAG_HAS_DIRTINESS;
        if dirtiness.force_self_dirty {
            flags |= FLAG_FORCE_SELF_DIRTY;
        }
        if dirtiness.force_containing_dirty {
            flags |= FLAG_FORCE_CONTAINING_DIRTY;
        }
        if dirtiness.update_because_of_contained {
            flags |= FLAG_BECAUSE_OF_CONTAINED;
        }
    }
    if payload.routes.current_route.routing_key.is_some() {
        flags |= FLAG_CURRENT_ROUTED;
    }

    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(flags);

    if let Some(key) = &payload.routes.current_route.routing_key {
        encode_bytes(&mut buf, key.as_bytes());
    }

    encode_varint_u64(&mut buf, payload.routes.previous_routes.len() as u64);
    for route in &payload.routes.previous_routes {
        match &route.routing_key {
            Some(key) => {
                buf.put_u8(ROUTE_ROUTED);
                encode_bytes(&mut buf, key.as_bytes());
            }
            None => buf.put_u8(ROUTE_UNROUTED),
        }
    }

    if let Some(dirtiness) = &payload.dirtiness {
        encode_varint_u64(&mut buf, dirtiness.dirty_paths.len() as u64);
        for path in &dirtiness.dirty_paths {
            encode_bytes(&mut buf, path.as_bytes());
        }
    }

    buf.freeze()
}

/// Decode a payload previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<IndexingQueueEventPayload> {
    let mut buf = bytes;

    let version = read_u8(&mut buf, "version")?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let flags = read_u8(&mut buf, "flags")?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(CodecError::InvalidFlags(flags));
    }
    // Dirtiness override bits without dirtiness cannot come from `encode`
    if flags & FLAG_HAS_DIRTINESS == 0
        && flags & (FLAG_FORCE_SELF_DIRTY | FLAG_FORCE_CONTAINING_DIRTY | FLAG_BECAUSE_OF_CONTAINED)
            != 0
    {
        return Err(CodecError::InvalidFlags(flags));
    }

    let current_route = if flags & FLAG_CURRENT_ROUTED != 0 {
        DocumentRouteDescriptor::of(decode_string(&mut buf, "current route")?)
    } else {
        DocumentRouteDescriptor::unrouted()
    };

    // Each previous route takes at least one byte, which bounds the count
    let route_count = decode_len(&mut buf)?;
    let mut previous_routes = Vec::with_capacity(route_count);
    for _ in 0..route_count {
        let route = match read_u8(&mut buf, "route tag")? {
            ROUTE_UNROUTED => DocumentRouteDescriptor::unrouted(),
            ROUTE_ROUTED => DocumentRouteDescriptor::of(decode_string(&mut buf, "previous route")?),
            other => return Err(CodecError::InvalidFlags(other)),
        };
        previous_routes.push(route);
    }

    let dirtiness = if flags & FLAG_HAS_DIRTINESS != 0 {
        let path_count = decode_len(&mut buf)?;
        let mut dirty_paths = BTreeSet::new();
        for _ in 0..path_count {
            dirty_paths.insert(decode_string(&mut buf, "dirty path")?);
        }
        Some(DirtinessDescriptor {
            dirty_paths,
            force_self_dirty: flags & FLAG_FORCE_SELF_DIRTY != 0,
            force_containing_dirty: flags & FLAG_FORCE_CONTAINING_DIRTY != 0,
            update_because_of_contained: flags & FLAG_BECAUSE_OF_CONTAINED != 0,
        })
    } else {
        None
    };

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }

    Ok(IndexingQueueEventPayload {
        routes: DocumentRoutesDescriptor {
            current_route,
            previous_routes,
        },
        dirtiness,
    })
}

fn read_u8(buf: &mut &[u8], field: &'static str) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(CodecError::Truncated(field));
    }
    Ok(buf.get_u8())
}

/// Estimate the encoded size of a payload in bytes
fn estimated_size(payload: &IndexingQueueEventPayload) -> usize {
    let route_len = |route: &DocumentRouteDescriptor| {
        1 + route.routing_key.as_ref().map(|k| k.len() + 2).unwrap_or(0)
    };
    2 + route_len(&payload.routes.current_route)
        + payload.routes.previous_routes.iter().map(route_len).sum::<usize>()
        + payload
            .dirtiness
            .as_ref()
            .map(|d| 2 + d.dirty_paths.iter().map(|p| p.len() + 2).sum::<usize>())
            .unwrap_or(0)
}
