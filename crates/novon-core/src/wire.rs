//! novon segment wire format: how one media segment becomes many messages.
//!
//! A segment is split into chunks of at most `max_chunk_size` payload bytes.
//! Every chunk is prefixed with a fixed 12-byte little-endian header:
//!
//! ```text
//!  0               4               8               12
//!  +---------------+---------------+---------------+-------------...
//!  |  segment_id   |  chunk_index  | total_chunks  |  payload
//!  +---------------+---------------+---------------+-------------...
//! ```
//!
//! Chunks of one segment may arrive in any order and more than once. A
//! receiver groups by `segment_id`, sorts by `chunk_index` and concatenates
//! the payloads once `total_chunks` distinct indices are present.
//!
//! Changing anything in `ChunkHeader` breaks every deployed viewer.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Header carried in front of every chunk payload.
///
/// Wire size: 12 bytes, all fields little-endian.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChunkHeader {
    /// Segment this chunk belongs to. Monotonic per stream, starts at 0.
    pub segment_id: U32<LittleEndian>,
    /// Position of this chunk within the segment. Always `< total_chunks`.
    pub chunk_index: U32<LittleEndian>,
    /// Number of chunks the segment was split into.
    pub total_chunks: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkHeader, [u8; 12]);

impl ChunkHeader {
    pub fn new(segment_id: u32, chunk_index: u32, total_chunks: u32) -> Self {
        Self {
            segment_id: U32::new(segment_id),
            chunk_index: U32::new(chunk_index),
            total_chunks: U32::new(total_chunks),
        }
    }

    /// Read a header from the front of a framed chunk.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        let header =
            ChunkHeader::read_from_prefix(frame).ok_or(WireError::TooShort(frame.len()))?;
        if header.chunk_index.get() >= header.total_chunks.get() {
            return Err(WireError::IndexOutOfRange {
                index: header.chunk_index.get(),
                total: header.total_chunks.get(),
            });
        }
        Ok(header)
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of `ChunkHeader` on the wire.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Default maximum payload bytes per chunk. Header + payload stays below
/// the overlay's per-message ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 64_000;

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// One framed piece of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub segment_id: u32,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
}

impl Chunk {
    /// Header followed by payload, ready to hand to the overlay.
    pub fn encode(&self) -> Bytes {
        let header = ChunkHeader::new(self.segment_id, self.chunk_index, self.total_chunks);
        let mut frame = BytesMut::with_capacity(CHUNK_HEADER_LEN + self.payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&self.payload);
        frame.freeze()
    }

    /// Parse a framed chunk received from the overlay.
    pub fn decode(frame: Bytes) -> Result<Self, WireError> {
        let header = ChunkHeader::parse(&frame)?;
        Ok(Self {
            segment_id: header.segment_id.get(),
            chunk_index: header.chunk_index.get(),
            total_chunks: header.total_chunks.get(),
            payload: frame.slice(CHUNK_HEADER_LEN..),
        })
    }
}

/// Split a segment into chunks of at most `max_chunk_size` payload bytes.
///
/// Capacity is reserved for `len / max_chunk_size + 1` chunks, but iteration
/// stops as soon as the segment is exhausted, so an exact multiple never
/// produces a trailing empty chunk. An empty segment yields no chunks.
pub fn split(segment: &[u8], max_chunk_size: usize, segment_id: u32) -> Result<Vec<Chunk>, WireError> {
    if max_chunk_size == 0 {
        return Err(WireError::InvalidArgument("max_chunk_size must be positive"));
    }

    let total = segment.len().div_ceil(max_chunk_size);
    let total_chunks =
        u32::try_from(total).map_err(|_| WireError::SegmentTooLarge(segment.len()))?;

    let mut chunks = Vec::with_capacity(segment.len() / max_chunk_size + 1);
    let source = Bytes::copy_from_slice(segment);
    let mut offset = 0;
    let mut chunk_index = 0u32;

    while offset < source.len() {
        let end = (offset + max_chunk_size).min(source.len());
        chunks.push(Chunk {
            segment_id,
            chunk_index,
            total_chunks,
            payload: source.slice(offset..end),
        });
        offset = end;
        chunk_index += 1;
    }

    Ok(chunks)
}

/// `split`, then frame every chunk for sending.
pub fn split_framed(
    segment: &[u8],
    max_chunk_size: usize,
    segment_id: u32,
) -> Result<Vec<Bytes>, WireError> {
    Ok(split(segment, max_chunk_size, segment_id)?
        .iter()
        .map(Chunk::encode)
        .collect())
}

// ── Reassembly ────────────────────────────────────────────────────────────────

struct PendingSegment {
    total_chunks: u32,
    parts: BTreeMap<u32, Bytes>,
}

/// Receiver-side reassembly of chunked segments.
///
/// Duplicate chunks (redundant sub-address deliveries) are ignored.
#[derive(Default)]
pub struct SegmentAssembler {
    pending: BTreeMap<u32, PendingSegment>,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk. Returns `(segment_id, bytes)` once the segment is complete.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<(u32, Bytes)>, WireError> {
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(WireError::IndexOutOfRange {
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }

        let entry = self
            .pending
            .entry(chunk.segment_id)
            .or_insert_with(|| PendingSegment {
                total_chunks: chunk.total_chunks,
                parts: BTreeMap::new(),
            });

        if entry.total_chunks != chunk.total_chunks {
            return Err(WireError::TotalMismatch {
                segment_id: chunk.segment_id,
                expected: entry.total_chunks,
                got: chunk.total_chunks,
            });
        }

        entry.parts.entry(chunk.chunk_index).or_insert(chunk.payload);
        if entry.parts.len() < entry.total_chunks as usize {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(&chunk.segment_id) else {
            return Ok(None);
        };
        let len = done.parts.values().map(Bytes::len).sum();
        let mut segment = BytesMut::with_capacity(len);
        for part in done.parts.values() {
            segment.extend_from_slice(part);
        }
        Ok(Some((chunk.segment_id, segment.freeze())))
    }

    /// Number of segments with chunks still missing.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop incomplete segments older than `segment_id`.
    pub fn discard_before(&mut self, segment_id: u32) {
        self.pending.retain(|id, _| *id >= segment_id);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when producing or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("frame of {0} bytes is shorter than its header")]
    TooShort(usize),

    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("segment {segment_id} announced {expected} chunks, chunk claims {got}")]
    TotalMismatch {
        segment_id: u32,
        expected: u32,
        got: u32,
    },

    #[error("segment of {0} bytes needs more than u32::MAX chunks")]
    SegmentTooLarge(usize),

    #[error("unknown payload kind: 0x{0:02x}")]
    UnknownPayloadKind(u8),

    #[error("payload of {0} bytes exceeds the datagram limit")]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
