// THEORY:
// The `ChunkedTransport` moves one arbitrarily large payload between two endpoints
// over a fabric whose messages are capped at `max_fragment_size`.
//
// Wire protocol for one transfer with id `T`:
// 1.  **Header**: the sender sends a 12-byte envelope `{u64 length, u32 chunk_count}`
//     (little-endian) tagged `T`. The receiver waits for it and allocates a buffer of
//     exactly `length` bytes.
// 2.  **Fragments**: the sender issues `chunk_count` sends concurrently; fragment `i`
//     covers `[i * max, min((i + 1) * max, length))` and is tagged `T + 1 + i`. The
//     receiver posts all fragment receives at once and copies fragment `i` to offset
//     `i * max`, so arrival order never matters.
// 3.  **Verification**: a chunk count that does not match the length, or a fragment
//     of the wrong size, is a `TransferError`. So is a header or fragment that does
//     not arrive within its timeout. Nothing is retried; the pass fails.
//
// Fragments are `Bytes` slices of the sender's buffer, which is never touched again
// once handed over, so fragmenting copies nothing on the sending side.

use crate::config::TransportConfig;
use crate::fabric::{Fabric, FabricError, Rank, Tag};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const ENVELOPE_LEN: usize = 12;
const KIND_SHIFT: u32 = 56;
const SLOT_SHIFT: u32 = 32;
/// Fragments of one transfer live in the low 32 bits of its tag.
const MAX_FRAGMENTS: u64 = (1 << SLOT_SHIFT) - 1;
const MAX_SLOT: u32 = (1 << (KIND_SHIFT - SLOT_SHIFT)) - 1;

/// What a transfer carries. Keeps tag ranges of different traffic apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferKind {
    /// The one overlapping frame an endpoint needs from its predecessor.
    Boundary = 1,
    /// A delivery header announcing an endpoint's results.
    Delivery = 2,
    /// One encoded diff frame.
    Result = 3,
}

/// Base tag of one logical transfer. Header uses the id itself, fragment `i` uses `id + 1 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

impl TransferId {
    /// `slot` distinguishes transfers of the same kind (a rank, a frame index).
    pub fn new(kind: TransferKind, slot: usize) -> Result<Self, TransferError> {
        let slot = u32::try_from(slot)
            .ok()
            .filter(|slot| *slot <= MAX_SLOT)
            .ok_or(TransferError::SlotOutOfRange(slot))?;
        Ok(Self(((kind as u64) << KIND_SHIFT) | ((slot as u64) << SLOT_SHIFT)))
    }

    pub fn header(&self) -> Tag {
        Tag(self.0)
    }

    pub fn fragment(&self, index: u64) -> Tag {
        Tag(self.0 + 1 + index)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error("timed out after {timeout:?} waiting for {what} from endpoint {source_rank}")]
    Timeout {
        what: String,
        source_rank: Rank,
        timeout: Duration,
    },
    #[error("malformed transfer envelope of {0} bytes")]
    MalformedEnvelope(usize),
    #[error("envelope declares {declared} chunks for {length} bytes, expected {expected}")]
    ChunkCountMismatch {
        length: u64,
        declared: u32,
        expected: u64,
    },
    #[error("fragment {index} is {actual} bytes, expected {expected}")]
    FragmentLengthMismatch {
        index: u64,
        expected: usize,
        actual: usize,
    },
    #[error("payload of {0} bytes needs more fragments than one transfer can carry")]
    PayloadTooLarge(usize),
    #[error("transfer slot {0} out of range")]
    SlotOutOfRange(usize),
    #[error("malformed {what} from endpoint {source_rank}: {detail}")]
    Malformed {
        what: &'static str,
        source_rank: Rank,
        detail: String,
    },
}

/// `{totalLength, chunkCount}` header of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEnvelope {
    pub total_length: u64,
    pub chunk_count: u32,
}

impl TransferEnvelope {
    pub fn for_payload(len: usize, max_fragment_size: usize) -> Result<Self, TransferError> {
        let chunks = len.div_ceil(max_fragment_size) as u64;
        if chunks > MAX_FRAGMENTS {
            return Err(TransferError::PayloadTooLarge(len));
        }
        Ok(Self {
            total_length: len as u64,
            chunk_count: chunks as u32,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(ENVELOPE_LEN);
        out.extend_from_slice(&self.total_length.to_le_bytes());
        out.extend_from_slice(&self.chunk_count.to_le_bytes());
        out.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        let (length, count) = bytes
            .split_first_chunk::<8>()
            .and_then(|(length, rest)| Some((length, <[u8; 4]>::try_from(rest).ok()?)))
            .ok_or(TransferError::MalformedEnvelope(bytes.len()))?;
        Ok(Self {
            total_length: u64::from_le_bytes(*length),
            chunk_count: u32::from_le_bytes(count),
        })
    }

    /// Byte range of fragment `index` for a given fragment size.
    fn fragment_range(&self, index: u64, max_fragment_size: usize) -> std::ops::Range<usize> {
        let start = index as usize * max_fragment_size;
        let end = (start + max_fragment_size).min(self.total_length as usize);
        start..end
    }
}

/// Chunked send/receive on top of any `Fabric`.
pub struct ChunkedTransport<'a, F: Fabric + ?Sized> {
    fabric: &'a F,
    fragment_timeout: Duration,
    header_timeout: Duration,
}

impl<'a, F: Fabric + ?Sized> ChunkedTransport<'a, F> {
    pub fn new(fabric: &'a F, config: &TransportConfig) -> Self {
        Self {
            fabric,
            fragment_timeout: config.fragment_timeout,
            header_timeout: config.rendezvous_timeout,
        }
    }

    pub async fn send(&self, payload: Bytes, dest: Rank, id: TransferId) -> Result<(), TransferError> {
        let max = self.fabric.max_fragment_size();
        let envelope = TransferEnvelope::for_payload(payload.len(), max)?;
        debug!(
            to = dest,
            bytes = envelope.total_length,
            chunks = envelope.chunk_count,
            "sending chunked payload"
        );

        self.fabric.send(dest, id.header(), envelope.encode()).await?;

        let sends = (0..envelope.chunk_count as u64).map(|index| {
            let fragment = payload.slice(envelope.fragment_range(index, max));
            self.fabric.send(dest, id.fragment(index), fragment)
        });
        try_join_all(sends).await?;
        Ok(())
    }

    pub async fn receive(&self, source: Rank, id: TransferId) -> Result<Bytes, TransferError> {
        let max = self.fabric.max_fragment_size();
        let header = tokio::time::timeout(self.header_timeout, self.fabric.recv(source, id.header()))
            .await
            .map_err(|_| TransferError::Timeout {
                what: "transfer header".to_string(),
                source_rank: source,
                timeout: self.header_timeout,
            })??;
        let envelope = TransferEnvelope::decode(&header)?;

        let expected = (envelope.total_length as usize).div_ceil(max) as u64;
        if u64::from(envelope.chunk_count) != expected {
            return Err(TransferError::ChunkCountMismatch {
                length: envelope.total_length,
                declared: envelope.chunk_count,
                expected,
            });
        }

        let receives = (0..expected).map(|index| async move {
            let fragment = tokio::time::timeout(self.fragment_timeout, self.fabric.recv(source, id.fragment(index)))
                .await
                .map_err(|_| TransferError::Timeout {
                    what: format!("fragment {index}/{expected}"),
                    source_rank: source,
                    timeout: self.fragment_timeout,
                })??;
            Ok::<_, TransferError>((index, fragment))
        });
        let fragments = try_join_all(receives).await?;

        let mut buffer = BytesMut::zeroed(envelope.total_length as usize);
        for (index, fragment) in fragments {
            let range = envelope.fragment_range(index, max);
            if fragment.len() != range.len() {
                return Err(TransferError::FragmentLengthMismatch {
                    index,
                    expected: range.len(),
                    actual: fragment.len(),
                });
            }
            buffer[range].copy_from_slice(&fragment);
        }
        debug!(from = source, bytes = envelope.total_length, "received chunked payload");
        Ok(buffer.freeze())
    }
}
