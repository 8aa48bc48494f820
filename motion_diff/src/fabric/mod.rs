// THEORY:
// The `Fabric` is the message-passing substrate the endpoints of a pass talk over.
// It is deliberately small: point-to-point tagged send/receive, a collective
// broadcast, a collective barrier, and the largest payload one message may carry.
// Everything above it (the chunked transport, manifest distribution, result
// delivery) is written against this trait, so the backing can be in-process
// channels, sockets or an RPC layer without touching the coordinator or the engine.
//
// Contract for implementors:
// 1.  **Tag Matching**: a `recv(source, tag)` only ever completes with a message
//     sent by `source` with exactly `tag`. Messages with the same `(source, tag)`
//     are delivered in send order.
// 2.  **Fragment Limit**: `send` rejects payloads larger than `max_fragment_size`.
//     Collectives handle their own framing and are not subject to it.
// 3.  **Collective Order**: every endpoint issues broadcasts and barriers in the
//     same order. Tags at or above `Tag::COLLECTIVE_BASE` belong to collectives.

pub mod local;
pub mod transport;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Identity of an endpoint, `0..size`.
pub type Rank = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl Tag {
    /// First tag reserved for collectives.
    pub const COLLECTIVE_BASE: u64 = 1 << 63;

    pub fn is_collective(&self) -> bool {
        self.0 >= Self::COLLECTIVE_BASE
    }
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("message of {len} bytes exceeds the fragment limit of {limit} bytes")]
    Oversized { len: usize, limit: usize },
    #[error("no endpoint with rank {0}")]
    UnknownRank(Rank),
    #[error("tag {0:?} is reserved for collectives")]
    ReservedTag(Tag),
    #[error("broadcast root {0} did not supply a payload")]
    MissingBroadcastPayload(Rank),
}

#[async_trait]
pub trait Fabric: Send + Sync {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of endpoints in the pass. Fixed for the whole run.
    fn size(&self) -> usize;

    /// Largest payload a single point-to-point message may carry.
    fn max_fragment_size(&self) -> usize;

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<(), FabricError>;

    /// Suspends until a message from `source` tagged `tag` arrives.
    async fn recv(&self, source: Rank, tag: Tag) -> Result<Bytes, FabricError>;

    /// The root passes `Some(payload)`; every endpoint, root included, gets it back.
    async fn broadcast(&self, root: Rank, payload: Option<Bytes>) -> Result<Bytes, FabricError>;

    /// Suspends until every endpoint has entered the barrier.
    async fn barrier(&self) -> Result<(), FabricError>;
}
