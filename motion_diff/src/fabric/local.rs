// THEORY:
// `LocalFabric` backs the `Fabric` trait with in-process mailboxes, one per endpoint,
// so a whole cluster can run as tokio tasks inside a single process. Every endpoint
// holds a handle to all mailboxes; sending means pushing into the destination's
// mailbox, receiving means waiting on your own.
//
// A mailbox is a map from `(source, tag)` to a FIFO of payloads plus a `Notify` that
// wakes every waiter when anything arrives. Waiters re-check their own key, so a
// wake-up for someone else's message costs one map lookup.
//
// Sends are eager: they never wait for the receiver. Receives, broadcasts (for
// non-roots) and barriers are the suspension points.
//
// Collectives run over the reserved tag space. Each endpoint numbers its collectives
// with a local counter; because all endpoints issue collectives in the same order,
// the counters agree without any coordination.

use crate::fabric::{Fabric, FabricError, Rank, Tag};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

const BARRIER_ROOT: Rank = 0;

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(Rank, Tag), VecDeque<Bytes>>>,
    arrived: Notify,
}

impl Mailbox {
    fn deliver(&self, source: Rank, tag: Tag, payload: Bytes) {
        {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            queues.entry((source, tag)).or_default().push_back(payload);
        }
        self.arrived.notify_waiters();
    }

    fn take(&self, source: Rank, tag: Tag) -> Option<Bytes> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.get_mut(&(source, tag))?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&(source, tag));
        }
        payload
    }

    async fn wait_for(&self, source: Rank, tag: Tag) -> Bytes {
        loop {
            // Register interest before checking, so a delivery between the check
            // and the await still wakes us.
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.take(source, tag) {
                return payload;
            }
            notified.await;
        }
    }
}

/// One endpoint's handle onto an in-process cluster.
pub struct LocalFabric {
    rank: Rank,
    max_fragment_size: usize,
    mailboxes: Arc<[Mailbox]>,
    collective_seq: AtomicU64,
}

impl LocalFabric {
    /// Creates `size` connected endpoints, indexed by rank.
    pub fn cluster(size: usize, max_fragment_size: usize) -> Vec<LocalFabric> {
        let mailboxes: Arc<[Mailbox]> = (0..size).map(|_| Mailbox::default()).collect();
        (0..size)
            .map(|rank| LocalFabric {
                rank,
                max_fragment_size: max_fragment_size.max(1),
                mailboxes: Arc::clone(&mailboxes),
                collective_seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn mailbox(&self, rank: Rank) -> Result<&Mailbox, FabricError> {
        self.mailboxes.get(rank).ok_or(FabricError::UnknownRank(rank))
    }

    fn next_collective(&self) -> u64 {
        self.collective_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn collective_tag(seq: u64, phase: u64) -> Tag {
        Tag(Tag::COLLECTIVE_BASE | (seq << 1) | phase)
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> Result<(), FabricError> {
        if tag.is_collective() {
            return Err(FabricError::ReservedTag(tag));
        }
        if payload.len() > self.max_fragment_size {
            return Err(FabricError::Oversized {
                len: payload.len(),
                limit: self.max_fragment_size,
            });
        }
        trace!(from = self.rank, to = dest, tag = tag.0, len = payload.len(), "send");
        self.mailbox(dest)?.deliver(self.rank, tag, payload);
        Ok(())
    }

    async fn recv(&self, source: Rank, tag: Tag) -> Result<Bytes, FabricError> {
        if tag.is_collective() {
            return Err(FabricError::ReservedTag(tag));
        }
        self.mailbox(source)?;
        Ok(self.mailbox(self.rank)?.wait_for(source, tag).await)
    }

    async fn broadcast(&self, root: Rank, payload: Option<Bytes>) -> Result<Bytes, FabricError> {
        self.mailbox(root)?;
        let tag = Self::collective_tag(self.next_collective(), 0);

        if self.rank != root {
            return Ok(self.mailbox(self.rank)?.wait_for(root, tag).await);
        }

        let payload = payload.ok_or(FabricError::MissingBroadcastPayload(root))?;
        for (rank, mailbox) in self.mailboxes.iter().enumerate() {
            if rank != root {
                mailbox.deliver(root, tag, payload.clone());
            }
        }
        Ok(payload)
    }

    async fn barrier(&self) -> Result<(), FabricError> {
        let seq = self.next_collective();
        let arrive = Self::collective_tag(seq, 0);
        let release = Self::collective_tag(seq, 1);
        let own = self.mailbox(self.rank)?;

        if self.rank == BARRIER_ROOT {
            for rank in 0..self.size() {
                if rank != BARRIER_ROOT {
                    own.wait_for(rank, arrive).await;
                }
            }
            for (rank, mailbox) in self.mailboxes.iter().enumerate() {
                if rank != BARRIER_ROOT {
                    mailbox.deliver(BARRIER_ROOT, release, Bytes::new());
                }
            }
        } else {
            self.mailbox(BARRIER_ROOT)?.deliver(self.rank, arrive, Bytes::new());
            own.wait_for(BARRIER_ROOT, release).await;
        }
        Ok(())
    }
}
