// THEORY:
// The `DiffWorkerPool` parallelizes the diffs of one endpoint's range across the
// cores of its host. Each frame pair is independent once both frames are decoded,
// so the pool only has to fan tasks out and hand results back.
//
// Layout:
// 1.  **Dispatcher**: one task reads the shared task channel and deals tasks to the
//     workers round-robin, each worker having its own channel.
// 2.  **Workers**: each worker owns one `DiffEngine`, and with it one visited-grid
//     arena. The CPU-bound diff and PNG encode run on the blocking thread pool; the
//     engine is moved in and handed back so its arena survives between pairs. If a
//     diff panics the engine is lost and the worker builds a fresh one.
// 3.  **Replies**: every task carries a oneshot sender. Callers get their result
//     for their own frame index, so completion order never leaks into the output.

use crate::config::DiffConfig;
use crate::core_modules::diff_engine::{DiffEngine, Region};
use crate::core_modules::frame::{DecodeError, Frame};
use crate::error::{PassError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// One encoded diff frame, ready for the output directory or the wire.
#[derive(Debug, Clone)]
pub struct EncodedDiff {
    /// Manifest index of the current frame of the pair.
    pub index: usize,
    pub png: Bytes,
    pub regions: Vec<Region>,
    pub changed_pixels: usize,
}

struct DiffTask {
    index: usize,
    previous: Arc<Frame>,
    current: Arc<Frame>,
    reply: oneshot::Sender<std::result::Result<EncodedDiff, PoolFault>>,
}

enum PoolFault {
    Decode(DecodeError),
    Panicked(String),
}

pub struct DiffWorkerPool {
    task_sender: mpsc::UnboundedSender<DiffTask>,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl DiffWorkerPool {
    /// Spawns the dispatcher and `workers` workers on the current runtime.
    pub fn new(config: DiffConfig, workers: usize) -> Self {
        let worker_count = workers.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<DiffTask>();

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) =
            (0..worker_count).map(|_| mpsc::unbounded_channel::<DiffTask>()).unzip();

        let dispatcher = tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                // A worker only goes away with the pool, so a failed send drops the
                // task and its reply sender, which the caller sees as a closed pool.
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        let workers = worker_receivers
            .into_iter()
            .enumerate()
            .map(|(worker_id, receiver)| tokio::spawn(Self::run_worker(worker_id, config.clone(), receiver)))
            .collect();

        Self {
            task_sender,
            dispatcher,
            workers,
        }
    }

    async fn run_worker(worker_id: usize, config: DiffConfig, mut receiver: mpsc::UnboundedReceiver<DiffTask>) {
        let mut engine = Some(DiffEngine::new(config.clone()));

        while let Some(task) = receiver.recv().await {
            let DiffTask {
                index,
                previous,
                current,
                reply,
            } = task;
            let mut owned = engine.take().unwrap_or_else(|| DiffEngine::new(config.clone()));

            let joined = tokio::task::spawn_blocking(move || {
                let outcome = owned.diff(&previous, &current).and_then(|diff| {
                    let png = diff.frame.encode_png()?;
                    Ok(EncodedDiff {
                        index,
                        png: Bytes::from(png),
                        regions: diff.regions,
                        changed_pixels: diff.changed_pixels,
                    })
                });
                (owned, outcome)
            })
            .await;

            let outcome = match joined {
                Ok((returned, outcome)) => {
                    engine = Some(returned);
                    outcome.map_err(PoolFault::Decode)
                }
                Err(e) => {
                    warn!(worker_id, index, error = %e, "diff task died, replacing engine");
                    Err(PoolFault::Panicked(e.to_string()))
                }
            };
            trace!(worker_id, index, "diff task finished");
            let _ = reply.send(outcome);
        }
    }

    /// Diffs `previous -> current` and returns the encoded result for `index`.
    ///
    /// A pair that cannot be diffed (mismatched sizes, encode failure) is a
    /// `PassError::Decode`; the caller skips it. A pool that can no longer run
    /// tasks is a `PassError::Worker`.
    pub async fn diff(&self, index: usize, previous: Arc<Frame>, current: Arc<Frame>) -> Result<EncodedDiff> {
        let (reply, result_receiver) = oneshot::channel();
        self.task_sender
            .send(DiffTask {
                index,
                previous,
                current,
                reply,
            })
            .map_err(|_| PassError::Worker("diff pool is shut down".to_string()))?;

        match result_receiver.await {
            Ok(Ok(encoded)) => Ok(encoded),
            Ok(Err(PoolFault::Decode(e))) => Err(PassError::Decode(e)),
            Ok(Err(PoolFault::Panicked(detail))) => Err(PassError::Worker(format!("diff of frame {index}: {detail}"))),
            Err(_) => Err(PassError::Worker(format!("no result for frame {index}"))),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting tasks and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        let Self {
            task_sender,
            dispatcher,
            workers,
        } = self;
        drop(task_sender);
        let _ = dispatcher.await;
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    fn frame(rgba: [u8; 4]) -> Arc<Frame> {
        Arc::new(Frame::filled(8, 6, rgba))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn results_come_back_under_their_own_index() {
        let pool = DiffWorkerPool::new(DiffConfig::default(), 3);
        assert_eq!(pool.worker_count(), 3);

        let black = frame([0, 0, 0, 255]);
        let white = frame([255, 255, 255, 255]);
        let tasks = (1..=10).map(|index| {
            let current = if index % 2 == 0 { Arc::clone(&white) } else { Arc::clone(&black) };
            pool.diff(index, Arc::clone(&black), current)
        });
        let results = join_all(tasks).await;

        for (offset, result) in results.into_iter().enumerate() {
            let encoded = result.expect("diff");
            let index = offset + 1;
            assert_eq!(encoded.index, index);
            let expected_regions = if index % 2 == 0 { 1 } else { 0 };
            assert_eq!(encoded.regions.len(), expected_regions);
            let decoded = Frame::decode("diff", &encoded.png).expect("png");
            assert_eq!((decoded.width, decoded.height), (8, 6));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn mismatched_pair_is_a_decode_error_and_the_worker_survives() {
        let pool = DiffWorkerPool::new(DiffConfig::default(), 1);
        let small = Arc::new(Frame::filled(2, 2, [0, 0, 0, 255]));
        let large = frame([0, 0, 0, 255]);

        assert!(matches!(
            pool.diff(1, Arc::clone(&small), Arc::clone(&large)).await,
            Err(PassError::Decode(DecodeError::SizeMismatch { .. }))
        ));
        let encoded = pool.diff(2, Arc::clone(&large), large).await.expect("diff");
        assert_eq!(encoded.changed_pixels, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn zero_workers_still_gets_one() {
        let pool = DiffWorkerPool::new(DiffConfig::default(), 0);
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown().await;
    }
}
