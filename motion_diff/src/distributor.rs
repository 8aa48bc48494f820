// THEORY:
// The `ManifestDistributor` gets one identical `Manifest` onto every endpoint, or
// makes every endpoint abort together.
//
// Two broadcasts from the root, in this order:
// 1.  **Signal**: an 8-byte little-endian `i64`. A positive value is the frame count
//     every endpoint should expect. Zero means the input was empty. A negative value
//     means the root could not set the pass up (for instance the output directory
//     could not be cleared). Non-positive signals end the exchange on every endpoint.
// 2.  **List**: the ordered frame names as JSON, only after a positive signal.
//
// The abort travels through the same broadcast as the count, so an endpoint can
// never miss it.

use crate::core_modules::manifest::Manifest;
use crate::error::{PassError, Result};
use crate::fabric::transport::TransferError;
use crate::fabric::{Fabric, Rank};
use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const SIGNAL_EMPTY: i64 = 0;
const SIGNAL_SETUP_FAILED: i64 = -1;

pub struct ManifestDistributor<'a, F: Fabric + ?Sized> {
    fabric: &'a F,
    root: Rank,
    timeout: Duration,
    /// Reported to peers when the root signals an empty input.
    input_dir: PathBuf,
}

impl<'a, F: Fabric + ?Sized> ManifestDistributor<'a, F> {
    pub fn new(fabric: &'a F, root: Rank, timeout: Duration, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            fabric,
            root,
            timeout,
            input_dir: input_dir.into(),
        }
    }

    /// Runs `prepare` on the root only, then distributes its outcome.
    /// Every endpoint returns the same manifest, or an error when the root aborted.
    pub async fn distribute<P, Fut>(&self, prepare: P) -> Result<Manifest>
    where
        P: FnOnce() -> Fut,
        Fut: Future<Output = Result<Manifest>>,
    {
        if self.fabric.rank() == self.root {
            self.distribute_from_root(prepare().await).await
        } else {
            self.receive().await
        }
    }

    async fn distribute_from_root(&self, prepared: Result<Manifest>) -> Result<Manifest> {
        let signal = match &prepared {
            Ok(manifest) if !manifest.is_empty() => manifest.len() as i64,
            Ok(_) | Err(PassError::EmptyInput { .. }) => SIGNAL_EMPTY,
            Err(_) => SIGNAL_SETUP_FAILED,
        };
        self.broadcast(Some(Bytes::copy_from_slice(&signal.to_le_bytes()))).await?;

        let manifest = match prepared {
            Ok(manifest) if !manifest.is_empty() => manifest,
            Ok(_) => {
                return Err(PassError::EmptyInput {
                    dir: self.input_dir.clone(),
                });
            }
            Err(e) => {
                warn!(error = %e, "manifest preparation failed, aborting every endpoint");
                return Err(e);
            }
        };

        let list = serde_json::to_vec(&manifest).map_err(|e| self.malformed(e.to_string()))?;
        self.broadcast(Some(Bytes::from(list))).await?;
        debug!(frames = manifest.len(), "manifest distributed");
        Ok(manifest)
    }

    async fn receive(&self) -> Result<Manifest> {
        let signal = self.broadcast(None).await?;
        let signal = <[u8; 8]>::try_from(&signal[..])
            .map(i64::from_le_bytes)
            .map_err(|_| self.malformed(format!("count signal of {} bytes", signal.len())))?;

        match signal {
            SIGNAL_EMPTY => {
                return Err(PassError::EmptyInput {
                    dir: self.input_dir.clone(),
                });
            }
            s if s < 0 => {
                return Err(PassError::PeerAborted {
                    rank: self.root,
                    reason: "pass setup failed on the coordinator".to_string(),
                });
            }
            _ => {}
        }

        let list = self.broadcast(None).await?;
        let manifest: Manifest = serde_json::from_slice(&list).map_err(|e| self.malformed(e.to_string()))?;
        if manifest.len() as i64 != signal {
            return Err(self.malformed(format!("{} frames announced, {} received", signal, manifest.len())));
        }
        debug!(frames = manifest.len(), "manifest received");
        Ok(manifest)
    }

    async fn broadcast(&self, payload: Option<Bytes>) -> Result<Bytes> {
        tokio::time::timeout(self.timeout, self.fabric.broadcast(self.root, payload))
            .await
            .map_err(|_| TransferError::Timeout {
                what: "manifest broadcast".to_string(),
                source_rank: self.root,
                timeout: self.timeout,
            })?
            .map_err(PassError::from)
    }

    fn malformed(&self, detail: String) -> PassError {
        PassError::Transfer(TransferError::Malformed {
            what: "manifest",
            source_rank: self.root,
            detail,
        })
    }
}
