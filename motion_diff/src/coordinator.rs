// THEORY:
// The `Coordinator` drives one endpoint through a whole pass. Every endpoint runs the
// same code; rank 0 additionally builds the manifest, owns the output directory and
// invokes the video assembly.
//
// States, in order:
// 1.  **ManifestReady**: the collector scans the input, clears the output directory,
//     and the `ManifestDistributor` puts the same manifest on every endpoint.
// 2.  **PartitionReady**: each endpoint derives its own `WorkRange`. Nothing is sent.
// 3.  **BoundaryExchanged**: an endpoint ships the last frame of its slice to its
//     successor before doing any work of its own, and receives the frame before its
//     slice from its predecessor. Only neighbors wait on each other.
// 4.  **LocalDiffDone**: frames are loaded in order and consecutive pairs go to the
//     `DiffWorkerPool`. Results are keyed by frame index. A frame that will not
//     decode costs the pairs it belongs to and nothing else.
// 5.  **ResultsDelivered**: the collector writes its own results, then takes every
//     peer's delivery concurrently. A delivery is a header (declared range, emitted
//     indices, skipped indices, or a failure) followed by one transfer per result.
//     The collector checks the header against the partition before writing a byte.
// 6.  **Barrier**: nobody moves on until every endpoint has delivered.
// 7.  **Verdict**: the collector broadcasts proceed or abort. Endpoints that failed
//     locally still reach the barrier, so one failure aborts everyone instead of
//     leaving peers waiting.
// 8.  **Assembled**: on proceed, the collector hands the output directory to the
//     `VideoAssembler`.

use crate::collaborators::{AssemblyRequest, VideoAssembler};
use crate::config::PassConfig;
use crate::core_modules::frame::Frame;
use crate::core_modules::manifest::{Manifest, frame_sort_key};
use crate::core_modules::partition::WorkRange;
use crate::diff_pool::{DiffWorkerPool, EncodedDiff};
use crate::distributor::ManifestDistributor;
use crate::error::{PassError, Result};
use crate::fabric::transport::{ChunkedTransport, TransferError, TransferId, TransferKind};
use crate::fabric::{Fabric, Rank};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Span, debug, error, info, warn};

/// The endpoint that builds the manifest, collects results and assembles the video.
pub const COLLECTOR: Rank = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Init,
    ManifestReady,
    PartitionReady,
    BoundaryExchanged,
    LocalDiffDone,
    ResultsDelivered,
    Barrier,
    Assembled,
    Done,
    Aborted,
}

/// What one endpoint did during a pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub rank: Rank,
    pub range: WorkRange,
    /// Diff frames this endpoint computed.
    pub diffs_emitted: usize,
    /// Indices whose pair could not be diffed.
    pub skipped_pairs: Vec<usize>,
    pub regions: usize,
    /// Diff frames written to the output directory. Only the collector writes.
    pub frames_written: usize,
    pub assembled: bool,
    pub elapsed: Duration,
}

/// Sent by every non-collector before its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHeader {
    pub rank: Rank,
    pub range: WorkRange,
    /// Indices of the results that follow, in send order.
    pub indices: Vec<usize>,
    pub skipped: Vec<usize>,
    /// Set when the endpoint failed before it had results; nothing follows.
    pub failure: Option<String>,
}

impl DeliveryHeader {
    /// Checks the header against what the partition says `rank` owns. Emitted and
    /// skipped indices must together cover the emitted range exactly once.
    pub fn validate(&self, rank: Rank, expected: &WorkRange) -> std::result::Result<(), String> {
        if self.rank != rank {
            return Err(format!("header claims rank {} on the channel of rank {rank}", self.rank));
        }
        if self.range != *expected {
            return Err(format!("declared range {:?}, partition says {:?}", self.range, expected));
        }
        if !self.indices.is_sorted_by(|a, b| a < b) || !self.skipped.is_sorted_by(|a, b| a < b) {
            return Err("indices are not strictly increasing".to_string());
        }
        let mut covered: Vec<usize> = self.indices.iter().chain(&self.skipped).copied().collect();
        covered.sort_unstable();
        if !covered.iter().copied().eq(expected.emitted()) {
            return Err(format!(
                "{} emitted and {} skipped indices do not cover {:?}",
                self.indices.len(),
                self.skipped.len(),
                expected.emitted()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Verdict {
    Proceed,
    Abort { reason: String },
}

/// Results of the local phase of one endpoint.
#[derive(Debug, Default)]
struct LocalDiff {
    results: BTreeMap<usize, EncodedDiff>,
    skipped: Vec<usize>,
    regions: usize,
}

/// What the collector ended up with on disk.
#[derive(Debug, Default)]
struct Collected {
    written: Vec<usize>,
    failure: Option<PassError>,
}

pub struct Coordinator<F: Fabric> {
    fabric: F,
    config: PassConfig,
    assembler: Arc<dyn VideoAssembler>,
    span: Span,
}

impl<F: Fabric> Coordinator<F> {
    pub fn new(fabric: F, config: PassConfig, assembler: Arc<dyn VideoAssembler>) -> Self {
        let span = tracing::info_span!("endpoint", rank = fabric.rank());
        Self {
            fabric,
            config,
            assembler,
            span,
        }
    }

    /// Replaces the span the pass is logged under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn rank(&self) -> Rank {
        self.fabric.rank()
    }

    fn is_collector(&self) -> bool {
        self.fabric.rank() == COLLECTOR
    }

    /// Runs one full pass on this endpoint.
    pub async fn run(&self) -> Result<PassReport> {
        let span = self.span.clone();
        async {
            let started = Instant::now();
            let mut state = EndpointState::Init;
            let outcome = self.drive(&mut state, started).await;
            match &outcome {
                Ok(report) => info!(
                    diffs = report.diffs_emitted,
                    skipped = report.skipped_pairs.len(),
                    regions = report.regions,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "pass finished"
                ),
                Err(e) => {
                    error!(error = %e, "pass failed");
                    transition(&mut state, EndpointState::Aborted);
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, state: &mut EndpointState, started: Instant) -> Result<PassReport> {
        let rendezvous = self.config.transport.rendezvous_timeout;
        let manifest = ManifestDistributor::new(&self.fabric, COLLECTOR, rendezvous, &self.config.input_dir)
            .distribute(|| self.prepare_output())
            .await?;
        transition(state, EndpointState::ManifestReady);

        let range = WorkRange::for_endpoint(manifest.len(), self.fabric.size(), self.fabric.rank());
        info!(
            total = manifest.len(),
            read_start = range.read_start,
            process_start = range.process_start,
            end = range.end,
            "work range assigned"
        );
        transition(state, EndpointState::PartitionReady);

        let transport = ChunkedTransport::new(&self.fabric, &self.config.transport);
        let local = self.local_phase(&transport, &manifest, &range, state).await;

        let collected = if self.is_collector() {
            Some(self.collect(&transport, &manifest, &local).await)
        } else {
            self.deliver(&transport, &range, &local).await?;
            None
        };
        transition(state, EndpointState::ResultsDelivered);

        tokio::time::timeout(rendezvous, self.fabric.barrier())
            .await
            .map_err(|_| TransferError::Timeout {
                what: "barrier".to_string(),
                source_rank: COLLECTOR,
                timeout: rendezvous,
            })??;
        transition(state, EndpointState::Barrier);

        let verdict = match &collected {
            Some(collected) => self.broadcast_verdict(collected.failure.as_ref()).await,
            None => self.await_verdict().await,
        };
        let local = local?;
        verdict?;

        let mut report = PassReport {
            rank: self.fabric.rank(),
            range,
            diffs_emitted: local.results.len(),
            skipped_pairs: local.skipped,
            regions: local.regions,
            frames_written: 0,
            assembled: false,
            elapsed: Duration::ZERO,
        };

        if let Some(collected) = collected {
            if let Some(failure) = collected.failure {
                return Err(failure);
            }
            report.frames_written = collected.written.len();
            report.assembled = self.assemble(&manifest, &collected.written).await?;
            if report.assembled {
                transition(state, EndpointState::Assembled);
            }
        }

        transition(state, EndpointState::Done);
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Collector-only setup: list the frames, then clear the output directory.
    /// The output directory is left alone when the input is empty, and refused when
    /// clearing it would delete the input.
    async fn prepare_output(&self) -> Result<Manifest> {
        let input_dir = self.config.input_dir.clone();
        let output_dir = self.config.output_dir.clone();
        let extension = self.config.frame_extension.clone();
        let (manifest, clobbers) = tokio::task::spawn_blocking(move || {
            Manifest::scan(&input_dir, &extension).map(|manifest| (manifest, clobbers_input(&input_dir, &output_dir)))
        })
        .await
        .map_err(|e| PassError::Worker(format!("scanning input: {e}")))??;

        let output_dir = &self.config.output_dir;
        if clobbers {
            return Err(PassError::Config(format!(
                "clearing output directory {} would delete the input frames in {}",
                output_dir.display(),
                self.config.input_dir.display()
            )));
        }
        if tokio::fs::try_exists(output_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(output_dir)
                .await
                .map_err(|e| PassError::filesystem("cannot clear", output_dir, e))?;
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| PassError::filesystem("cannot create", output_dir, e))?;

        info!(frames = manifest.len(), output = %output_dir.display(), "output directory prepared");
        Ok(manifest)
    }

    async fn local_phase(
        &self,
        transport: &ChunkedTransport<'_, F>,
        manifest: &Manifest,
        range: &WorkRange,
        state: &mut EndpointState,
    ) -> Result<LocalDiff> {
        let boundary = self.exchange_boundary(transport, manifest, range).await?;
        transition(state, EndpointState::BoundaryExchanged);

        let local = self.diff_range(manifest, range, boundary).await?;
        info!(
            diffs = local.results.len(),
            skipped = local.skipped.len(),
            regions = local.regions,
            "local diff done"
        );
        transition(state, EndpointState::LocalDiffDone);
        Ok(local)
    }

    /// Ships this slice's last frame to the successor and receives the frame before
    /// this slice from the predecessor.
    async fn exchange_boundary(
        &self,
        transport: &ChunkedTransport<'_, F>,
        manifest: &Manifest,
        range: &WorkRange,
    ) -> Result<Option<Bytes>> {
        let ((), boundary) = tokio::try_join!(
            self.handoff_boundary(transport, manifest, range),
            self.receive_boundary(transport, range),
        )?;
        Ok(boundary)
    }

    async fn handoff_boundary(
        &self,
        transport: &ChunkedTransport<'_, F>,
        manifest: &Manifest,
        range: &WorkRange,
    ) -> std::result::Result<(), TransferError> {
        let successor = self.fabric.rank() + 1;
        if successor >= self.fabric.size() {
            return Ok(());
        }
        let successor_range = WorkRange::for_endpoint(manifest.len(), self.fabric.size(), successor);
        let Some(index) = range.handoff_frame(&successor_range) else {
            return Ok(());
        };
        let payload = self.read_frame_bytes(manifest, index).await;
        debug!(index, to = successor, len = payload.len(), "shipping boundary frame");
        transport
            .send(payload, successor, TransferId::new(TransferKind::Boundary, successor)?)
            .await
    }

    async fn receive_boundary(
        &self,
        transport: &ChunkedTransport<'_, F>,
        range: &WorkRange,
    ) -> std::result::Result<Option<Bytes>, TransferError> {
        let rank = self.fabric.rank();
        if range.boundary_frame().is_none() {
            return Ok(None);
        }
        let payload = transport
            .receive(rank - 1, TransferId::new(TransferKind::Boundary, rank)?)
            .await?;
        debug!(from = rank - 1, len = payload.len(), "boundary frame received");
        Ok(Some(payload))
    }

    /// The encoded bytes of frame `index`, or an empty payload when it cannot be read.
    /// The successor treats an empty payload as an undecodable frame.
    async fn read_frame_bytes(&self, manifest: &Manifest, index: usize) -> Bytes {
        let Some(path) = manifest.path_in(&self.config.input_dir, index) else {
            return Bytes::new();
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(index, path = %path.display(), error = %e, "cannot read boundary frame");
                Bytes::new()
            }
        }
    }

    async fn diff_range(&self, manifest: &Manifest, range: &WorkRange, mut boundary: Option<Bytes>) -> Result<LocalDiff> {
        let mut local = LocalDiff::default();
        if range.is_empty() {
            return Ok(local);
        }

        let pool = DiffWorkerPool::new(self.config.diff.clone(), self.config.worker_count());
        let workers = &pool;
        let in_flight_limit = pool.worker_count() * 2;
        let mut in_flight = FuturesUnordered::new();
        let mut previous: Option<Arc<Frame>> = None;
        let emitted = range.emitted();
        let mut outcome = Ok(());

        for index in range.reads() {
            let current = match self.load_frame(manifest, index, range, &mut boundary).await {
                Ok(frame) => Some(Arc::new(frame)),
                Err(PassError::Decode(e)) => {
                    warn!(index, error = %e, "frame skipped");
                    None
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            if emitted.contains(&index) {
                match (&previous, &current) {
                    (Some(prev), Some(curr)) => {
                        let (prev, curr) = (Arc::clone(prev), Arc::clone(curr));
                        in_flight.push(async move { (index, workers.diff(index, prev, curr).await) });
                    }
                    _ => {
                        warn!(index, "pair skipped, a frame is missing");
                        local.skipped.push(index);
                    }
                }
            }
            previous = current;

            while in_flight.len() >= in_flight_limit {
                if let Some((index, result)) = in_flight.next().await
                    && let Err(e) = record(&mut local, index, result)
                {
                    outcome = Err(e);
                }
            }
            if outcome.is_err() {
                break;
            }
        }

        while let Some((index, result)) = in_flight.next().await {
            if let Err(e) = record(&mut local, index, result)
                && outcome.is_ok()
            {
                outcome = Err(e);
            }
        }
        drop(in_flight);
        pool.shutdown().await;

        outcome?;
        local.skipped.sort_unstable();
        Ok(local)
    }

    async fn load_frame(
        &self,
        manifest: &Manifest,
        index: usize,
        range: &WorkRange,
        boundary: &mut Option<Bytes>,
    ) -> Result<Frame> {
        let name = manifest.name(index).unwrap_or_default().to_string();
        let decoded = if range.boundary_frame() == Some(index) {
            let bytes = boundary.take().unwrap_or_default();
            tokio::task::spawn_blocking(move || Frame::decode(&name, &bytes)).await
        } else {
            let path = self.config.input_dir.join(&name);
            tokio::task::spawn_blocking(move || Frame::load(&path)).await
        };
        decoded
            .map_err(|e| PassError::Worker(format!("decoding frame {index}: {e}")))?
            .map_err(PassError::from)
    }

    /// Non-collector side of result delivery.
    async fn deliver(
        &self,
        transport: &ChunkedTransport<'_, F>,
        range: &WorkRange,
        local: &Result<LocalDiff>,
    ) -> Result<()> {
        let rank = self.fabric.rank();
        let header = match local {
            Ok(local) => DeliveryHeader {
                rank,
                range: *range,
                indices: local.results.keys().copied().collect(),
                skipped: local.skipped.clone(),
                failure: None,
            },
            Err(e) => DeliveryHeader {
                rank,
                range: *range,
                indices: Vec::new(),
                skipped: Vec::new(),
                failure: Some(e.to_string()),
            },
        };

        let encoded = serde_json::to_vec(&header).map_err(|e| TransferError::Malformed {
            what: "delivery header",
            source_rank: rank,
            detail: e.to_string(),
        })?;
        transport
            .send(Bytes::from(encoded), COLLECTOR, TransferId::new(TransferKind::Delivery, rank)?)
            .await?;

        if let Ok(local) = local {
            for (index, diff) in &local.results {
                transport
                    .send(diff.png.clone(), COLLECTOR, TransferId::new(TransferKind::Result, *index)?)
                    .await?;
            }
            debug!(results = local.results.len(), "results shipped to collector");
        }
        Ok(())
    }

    /// Collector side: write local results, then every peer's, as they arrive.
    async fn collect(
        &self,
        transport: &ChunkedTransport<'_, F>,
        manifest: &Manifest,
        local: &Result<LocalDiff>,
    ) -> Collected {
        let mut collected = Collected::default();

        match local {
            Ok(local) => {
                for (index, diff) in &local.results {
                    match self.write_result(manifest, *index, &diff.png).await {
                        Ok(()) => collected.written.push(*index),
                        Err(e) => {
                            collected.failure = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => collected.failure = Some(PassError::Aborted { reason: e.to_string() }),
        }

        let peers = (0..self.fabric.size()).filter(|peer| *peer != COLLECTOR);
        let deliveries = join_all(peers.map(|peer| self.collect_peer(transport, manifest, peer))).await;
        for delivery in deliveries {
            match delivery {
                Ok(written) => collected.written.extend(written),
                Err(e) => {
                    warn!(error = %e, "delivery failed");
                    collected.failure.get_or_insert(e);
                }
            }
        }

        collected.written.sort_unstable();
        info!(written = collected.written.len(), "results collected");
        collected
    }

    async fn collect_peer(
        &self,
        transport: &ChunkedTransport<'_, F>,
        manifest: &Manifest,
        peer: Rank,
    ) -> Result<Vec<usize>> {
        let payload = transport
            .receive(peer, TransferId::new(TransferKind::Delivery, peer)?)
            .await?;
        let header: DeliveryHeader = serde_json::from_slice(&payload).map_err(|e| TransferError::Malformed {
            what: "delivery header",
            source_rank: peer,
            detail: e.to_string(),
        })?;

        if let Some(reason) = header.failure {
            return Err(PassError::PeerAborted { rank: peer, reason });
        }
        let expected = WorkRange::for_endpoint(manifest.len(), self.fabric.size(), peer);
        header.validate(peer, &expected).map_err(|detail| TransferError::Malformed {
            what: "delivery header",
            source_rank: peer,
            detail,
        })?;

        for index in &header.indices {
            let png = transport
                .receive(peer, TransferId::new(TransferKind::Result, *index)?)
                .await?;
            self.write_result(manifest, *index, &png).await?;
        }
        debug!(peer, results = header.indices.len(), skipped = header.skipped.len(), "peer delivered");
        Ok(header.indices)
    }

    async fn write_result(&self, manifest: &Manifest, index: usize, png: &[u8]) -> Result<()> {
        let path = manifest.path_in(&self.config.output_dir, index).ok_or_else(|| {
            PassError::Config(format!("frame index {index} outside a manifest of {}", manifest.len()))
        })?;
        tokio::fs::write(&path, png)
            .await
            .map_err(|e| PassError::filesystem("cannot write", path, e))
    }

    async fn broadcast_verdict(&self, failure: Option<&PassError>) -> Result<()> {
        let verdict = match failure {
            None => Verdict::Proceed,
            Some(e) => Verdict::Abort { reason: e.to_string() },
        };
        let encoded = serde_json::to_vec(&verdict).map_err(|e| TransferError::Malformed {
            what: "verdict",
            source_rank: COLLECTOR,
            detail: e.to_string(),
        })?;
        self.verdict_broadcast(Some(Bytes::from(encoded))).await?;
        Ok(())
    }

    async fn await_verdict(&self) -> Result<()> {
        let payload = self.verdict_broadcast(None).await?;
        let verdict: Verdict = serde_json::from_slice(&payload).map_err(|e| TransferError::Malformed {
            what: "verdict",
            source_rank: COLLECTOR,
            detail: e.to_string(),
        })?;
        match verdict {
            Verdict::Proceed => Ok(()),
            Verdict::Abort { reason } => Err(PassError::Aborted { reason }),
        }
    }

    async fn verdict_broadcast(&self, payload: Option<Bytes>) -> Result<Bytes> {
        let timeout = self.config.transport.rendezvous_timeout;
        let bytes = tokio::time::timeout(timeout, self.fabric.broadcast(COLLECTOR, payload))
            .await
            .map_err(|_| TransferError::Timeout {
                what: "verdict".to_string(),
                source_rank: COLLECTOR,
                timeout,
            })??;
        Ok(bytes)
    }

    /// Returns whether a video was assembled.
    async fn assemble(&self, manifest: &Manifest, written: &[usize]) -> Result<bool> {
        let frames: Vec<String> = written
            .iter()
            .filter_map(|index| manifest.name(*index).map(str::to_string))
            .collect();
        let Some(first) = frames.first() else {
            warn!("no diff frames produced, skipping video assembly");
            return Ok(false);
        };

        let request = AssemblyRequest {
            frame_dir: self.config.output_dir.clone(),
            start_number: frame_sort_key(first).unwrap_or_default(),
            frames,
            output_video: self.config.output_video.clone(),
            fps: self.config.fps,
        };
        info!(frames = request.frames.len(), video = %request.output_video.display(), "assembling video");
        self.assembler.assemble(&request).await?;
        Ok(true)
    }
}

fn transition(state: &mut EndpointState, next: EndpointState) {
    debug!(from = ?*state, to = ?next, "state");
    *state = next;
}

/// Files the outcome of the pair ending at `index`. A pair that could not be diffed
/// is recorded as skipped so the delivery still covers the whole range.
fn record(local: &mut LocalDiff, index: usize, result: Result<EncodedDiff>) -> Result<()> {
    match result {
        Ok(diff) => {
            local.regions += diff.regions.len();
            local.results.insert(index, diff);
            Ok(())
        }
        Err(PassError::Decode(e)) => {
            warn!(index, error = %e, "pair skipped");
            local.skipped.push(index);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// True when removing `output` would remove `input`: the same directory or one of
/// its ancestors.
fn clobbers_input(input: &Path, output: &Path) -> bool {
    match (std::fs::canonicalize(input), std::fs::canonicalize(output)) {
        (Ok(input), Ok(output)) => input.starts_with(output),
        _ => input.starts_with(output),
    }
}
