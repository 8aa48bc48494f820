// Runs every endpoint of a pass as a tokio task over one in-process fabric.

use motion_diff::{Coordinator, LocalFabric, PassConfig, PassError, PassReport, VideoAssembler};
use std::sync::Arc;
use tracing::{error, info};

/// Runs one pass over `endpoints` endpoints. Results are indexed by rank.
pub async fn run_local_cluster(
    config: &PassConfig,
    endpoints: usize,
    assembler: Arc<dyn VideoAssembler>,
) -> Vec<Result<PassReport, PassError>> {
    let handles: Vec<_> = LocalFabric::cluster(endpoints, config.transport.max_fragment_size)
        .into_iter()
        .map(|fabric| {
            let coordinator = Coordinator::new(fabric, config.clone(), Arc::clone(&assembler));
            tokio::spawn(async move { coordinator.run().await })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
            .await
            .unwrap_or_else(|e| Err(PassError::Worker(format!("endpoint {rank} task failed: {e}"))));
        results.push(result);
    }
    results
}

/// Logs a line per endpoint and picks the error to report, the collector's first.
pub fn summarize(results: Vec<Result<PassReport, PassError>>) -> Result<PassReport, PassError> {
    let mut collector = None;
    let mut first_error = None;

    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(report) => {
                info!(
                    rank,
                    frames = report.range.len(),
                    diffs = report.diffs_emitted,
                    skipped = report.skipped_pairs.len(),
                    regions = report.regions,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "endpoint done"
                );
                if rank == motion_diff::COLLECTOR {
                    collector = Some(report);
                }
            }
            Err(e) => {
                error!(rank, error = %e, "endpoint failed");
                if first_error.is_none() || rank == motion_diff::COLLECTOR {
                    first_error = Some(e);
                }
            }
        }
    }

    match (first_error, collector) {
        (Some(e), _) => Err(e),
        (None, Some(report)) => Ok(report),
        (None, None) => Err(PassError::Config("pass ran with no endpoints".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion_diff::{Frame, NoAssembly};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_cluster_writes_every_diff() {
        let input = tempfile::tempdir().expect("input");
        let output = tempfile::tempdir().expect("output");
        for n in 1..=6u8 {
            let frame = Frame::filled(4, 4, [n * 40, 0, 0, 255]);
            std::fs::write(
                input.path().join(format!("frame_{n:04}.png")),
                frame.encode_png().expect("encode"),
            )
            .expect("write");
        }

        let config = PassConfig::new(input.path(), output.path(), 10);
        let results = run_local_cluster(&config, 3, Arc::new(NoAssembly)).await;
        let report = summarize(results).expect("pass");

        assert_eq!(report.frames_written, 5);
        assert!(report.assembled);
    }

    #[tokio::test]
    async fn collector_error_wins() {
        let input = tempfile::tempdir().expect("input");
        let config = PassConfig::new(input.path(), input.path().join("out"), 10);
        let results = run_local_cluster(&config, 2, Arc::new(NoAssembly)).await;
        assert!(matches!(summarize(results), Err(PassError::EmptyInput { .. })));
    }
}
