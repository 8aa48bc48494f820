// Run parameters for one distributed pass. Passed into the `Coordinator` at
// construction; nothing in the crate reads global configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Extension of the frame files produced by the extraction collaborator.
pub const DEFAULT_FRAME_EXTENSION: &str = "png";
/// Name of the assembled video inside the output directory.
pub const DEFAULT_VIDEO_NAME: &str = "output.mp4";

/// What the diff frame shows where nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundPolicy {
    /// Unchanged pixels are copied verbatim from the current frame.
    #[default]
    Copy,
    /// Unchanged pixels are dimmed so the recolored regions stand out.
    Dim,
}

/// Tunables of the per-pixel difference and region segmentation.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// A pixel has changed when its channel distance is strictly above this percentage.
    pub threshold_percent: f64,
    pub background: BackgroundPolicy,
    /// Number of region colors cycled through within one frame pair.
    pub palette_size: usize,
    /// Fixes the region colors. Colors are cosmetic; region shapes never depend on this.
    pub palette_seed: Option<u64>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 5.0,
            background: BackgroundPolicy::Copy,
            palette_size: 10,
            palette_seed: None,
        }
    }
}

/// Limits of the chunked transport and of every rendezvous point.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload a single fabric message may carry.
    pub max_fragment_size: usize,
    /// How long a receiver waits for each fragment once the header has arrived.
    pub fragment_timeout: Duration,
    /// How long an endpoint waits at a rendezvous (headers, broadcasts, barrier).
    /// Peers may still be diffing, so this is much longer than `fragment_timeout`.
    pub rendezvous_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 1024 * 1024,
            fragment_timeout: Duration::from_secs(30),
            rendezvous_timeout: Duration::from_secs(600),
        }
    }
}

/// Configuration for one pass, identical on every endpoint.
#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Directory holding `frame_%04d.<ext>` files.
    pub input_dir: PathBuf,
    /// Directory the collector fills with diff frames. Cleared before the pass.
    pub output_dir: PathBuf,
    /// Where the collector asks the assembly collaborator to write the video.
    pub output_video: PathBuf,
    pub fps: u32,
    pub frame_extension: String,
    /// Diff workers per endpoint. `None` sizes the pool to the available cores.
    pub workers: Option<usize>,
    pub diff: DiffConfig,
    pub transport: TransportConfig,
}

impl PassConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, fps: u32) -> Self {
        let output_dir = output_dir.into();
        Self {
            input_dir: input_dir.into(),
            output_video: output_dir.join(DEFAULT_VIDEO_NAME),
            output_dir,
            fps,
            ..Self::default()
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("frames"),
            output_dir: PathBuf::from("diff_frames"),
            output_video: PathBuf::from("diff_frames").join(DEFAULT_VIDEO_NAME),
            fps: 30,
            frame_extension: DEFAULT_FRAME_EXTENSION.to_string(),
            workers: None,
            diff: DiffConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_extraction_conventions() {
        let config = PassConfig::default();
        assert_eq!(config.frame_extension, "png");
        assert_eq!(config.fps, 30);
        assert_eq!(config.diff.threshold_percent, 5.0);
        assert_eq!(config.diff.background, BackgroundPolicy::Copy);
        assert_eq!(config.transport.max_fragment_size, 1024 * 1024);
    }

    #[test]
    fn video_defaults_into_the_output_directory() {
        let config = PassConfig::new("in", "out", 24);
        assert_eq!(config.output_video, PathBuf::from("out").join("output.mp4"));
        assert_eq!(config.fps, 24);
    }

    #[test]
    fn worker_count_is_never_zero() {
        let config = PassConfig {
            workers: Some(0),
            ..PassConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }
}
