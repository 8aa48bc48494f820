// The pass stops at a directory of numbered images on both ends. Turning a video into
// frames and frames back into a video belongs to external tools; these traits are
// the boundary the coordinator and the runner talk to them through.

use crate::core_modules::manifest::frame_sort_key;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Everything the assembly collaborator needs to mux one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRequest {
    pub frame_dir: PathBuf,
    /// Diff frame file names in playback order. May have gaps where pairs were skipped.
    pub frames: Vec<String>,
    pub output_video: PathBuf,
    pub fps: u32,
    /// Number embedded in the first frame's name.
    pub start_number: u64,
}

impl AssemblyRequest {
    /// True when frame numbers run without gaps from `start_number`.
    pub fn is_contiguous(&self) -> bool {
        self.frames
            .iter()
            .map(|name| frame_sort_key(name))
            .zip(self.start_number..)
            .all(|(key, expected)| key == Some(expected))
    }
}

/// Muxes a numbered image sequence into one video. Invoked once per pass, by the
/// collector, after every endpoint has passed the barrier.
#[async_trait]
pub trait VideoAssembler: Send + Sync {
    async fn assemble(&self, request: &AssemblyRequest) -> Result<()>;
}

/// Fills a directory with `frame_%04d.<ext>` images from a source video.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, video: &Path, frame_dir: &Path, fps: u32) -> Result<()>;
}

/// An assembler that produces nothing, for passes that only want the diff frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAssembly;

#[async_trait]
impl VideoAssembler for NoAssembly {
    async fn assemble(&self, request: &AssemblyRequest) -> Result<()> {
        tracing::info!(frames = request.frames.len(), "video assembly disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frames: &[&str], start_number: u64) -> AssemblyRequest {
        AssemblyRequest {
            frame_dir: PathBuf::from("out"),
            frames: frames.iter().map(|f| f.to_string()).collect(),
            output_video: PathBuf::from("out/output.mp4"),
            fps: 30,
            start_number,
        }
    }

    #[test]
    fn contiguous_sequences_are_detected() {
        assert!(request(&["frame_0002.png", "frame_0003.png", "frame_0004.png"], 2).is_contiguous());
        assert!(!request(&["frame_0002.png", "frame_0004.png"], 2).is_contiguous());
        assert!(!request(&["frame_0002.png"], 1).is_contiguous());
    }
}
