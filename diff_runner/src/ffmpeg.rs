// ffmpeg-backed frame extraction and video assembly.

use anyhow::{Context, bail};
use async_trait::async_trait;
use motion_diff::{AssemblyRequest, FrameExtractor, PassError, VideoAssembler};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Pattern the extractor writes and the assembler reads.
pub const FRAME_PATTERN: &str = "frame_%04d.png";
const CONCAT_LIST: &str = "frames.ffconcat";
const STDERR_TAIL: usize = 2000;

pub fn ensure_ffmpeg_available() -> anyhow::Result<()> {
    let out = std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .context("failed to run ffmpeg -version")?;
    if !out.status.success() {
        bail!("ffmpeg exists but returned non-zero on -version");
    }
    Ok(())
}

/// Runs ffmpeg and returns its stderr tail on failure.
async fn run_ffmpeg(args: &[OsString]) -> Result<(), String> {
    debug!(?args, "ffmpeg");
    let out = Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .map_err(|e| format!("cannot spawn ffmpeg: {e}"))?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    let tail: String = {
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let start = (start..stderr.len()).find(|i| stderr.is_char_boundary(*i)).unwrap_or(start);
        stderr[start..].trim().to_string()
    };
    Err(format!("ffmpeg exited with {}: {}", out.status, tail))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegExtractor;

impl FfmpegExtractor {
    fn args(video: &Path, frame_dir: &Path, fps: u32) -> Vec<OsString> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            video.into(),
            "-vf".into(),
            format!("fps={fps}").into(),
            frame_dir.join(FRAME_PATTERN).into(),
        ]
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract(&self, video: &Path, frame_dir: &Path, fps: u32) -> motion_diff::Result<()> {
        if tokio::fs::try_exists(frame_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(frame_dir)
                .await
                .map_err(|e| PassError::filesystem("cannot clear", frame_dir, e))?;
        }
        tokio::fs::create_dir_all(frame_dir)
            .await
            .map_err(|e| PassError::filesystem("cannot create", frame_dir, e))?;

        info!(video = %video.display(), frames = %frame_dir.display(), fps, "extracting frames");
        run_ffmpeg(&Self::args(video, frame_dir, fps))
            .await
            .map_err(PassError::Extraction)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegAssembler;

impl FfmpegAssembler {
    /// True when the frames can be read through `FRAME_PATTERN` from `start_number`.
    fn follows_pattern(request: &AssemblyRequest) -> bool {
        request.is_contiguous()
            && request
                .frames
                .iter()
                .zip(request.start_number..)
                .all(|(name, number)| *name == format!("frame_{number:04}.png"))
    }

    fn pattern_args(request: &AssemblyRequest) -> Vec<OsString> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-framerate".into(),
            request.fps.to_string().into(),
            "-start_number".into(),
            request.start_number.to_string().into(),
            "-i".into(),
            request.frame_dir.join(FRAME_PATTERN).into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            request.output_video.clone().into(),
        ]
    }

    fn concat_args(request: &AssemblyRequest, list: &Path) -> Vec<OsString> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list.into(),
            "-r".into(),
            request.fps.to_string().into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            request.output_video.clone().into(),
        ]
    }

    /// An ffconcat list showing every frame for one frame period. Paths are relative
    /// to the list, which lives in the frame directory.
    fn concat_list(request: &AssemblyRequest) -> String {
        // ffconcat durations are decimal seconds.
        let duration = 1.0 / f64::from(request.fps.max(1));
        let mut list = String::from("ffconcat version 1.0\n");
        for name in &request.frames {
            list.push_str(&format!("file '{}'\nduration {duration:.6}\n", name.replace('\'', "'\\''")));
        }
        // The last entry's duration is only honored when the file is repeated.
        if let Some(last) = request.frames.last() {
            list.push_str(&format!("file '{}'\n", last.replace('\'', "'\\''")));
        }
        list
    }

    async fn remove_stale(path: &Path) -> motion_diff::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(video = %path.display(), "removed previous output video");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PassError::filesystem("cannot remove", path, e)),
        }
    }
}

#[async_trait]
impl VideoAssembler for FfmpegAssembler {
    async fn assemble(&self, request: &AssemblyRequest) -> motion_diff::Result<()> {
        Self::remove_stale(&request.output_video).await?;

        if Self::follows_pattern(request) {
            info!(frames = request.frames.len(), start = request.start_number, "encoding video");
            return run_ffmpeg(&Self::pattern_args(request)).await.map_err(PassError::Assembly);
        }

        let list: PathBuf = request.frame_dir.join(CONCAT_LIST);
        tokio::fs::write(&list, Self::concat_list(request))
            .await
            .map_err(|e| PassError::filesystem("cannot write", &list, e))?;
        info!(frames = request.frames.len(), "encoding video from a frame list, sequence has gaps");
        let encoded = run_ffmpeg(&Self::concat_args(request, &list)).await;
        let _ = tokio::fs::remove_file(&list).await;
        encoded.map_err(PassError::Assembly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frames: &[&str], start_number: u64) -> AssemblyRequest {
        AssemblyRequest {
            frame_dir: PathBuf::from("diffs"),
            frames: frames.iter().map(|f| f.to_string()).collect(),
            output_video: PathBuf::from("diffs/output.mp4"),
            fps: 25,
            start_number,
        }
    }

    #[test]
    fn extraction_samples_at_the_requested_rate() {
        let args = FfmpegExtractor::args(Path::new("in.mp4"), Path::new("frames"), 12);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(&args[3..], &["-i", "in.mp4", "-vf", "fps=12", "frames/frame_%04d.png"]);
    }

    #[test]
    fn contiguous_sequence_uses_the_pattern() {
        let contiguous = request(&["frame_0002.png", "frame_0003.png"], 2);
        assert!(FfmpegAssembler::follows_pattern(&contiguous));
        let args = FfmpegAssembler::pattern_args(&contiguous);
        let position = args.iter().position(|a| a == "-start_number").expect("start number");
        assert_eq!(args[position + 1], "2");
        assert_eq!(args.last().map(|a| a.to_string_lossy().into_owned()), Some("diffs/output.mp4".to_string()));
    }

    #[test]
    fn gaps_or_foreign_names_fall_back_to_a_list() {
        assert!(!FfmpegAssembler::follows_pattern(&request(&["frame_0002.png", "frame_0004.png"], 2)));
        assert!(!FfmpegAssembler::follows_pattern(&request(&["frame_2.png", "frame_3.png"], 2)));
        assert!(!FfmpegAssembler::follows_pattern(&request(&["frame_0002.jpg"], 2)));
    }

    #[test]
    fn concat_list_repeats_the_last_frame() {
        let list = FfmpegAssembler::concat_list(&request(&["frame_0002.png", "frame_0004.png"], 2));
        assert_eq!(
            list,
            "ffconcat version 1.0\n\
             file 'frame_0002.png'\nduration 0.040000\n\
             file 'frame_0004.png'\nduration 0.040000\n\
             file 'frame_0004.png'\n"
        );
    }

    #[test]
    fn concat_durations_are_decimal_seconds() {
        let mut at_30 = request(&["frame_0001.png"], 1);
        at_30.fps = 30;
        assert!(FfmpegAssembler::concat_list(&at_30).contains("duration 0.033333\n"));

        at_30.fps = 0;
        assert!(FfmpegAssembler::concat_list(&at_30).contains("duration 1.000000\n"));
    }

    #[tokio::test]
    async fn missing_stale_video_is_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("output.mp4");
        FfmpegAssembler::remove_stale(&video).await.expect("nothing to remove");

        std::fs::write(&video, b"old").expect("write");
        FfmpegAssembler::remove_stale(&video).await.expect("removed");
        assert!(!video.exists());
    }
}
