mod cluster;
mod ffmpeg;

use anyhow::{Context, Result, bail, ensure};
use clap::{Args, Parser, Subcommand, ValueEnum};
use motion_diff::{
    BackgroundPolicy, DiffConfig, FrameExtractor, NoAssembly, PassConfig, TransportConfig, VideoAssembler,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};

#[derive(Parser)]
#[command(
    name = "diff_runner",
    version,
    about = "Highlights motion between consecutive video frames over a cluster of endpoints"
)]
struct Cli {
    /// Most verbose level that gets logged.
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract frames from an .mp4, diff them and encode the diff video
    Run {
        input_video: PathBuf,

        /// Where extracted frames go. Cleared first.
        #[arg(long, default_value = "frames")]
        frames_dir: PathBuf,

        /// Where diff frames go. Cleared first.
        #[arg(long, default_value = "diff_frames")]
        output_dir: PathBuf,

        /// Defaults to output.mp4 inside the output directory.
        #[arg(long)]
        output_video: Option<PathBuf>,

        #[command(flatten)]
        pass: PassArgs,
    },

    /// Diff an existing directory of frame_%04d.png files
    Diff {
        frames_dir: PathBuf,
        output_dir: PathBuf,

        #[arg(long)]
        output_video: Option<PathBuf>,

        /// Write the diff frames only, without encoding a video.
        #[arg(long, default_value_t = false)]
        no_video: bool,

        #[command(flatten)]
        pass: PassArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct PassArgs {
    /// Frames per second for extraction and assembly.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Number of cooperating endpoints.
    #[arg(long, default_value_t = 4)]
    endpoints: usize,

    /// Diff workers per endpoint. Default: one per core.
    #[arg(long)]
    workers: Option<usize>,

    /// A pixel changed when its channel distance is above this percentage.
    #[arg(long, default_value_t = 5.0)]
    threshold: f64,

    /// Dim unchanged pixels instead of copying them.
    #[arg(long, default_value_t = false)]
    dim: bool,

    /// Fixes region colors across runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Largest message the fabric carries, in KiB.
    #[arg(long, default_value_t = 1024)]
    fragment_kib: usize,

    /// Seconds to wait for one fragment once its transfer has started.
    #[arg(long, default_value_t = 30)]
    fragment_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl PassArgs {
    fn validate(&self) -> Result<()> {
        ensure!(self.fps > 0, "--fps must be at least 1");
        ensure!(self.endpoints > 0, "--endpoints must be at least 1");
        ensure!(self.fragment_kib > 0, "--fragment-kib must be at least 1");
        ensure!(
            (0.0..=100.0).contains(&self.threshold),
            "--threshold must be a percentage, got {}",
            self.threshold
        );
        Ok(())
    }

    fn to_config(&self, input_dir: &Path, output_dir: &Path, output_video: Option<PathBuf>) -> PassConfig {
        let mut config = PassConfig::new(input_dir, output_dir, self.fps);
        if let Some(video) = output_video {
            config.output_video = video;
        }
        config.workers = self.workers;
        config.diff = DiffConfig {
            threshold_percent: self.threshold,
            background: if self.dim { BackgroundPolicy::Dim } else { BackgroundPolicy::Copy },
            palette_seed: self.seed,
            ..DiffConfig::default()
        };
        config.transport = TransportConfig {
            max_fragment_size: self.fragment_kib * 1024,
            fragment_timeout: Duration::from_secs(self.fragment_timeout_secs),
            ..TransportConfig::default()
        };
        config
    }
}

fn validate_input_video(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("input video {} does not exist", path.display());
    }
    let is_mp4 = path
        .extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("mp4"));
    if !is_mp4 {
        bail!("input video {} is not an .mp4 file", path.display());
    }
    Ok(())
}

async fn run_pass(config: PassConfig, endpoints: usize, assembler: Arc<dyn VideoAssembler>) -> Result<()> {
    info!(
        input = %config.input_dir.display(),
        output = %config.output_dir.display(),
        endpoints,
        workers = config.worker_count(),
        "starting pass"
    );
    let results = cluster::run_local_cluster(&config, endpoints, assembler).await;
    let report = cluster::summarize(results).context("pass failed")?;

    if report.assembled {
        info!(video = %config.output_video.display(), frames = report.frames_written, "done");
    } else {
        info!(frames = report.frames_written, output = %config.output_dir.display(), "done, no video");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .init();

    match cli.cmd {
        Commands::Run {
            input_video,
            frames_dir,
            output_dir,
            output_video,
            pass,
        } => {
            pass.validate()?;
            validate_input_video(&input_video)?;
            ffmpeg::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;

            ffmpeg::FfmpegExtractor
                .extract(&input_video, &frames_dir, pass.fps)
                .await
                .with_context(|| format!("extracting frames from {}", input_video.display()))?;

            let config = pass.to_config(&frames_dir, &output_dir, output_video);
            run_pass(config, pass.endpoints, Arc::new(ffmpeg::FfmpegAssembler)).await
        }
        Commands::Diff {
            frames_dir,
            output_dir,
            output_video,
            no_video,
            pass,
        } => {
            pass.validate()?;
            let assembler: Arc<dyn VideoAssembler> = if no_video {
                Arc::new(NoAssembly)
            } else {
                ffmpeg::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;
                Arc::new(ffmpeg::FfmpegAssembler)
            };
            let config = pass.to_config(&frames_dir, &output_dir, output_video);
            run_pass(config, pass.endpoints, assembler).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn diff_flags_reach_the_pass_config() {
        let cli = Cli::try_parse_from([
            "diff_runner",
            "--log-level",
            "debug",
            "diff",
            "in",
            "out",
            "--fps",
            "12",
            "--endpoints",
            "3",
            "--threshold",
            "7.5",
            "--dim",
            "--seed",
            "9",
            "--fragment-kib",
            "64",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, LogLevel::Debug);

        let Commands::Diff {
            frames_dir,
            output_dir,
            output_video,
            no_video,
            pass,
        } = cli.cmd
        else {
            panic!("expected diff");
        };
        assert!(!no_video);
        assert_eq!(pass.endpoints, 3);

        let config = pass.to_config(&frames_dir, &output_dir, output_video);
        assert_eq!(config.fps, 12);
        assert_eq!(config.output_video, PathBuf::from("out/output.mp4"));
        assert_eq!(config.diff.threshold_percent, 7.5);
        assert_eq!(config.diff.background, BackgroundPolicy::Dim);
        assert_eq!(config.diff.palette_seed, Some(9));
        assert_eq!(config.transport.max_fragment_size, 64 * 1024);
    }

    #[test]
    fn out_of_range_arguments_are_rejected() {
        let parse = |extra: &[&str]| {
            let mut args = vec!["diff_runner", "diff", "in", "out"];
            args.extend_from_slice(extra);
            let Commands::Diff { pass, .. } = Cli::try_parse_from(args).expect("parse").cmd else {
                panic!("expected diff");
            };
            pass
        };
        assert!(parse(&[]).validate().is_ok());
        assert!(parse(&["--endpoints", "0"]).validate().is_err());
        assert!(parse(&["--fps", "0"]).validate().is_err());
        assert!(parse(&["--threshold", "150"]).validate().is_err());
    }

    #[test]
    fn input_video_must_be_an_existing_mp4() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mp4 = dir.path().join("clip.MP4");
        let avi = dir.path().join("clip.avi");
        std::fs::write(&mp4, b"x").expect("write");
        std::fs::write(&avi, b"x").expect("write");

        assert!(validate_input_video(&mp4).is_ok());
        assert!(validate_input_video(&avi).is_err());
        assert!(validate_input_video(&dir.path().join("absent.mp4")).is_err());
    }
}
