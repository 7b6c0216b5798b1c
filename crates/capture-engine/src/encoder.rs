//! External ffmpeg encoder: argument composition and process lifecycle.
//!
//! The encoder reads a stream of concatenated JPEG images on stdin and
//! writes one finished video file. Frame timing is either rebuilt from
//! wall-clock arrival (pass-through pacing) or assumed to be the nominal
//! rate (throttled pacing).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use siterec_common::config::{OutputFormat, PacingMode};
use siterec_common::error::{SiterecError, SiterecResult};
use siterec_job_model::CropRect;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Lines of encoder stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Everything needed to compose one encoder invocation.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: PathBuf,
    /// Output width; must be even.
    pub width: u32,
    /// Output height; must be even.
    pub height: u32,
    pub crop: Option<CropRect>,
    pub fps: u32,
    pub crf: u32,
    /// H.264 speed preset, ignored for WebM.
    pub preset: String,
    pub format: OutputFormat,
    pub pacing: PacingMode,
    /// Hard cap on output length.
    pub duration_cap: Option<Duration>,
    pub verbose: bool,
}

impl EncoderSettings {
    pub fn validate(&self) -> SiterecResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SiterecError::encoder("output width/height must be non-zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(SiterecError::encoder(
                "output width/height must be even (required for yuv420p output)",
            ));
        }
        if self.fps == 0 {
            return Err(SiterecError::encoder("fps must be non-zero"));
        }
        if let Some(crop) = self.crop {
            if crop.width < 2 || crop.height < 2 {
                return Err(SiterecError::encoder("crop rectangle is empty"));
            }
        }
        Ok(())
    }

    /// Filter chain: crop, then rate normalization, then scale.
    pub fn filter_graph(&self) -> String {
        let mut filters = Vec::with_capacity(3);
        if let Some(crop) = self.crop {
            filters.push(format!(
                "crop={}:{}:{}:{}",
                crop.width, crop.height, crop.x, crop.y
            ));
        }
        filters.push(format!("fps={}", self.fps));
        filters.push(format!(
            "scale={}:{}:flags=lanczos",
            self.width, self.height
        ));
        filters.join(",")
    }

    /// Full argument list for writing to `output`.
    pub fn build_args(&self, output: &Path) -> Vec<String> {
        let fps = self.fps.to_string();
        let loglevel = if self.verbose { "info" } else { "error" };
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            loglevel.into(),
            "-f".into(),
            "image2pipe".into(),
        ];

        match self.pacing {
            PacingMode::PassThrough => args.extend([
                "-use_wallclock_as_timestamps".into(),
                "1".into(),
                "-fflags".into(),
                "+genpts".into(),
            ]),
            PacingMode::Throttle => args.extend(["-framerate".into(), fps.clone()]),
        }

        args.extend(["-c:v".into(), "mjpeg".into(), "-i".into(), "pipe:0".into()]);

        if let Some(cap) = self.duration_cap {
            args.extend(["-t".into(), format!("{:.3}", cap.as_secs_f64())]);
        }

        args.extend([
            "-vf".into(),
            self.filter_graph(),
            "-r".into(),
            fps,
            "-an".into(),
        ]);

        match self.format {
            OutputFormat::Mp4 => args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                self.preset.clone(),
                "-crf".into(),
                self.crf.to_string(),
                "-movflags".into(),
                "+faststart".into(),
            ]),
            OutputFormat::Webm => args.extend([
                "-c:v".into(),
                "libvpx-vp9".into(),
                "-crf".into(),
                self.crf.to_string(),
                "-b:v".into(),
                "0".into(),
                "-deadline".into(),
                "realtime".into(),
                "-cpu-used".into(),
                "8".into(),
            ]),
        }

        args.extend([
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-y".into(),
            output.display().to_string(),
        ]);
        args
    }
}

/// A running encoder process.
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_tail: Option<JoinHandle<String>>,
}

impl EncoderProcess {
    /// Validate settings and start the encoder writing to `output`.
    pub fn spawn(settings: &EncoderSettings, output: &Path) -> SiterecResult<Self> {
        settings.validate()?;
        let args = settings.build_args(output);
        tracing::debug!(program = %settings.program.display(), args = ?args, "Spawning encoder");

        let mut cmd = Command::new(&settings.program);
        cmd.args(&args);
        Self::spawn_command(cmd)
    }

    /// Start an arbitrary command with the encoder's stdio wiring.
    pub fn spawn_command(mut cmd: Command) -> SiterecResult<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SiterecError::encoder(format!("failed to spawn encoder (is it installed?): {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SiterecError::encoder("failed to open encoder stdin"))?;

        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(line = %line, "encoder stderr");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        tracing::info!(pid = child.id(), "Encoder started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_tail,
        })
    }

    /// Hand over the input stream. Returns `None` after the first call.
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Resolves when the process exits, without consuming it.
    ///
    /// Cancel safe, so it can sit in a `select!` beside the recording timer.
    /// A later [`finish`](Self::finish) still reports the same status.
    pub async fn exited(&mut self) -> SiterecResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Kill the process, discarding whatever it has written so far.
    pub async fn kill(mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Encoder kill failed");
        }
        if let Some(task) = self.stderr_tail.take() {
            task.abort();
        }
    }

    /// Close input and wait for the encoder to exit.
    ///
    /// A non-zero exit is an error carrying the tail of stderr. If the process
    /// has not exited within `timeout` it is killed.
    pub async fn finish(mut self, timeout: Duration) -> SiterecResult<()> {
        drop(self.stdin.take());

        let waited = tokio::time::timeout(timeout, self.child.wait()).await;
        let status = match waited {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(?timeout, "Encoder did not exit in time, killing");
                self.kill().await;
                return Err(SiterecError::EncoderTimeout { duration: timeout });
            }
        };

        let stderr = match self.stderr_tail.take() {
            Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            tracing::info!("Encoder finished");
            Ok(())
        } else {
            Err(SiterecError::EncoderExit {
                status: status.to_string(),
                stderr,
            })
        }
    }
}

/// Check that the encoder produced a non-empty file. Returns its size.
pub async fn verify_output(path: &Path, frames: u64) -> SiterecResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        _ => Err(SiterecError::EmptyOutput {
            path: path.to_path_buf(),
            frames,
        }),
    }
}

/// Whether `program -version` runs successfully.
pub async fn is_encoder_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            program: PathBuf::from("ffmpeg"),
            width: 1280,
            height: 720,
            crop: None,
            fps: 25,
            crf: 23,
            preset: "veryfast".to_string(),
            format: OutputFormat::Mp4,
            pacing: PacingMode::PassThrough,
            duration_cap: None,
            verbose: false,
        }
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("missing {flag} in {args:?}"))
    }

    #[test]
    fn args_follow_invocation_order() {
        let mut s = settings();
        s.crop = Some(CropRect {
            x: 10,
            y: 20,
            width: 1280,
            height: 720,
        });
        s.duration_cap = Some(Duration::from_millis(5_500));
        let args = s.build_args(Path::new("/out/video.mp4"));

        let order = [
            position(&args, "-loglevel"),
            position(&args, "image2pipe"),
            position(&args, "mjpeg"),
            position(&args, "pipe:0"),
            position(&args, "-t"),
            position(&args, "-vf"),
            position(&args, "-r"),
            position(&args, "libx264"),
            position(&args, "-pix_fmt"),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{args:?}");
        assert_eq!(args.last().map(String::as_str), Some("/out/video.mp4"));
        assert_eq!(args[position(&args, "-t") + 1], "5.500");
        assert_eq!(
            args[position(&args, "-vf") + 1],
            "crop=1280:720:10:20,fps=25,scale=1280:720:flags=lanczos"
        );
    }

    #[test]
    fn no_crop_means_rate_then_scale() {
        assert_eq!(settings().filter_graph(), "fps=25,scale=1280:720:flags=lanczos");
    }

    #[test]
    fn pacing_selects_input_timing() {
        let pass = settings().build_args(Path::new("a.mp4"));
        assert!(pass.contains(&"-use_wallclock_as_timestamps".to_string()));
        assert!(!pass.contains(&"-framerate".to_string()));

        let mut s = settings();
        s.pacing = PacingMode::Throttle;
        let throttled = s.build_args(Path::new("a.mp4"));
        assert_eq!(throttled[position(&throttled, "-framerate") + 1], "25");
        assert!(position(&throttled, "-framerate") < position(&throttled, "-i"));
    }

    #[test]
    fn webm_uses_vp9_quality_flags() {
        let mut s = settings();
        s.format = OutputFormat::Webm;
        s.crf = 33;
        let args = s.build_args(Path::new("a.webm"));
        assert_eq!(args[position(&args, "libvpx-vp9") + 2], "33");
        assert_eq!(args[position(&args, "-b:v") + 1], "0");
        assert!(!args.contains(&"libx264".to_string()));
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let mut s = settings();
        s.width = 1281;
        assert!(s.validate().is_err());
        s.width = 1280;
        s.fps = 0;
        assert!(s.validate().is_err());
        assert!(settings().validate().is_ok());
    }

    #[tokio::test]
    async fn missing_or_empty_output_fails_verification() {
        let dir = std::env::temp_dir().join(format!("siterec-verify-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let missing = dir.join("missing.mp4");
        let err = verify_output(&missing, 42).await.unwrap_err();
        assert!(err.to_string().contains("Captured 42 frames"));

        let empty = dir.join("empty.mp4");
        tokio::fs::write(&empty, b"").await.unwrap();
        assert!(verify_output(&empty, 1).await.is_err());

        let good = dir.join("good.mp4");
        tokio::fs::write(&good, b"\x00\x00\x00\x18ftyp").await.unwrap();
        assert_eq!(verify_output(&good, 1).await.unwrap(), 8);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_receives_input_and_exits_cleanly() {
        use tokio::io::AsyncWriteExt;

        let out = std::env::temp_dir().join(format!("siterec-enc-{}.bin", std::process::id()));
        let mut encoder =
            EncoderProcess::spawn_command(shell(&format!("cat > '{}'", out.display()))).unwrap();
        let mut input = encoder.take_input().unwrap();
        assert!(encoder.take_input().is_none());
        input.write_all(b"frame-bytes").await.unwrap();
        input.shutdown().await.unwrap();
        drop(input);

        encoder.finish(Duration::from_secs(5)).await.unwrap();
        assert_eq!(verify_output(&out, 1).await.unwrap(), 11);
        let _ = tokio::fs::remove_file(&out).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_status_and_stderr() {
        let encoder = EncoderProcess::spawn_command(shell("echo 'bad input' >&2; exit 3")).unwrap();
        let err = encoder.finish(Duration::from_secs(5)).await.unwrap_err();
        match err {
            SiterecError::EncoderExit { status, stderr } => {
                assert!(status.contains('3'), "{status}");
                assert!(stderr.contains("bad input"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_observed_before_finish() {
        let mut encoder = EncoderProcess::spawn_command(shell("exit 7")).unwrap();
        let _input = encoder.take_input();
        let status = tokio::time::timeout(Duration::from_secs(5), encoder.exited())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(7));

        let err = encoder.finish(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SiterecError::EncoderExit { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drain_timeout_kills_the_process() {
        let encoder = EncoderProcess::spawn_command(shell("sleep 30")).unwrap();
        let err = encoder
            .finish(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SiterecError::EncoderTimeout { .. }));
    }
}
