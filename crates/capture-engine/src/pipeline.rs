//! Per-job recording pipeline.
//!
//! One [`Recorder::record`] call owns exactly one browser process and one
//! encoder process for the lifetime of a job. Both are released on every
//! exit path before the result is reported.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use siterec_common::clock::RecordingClock;
use siterec_common::config::{AppConfig, CaptureDefaults};
use siterec_common::error::{SiterecError, SiterecResult};
use siterec_job_model::{output_file_name, JobId, RecordingOutput, RecordingRequest};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::browser::{BrowserSession, CaptureFrame, LaunchOptions, ScreencastOptions};
use crate::encoder::{verify_output, EncoderProcess, EncoderSettings};
use crate::relay::{FrameRelay, PacingStrategy, RelayStats};

/// Why the recording phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested duration elapsed.
    DurationElapsed,
    /// The browser or its DevTools connection went away.
    TransportLost,
    /// The encoder stopped accepting input.
    EncoderInputClosed,
    /// The encoder process exited on its own.
    EncoderExited,
}

#[derive(Debug)]
struct CaptureSummary {
    stop: StopReason,
    relay: RelayStats,
    navigation_completed: bool,
}

/// Timing for the phase in which frames flow into the encoder.
#[derive(Debug, Clone, Copy)]
struct RecordingPlan {
    duration: Duration,
    pacing: PacingStrategy,
    drain_timeout: Duration,
}

/// Runs recording jobs with a fixed set of capture defaults.
#[derive(Debug, Clone)]
pub struct Recorder {
    config: CaptureDefaults,
    output_dir: PathBuf,
}

impl Recorder {
    pub fn new(config: CaptureDefaults, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(config.capture.clone(), config.output_dir.clone())
    }

    pub fn config(&self) -> &CaptureDefaults {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Encoder settings for a request.
    pub fn encoder_settings(&self, request: &RecordingRequest) -> EncoderSettings {
        EncoderSettings {
            program: self.config.ffmpeg_path.clone(),
            width: request.width(),
            height: request.height(),
            crop: request.crop_rect(),
            fps: self.config.fps,
            crf: self.config.crf,
            preset: self.config.preset.clone(),
            format: self.config.format,
            pacing: self.config.pacing,
            duration_cap: self.config.cap_duration.then(|| request.duration()),
            verbose: self.config.verbose_encoder,
        }
    }

    fn launch_options(&self, request: &RecordingRequest) -> LaunchOptions {
        LaunchOptions {
            viewport_width: request.viewport_width(),
            viewport_height: request.viewport_height(),
            browser_path: self.config.browser_path.clone(),
            extra_args: self.config.extra_browser_args.clone(),
            timeout: Duration::from_millis(self.config.launch_timeout_ms),
        }
    }

    fn screencast_options(&self, request: &RecordingRequest) -> ScreencastOptions {
        ScreencastOptions {
            format: "jpeg",
            quality: self.config.jpeg_quality.min(100),
            every_nth_frame: self.config.every_nth_frame,
            max_width: request.viewport_width(),
            max_height: request.viewport_height(),
            buffer: self.config.frame_buffer,
        }
    }

    /// Record one request to a new file in the output directory.
    ///
    /// Succeeds only if a non-empty video file exists afterwards.
    pub async fn record(
        &self,
        job_id: JobId,
        request: &RecordingRequest,
    ) -> SiterecResult<RecordingOutput> {
        let span = tracing::info_span!("job", job_id, url = %request.url());
        self.record_inner(job_id, request).instrument(span).await
    }

    async fn record_inner(
        &self,
        job_id: JobId,
        request: &RecordingRequest,
    ) -> SiterecResult<RecordingOutput> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let file_name = output_file_name(
            request.url(),
            Utc::now(),
            job_id,
            self.config.format.extension(),
        );
        let path = self.output_dir.join(&file_name);

        tracing::info!(
            output = %path.display(),
            duration_ms = request.duration_ms(),
            width = request.width(),
            height = request.height(),
            viewport_width = request.viewport_width(),
            viewport_height = request.viewport_height(),
            crop = ?request.crop_rect(),
            "Starting recording"
        );

        let mut session = BrowserSession::launch(&self.launch_options(request)).await?;
        let outcome = self.capture(&session, request, &path).await;
        session.close().await;

        let frames_received = session.frames_received();
        let gate_dropped = session.frames_dropped();
        let summary = outcome?;

        let size_bytes = verified_size(&path, summary.stop, frames_received).await?;

        let output = RecordingOutput {
            path,
            file_name,
            size_bytes,
            frames_received,
            frames_forwarded: summary.relay.frames_forwarded,
            frames_dropped: gate_dropped + summary.relay.frames_dropped,
            navigation_completed: summary.navigation_completed,
        };
        tracing::info!(
            size_bytes = output.size_bytes,
            frames_received = output.frames_received,
            frames_forwarded = output.frames_forwarded,
            frames_dropped = output.frames_dropped,
            "Recording complete"
        );
        Ok(output)
    }

    async fn capture(
        &self,
        session: &BrowserSession,
        request: &RecordingRequest,
        path: &Path,
    ) -> SiterecResult<CaptureSummary> {
        let drain_timeout = Duration::from_millis(self.config.drain_timeout_ms);

        if self.config.suppress_motion {
            if let Err(e) = session.suppress_motion().await {
                tracing::warn!(error = %e, "Could not install motion suppression");
            }
        }

        let navigation_completed = session
            .navigate(
                request.url().as_str(),
                Duration::from_millis(self.config.navigation_timeout_ms),
            )
            .await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)) => {}
            _ = session.closed() => {
                return Err(SiterecError::transport("browser closed before capture started"));
            }
        }

        let encoder = EncoderProcess::spawn(&self.encoder_settings(request), path)?;

        let frames = match session
            .start_screencast(&self.screencast_options(request))
            .await
        {
            Ok(frames) => frames,
            Err(e) => {
                if let Err(finish_err) = encoder.finish(drain_timeout).await {
                    tracing::debug!(error = %finish_err, "Encoder cleanup after failed screencast");
                }
                return Err(e);
            }
        };

        let plan = RecordingPlan {
            duration: request.duration(),
            pacing: PacingStrategy::from_mode(self.config.pacing, self.config.fps),
            drain_timeout,
        };
        let (stop, relay) = record_frames(
            plan,
            frames,
            encoder,
            session.closed(),
            session.stop_screencast(),
        )
        .await?;

        Ok(CaptureSummary {
            stop,
            relay,
            navigation_completed,
        })
    }
}

/// Relay frames into the encoder until the duration elapses, the transport
/// closes or the encoder goes away. Then stop the frame source, drain the
/// relay and let the encoder finish.
///
/// `stop_frames` must end the frame stream so the relay can drain. If the
/// relay is still busy after the drain timeout the encoder is killed and the
/// job fails whatever it has written.
async fn record_frames<C, S>(
    plan: RecordingPlan,
    frames: mpsc::Receiver<CaptureFrame>,
    mut encoder: EncoderProcess,
    transport_closed: C,
    stop_frames: S,
) -> SiterecResult<(StopReason, RelayStats)>
where
    C: Future<Output = ()>,
    S: Future<Output = ()>,
{
    let input = encoder
        .take_input()
        .ok_or_else(|| SiterecError::encoder("encoder input unavailable"))?;

    let live = Arc::new(AtomicBool::new(true));
    let relay = FrameRelay::new(input, plan.pacing, Arc::clone(&live));
    let mut relay_task = tokio::spawn(relay.run(frames));
    let clock = RecordingClock::start();
    tracing::info!("Recording started");

    let mut finished_relay = None;
    let stop = tokio::select! {
        _ = tokio::time::sleep(plan.duration) => StopReason::DurationElapsed,
        _ = transport_closed => StopReason::TransportLost,
        status = encoder.exited() => {
            tracing::warn!(?status, "Encoder exited during capture");
            StopReason::EncoderExited
        }
        result = &mut relay_task => {
            finished_relay = Some(result);
            StopReason::EncoderInputClosed
        }
    };
    live.store(false, Ordering::SeqCst);
    tracing::info!(?stop, elapsed_secs = clock.elapsed_secs(), "Recording stopped");

    stop_frames.await;

    let joined = match finished_relay {
        Some(result) => result,
        None => match tokio::time::timeout(plan.drain_timeout, &mut relay_task).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    drain_timeout = ?plan.drain_timeout,
                    "Relay did not drain in time, killing encoder"
                );
                encoder.kill().await;
                relay_task.abort();
                return Err(SiterecError::EncoderTimeout {
                    duration: plan.drain_timeout,
                });
            }
        },
    };
    let relay = joined.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Relay task failed");
        RelayStats::default()
    });

    encoder.finish(plan.drain_timeout).await?;
    Ok((stop, relay))
}

/// Size of the finished file. A lost transport with nothing usable on disk
/// is reported as the transport failure.
async fn verified_size(path: &Path, stop: StopReason, frames_received: u64) -> SiterecResult<u64> {
    match verify_output(path, frames_received).await {
        Ok(size) => {
            if stop == StopReason::TransportLost {
                tracing::warn!("Browser connection lost mid-capture, keeping partial recording");
            }
            Ok(size)
        }
        Err(e) if stop == StopReason::TransportLost => {
            tracing::error!(error = %e, "Browser connection lost and no usable output");
            Err(SiterecError::transport(format!(
                "browser connection lost during capture after {frames_received} frames"
            )))
        }
        Err(e) => Err(e),
    }
}
