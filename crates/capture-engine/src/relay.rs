//! Frame relay from the screencast channel into the encoder's input.
//!
//! Frames are written whole and in arrival order. A frame that cannot be
//! forwarded (recording no longer live, sink gone, or throttled) is dropped
//! and counted; nothing here ever blocks the browser side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use siterec_common::clock::{RateController, RecordingClock};
use siterec_common::config::PacingMode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::browser::CaptureFrame;

/// How frames are paced on their way to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingStrategy {
    /// Forward everything; timing is rebuilt from arrival times downstream.
    PassThrough,
    /// Forward at most one frame per target interval.
    Throttle { fps: u32 },
}

impl PacingStrategy {
    pub fn from_mode(mode: PacingMode, fps: u32) -> Self {
        match mode {
            PacingMode::PassThrough => Self::PassThrough,
            PacingMode::Throttle => Self::Throttle { fps: fps.max(1) },
        }
    }
}

/// Why a frame was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotLive,
    SinkClosed,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Forwarded,
    Dropped(DropReason),
}

/// Runtime statistics from a relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    /// Frames written to the sink.
    pub frames_forwarded: u64,

    /// Frames discarded by the relay.
    pub frames_dropped: u64,

    /// Bytes written to the sink.
    pub bytes_written: u64,

    /// Whether the sink failed before the stream ended.
    pub sink_closed: bool,
}

impl RelayStats {
    /// Drop rate as a percentage.
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_forwarded + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / total as f64 * 100.0
    }
}

/// Writes frames into an encoder input stream.
pub struct FrameRelay<W> {
    sink: Option<W>,
    live: Arc<AtomicBool>,
    pacer: Option<RateController>,
    clock: RecordingClock,
    stats: RelayStats,
}

impl<W: AsyncWrite + Unpin> FrameRelay<W> {
    /// `live` gates forwarding; once it is cleared every later frame is
    /// dropped.
    pub fn new(sink: W, pacing: PacingStrategy, live: Arc<AtomicBool>) -> Self {
        let pacer = match pacing {
            PacingStrategy::PassThrough => None,
            PacingStrategy::Throttle { fps } => Some(RateController::new(fps)),
        };
        Self {
            sink: Some(sink),
            live,
            pacer,
            clock: RecordingClock::start(),
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn is_sink_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Forward one frame or account for dropping it.
    pub async fn relay_frame(&mut self, frame: &CaptureFrame) -> FrameDisposition {
        let disposition = self.try_forward(frame).await;
        match disposition {
            FrameDisposition::Forwarded => {
                self.stats.frames_forwarded += 1;
                self.stats.bytes_written += frame.data.len() as u64;
                let n = self.stats.frames_forwarded;
                if n == 1 || n % 25 == 0 {
                    tracing::debug!(frames = n, sequence = frame.sequence, "Frames forwarded");
                }
            }
            FrameDisposition::Dropped(reason) => {
                self.stats.frames_dropped += 1;
                tracing::trace!(sequence = frame.sequence, ?reason, "Frame dropped");
            }
        }
        disposition
    }

    async fn try_forward(&mut self, frame: &CaptureFrame) -> FrameDisposition {
        if !self.live.load(Ordering::SeqCst) {
            return FrameDisposition::Dropped(DropReason::NotLive);
        }
        if let Some(pacer) = self.pacer.as_mut() {
            if !pacer.should_tick(self.clock.ns_at(frame.received_at)) {
                return FrameDisposition::Dropped(DropReason::Throttled);
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return FrameDisposition::Dropped(DropReason::SinkClosed);
        };
        match sink.write_all(&frame.data).await {
            Ok(()) => FrameDisposition::Forwarded,
            Err(e) => {
                tracing::warn!(error = %e, "Encoder input closed, dropping further frames");
                self.sink = None;
                self.stats.sink_closed = true;
                FrameDisposition::Dropped(DropReason::SinkClosed)
            }
        }
    }

    /// Flush and half-close the sink so the encoder sees end of input.
    pub async fn finish(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush().await {
                tracing::debug!(error = %e, "Flushing encoder input failed");
            }
            if let Err(e) = sink.shutdown().await {
                tracing::debug!(error = %e, "Closing encoder input failed");
            }
        }
    }

    /// Relay until the channel ends or the sink fails, then close the sink.
    pub async fn run(mut self, mut frames: mpsc::Receiver<CaptureFrame>) -> RelayStats {
        while let Some(frame) = frames.recv().await {
            self.relay_frame(&frame).await;
            if !self.is_sink_open() {
                break;
            }
        }
        self.finish().await;
        tracing::debug!(
            forwarded = self.stats.frames_forwarded,
            dropped = self.stats.frames_dropped,
            drop_rate = self.stats.drop_rate(),
            "Relay finished"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};

    fn frame(sequence: u64, data: &[u8], received_at: Instant) -> CaptureFrame {
        CaptureFrame {
            data: data.to_vec(),
            received_at,
            sequence,
        }
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn pass_through_writes_frames_whole_and_in_order() {
        let live = Arc::new(AtomicBool::new(true));
        let mut relay = FrameRelay::new(Vec::new(), PacingStrategy::PassThrough, live);
        let now = Instant::now();

        assert_eq!(
            relay.relay_frame(&frame(1, b"AAA", now)).await,
            FrameDisposition::Forwarded
        );
        assert_eq!(
            relay.relay_frame(&frame(2, b"BB", now)).await,
            FrameDisposition::Forwarded
        );

        assert_eq!(relay.sink.as_deref(), Some(&b"AAABB"[..]));
        assert_eq!(relay.stats().frames_forwarded, 2);
        assert_eq!(relay.stats().bytes_written, 5);
    }

    #[tokio::test]
    async fn frames_after_live_cleared_are_dropped() {
        let live = Arc::new(AtomicBool::new(true));
        let mut relay =
            FrameRelay::new(Vec::new(), PacingStrategy::PassThrough, Arc::clone(&live));
        relay.relay_frame(&frame(1, b"A", Instant::now())).await;

        live.store(false, Ordering::SeqCst);
        assert_eq!(
            relay.relay_frame(&frame(2, b"B", Instant::now())).await,
            FrameDisposition::Dropped(DropReason::NotLive)
        );
        assert_eq!(relay.sink.as_deref(), Some(&b"A"[..]));
        assert_eq!(relay.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn write_failure_closes_sink_without_error() {
        let live = Arc::new(AtomicBool::new(true));
        let mut relay = FrameRelay::new(BrokenPipe, PacingStrategy::PassThrough, live);

        assert_eq!(
            relay.relay_frame(&frame(1, b"A", Instant::now())).await,
            FrameDisposition::Dropped(DropReason::SinkClosed)
        );
        assert!(!relay.is_sink_open());
        assert_eq!(
            relay.relay_frame(&frame(2, b"B", Instant::now())).await,
            FrameDisposition::Dropped(DropReason::SinkClosed)
        );
        assert!(relay.stats().sink_closed);
        assert_eq!(relay.stats().frames_dropped, 2);
    }

    #[tokio::test]
    async fn throttle_forwards_at_most_one_frame_per_interval() {
        let live = Arc::new(AtomicBool::new(true));
        let mut relay = FrameRelay::new(Vec::new(), PacingStrategy::Throttle { fps: 10 }, live);
        let base = Instant::now() + Duration::from_millis(10);

        let offsets_ms = [0u64, 30, 60, 100, 150, 210];
        let mut forwarded = Vec::new();
        for (i, ms) in offsets_ms.iter().enumerate() {
            let f = frame(i as u64 + 1, &[i as u8], base + Duration::from_millis(*ms));
            if relay.relay_frame(&f).await == FrameDisposition::Forwarded {
                forwarded.push(f.sequence);
            }
        }

        // 100ms interval: frames at 0, 100 and 210 pass.
        assert_eq!(forwarded, vec![1, 4, 6]);
        assert_eq!(relay.stats().frames_dropped, 3);
    }

    #[tokio::test]
    async fn run_drains_channel_then_closes_sink() {
        let live = Arc::new(AtomicBool::new(true));
        let relay = FrameRelay::new(Vec::new(), PacingStrategy::PassThrough, live);
        let (tx, rx) = mpsc::channel(4);
        for i in 1..=3u8 {
            tx.send(frame(i as u64, &[i], Instant::now())).await.unwrap();
        }
        drop(tx);

        let stats = relay.run(rx).await;
        assert_eq!(stats.frames_forwarded, 3);
        assert_eq!(stats.drop_rate(), 0.0);
    }

    #[test]
    fn strategy_follows_configured_mode() {
        assert_eq!(
            PacingStrategy::from_mode(PacingMode::PassThrough, 25),
            PacingStrategy::PassThrough
        );
        assert_eq!(
            PacingStrategy::from_mode(PacingMode::Throttle, 0),
            PacingStrategy::Throttle { fps: 1 }
        );
    }
}
