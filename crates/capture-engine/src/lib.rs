//! Siterec Capture Engine
//!
//! Records a web page to a video file. A headless browser streams
//! screencast frames over the DevTools protocol; the frame relay writes
//! them into an external encoder's stdin; the pipeline ties one of each
//! together for a single job and verifies the finished file.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Recorder                         │
//! │  ┌──────────────┐   ┌────────────┐   ┌──────────────┐  │
//! │  │BrowserSession│──▶│ FrameRelay │──▶│EncoderProcess│  │
//! │  │ (CDP, ack)   │   │ (pacing)   │   │ (ffmpeg)     │  │
//! │  └──────────────┘   └────────────┘   └──────┬───────┘  │
//! │     FrameGate: bounded, drop-on-full        │          │
//! │                                             ▼          │
//! │                             {host}_{time}_{id}.mp4     │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod encoder;
pub mod pipeline;
pub mod relay;

pub use browser::{BrowserSession, CaptureFrame, LaunchOptions, ScreencastOptions};
pub use encoder::{is_encoder_available, verify_output, EncoderProcess, EncoderSettings};
pub use pipeline::{Recorder, StopReason};
pub use relay::{FrameRelay, PacingStrategy, RelayStats};
