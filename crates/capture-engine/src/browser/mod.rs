//! Headless browser control over the DevTools protocol.

pub mod cdp;
pub mod launcher;
pub mod session;

pub use cdp::{CdpClient, CdpConnection, CdpEvent};
pub use launcher::{browser_candidates, launch_browser, LaunchOptions, LaunchedBrowser};
pub use session::{BrowserSession, CaptureFrame, FrameGate, FrameOffer, ScreencastOptions};
