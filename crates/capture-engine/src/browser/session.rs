//! Browser session: one headless browser process driven over CDP.
//!
//! A background pump task owns the event stream for the lifetime of the
//! session. It turns `Page.screencastFrame` events into [`CaptureFrame`]s,
//! offers them to a bounded channel through the [`FrameGate`], and
//! acknowledges every frame to the browser whether or not it was accepted.
//! It also tracks page load events for navigation and raises the closed
//! signal when the transport goes away.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use siterec_common::error::{SiterecError, SiterecResult};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::cdp::{CdpClient, CdpEvent};
use super::launcher::{launch_browser, LaunchOptions};

const CLOSE_GRACE: Duration = Duration::from_secs(3);
const STOP_SCREENCAST_TIMEOUT: Duration = Duration::from_secs(5);

const MOTION_SUPPRESSION_SCRIPT: &str = r#"(() => {
  const apply = () => {
    const style = document.createElement('style');
    style.setAttribute('data-siterec', 'motion');
    style.textContent = '*, *::before, *::after {' +
      ' animation-duration: 0.001s !important; animation-delay: 0s !important;' +
      ' animation-iteration-count: 1 !important;' +
      ' transition-duration: 0.001s !important; transition-delay: 0s !important;' +
      ' scroll-behavior: auto !important; caret-color: transparent !important; }';
    (document.head || document.documentElement).appendChild(style);
  };
  if (document.readyState === 'loading') {
    document.addEventListener('DOMContentLoaded', apply, { once: true });
  } else {
    apply();
  }
})();"#;

/// One compressed frame pushed by the screencast.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Encoded image bytes (JPEG by default).
    pub data: Vec<u8>,
    /// When the frame arrived from the browser.
    pub received_at: Instant,
    /// 1-based arrival order within the session.
    pub sequence: u64,
}

/// Screencast parameters.
#[derive(Debug, Clone)]
pub struct ScreencastOptions {
    /// Image format, "jpeg" or "png".
    pub format: &'static str,
    pub quality: u8,
    pub every_nth_frame: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Capacity of the frame channel handed to the relay.
    pub buffer: usize,
}

/// Outcome of offering a frame to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOffer {
    Enqueued,
    /// No screencast consumer is attached (not started or already stopped).
    Detached,
    /// The consumer is behind; the frame was discarded.
    Full,
    /// The consumer has gone away.
    Closed,
}

/// Non-blocking hand-off point between the browser and the frame relay.
///
/// `offer` never waits: a full or closed channel discards the frame. The
/// caller acknowledges the frame to the browser regardless of the outcome.
#[derive(Debug, Default)]
pub struct FrameGate {
    sender: Mutex<Option<mpsc::Sender<CaptureFrame>>>,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl FrameGate {
    /// Attach a consumer. Replaces any previous one.
    pub fn open(&self, sender: mpsc::Sender<CaptureFrame>) {
        if let Ok(mut guard) = self.sender.lock() {
            *guard = Some(sender);
        }
    }

    /// Detach the consumer. Dropping the sender lets the receiver drain and
    /// then observe end-of-stream.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn offer(&self, data: Vec<u8>) -> FrameOffer {
        let sequence = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = CaptureFrame {
            data,
            received_at: Instant::now(),
            sequence,
        };

        let outcome = match self.sender.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => match tx.try_send(frame) {
                    Ok(()) => FrameOffer::Enqueued,
                    Err(mpsc::error::TrySendError::Full(_)) => FrameOffer::Full,
                    Err(mpsc::error::TrySendError::Closed(_)) => FrameOffer::Closed,
                },
                None => FrameOffer::Detached,
            },
            Err(_) => FrameOffer::Closed,
        };

        if outcome != FrameOffer::Enqueued {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        outcome
    }

    /// Frames delivered by the browser so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    /// Frames discarded at the gate.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Extract the acknowledgment id and decoded image bytes from a
/// `Page.screencastFrame` event.
///
/// The acknowledgment id is returned even when the payload is unusable so
/// the frame can still be acknowledged.
pub fn decode_screencast_frame(params: &Value) -> (Option<u64>, Option<Vec<u8>>) {
    let ack_id = params.get("sessionId").and_then(Value::as_u64);
    let data = params
        .get("data")
        .and_then(Value::as_str)
        .and_then(|b64| B64.decode(b64).ok())
        .filter(|bytes| !bytes.is_empty());
    (ack_id, data)
}

/// A live headless browser with one attached page.
pub struct BrowserSession {
    client: CdpClient,
    page_session: String,
    gate: Arc<FrameGate>,
    loads: watch::Receiver<u64>,
    closed: watch::Receiver<bool>,
    child: Option<Child>,
    profile_dir: PathBuf,
    pump: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl BrowserSession {
    /// Start a browser at the given viewport geometry and attach to a page.
    ///
    /// Any failure here is fatal to the job; the process is killed before
    /// returning the error.
    pub async fn launch(options: &LaunchOptions) -> SiterecResult<Self> {
        let launched = launch_browser(options).await?;
        let mut child = launched.child;

        match Self::attach(&launched.ws_url, options).await {
            Ok((client, page_session, pump, reader, loads, closed, gate)) => Ok(Self {
                client,
                page_session,
                gate,
                loads,
                closed,
                child: Some(child),
                profile_dir: launched.profile_dir,
                pump,
                reader,
            }),
            Err(e) => {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_dir_all(&launched.profile_dir).await;
                Err(SiterecError::launch(format!("failed to attach to browser: {e}")))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn attach(
        ws_url: &str,
        options: &LaunchOptions,
    ) -> SiterecResult<(
        CdpClient,
        String,
        JoinHandle<()>,
        JoinHandle<()>,
        watch::Receiver<u64>,
        watch::Receiver<bool>,
        Arc<FrameGate>,
    )> {
        let connection = CdpClient::connect(ws_url).await?;
        let client = connection.client;

        let target = client
            .send_command(
                "Target.createTarget",
                json!({
                    "url": "about:blank",
                    "width": options.viewport_width,
                    "height": options.viewport_height,
                }),
                None,
            )
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| SiterecError::transport("Target.createTarget returned no targetId"))?
            .to_string();

        let attached = client
            .send_command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let page_session = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SiterecError::transport("Target.attachToTarget returned no sessionId"))?
            .to_string();

        let gate = Arc::new(FrameGate::default());
        let (loads_tx, loads) = watch::channel(0u64);
        let (closed_tx, closed) = watch::channel(false);
        let pump = tokio::spawn(pump_events(
            connection.events,
            client.clone(),
            page_session.clone(),
            Arc::clone(&gate),
            loads_tx,
            closed_tx,
        ));

        let page = Some(page_session.as_str());
        client.send_command("Page.enable", json!({}), page).await?;
        client.send_command("Inspector.enable", json!({}), page).await?;
        client
            .send_command(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": options.viewport_width,
                    "height": options.viewport_height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
                page,
            )
            .await?;

        Ok((
            client,
            page_session,
            pump,
            connection.reader,
            loads,
            closed,
            gate,
        ))
    }

    /// Shorten CSS animations and transitions on every document loaded from
    /// now on.
    pub async fn suppress_motion(&self) -> SiterecResult<()> {
        self.client
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": MOTION_SUPPRESSION_SCRIPT }),
                Some(&self.page_session),
            )
            .await?;
        Ok(())
    }

    /// Navigate and wait for the load event.
    ///
    /// Returns whether the page finished loading in time. Failures and
    /// timeouts are logged and never abort the capture; whatever has rendered
    /// gets recorded.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> bool {
        let mut loads = self.loads.clone();
        let before = *loads.borrow_and_update();

        let attempt = async {
            let result = self
                .client
                .send_command_with_timeout(
                    "Page.navigate",
                    json!({ "url": url }),
                    Some(&self.page_session),
                    timeout,
                )
                .await?;
            if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
                return Err(SiterecError::navigation(error_text.to_string()));
            }
            loads
                .wait_for(|count| *count != before)
                .await
                .map_err(|_| SiterecError::transport("browser closed during navigation"))?;
            Ok(())
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {
                tracing::info!(url, "Navigation completed");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(url, error = %e, "Navigation failed, recording whatever rendered");
                false
            }
            Err(_) => {
                tracing::warn!(url, ?timeout, "Navigation timed out, continuing anyway");
                false
            }
        }
    }

    /// Begin pushing frames. The returned receiver yields frames in arrival
    /// order until the screencast stops or the browser goes away.
    pub async fn start_screencast(
        &self,
        options: &ScreencastOptions,
    ) -> SiterecResult<mpsc::Receiver<CaptureFrame>> {
        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        self.gate.open(tx);

        let started = self
            .client
            .send_command(
                "Page.startScreencast",
                json!({
                    "format": options.format,
                    "quality": options.quality,
                    "maxWidth": options.max_width,
                    "maxHeight": options.max_height,
                    "everyNthFrame": options.every_nth_frame.max(1),
                }),
                Some(&self.page_session),
            )
            .await;

        if let Err(e) = started {
            self.gate.close();
            return Err(e);
        }
        Ok(rx)
    }

    /// Stop pushing frames.
    ///
    /// The frame channel is detached first, so frames the browser emits after
    /// this call are still acknowledged but discarded. A failing
    /// `Page.stopScreencast` is only logged.
    pub async fn stop_screencast(&self) {
        self.gate.close();
        if let Err(e) = self
            .client
            .send_command_with_timeout(
                "Page.stopScreencast",
                json!({}),
                Some(&self.page_session),
                STOP_SCREENCAST_TIMEOUT,
            )
            .await
        {
            tracing::warn!(error = %e, "stopScreencast failed");
        }
    }

    /// Resolves once the DevTools transport has closed.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut closed = self.closed.clone();
        async move {
            let _ = closed.wait_for(|c| *c).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Frames delivered by the browser so far.
    pub fn frames_received(&self) -> u64 {
        self.gate.received()
    }

    /// Frames discarded before reaching the relay.
    pub fn frames_dropped(&self) -> u64 {
        self.gate.dropped()
    }

    /// Shut the browser down and release its resources. Safe to call more
    /// than once.
    pub async fn close(&mut self) {
        self.gate.close();
        let Some(mut child) = self.child.take() else {
            return;
        };

        if !self.is_closed() {
            let _ = self
                .client
                .send_command_with_timeout("Browser.close", json!({}), None, CLOSE_GRACE)
                .await;
        }

        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Browser exited"),
            _ => {
                tracing::debug!("Browser did not exit in time, killing");
                let _ = child.kill().await;
            }
        }

        self.pump.abort();
        self.reader.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            tracing::debug!(error = %e, dir = %self.profile_dir.display(), "Failed to remove browser profile");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.pump.abort();
        self.reader.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Drain page events until the transport closes or the page detaches.
async fn pump_events(
    mut events: mpsc::Receiver<CdpEvent>,
    client: CdpClient,
    page_session: String,
    gate: Arc<FrameGate>,
    loads: watch::Sender<u64>,
    closed: watch::Sender<bool>,
) {
    while let Some(event) = events.recv().await {
        if event.session_id.as_deref() != Some(page_session.as_str()) {
            let detached = event.method == "Target.detachedFromTarget"
                && event.params.get("sessionId").and_then(Value::as_str)
                    == Some(page_session.as_str());
            if detached {
                tracing::warn!("Page target detached");
                break;
            }
            continue;
        }

        match event.method.as_str() {
            "Page.screencastFrame" => {
                let (ack_id, data) = decode_screencast_frame(&event.params);
                match data {
                    Some(bytes) => {
                        let outcome = gate.offer(bytes);
                        let received = gate.received();
                        if received == 1 {
                            tracing::debug!("First frame received");
                        } else if received % 25 == 0 {
                            tracing::debug!(frames = received, "Frames captured");
                        }
                        if outcome != FrameOffer::Enqueued {
                            tracing::trace!(?outcome, "Frame dropped at gate");
                        }
                    }
                    None => tracing::warn!("Screencast frame without usable data"),
                }
                if let Some(ack_id) = ack_id {
                    if let Err(e) = client
                        .send_detached(
                            "Page.screencastFrameAck",
                            json!({ "sessionId": ack_id }),
                            Some(&page_session),
                        )
                        .await
                    {
                        tracing::debug!(error = %e, "Frame acknowledgment failed");
                    }
                }
            }
            "Page.loadEventFired" => {
                loads.send_modify(|count| *count += 1);
            }
            "Inspector.targetCrashed" => {
                tracing::warn!("Page crashed");
                break;
            }
            "Inspector.detached" => {
                tracing::warn!(reason = ?event.params.get("reason"), "Inspector detached");
                break;
            }
            _ => {}
        }
    }

    gate.close();
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_without_consumer_drops() {
        let gate = FrameGate::default();
        assert_eq!(gate.offer(vec![1, 2, 3]), FrameOffer::Detached);
        assert_eq!(gate.received(), 1);
        assert_eq!(gate.dropped(), 1);
    }

    #[tokio::test]
    async fn gate_drops_when_full_and_preserves_order() {
        let gate = FrameGate::default();
        let (tx, mut rx) = mpsc::channel(2);
        gate.open(tx);

        assert_eq!(gate.offer(vec![1]), FrameOffer::Enqueued);
        assert_eq!(gate.offer(vec![2]), FrameOffer::Enqueued);
        assert_eq!(gate.offer(vec![3]), FrameOffer::Full);
        assert_eq!(gate.dropped(), 1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.sequence, first.data), (1, vec![1]));
        assert_eq!((second.sequence, second.data), (2, vec![2]));
        assert!(first.received_at <= second.received_at);
    }

    #[tokio::test]
    async fn gate_close_ends_stream_after_buffered_frames() {
        let gate = FrameGate::default();
        let (tx, mut rx) = mpsc::channel(4);
        gate.open(tx);
        assert_eq!(gate.offer(vec![9]), FrameOffer::Enqueued);

        gate.close();
        assert_eq!(gate.offer(vec![10]), FrameOffer::Detached);

        assert_eq!(rx.recv().await.unwrap().data, vec![9]);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn gate_reports_closed_consumer() {
        let gate = FrameGate::default();
        let (tx, rx) = mpsc::channel(4);
        gate.open(tx);
        drop(rx);
        assert_eq!(gate.offer(vec![1]), FrameOffer::Closed);
    }

    #[test]
    fn screencast_frame_is_decoded() {
        let params = json!({ "sessionId": 17, "data": B64.encode([0xff, 0xd8, 0xff]) });
        let (ack, data) = decode_screencast_frame(&params);
        assert_eq!(ack, Some(17));
        assert_eq!(data, Some(vec![0xff, 0xd8, 0xff]));
    }

    #[test]
    fn bad_payload_still_yields_ack_id() {
        let params = json!({ "sessionId": 3, "data": "***not base64***" });
        let (ack, data) = decode_screencast_frame(&params);
        assert_eq!(ack, Some(3));
        assert!(data.is_none());
    }
}
