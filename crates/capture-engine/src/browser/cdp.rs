//! Low-level CDP (Chrome DevTools Protocol) WebSocket client.
//!
//! Connects to the browser-level DevTools endpoint and provides
//! request/response correlation by command id. Commands may target a
//! flattened page session via `sessionId`. Events are delivered on a bounded
//! channel; the reader task applies backpressure to the socket rather than
//! buffering without limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use siterec_common::error::{SiterecError, SiterecResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpResponse>>>>;

/// Default timeout for a command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the event channel between the socket reader and its consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A CDP event received from the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// The event method name (e.g. "Page.screencastFrame").
    pub method: String,
    /// The event parameters.
    pub params: Value,
    /// The flattened target session the event belongs to, if any.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
struct CdpCommand<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// A CDP response from the browser.
#[derive(Debug, Clone)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<CdpResponseError>,
}

/// Error object in a CDP response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CdpResponseError {
    pub code: i64,
    pub message: String,
}

/// An open DevTools connection: the command client, the event stream and
/// the reader task feeding both.
pub struct CdpConnection {
    pub client: CdpClient,
    pub events: mpsc::Receiver<CdpEvent>,
    pub reader: JoinHandle<()>,
}

/// Command half of a DevTools connection. Cheap to clone; all clones share
/// the socket and the id counter.
#[derive(Clone)]
pub struct CdpClient {
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
    writer: Arc<Mutex<WsSink>>,
}

impl CdpClient {
    /// Connect to a DevTools WebSocket endpoint such as
    /// `ws://127.0.0.1:{port}/devtools/browser/{id}`.
    pub async fn connect(ws_url: &str) -> SiterecResult<CdpConnection> {
        tracing::debug!(url = ws_url, "Connecting to DevTools WebSocket");

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| {
                SiterecError::transport(format!("failed to connect to {ws_url}: {e}"))
            })?;

        let (writer, reader) = ws_stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), event_tx));

        Ok(CdpConnection {
            client: Self {
                next_id: Arc::new(AtomicU64::new(1)),
                pending,
                writer: Arc::new(Mutex::new(writer)),
            },
            events,
            reader,
        })
    }

    /// Send a command and wait for its result.
    pub async fn send_command(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> SiterecResult<Value> {
        self.send_command_with_timeout(method, params, session_id, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Send a command with a custom timeout.
    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> SiterecResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Register before sending so a fast response cannot be missed.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write(id, method, params, session_id).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(SiterecError::transport(
                    "response channel closed unexpectedly",
                ))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(SiterecError::timeout(method, timeout));
            }
        };

        if let Some(err) = response.error {
            return Err(SiterecError::Cdp {
                code: err.code,
                message: err.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a command without waiting for its response.
    ///
    /// Used for screencast acknowledgments, which must never stall the event
    /// consumer on a round trip.
    pub async fn send_detached(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> SiterecResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write(id, method, params, session_id).await
    }

    async fn write(
        &self,
        id: u64,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> SiterecResult<()> {
        let json = serde_json::to_string(&CdpCommand {
            id,
            method,
            params,
            session_id,
        })?;
        tracing::trace!(id, method, "Sending CDP command");

        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SiterecError::transport(format!("failed to send {method}: {e}")))
    }
}

/// Reads socket messages until the connection drops.
///
/// Messages with an `id` resolve pending commands; messages with a `method`
/// are forwarded as events. When the socket closes every pending command is
/// failed and the event channel is closed, which is how consumers learn the
/// browser went away.
async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: PendingMap,
    event_tx: mpsc::Sender<CdpEvent>,
) {
    while let Some(msg_result) = reader.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "DevTools socket read error");
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Message::Close(_) => {
                tracing::debug!("DevTools socket closed by browser");
                break;
            }
            _ => continue,
        };

        match decode_message(&text) {
            Some(Incoming::Response(response)) => {
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(response);
                }
            }
            Some(Incoming::Event(event)) => {
                // A dropped consumer is fine; keep reading so responses still land.
                let _ = event_tx.send(event).await;
            }
            None => {}
        }
    }

    let mut pending_guard = pending.lock().await;
    for (id, tx) in pending_guard.drain() {
        let _ = tx.send(CdpResponse {
            id,
            result: None,
            error: Some(CdpResponseError {
                code: -1,
                message: "DevTools connection closed".to_string(),
            }),
        });
    }
}

/// Wire shape shared by responses and events.
#[derive(Debug, serde::Deserialize)]
struct RawMessage {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<CdpResponseError>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// A decoded message from the socket.
#[derive(Debug)]
enum Incoming {
    Response(CdpResponse),
    Event(CdpEvent),
}

/// Classify one text frame. Anything with an `id` is a response; anything
/// else needs a `method` to count as an event.
fn decode_message(text: &str) -> Option<Incoming> {
    let raw: RawMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse CDP message");
            return None;
        }
    };
    match (raw.id, raw.method) {
        (Some(id), _) => Some(Incoming::Response(CdpResponse {
            id,
            result: raw.result,
            error: raw.error,
        })),
        (None, Some(method)) => Some(Incoming::Event(CdpEvent {
            method,
            params: raw.params,
            session_id: raw.session_id,
        })),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> CdpResponse {
        match decode_message(text) {
            Some(Incoming::Response(r)) => r,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn event(text: &str) -> CdpEvent {
        match decode_message(text) {
            Some(Incoming::Event(e)) => e,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[test]
    fn responses_carry_result_or_error() {
        let ok = response(r#"{"id":1,"result":{"frameId":"abc123"}}"#);
        assert_eq!(ok.id, 1);
        assert!(ok.error.is_none());
        assert_eq!(ok.result.unwrap()["frameId"], "abc123");

        let failed = response(r#"{"id":2,"error":{"code":-32602,"message":"Invalid params"}}"#);
        let err = failed.error.unwrap();
        assert_eq!((err.code, err.message.as_str()), (-32602, "Invalid params"));
    }

    #[test]
    fn screencast_frame_keeps_both_session_ids_apart() {
        // The flattened target session sits at the top level; the screencast
        // session used for acks sits inside params.
        let frame = event(
            r#"{"method":"Page.screencastFrame","params":{"sessionId":4,"data":"AAAA"},"sessionId":"PAGE-1"}"#,
        );
        assert_eq!(frame.method, "Page.screencastFrame");
        assert_eq!(frame.session_id.as_deref(), Some("PAGE-1"));
        assert_eq!(frame.params["sessionId"], 4);
    }

    #[test]
    fn load_event_without_params_or_session() {
        let load = event(r#"{"method":"Page.loadEventFired"}"#);
        assert_eq!(load.params, Value::Null);
        assert!(load.session_id.is_none());
    }

    #[test]
    fn garbage_and_shapeless_messages_are_skipped() {
        assert!(decode_message("not json").is_none());
        assert!(decode_message(r#"{"params":{}}"#).is_none());
    }

    #[test]
    fn session_id_is_sent_only_for_page_commands() {
        let page = serde_json::to_value(CdpCommand {
            id: 7,
            method: "Page.navigate",
            params: serde_json::json!({ "url": "https://example.com" }),
            session_id: Some("PAGE-1"),
        })
        .unwrap();
        assert_eq!(page["sessionId"], "PAGE-1");
        assert_eq!(page["params"]["url"], "https://example.com");

        let browser = serde_json::to_value(CdpCommand {
            id: 8,
            method: "Browser.close",
            params: serde_json::json!({}),
            session_id: None,
        })
        .unwrap();
        assert!(browser.get("sessionId").is_none());
    }
}
