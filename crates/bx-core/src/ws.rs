//! Single-shot market-data WebSocket transport.
//!
//! Each `MdTransport` runs one connection as a tokio task that:
//! 1. Connects to the venue WebSocket endpoint (TLS) — synchronously with
//!    respect to [`MdTransport::open`], so setup failures surface to the
//!    caller immediately.
//! 2. Sends the subscription message.
//! 3. Reads messages and forwards text frames to a callback.
//! 4. Sends periodic ping messages (venue-specific format).
//! 5. Invokes `on_close` exactly once when the stream ends or errors.
//!
//! The transport does **not** reconnect on its own: reconnect and fallback
//! policy belong to the multiplexer, which owns the timers. A caller-driven
//! [`MdTransport::stop`] tears the connection down without firing
//! `on_close`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Callback invoked for each received text frame.
pub type OnTextCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked once when the transport closes on its own (stream end,
/// read error, send error). The argument is a human-readable reason.
pub type OnCloseCallback = Box<dyn FnOnce(String) + Send>;

/// Ping payload format — varies by venue.
#[derive(Debug, Clone)]
pub enum PingPayload {
    /// Send a text frame (e.g. OKX/Bitget send `"ping"`).
    Text(String),
    /// Send a JSON object as text (e.g. Bybit `{"op":"ping"}`).
    Json(serde_json::Value),
    /// Use the standard WebSocket ping frame.
    WebSocketPing,
}

/// Configuration for one transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Full WebSocket URL (e.g. `wss://stream.binance.com:443/ws`).
    pub url: String,
    /// Message to send immediately after connection (subscription request).
    pub subscribe_msg: Option<String>,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between ping messages.
    pub ping_interval: Option<Duration>,
    /// Ping message format.
    pub ping_payload: Option<PingPayload>,
    /// Log label (e.g. `"binance:BTCUSD"`).
    pub label: String,
}

impl TransportConfig {
    /// A plain transport with no subscribe message, headers, or pinging.
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscribe_msg: None,
            extra_headers: HashMap::new(),
            ping_interval: None,
            ping_payload: None,
            label: label.into(),
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A live market-data WebSocket connection managed by a background task.
pub struct MdTransport {
    label: String,
    outbound_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    /// Set before a caller-driven stop so the loop skips `on_close`.
    caller_closed: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MdTransport {
    /// Connect, subscribe, and start the read loop.
    ///
    /// Connection and subscription happen before this returns; transport
    /// setup failures are reported here, not through `on_close`.
    pub async fn open(
        config: TransportConfig,
        on_text: OnTextCallback,
        on_close: OnCloseCallback,
    ) -> Result<Self, WsError> {
        let label = config.label.clone();
        info!("[ws {label}] connecting to {}", config.url);

        let mut ws_stream = connect_ws(&config).await?;

        if let Some(ref sub_msg) = config.subscribe_msg {
            debug!("[ws {label}] subscribing: {sub_msg}");
            ws_stream.send(Message::Text(sub_msg.clone().into())).await?;
        }
        info!("[ws {label}] connected");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let caller_closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(read_loop(
            config,
            ws_stream,
            on_text,
            on_close,
            outbound_rx,
            shutdown_rx,
            Arc::clone(&caller_closed),
        ));

        Ok(Self {
            label,
            outbound_tx,
            shutdown_tx,
            caller_closed,
            task: Some(task),
        })
    }

    /// Send a text message on this connection.
    pub async fn send(&self, msg: String) -> Result<(), WsError> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| WsError::ConnectionClosed)
    }

    /// Stop the connection and wait for the task to finish.
    ///
    /// Does not fire `on_close` — the caller asked for the teardown.
    pub async fn stop(&mut self) {
        self.caller_closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("[ws {}] stopped", self.label);
    }
}

/// Main loop — reads, pings, and reports the close reason once.
async fn read_loop(
    config: TransportConfig,
    ws_stream: WsStream,
    on_text: OnTextCallback,
    on_close: OnCloseCallback,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    caller_closed: Arc<AtomicBool>,
) {
    let label = config.label.clone();
    let (mut ws_write, mut ws_read) = ws_stream.split();

    // Set up ping timer
    let ping_interval = config.ping_interval.map(tokio::time::interval);
    tokio::pin! {
        let ping_tick = async {
            if let Some(mut interval) = ping_interval {
                interval.tick().await; // skip the immediate first tick
                loop {
                    interval.tick().await;
                }
            } else {
                // No pinging — wait forever
                std::future::pending::<()>().await
            }
        };
    }

    let close_reason: String = loop {
        tokio::select! {
            // Shutdown signal
            _ = shutdown_rx.changed() => {
                info!("[ws {label}] shutdown signal received");
                let _ = ws_write.close().await;
                break "caller shutdown".into();
            }

            // Incoming message
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        on_text(&text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("[ws {label}] received close frame");
                        break match frame {
                            Some(frame) => format!("close frame: {}", frame.reason),
                            None => "close frame".into(),
                        };
                    }
                    Some(Err(e)) => {
                        error!("[ws {label}] read error: {e}");
                        break format!("read error: {e}");
                    }
                    None => {
                        warn!("[ws {label}] stream ended");
                        break "stream ended".into();
                    }
                    _ => {} // Binary, Pong, Frame — ignore
                }
            }

            // Outbound message from caller
            Some(msg) = outbound_rx.recv() => {
                if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                    error!("[ws {label}] send error: {e}");
                    break format!("send error: {e}");
                }
            }

            // Ping timer
            _ = &mut ping_tick => {
                let ping_msg = match &config.ping_payload {
                    Some(PingPayload::Text(t)) => Message::Text(t.clone().into()),
                    Some(PingPayload::Json(j)) => Message::Text(j.to_string().into()),
                    Some(PingPayload::WebSocketPing) | None => {
                        Message::Ping(vec![].into())
                    }
                };
                if let Err(e) = ws_write.send(ping_msg).await {
                    error!("[ws {label}] ping send error: {e}");
                    break format!("ping send error: {e}");
                }
            }
        }
    };

    if !caller_closed.load(Ordering::SeqCst) {
        on_close(close_reason);
    }
}

/// Establish a TLS WebSocket connection.
async fn connect_ws(config: &TransportConfig) -> Result<WsStream, WsError> {
    use tokio_tungstenite::tungstenite::http::Request;

    let mut request = Request::builder()
        .uri(&config.url)
        .header("Host", extract_host(&config.url));

    for (key, value) in &config.extra_headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let request = request.body(()).map_err(WsError::HttpFormat)?;

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Extract the host from a URL string.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("").to_string())
        .unwrap_or_default()
}
