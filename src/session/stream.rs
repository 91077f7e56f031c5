//! # session::stream
//!
//! Streaming transport seam + the WebSocket chart-feed implementation.
//!
//! [`StreamTransport`] is the boundary the renewal coordinator works
//! against: connect with credentials, disconnect, an observable status and
//! a subscription set. [`LightStream`] implements it over a provider
//! WebSocket: one read task per connection that parses tick frames into
//! [`ChartTick`]s for the ingest adapter, answers pings, and publishes every
//! status edge on a `watch` channel.
//!
//! ## Subscription continuity
//! Subscription set ถูกเก็บฝั่ง client แล้ว replay ทุกครั้งที่ connect —
//! renewal cycle จึงไม่ต้องรู้เรื่อง subscribe เลย (ดู DESIGN.md)

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::models::trade::TICK_TIMEFRAME;
use crate::models::{ChartTick, SessionCredentials};

use super::SessionError;

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Blocks until the transport reports `want`, bounded by `limit`.
pub async fn wait_for_status(
    rx: &mut watch::Receiver<TransportStatus>,
    want: TransportStatus,
    limit: std::time::Duration,
) -> Result<(), SessionError> {
    let reached = async {
        loop {
            if *rx.borrow_and_update() == want {
                return true;
            }
            if rx.changed().await.is_err() {
                return false; // sender หายไป — สถานะไม่มีวันถึง
            }
        }
    };

    match tokio::time::timeout(limit, reached).await {
        Ok(true) => Ok(()),
        _ => Err(SessionError::StatusTimeout { want, waited: limit }),
    }
}

// ─── Transport seam ───────────────────────────────────────────────────────────

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens the streaming connection using `creds` as transport identity.
    async fn connect(&self, creds: &SessionCredentials) -> Result<(), SessionError>;

    /// Starts teardown. Completion is observed through [`Self::status`]
    /// reaching `Disconnected`.
    async fn disconnect(&self);

    fn status(&self) -> watch::Receiver<TransportStatus>;

    /// Adds instruments to the retained subscription set (and pushes the
    /// subscription immediately when currently connected).
    async fn subscribe(&self, epics: &[String]);
}

// ─── LightStream ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WSS endpoint from the login session.
    pub endpoint:   String,
    /// Streaming identity — the spread-bet account id.
    pub account_id: String,
}

type WsSink   = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct LightStream {
    config:    StreamConfig,
    status:    watch::Sender<TransportStatus>,
    /// ถือ receiver ไว้เสมอ — `watch::Sender::send` ต้องมีผู้รับอย่างน้อยหนึ่ง
    status_rx: watch::Receiver<TransportStatus>,
    subs:      RwLock<Vec<String>>,
    ticks:     mpsc::UnboundedSender<ChartTick>,
    /// Outbound frame channel ของ connection ปัจจุบัน (None เมื่อไม่ได้ต่อ)
    frames:    RwLock<Option<mpsc::UnboundedSender<String>>>,
    shutdown:  RwLock<Option<watch::Sender<bool>>>,
}

impl LightStream {
    pub fn new(config: StreamConfig, ticks: mpsc::UnboundedSender<ChartTick>) -> Arc<Self> {
        let (status, status_rx) = watch::channel(TransportStatus::Disconnected);
        Arc::new(Self {
            config,
            status,
            status_rx,
            subs:     RwLock::new(Vec::new()),
            ticks,
            frames:   RwLock::new(None),
            shutdown: RwLock::new(None),
        })
    }

    fn subscription_frame(epics: &[String]) -> String {
        let items: Vec<String> = epics
            .iter()
            .map(|epic| format!("CHART:{epic}:{TICK_TIMEFRAME}"))
            .collect();
        serde_json::json!({
            "operation": "subscribe",
            "mode":      "DISTINCT",
            "items":     items,
            "fields":    ["UTM", "BID", "OFR", "LTV", "TTV"],
        })
        .to_string()
    }
}

#[async_trait]
impl StreamTransport for LightStream {
    async fn connect(&self, creds: &SessionCredentials) -> Result<(), SessionError> {
        if *self.status.borrow() == TransportStatus::Connected {
            debug!("transport already connected");
            return Ok(());
        }
        let _ = self.status.send(TransportStatus::Connecting);

        let transport_err = |e: String| SessionError::Transport(e);

        let mut request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| transport_err(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "X-LS-USER",
            HeaderValue::from_str(&self.config.account_id)
                .map_err(|e| transport_err(e.to_string()))?,
        );
        headers.insert(
            "X-LS-PASSWORD",
            HeaderValue::from_str(&creds.transport_password())
                .map_err(|e| transport_err(e.to_string()))?,
        );

        let (ws, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = self.status.send(TransportStatus::Disconnected);
                return Err(transport_err(e.to_string()));
            }
        };
        let (mut sink, stream) = ws.split();

        // ── Replay retained subscriptions ────────────────────────────────────
        let epics = self.subs.read().await.clone();
        if !epics.is_empty() {
            sink.send(Message::Text(Self::subscription_frame(&epics)))
                .await
                .map_err(|e| transport_err(e.to_string()))?;
            info!(count = epics.len(), "subscriptions replayed on connect");
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.frames.write().await = Some(frames_tx);
        *self.shutdown.write().await = Some(shutdown_tx);

        let _ = self.status.send(TransportStatus::Connected);
        info!(endpoint = %self.config.endpoint, "🔌 stream transport connected");

        tokio::spawn(read_loop(
            sink,
            stream,
            frames_rx,
            shutdown_rx,
            self.ticks.clone(),
            self.status.clone(),
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(shutdown) = self.shutdown.write().await.take() else {
            let _ = self.status.send(TransportStatus::Disconnected);
            return;
        };
        let _ = self.status.send(TransportStatus::Disconnecting);
        *self.frames.write().await = None;
        // read task ปิด socket แล้วประกาศ DISCONNECTED เอง
        let _ = shutdown.send(true);
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status_rx.clone()
    }

    async fn subscribe(&self, epics: &[String]) {
        {
            let mut subs = self.subs.write().await;
            for epic in epics {
                if !subs.contains(epic) {
                    subs.push(epic.clone());
                }
            }
        }
        let frames = self.frames.read().await;
        if let Some(tx) = frames.as_ref() {
            if tx.send(Self::subscription_frame(epics)).is_err() {
                warn!("subscription frame dropped — connection is going down");
            }
        }
    }
}

// ─── Read loop ────────────────────────────────────────────────────────────────

async fn read_loop(
    mut sink: WsSink,
    mut stream: WsStream,
    mut frames: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
    ticks: mpsc::UnboundedSender<ChartTick>,
    status: watch::Sender<TransportStatus>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            Some(frame) = frames.recv() => {
                if sink.send(Message::Text(frame)).await.is_err() {
                    warn!("outbound frame send failed");
                    break;
                }
            }

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ChartTick>(&text) {
                        Ok(tick) => { let _ = ticks.send(tick); }
                        Err(e)   => debug!(error = %e, "unparsed stream frame"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!("stream closed by provider");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "stream read error");
                    break;
                }
            }
        }
    }

    let _ = status.send(TransportStatus::Disconnected);
    info!("🔌 stream transport disconnected");
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_resolves_on_change() {
        let (tx, mut rx) = watch::channel(TransportStatus::Connecting);
        let waiter = tokio::spawn(async move {
            wait_for_status(&mut rx, TransportStatus::Connected, Duration::from_secs(60)).await
        });
        tx.send(TransportStatus::Connected).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_times_out() {
        let (_tx, mut rx) = watch::channel(TransportStatus::Connecting);
        let result =
            wait_for_status(&mut rx, TransportStatus::Connected, Duration::from_secs(60)).await;
        assert!(matches!(
            result,
            Err(SessionError::StatusTimeout { want: TransportStatus::Connected, .. })
        ));
    }

    #[test]
    fn test_subscription_frame_layout() {
        let frame = LightStream::subscription_frame(&["CS.D.GBPJPY.CFD.IP".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["mode"], "DISTINCT");
        assert_eq!(value["items"][0], "CHART:CS.D.GBPJPY.CFD.IP:TICK");
        assert_eq!(value["fields"][0], "UTM");
    }
}
