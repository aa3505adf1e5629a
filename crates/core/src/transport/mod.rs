//! Backend socket client.
//!
//! Messages are JSON text frames tagged by `type`. The client keeps one
//! connection open, sends the newest frame and vision-language result on a
//! fixed interval, pings on a longer one and caches inbound engagement
//! updates in the [`AppStore`]. Failed attempts are retried a bounded number
//! of times, after which the client settles in [`ConnectionStatus::Error`]
//! and the kiosk keeps running standalone.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    camera::{Frame, VideoSink},
    config::TransportConfig,
    inference::FastVlmAnalysis,
    store::AppStore,
    task::{CancelGate, LoopHandle},
    KioskError, Result,
};

const STATUS_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    VideoFrame {
        /// Base64 encoded JPEG.
        frame: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fastvlm_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fastvlm_keywords: Option<Vec<String>>,
    },
    Ping,
}

impl OutboundMessage {
    pub fn video_frame(frame: &Frame, analysis: Option<&FastVlmAnalysis>) -> Self {
        OutboundMessage::VideoFrame {
            frame: BASE64.encode(&frame.jpeg),
            fastvlm_text: analysis.map(|analysis| analysis.text.clone()),
            fastvlm_keywords: analysis.map(|analysis| analysis.extracted_keywords.clone()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    EngagementUpdate {
        data: Value,
    },
    Pong,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Retries are exhausted. Terminal.
    Error,
}

/// Opens connections to the backend.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>>;
}

/// One open text-frame connection.
pub trait Connection: Send + Sync {
    fn send(&self, text: String) -> BoxFuture<'_, Result<()>>;
    /// `None` once the peer has closed.
    fn recv(&self) -> BoxFuture<'_, Option<Result<String>>>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Where the client reads what it sends and writes what it receives.
#[derive(Clone)]
pub struct TransportSources {
    pub sink: Arc<VideoSink>,
    pub analysis: Option<watch::Receiver<Option<Arc<FastVlmAnalysis>>>>,
    pub store: Arc<AppStore>,
}

impl TransportSources {
    fn latest_analysis(&self) -> Option<Arc<FastVlmAnalysis>> {
        self.analysis.as_ref().and_then(|analysis| analysis.borrow().clone())
    }
}

struct Shared {
    status: watch::Sender<ConnectionStatus>,
    status_events: broadcast::Sender<ConnectionStatus>,
    gate: Arc<CancelGate>,
    attempts: AtomicU32,
    frames_sent: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        self.gate.publish(|| {
            self.status.send_replace(status);
            let _ = self.status_events.send(status);
        });
        tracing::debug!(?status, "transport status");
    }
}

/// Backend connection with bounded reconnection.
pub struct TransportClient {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    sources: TransportSources,
    handle: Mutex<Option<LoopHandle>>,
}

impl TransportClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        sources: TransportSources,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (status_events, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                status,
                status_events,
                gate: Arc::new(CancelGate::new()),
                attempts: AtomicU32::new(0),
                frames_sent: AtomicU64::new(0),
            }),
            connector,
            config,
            sources,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the connection loop. Calling it twice keeps the first loop.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.shared.gate.is_cancelled() {
            return;
        }

        let task = tokio::spawn(run(
            self.shared.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.sources.clone(),
            self.shared.gate.token().clone(),
        ));
        *handle = Some(LoopHandle::new(self.shared.gate.clone(), task));
        tracing::info!(url = %self.config.url, "transport started");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Every status transition, in order.
    pub fn status_events(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.shared.status_events.subscribe()
    }

    /// Total connect attempts made so far.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        self.shared.gate.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shared.gate.cancel();
    }
}

enum SessionEnd {
    Cancelled,
    Dropped(KioskError),
}

async fn run(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    sources: TransportSources,
    token: CancellationToken,
) {
    let mut failures = 0u32;

    loop {
        shared.set_status(ConnectionStatus::Connecting);
        shared.attempts.fetch_add(1, Ordering::SeqCst);

        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            connected = connector.connect(&config.url) => connected,
        };

        match connected {
            Ok(connection) => {
                failures = 0;
                shared.set_status(ConnectionStatus::Connected);
                tracing::info!(url = %config.url, "backend connected");

                let end = serve(&shared, connection.as_ref(), &config, &sources, &token).await;
                connection.close().await;
                match end {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Dropped(err) => {
                        tracing::warn!(error = %err, "backend connection dropped");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, url = %config.url, "backend connect failed"),
        }

        failures += 1;
        shared.set_status(ConnectionStatus::Disconnected);
        if failures >= config.max_reconnect_attempts {
            shared.set_status(ConnectionStatus::Error);
            tracing::warn!(failures, "reconnect attempts exhausted, continuing standalone");
            return;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
        }
    }
}

async fn serve(
    shared: &Shared,
    connection: &dyn Connection,
    config: &TransportConfig,
    sources: &TransportSources,
    token: &CancellationToken,
) -> SessionEnd {
    let mut send_ticker = tokio::time::interval(config.send_interval());
    send_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ping_period = config.ping_interval();
    let mut ping_ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return SessionEnd::Cancelled,
            inbound = connection.recv() => match inbound {
                Some(Ok(text)) => handle_inbound(&text, &sources.store),
                Some(Err(err)) => return SessionEnd::Dropped(err),
                None => return SessionEnd::Dropped(KioskError::Transport("closed by peer".into())),
            },
            _ = send_ticker.tick() => {
                let Some(frame) = sources.sink.decodable_frame() else {
                    continue;
                };
                let analysis = sources.latest_analysis();
                let message = OutboundMessage::video_frame(&frame, analysis.as_deref());
                if let Err(err) = send(connection, &message).await {
                    return SessionEnd::Dropped(err);
                }
                shared.frames_sent.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    sequence = frame.sequence,
                    with_analysis = analysis.is_some(),
                    "frame sent"
                );
            }
            _ = ping_ticker.tick() => {
                if let Err(err) = send(connection, &OutboundMessage::Ping).await {
                    return SessionEnd::Dropped(err);
                }
            }
        }
    }
}

async fn send(connection: &dyn Connection, message: &OutboundMessage) -> Result<()> {
    let text = message.encode()?;
    connection.send(text).await
}

fn handle_inbound(text: &str, store: &AppStore) {
    match InboundMessage::decode(text) {
        Ok(InboundMessage::EngagementUpdate { data }) => {
            tracing::debug!("engagement update received");
            store.record_engagement(data);
        }
        Ok(InboundMessage::Pong) => tracing::debug!("pong"),
        Ok(InboundMessage::Error { message }) => {
            tracing::warn!(message = message.as_deref().unwrap_or(""), "backend reported an error")
        }
        Err(err) => tracing::warn!(error = %err, "skipping malformed backend message"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::camera::testing::frame;

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            Box::pin(async { Err(KioskError::Transport("connection refused".into())) })
        }
    }

    struct ChannelConnection {
        outbound: mpsc::UnboundedSender<String>,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    }

    impl Connection for ChannelConnection {
        fn send(&self, text: String) -> BoxFuture<'_, Result<()>> {
            let sent = self
                .outbound
                .send(text)
                .map_err(|_| KioskError::Transport("peer gone".into()));
            Box::pin(async move { sent })
        }

        fn recv(&self) -> BoxFuture<'_, Option<Result<String>>> {
            Box::pin(async move { self.inbound.lock().await.recv().await.map(Ok) })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    /// Hands out one prepared connection, then refuses.
    struct OnceConnector {
        connection: Mutex<Option<ChannelConnection>>,
    }

    impl Connector for OnceConnector {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            let connection = self.connection.lock().take();
            Box::pin(async move {
                match connection {
                    Some(connection) => Ok(Box::new(connection) as Box<dyn Connection>),
                    None => Err(KioskError::Transport("refused".into())),
                }
            })
        }
    }

    /// Accepts `accepts` connections that the backend closes straight away,
    /// then refuses.
    struct ClosingConnector {
        accepts: AtomicU32,
    }

    impl Connector for ClosingConnector {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Box<dyn Connection>>> {
            let accepted = self
                .accepts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            Box::pin(async move {
                if !accepted {
                    return Err(KioskError::Transport("refused".into()));
                }
                let (outbound, _) = mpsc::unbounded_channel();
                let (_, inbound) = mpsc::unbounded_channel();
                Ok(Box::new(ChannelConnection {
                    outbound,
                    inbound: tokio::sync::Mutex::new(inbound),
                }) as Box<dyn Connection>)
            })
        }
    }

    fn sources() -> TransportSources {
        TransportSources {
            sink: Arc::new(VideoSink::new()),
            analysis: None,
            store: Arc::new(AppStore::new(Duration::from_secs(10))),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let client = TransportClient::new(
            Arc::new(RefusingConnector),
            TransportConfig::default(),
            sources(),
        );
        let mut events = client.status_events();
        client.start();

        let mut seen = Vec::new();
        loop {
            let status = events.recv().await.unwrap();
            seen.push(status);
            if status == ConnectionStatus::Error {
                break;
            }
        }

        use ConnectionStatus::*;
        assert_eq!(
            seen,
            vec![
                Connecting,
                Disconnected,
                Connecting,
                Disconnected,
                Connecting,
                Disconnected,
                Error,
            ]
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.connect_attempts(), 3);
        assert_eq!(client.status(), ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connections_reconnect_with_a_fresh_budget() {
        let connector = ClosingConnector {
            accepts: AtomicU32::new(2),
        };
        let client =
            TransportClient::new(Arc::new(connector), TransportConfig::default(), sources());
        let mut events = client.status_events();
        client.start();

        let mut seen = Vec::new();
        loop {
            let status = events.recv().await.unwrap();
            seen.push(status);
            if status == ConnectionStatus::Error {
                break;
            }
        }

        use ConnectionStatus::*;
        assert_eq!(
            seen,
            vec![
                Connecting,
                Connected,
                Disconnected,
                Connecting,
                Connected,
                Disconnected,
                Connecting,
                Disconnected,
                Connecting,
                Disconnected,
                Error,
            ]
        );
        // each connect resets the budget; the drop itself is one failure
        assert_eq!(client.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_spaced_by_the_reconnect_delay() {
        let client = TransportClient::new(
            Arc::new(RefusingConnector),
            TransportConfig::default(),
            sources(),
        );
        client.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.connect_attempts(), 1);
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(client.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_frames_and_stores_engagement() {
        let (to_backend, mut backend_rx) = mpsc::unbounded_channel();
        let (backend_tx, from_backend) = mpsc::unbounded_channel();
        let connector = OnceConnector {
            connection: Mutex::new(Some(ChannelConnection {
                outbound: to_backend,
                inbound: tokio::sync::Mutex::new(from_backend),
            })),
        };

        let sources = sources();
        sources.sink.push(frame(7));
        let store = sources.store.clone();
        let client = TransportClient::new(Arc::new(connector), TransportConfig::default(), sources);
        client.start();

        let sent = backend_rx.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(sent["type"], "video_frame");
        assert_eq!(sent["frame"], BASE64.encode(&frame(7).jpeg));
        assert!(sent.get("fastvlm_text").is_none());
        assert_eq!(client.status(), ConnectionStatus::Connected);

        backend_tx
            .send(json!({"type": "engagement_update", "data": {"score": 0.9}}).to_string())
            .unwrap();
        backend_tx.send("not json".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.fresh_engagement(Instant::now()), Some(json!({"score": 0.9})));
        assert_eq!(client.status(), ConnectionStatus::Connected);

        client.shutdown().await;
    }

    #[test]
    fn video_frame_omits_absent_fields() {
        let frame = Frame {
            sequence: 1,
            captured_at: Instant::now(),
            width: 2,
            height: 2,
            jpeg: Bytes::from_static(&[0xff, 0xd8, 0xff]),
        };
        let encoded = OutboundMessage::video_frame(&frame, None).encode().unwrap();
        assert_eq!(encoded, r#"{"type":"video_frame","frame":"/9j/"}"#);
        assert_eq!(OutboundMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn video_frame_carries_analysis() {
        let analysis = FastVlmAnalysis {
            text: "attentive".into(),
            extracted_keywords: vec!["attentive".into()],
            derived_score: 0.58,
            timestamp: 10,
            report: Default::default(),
        };
        let message = OutboundMessage::video_frame(&frame(1), Some(&analysis));
        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["fastvlm_text"], "attentive");
        assert_eq!(value["fastvlm_keywords"], json!(["attentive"]));
    }

    #[test]
    fn decodes_inbound_messages() {
        assert_eq!(InboundMessage::decode(r#"{"type":"pong"}"#).unwrap(), InboundMessage::Pong);
        assert_eq!(
            InboundMessage::decode(r#"{"type":"error","message":"overloaded"}"#).unwrap(),
            InboundMessage::Error {
                message: Some("overloaded".into())
            }
        );
        assert!(InboundMessage::decode(r#"{"type":"mystery"}"#).is_err());
    }
}
