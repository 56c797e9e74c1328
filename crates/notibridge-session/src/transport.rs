//! Duplex text-frame transports.
//!
//! A [`TransportSession`] is the local half of a connection: frames go out
//! through a bounded channel and inbound frames arrive as
//! [`TransportEvent`]s. A pump task owns the socket. The session reports
//! `Closed` exactly once, whichever side closes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use notibridge_core::config::SessionConfig;

use crate::error::TransportError;

/// Frames queued for sending before the sender waits.
const OUTBOUND_CAPACITY: usize = 64;

/// Inbound frames buffered ahead of the session loop.
const INBOUND_CAPACITY: usize = 256;

/// Longest accepted line on newline-delimited transports.
const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// Peer closed the connection.
    Remote(String),
    /// Read or write failure.
    Error(String),
    /// The pump went away without reporting.
    Dropped,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Remote(reason) if reason.is_empty() => write!(f, "closed by peer"),
            Self::Remote(reason) => write!(f, "closed by peer: {reason}"),
            Self::Error(e) => write!(f, "transport error: {e}"),
            Self::Dropped => write!(f, "transport dropped"),
        }
    }
}

/// Event delivered to the owner of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed(CloseReason),
}

/// Cloneable handle for writing frames to a transport.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl FrameSender {
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::NotOpen);
        }
        self.tx.send(frame).await.map_err(|_| TransportError::NotOpen)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Local half of an open connection.
#[derive(Debug)]
pub struct TransportSession {
    id: String,
    sender: FrameSender,
    inbound: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    closed: bool,
}

impl TransportSession {
    /// Assemble a session from the channels of a pump task.
    ///
    /// The pump reads `outbound`, writes to `inbound`, and stops when
    /// `cancel` fires.
    pub fn new(
        id: impl Into<String>,
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            sender: FrameSender {
                tx: outbound,
                cancel: cancel.clone(),
            },
            inbound,
            cancel,
            closed: false,
        }
    }

    /// Short identifier used in logs and correlation ids.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender.send(frame).await
    }

    /// Next inbound event. Yields `Closed` once, then `None` forever.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        let event = tokio::select! {
            biased;
            () = self.cancel.cancelled() => TransportEvent::Closed(CloseReason::Local),
            event = self.inbound.recv() => event.unwrap_or(TransportEvent::Closed(CloseReason::Dropped)),
        };
        if matches!(event, TransportEvent::Closed(_)) {
            self.closed = true;
            self.cancel.cancel();
        }
        Some(event)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(transport = %self.id, "Closing transport");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.cancel.is_cancelled()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(crate) fn new_transport_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Opens transports to device endpoints.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<TransportSession, TransportError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint<'a> {
    WebSocket(&'a str),
    Tcp(&'a str),
}

/// Classify an endpoint: `ws://`/`wss://` URLs, `tcp://host:port`, or a
/// bare `host:port` (newline-delimited JSON over TCP).
fn parse_endpoint(endpoint: &str) -> Result<Endpoint<'_>, TransportError> {
    let endpoint = endpoint.trim();
    match endpoint.split_once("://") {
        Some(("ws" | "wss", rest)) if !rest.is_empty() => Ok(Endpoint::WebSocket(endpoint)),
        Some(("tcp", addr)) if !addr.is_empty() => Ok(Endpoint::Tcp(addr.trim_end_matches('/'))),
        Some((scheme, _)) => Err(TransportError::InvalidEndpoint(format!(
            "unsupported endpoint '{endpoint}' (scheme '{scheme}')"
        ))),
        None if endpoint.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }) =>
        {
            Ok(Endpoint::Tcp(endpoint))
        }
        None => Err(TransportError::InvalidEndpoint(format!(
            "'{endpoint}' is neither a URL nor host:port"
        ))),
    }
}

/// Connector for real devices: WebSocket or newline-delimited TCP.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    heartbeat_interval: Duration,
}

impl DefaultConnector {
    pub const fn new(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for DefaultConnector {
    fn from(config: &SessionConfig) -> Self {
        Self::new(config.heartbeat_interval())
    }
}

impl Connector for DefaultConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportSession, TransportError> {
        match parse_endpoint(endpoint)? {
            Endpoint::WebSocket(url) => {
                let (ws, _response) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                info!(endpoint = url, "WebSocket connected");
                Ok(spawn_ws_pump(ws, self.heartbeat_interval))
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                info!(endpoint = addr, "TCP connected");
                Ok(spawn_line_pump(stream))
            }
        }
    }
}

/// Wrap an established WebSocket in a transport session.
pub fn spawn_ws_pump<S>(ws: WebSocketStream<S>, heartbeat_interval: Duration) -> TransportSession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
    let cancel = CancellationToken::new();
    let id = new_transport_id();
    tokio::spawn(ws_pump(
        id.clone(),
        ws,
        out_rx,
        in_tx,
        cancel.clone(),
        heartbeat_interval,
    ));
    TransportSession::new(id, out_tx, in_rx, cancel)
}

async fn ws_pump<S>(
    id: String,
    ws: WebSocketStream<S>,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break CloseReason::Local;
            }
            frame = out_rx.recv() => {
                let Some(text) = frame else {
                    let _ = sink.close().await;
                    break CloseReason::Local;
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break CloseReason::Error(e.to_string());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(TransportEvent::Frame(text)).await.is_err() {
                        break CloseReason::Local;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if in_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            break CloseReason::Local;
                        }
                    }
                    Err(_) => warn!(transport = %id, "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break CloseReason::Remote(
                        frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Remote(String::new()),
            },
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break CloseReason::Error(e.to_string());
                }
            }
        }
    };

    debug!(transport = %id, %reason, "WebSocket pump stopped");
    let _ = in_tx.send(TransportEvent::Closed(reason)).await;
}

/// Wrap a byte stream carrying one JSON object per line.
pub fn spawn_line_pump<S>(stream: S) -> TransportSession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
    let cancel = CancellationToken::new();
    let id = new_transport_id();
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    tokio::spawn(line_pump(id.clone(), framed, out_rx, in_tx, cancel.clone()));
    TransportSession::new(id, out_tx, in_rx, cancel)
}

async fn line_pump<S>(
    id: String,
    framed: Framed<S, LinesCodec>,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut lines) = framed.split();

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = SinkExt::<String>::close(&mut sink).await;
                break CloseReason::Local;
            }
            frame = out_rx.recv() => {
                let Some(text) = frame else {
                    break CloseReason::Local;
                };
                if let Err(e) = sink.send(text).await {
                    break CloseReason::Error(e.to_string());
                }
            }
            line = lines.next() => match line {
                Some(Ok(text)) if text.trim().is_empty() => {}
                Some(Ok(text)) => {
                    if in_tx.send(TransportEvent::Frame(text)).await.is_err() {
                        break CloseReason::Local;
                    }
                }
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Remote(String::new()),
            },
        }
    };

    debug!(transport = %id, %reason, "Line pump stopped");
    let _ = in_tx.send(TransportEvent::Closed(reason)).await;
}

/// Remote half of an in-memory transport.
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl MemoryPeer {
    /// Next frame written by the local side; `None` once it closed.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            frame = self.from_client.recv() => frame,
            () = self.cancel.cancelled() => None,
        }
    }

    /// Deliver a frame to the local side. Returns `false` if it is gone.
    pub async fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client
            .send(TransportEvent::Frame(frame.into()))
            .await
            .is_ok()
    }

    /// Close from the remote side.
    pub async fn close(&self, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(CloseReason::Remote(reason.to_string())))
            .await;
    }

    /// Whether the local side has closed its half.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Connected in-memory pair.
pub fn memory_pair() -> (TransportSession, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
    let cancel = CancellationToken::new();
    let peer = MemoryPeer {
        from_client: out_rx,
        to_client: in_tx,
        cancel: cancel.clone(),
    };
    (
        TransportSession::new(new_transport_id(), out_tx, in_rx, cancel),
        peer,
    )
}

/// Connector handing out in-memory transports.
///
/// The remote half of every successful connect is delivered on the
/// receiver returned by [`MemoryConnector::new`].
#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<(String, MemoryPeer)>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, MemoryPeer)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Make subsequent connects fail as if the device were unreachable.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of connect calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportSession, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{endpoint}: connection refused")));
        }
        let (session, peer) = memory_pair();
        self.peers
            .send((endpoint.to_string(), peer))
            .map_err(|_| TransportError::Connect(format!("{endpoint}: no listener")))?;
        Ok(session)
    }
}

impl<C: Connector> Connector for Arc<C> {
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<TransportSession, TransportError>> + Send {
        C::connect(self, endpoint)
    }
}
