use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// An event produced by the transport layer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame from the server
    Message(String),
    /// The peer closed the connection
    Closed { code: u16, reason: String },
    /// The connection failed
    Error(String),
}

/// An open duplex connection
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Queue a text frame without waiting. Fails if the socket is closed
    /// or its bounded send queue is full.
    fn send_text(&self, text: String) -> Result<()>;

    /// Close with `code`; idempotent
    async fn close(&self, code: u16, reason: &str);
}

/// Creates transports; one call per connection attempt
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

const CLOSE_DEADLINE: Duration = Duration::from_secs(2);

/// How long a closing socket waits for the peer's close reply
const CLOSE_REPLY_GRACE: Duration = Duration::from_millis(500);

/// A tokio-tungstenite connection split into read and write pumps.
///
/// Closing (or dropping) the transport releases the socket even when the
/// peer never answers the close frame.
pub struct WebSocketTransport {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    fn send_text(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("socket is closed");
        }

        self.tx.try_send(Outbound::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("send queue full"),
            TrySendError::Closed(_) => anyhow!("socket is closed"),
        })
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let close = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if tokio::time::timeout(CLOSE_DEADLINE, self.tx.send(close)).await.is_err() {
            warn!("Timed out queueing close frame");
        }

        // The read half keeps the socket open until it is dropped
        if let Some(mut reader) = self.take_reader() {
            if tokio::time::timeout(CLOSE_REPLY_GRACE, &mut reader).await.is_err() {
                debug!("No close reply from peer, releasing socket");
                reader.abort();
            }
        }
    }
}

/// Dials `url` with tokio-tungstenite
pub struct WebSocketTransportFactory {
    url: String,
    send_queue: usize,
}

impl WebSocketTransportFactory {
    pub fn new(url: impl Into<String>, send_queue: usize) -> Self {
        Self {
            url: url.into(),
            send_queue: send_queue.max(1),
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        info!("Dialing {}", self.url);

        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("WebSocket connect to {} failed", self.url))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(self.send_queue);

        tokio::spawn(write_pump(sink, out_rx, event_tx.clone()));
        let reader = tokio::spawn(read_pump(stream, event_tx));

        let transport = Arc::new(WebSocketTransport {
            tx: out_tx,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        });

        Ok((transport, event_rx))
    }
}

async fn write_pump(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Outbound>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("WebSocket send error: {}", e);
                    let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("Close frame not delivered: {}", e);
                }
                let _ = sink.close().await;
                break;
            }
        }
    }
    debug!("Write pump stopped");
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let terminal = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if event_tx.send(TransportEvent::Message(text)).await.is_err() {
                    debug!("Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                debug!("Received close frame ({})", code);
                break TransportEvent::Closed { code, reason };
            }
            Some(Ok(Message::Binary(data))) => {
                debug!("Ignoring {} byte binary frame", data.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            None => {
                break TransportEvent::Closed {
                    code: 1006,
                    reason: "stream ended".to_string(),
                }
            }
        }
    };

    let _ = event_tx.send(terminal).await;
}
