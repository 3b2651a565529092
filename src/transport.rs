// Tripbeacon Transport Layer
//
// Abstracts the persistent duplex channel so the connection manager can run
// against a real WebSocket in production and an in-memory link in tests.
// A transport produces raw text frames; framing/parsing lives one layer up.

use crate::error::BeaconError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One live duplex link: text frames out, text frames in.
///
/// Dropping `outbound` closes the write half; `inbound` yielding `None` means
/// the link is gone.
#[derive(Debug)]
pub struct Duplex {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Factory for duplex links. One dial attempt per call; retry/backoff policy
/// belongs to the connection manager, not the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<Duplex, BeaconError>;
}

// ============================================================================
// WebSocket transport
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport backed by tokio-tungstenite
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn dial(&self) -> Result<Duplex, BeaconError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url).await?;
        tracing::debug!("websocket connected to {}", self.url);

        let (ws_sink, ws_source) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            if let Err(e) = write_pump(ws_sink, out_rx).await {
                tracing::debug!("websocket write pump ended: {:#}", e);
            }
        });
        tokio::spawn(async move {
            if let Err(e) = read_pump(ws_source, in_tx).await {
                tracing::debug!("websocket read pump ended: {:#}", e);
            }
        });

        Ok(Duplex {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn write_pump(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    while let Some(text) = out_rx.recv().await {
        sink.send(Message::Text(text.into()))
            .await
            .context("websocket send failed")?;
    }
    // Sender side dropped: close the socket politely
    let _ = sink.close().await;
    Ok(())
}

async fn read_pump(
    mut source: futures_util::stream::SplitStream<WsStream>,
    in_tx: mpsc::UnboundedSender<String>,
) -> Result<()> {
    while let Some(msg) = source.next().await {
        let msg = msg.context("websocket read failed")?;
        if msg.is_text() {
            let text = msg.to_text().context("non-utf8 text frame")?;
            if in_tx.send(text.to_string()).is_err() {
                break;
            }
        } else if msg.is_close() {
            break;
        }
        // Binary and ping/pong frames are not part of the protocol
    }
    Ok(())
}

// ============================================================================
// In-memory transport
// ============================================================================

/// Server side of an in-memory link, handed to the acceptor on each dial
pub struct MemoryLink {
    /// Frames the fake server pushes to the client
    pub to_client: mpsc::UnboundedSender<String>,

    /// Frames the client sent
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// In-memory transport for tests and harnesses.
///
/// Each successful `dial` delivers a [`MemoryLink`] to the acceptor returned
/// by [`memory_pair`]. Dropping the acceptor makes subsequent dials fail,
/// which is how tests simulate an unreachable server.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryLink>,
}

/// Build an in-memory transport plus the acceptor for its server side
pub fn memory_pair() -> (MemoryTransport, mpsc::UnboundedReceiver<MemoryLink>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (MemoryTransport { accept_tx }, accept_rx)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self) -> Result<Duplex, BeaconError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryLink {
                to_client: in_tx,
                from_client: out_rx,
            })
            .map_err(|_| BeaconError::transport("connection refused"))?;
        Ok(Duplex {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
