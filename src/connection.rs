// Connection Manager
//
// Owns the single duplex channel instance and its lifecycle: connect,
// reconnect with bounded capped backoff, and failure after the attempt budget
// is spent. Every link loss is reported to the session dispatcher before any
// reconnect sleep, so group/presence/publisher teardown is ordered
// synchronously with the state change.

use crate::config::ConnectionConfig;
use crate::error::BeaconError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::Transport;
use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};

/// Channel connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; terminal until `ensure_connected` is
    /// called again
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Link lifecycle and inbound traffic, consumed by the session dispatcher
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A fresh link is up; carries the server-assigned self peer id
    Up { peer_id: String },

    /// A parsed inbound frame
    Inbound(ServerMessage),

    /// The link is gone. `terminal` means no automatic recovery follows and
    /// explicit user action is required.
    Down { terminal: bool, reason: String },
}

/// Owner of the process-wide duplex channel
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectionState>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Outbound sender of the live duplex, if any
    current: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Self peer id learned from the welcome frame
    peer_id: Mutex<Option<String>>,
    /// Whether a run task is alive. Cleared by the task itself before it
    /// publishes a terminal state, so a restart can never observe a stale
    /// terminal state with no task behind it.
    started: AtomicBool,
    shutdown: AtomicBool,
    close_notify: Notify,
}

impl ConnectionManager {
    /// Build a manager plus the link event stream for the session dispatcher
    pub(crate) fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            transport,
            state_tx,
            link_tx,
            current: Mutex::new(None),
            peer_id: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (manager, link_rx)
    }

    /// Idempotent connect: reuses the live run task when one exists, otherwise
    /// starts one, then awaits the first `Connected` (Ok) or terminal state
    /// (Err). After `Failed`, calling this again is the explicit retry entry
    /// point.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), BeaconError> {
        let mut rx = self.state_tx.subscribe();
        let mut restarted = false;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    if restarted {
                        return Err(BeaconError::transport("connection attempts exhausted"));
                    }
                    if !self.started.swap(true, Ordering::SeqCst) {
                        self.shutdown.store(false, Ordering::SeqCst);
                        self.state_tx.send_replace(ConnectionState::Connecting);
                        let manager = self.clone();
                        tokio::spawn(async move { manager.run().await });
                    }
                    restarted = true;
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(BeaconError::transport("connection manager dropped"));
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch for lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Server-assigned session identifier for self, while a link is up
    pub async fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().await.clone()
    }

    /// Serialize and send a frame over the live link
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), BeaconError> {
        let text = serde_json::to_string(msg)?;
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => Err(BeaconError::NotConnected),
        }
    }

    /// Tear the link down and stop the run task. Reversible via
    /// `ensure_connected`.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.close_notify.notify_one();
    }

    async fn run(self: Arc<Self>) {
        tracing::debug!("connection task started");
        let mut attempts: u32 = 0;
        let mut delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.finish(ConnectionState::Disconnected, "closed by client")
                    .await;
                return;
            }
            match self.connect_once().await {
                Ok((inbound, peer_id)) => {
                    attempts = 0;
                    delay = Duration::from_millis(self.config.reconnect_delay_ms);
                    self.state_tx.send_replace(ConnectionState::Connected);
                    tracing::info!(peer_id = %peer_id, "channel connected");
                    let _ = self.link_tx.send(LinkEvent::Up { peer_id });

                    let reason = self.pump(inbound).await;
                    self.drop_link().await;
                    tracing::info!("link lost: {}", reason);

                    if self.shutdown.load(Ordering::SeqCst) || !self.config.reconnect {
                        self.finish(ConnectionState::Disconnected, &reason).await;
                        return;
                    }
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    let _ = self.link_tx.send(LinkEvent::Down {
                        terminal: false,
                        reason,
                    });
                }
                Err(e) => {
                    if !self.config.reconnect {
                        self.finish(ConnectionState::Disconnected, &e.to_string())
                            .await;
                        return;
                    }
                    attempts += 1;
                    tracing::warn!(
                        "connect attempt {}/{} failed: {}",
                        attempts,
                        self.config.max_reconnect_attempts,
                        e
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        self.finish(
                            ConnectionState::Failed,
                            &format!("reconnect attempts exhausted: {}", e),
                        )
                        .await;
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    delay = cmp::min(
                        delay * 2,
                        Duration::from_millis(self.config.reconnect_delay_max_ms),
                    );
                }
            }
        }
    }

    /// One dial plus the welcome handshake, both under the connect timeout
    async fn connect_once(&self) -> Result<(mpsc::UnboundedReceiver<String>, String), BeaconError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut duplex = tokio::time::timeout(timeout, self.transport.dial())
            .await
            .map_err(|_| BeaconError::transport("connect timed out"))??;

        let text = tokio::time::timeout(timeout, duplex.inbound.recv())
            .await
            .map_err(|_| BeaconError::transport("no welcome before timeout"))?
            .ok_or_else(|| BeaconError::transport("closed before welcome"))?;
        let peer_id = match serde_json::from_str::<ServerMessage>(&text)? {
            ServerMessage::Welcome(welcome) => welcome.peer_id,
            other => {
                return Err(BeaconError::protocol(format!(
                    "expected welcome frame, got {:?}",
                    other
                )))
            }
        };

        *self.current.lock().await = Some(duplex.outbound);
        *self.peer_id.lock().await = Some(peer_id.clone());
        Ok((duplex.inbound, peer_id))
    }

    /// Forward inbound frames until the link dies or the client closes it
    async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<String>) -> String {
        loop {
            tokio::select! {
                _ = self.close_notify.notified() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return "closed by client".to_string();
                    }
                }
                frame = inbound.recv() => match frame {
                    Some(text) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            let _ = self.link_tx.send(LinkEvent::Inbound(msg));
                        }
                        Err(e) => tracing::debug!("dropping unreadable frame: {}", e),
                    },
                    None => return "transport closed".to_string(),
                }
            }
        }
    }

    async fn drop_link(&self) {
        *self.current.lock().await = None;
        *self.peer_id.lock().await = None;
    }

    /// Publish a terminal state and order downstream teardown
    async fn finish(&self, state: ConnectionState, reason: &str) {
        self.drop_link().await;
        self.started.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(state);
        let _ = self.link_tx.send(LinkEvent::Down {
            terminal: true,
            reason: reason.to_string(),
        });
        tracing::info!("connection task stopped ({}): {}", state, reason);
    }
}
