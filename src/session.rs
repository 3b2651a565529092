// Group Session
//
// Join/leave state machine layered on the connection manager. All session
// mutation is funneled through one dispatcher task that consumes a single
// merged stream of caller commands and link events, so a screen's
// unmount-triggered leave can never race another screen's in-progress join,
// and inbound handlers are registered exactly once.

use crate::config::SamplePolicy;
use crate::connection::{ConnectionManager, ConnectionState, LinkEvent};
use crate::error::BeaconError;
use crate::presence::PresenceStore;
use crate::protocol::{AckPayload, AckStatus, ClientMessage, PeerLocation, ServerMessage};
use crate::publisher::{LocationPublisher, LocationSource};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

/// Capacity of the session event fan-out; lagging receivers lose the oldest
/// events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Group session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoGroup,
    Joining,
    Joined,
    Leaving,
}

/// Proof of an acknowledged join. Exists only while the membership lasts; at
/// most one per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// Notifications for UI projections reading the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Channel is up; carries our server-assigned peer id
    Connected { peer_id: String },

    /// Channel went down. `terminal` means no automatic recovery follows.
    Disconnected { reason: String, terminal: bool },

    /// Join acknowledged
    Joined(GroupMembership),

    /// Explicit leave completed
    Left { group_id: String },

    /// Full presence snapshot applied
    PresenceSnapshot { peers: usize },

    /// A peer entered the group (it may not have a location yet)
    PeerJoined { peer_id: String, username: String },

    /// A peer's location changed
    PeerUpdated(PeerLocation),

    /// A peer left the group
    PeerLeft { peer_id: String },

    /// The location watch could not start (e.g. permission denied);
    /// membership is unaffected and `LocationPublisher::start` is the retry
    /// entry point
    PublisherError { reason: String },
}

enum SessionCommand {
    Join {
        group_id: String,
        display_name: String,
        reply: oneshot::Sender<Result<GroupMembership, BeaconError>>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), BeaconError>>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
}

struct SessionShared {
    state: SessionState,
    membership: Option<GroupMembership>,
}

/// Handle to the session dispatcher
pub struct GroupSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    presence: Arc<PresenceStore>,
    publisher: Arc<LocationPublisher>,
    shared: Arc<RwLock<SessionShared>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl GroupSession {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        source: Arc<dyn LocationSource>,
        policy: SamplePolicy,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        let presence = Arc::new(PresenceStore::new());
        let publisher = Arc::new(LocationPublisher::new(source, policy, connection.clone()));
        let shared = Arc::new(RwLock::new(SessionShared {
            state: SessionState::NoGroup,
            membership: None,
        }));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            connection,
            presence: presence.clone(),
            publisher: publisher.clone(),
            shared: shared.clone(),
            event_tx: event_tx.clone(),
            pending: None,
            self_peer: None,
        };
        tokio::spawn(dispatcher.run(cmd_rx, link_rx));

        Self {
            cmd_tx,
            presence,
            publisher,
            shared,
            event_tx,
        }
    }

    /// Join a group. Legal only from NoGroup with a live connection; a server
    /// rejection is returned verbatim and never retried automatically.
    pub async fn join(
        &self,
        group_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<GroupMembership, BeaconError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Join {
                group_id: group_id.into(),
                display_name: display_name.into(),
                reply: reply_tx,
            })
            .map_err(|_| BeaconError::disconnected("session dispatcher stopped"))?;
        reply_rx
            .await
            .map_err(|_| BeaconError::disconnected("session dispatcher stopped"))?
    }

    /// Leave the current group. Best-effort on the wire: local state
    /// transitions even when the channel is already down, since intent rather
    /// than delivery is authoritative. No-op when not in a group.
    pub async fn leave(&self) -> Result<(), BeaconError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Leave { reply: reply_tx })
            .map_err(|_| BeaconError::disconnected("session dispatcher stopped"))?;
        reply_rx
            .await
            .map_err(|_| BeaconError::disconnected("session dispatcher stopped"))?
    }

    /// Full teardown: fail any pending request, leave best-effort, stop the
    /// publisher and clear presence. Safe from any owning scope.
    pub async fn release(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Release { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub async fn state(&self) -> SessionState {
        self.shared.read().await.state
    }

    pub async fn membership(&self) -> Option<GroupMembership> {
        self.shared.read().await.membership.clone()
    }

    /// Peer presence for the active group; read-only
    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    /// The location publisher bound to this session
    pub fn publisher(&self) -> &Arc<LocationPublisher> {
        &self.publisher
    }

    /// Subscribe to session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

struct PendingJoin {
    id: String,
    group_id: String,
    display_name: String,
    reply: oneshot::Sender<Result<GroupMembership, BeaconError>>,
}

/// Single-task owner of all session state transitions
struct Dispatcher {
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceStore>,
    publisher: Arc<LocationPublisher>,
    shared: Arc<RwLock<SessionShared>>,
    event_tx: broadcast::Sender<SessionEvent>,
    pending: Option<PendingJoin>,
    self_peer: Option<String>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        tracing::debug!("session dispatcher started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break, // session handle dropped
                },
                event = link_rx.recv() => match event {
                    Some(event) => self.handle_link(event).await,
                    None => break, // connection manager gone
                },
            }
        }
        self.publisher.stop().await;
        tracing::debug!("session dispatcher stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                group_id,
                display_name,
                reply,
            } => self.handle_join(group_id, display_name, reply).await,
            SessionCommand::Leave { reply } => {
                let _ = reply.send(self.handle_leave().await);
            }
            SessionCommand::Release { reply } => {
                self.handle_release().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_join(
        &mut self,
        group_id: String,
        display_name: String,
        reply: oneshot::Sender<Result<GroupMembership, BeaconError>>,
    ) {
        if self.pending.is_some() || self.shared.read().await.state != SessionState::NoGroup {
            let _ = reply.send(Err(BeaconError::SessionBusy {
                operation: "join or leave".to_string(),
            }));
            return;
        }
        // Must not put a join on the wire without a live connection
        if self.connection.state() != ConnectionState::Connected {
            let _ = reply.send(Err(BeaconError::NotConnected));
            return;
        }

        let id = Uuid::new_v4().to_string();
        let msg = ClientMessage::JoinGroup {
            id: id.clone(),
            group_id: group_id.clone(),
            username: display_name.clone(),
        };
        if let Err(e) = self.connection.send(&msg).await {
            let _ = reply.send(Err(e));
            return;
        }

        tracing::info!(group_id = %group_id, "join requested");
        self.shared.write().await.state = SessionState::Joining;
        self.pending = Some(PendingJoin {
            id,
            group_id,
            display_name,
            reply,
        });
    }

    async fn handle_leave(&mut self) -> Result<(), BeaconError> {
        let state = self.shared.read().await.state;
        match state {
            // leave() while already out of a group is a no-op
            SessionState::NoGroup => Ok(()),
            SessionState::Joining | SessionState::Leaving => Err(BeaconError::SessionBusy {
                operation: "join or leave".to_string(),
            }),
            SessionState::Joined => {
                self.shared.write().await.state = SessionState::Leaving;
                let msg = ClientMessage::LeaveGroup {
                    id: Uuid::new_v4().to_string(),
                };
                // Best effort: a dead channel does not fail the leave
                if let Err(e) = self.connection.send(&msg).await {
                    tracing::debug!("leave notification not sent: {}", e);
                }
                if let Some(membership) = self.teardown().await {
                    tracing::info!(group_id = %membership.group_id, "left group");
                    let _ = self.event_tx.send(SessionEvent::Left {
                        group_id: membership.group_id,
                    });
                }
                Ok(())
            }
        }
    }

    async fn handle_release(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending
                .reply
                .send(Err(BeaconError::disconnected("session released")));
        }
        let state = self.shared.read().await.state;
        if state == SessionState::Joined {
            let msg = ClientMessage::LeaveGroup {
                id: Uuid::new_v4().to_string(),
            };
            if let Err(e) = self.connection.send(&msg).await {
                tracing::debug!("leave notification not sent: {}", e);
            }
        }
        if let Some(membership) = self.teardown().await {
            let _ = self.event_tx.send(SessionEvent::Left {
                group_id: membership.group_id,
            });
        }
    }

    async fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up { peer_id } => {
                self.self_peer = Some(peer_id.clone());
                let _ = self.event_tx.send(SessionEvent::Connected { peer_id });
            }
            LinkEvent::Down { terminal, reason } => {
                self.self_peer = None;
                // A disconnect invalidates any outstanding request; callers
                // see a failure, never a hang
                if let Some(pending) = self.pending.take() {
                    let _ = pending
                        .reply
                        .send(Err(BeaconError::disconnected(reason.clone())));
                }
                if self.teardown().await.is_some() {
                    tracing::info!("membership dropped: {}", reason);
                }
                let _ = self
                    .event_tx
                    .send(SessionEvent::Disconnected { reason, terminal });
            }
            LinkEvent::Inbound(msg) => self.handle_inbound(msg).await,
        }
    }

    async fn handle_inbound(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Ack(ack) => self.handle_ack(ack).await,
            ServerMessage::GroupLocations(entries) => {
                if !self.is_joined().await {
                    tracing::debug!("snapshot dropped outside membership");
                    return;
                }
                self.presence
                    .apply_snapshot(entries, self.self_peer.as_deref())
                    .await;
                let peers = self.presence.len().await;
                let _ = self.event_tx.send(SessionEvent::PresenceSnapshot { peers });
            }
            ServerMessage::LocationUpdate(entry) => {
                if !self.is_joined().await {
                    tracing::debug!("location update dropped outside membership");
                    return;
                }
                if self
                    .presence
                    .apply_update(entry.clone(), self.self_peer.as_deref())
                    .await
                {
                    let _ = self.event_tx.send(SessionEvent::PeerUpdated(entry));
                }
            }
            ServerMessage::UserJoined {
                peer_id, username, ..
            } => {
                if self.is_joined().await && Some(peer_id.as_str()) != self.self_peer.as_deref() {
                    let _ = self
                        .event_tx
                        .send(SessionEvent::PeerJoined { peer_id, username });
                }
            }
            ServerMessage::UserLeft { peer_id } => {
                if !self.is_joined().await {
                    return;
                }
                if self.presence.apply_departure(&peer_id).await.is_some() {
                    let _ = self.event_tx.send(SessionEvent::PeerLeft { peer_id });
                }
            }
            ServerMessage::Welcome(_) => {
                tracing::debug!("unexpected welcome frame mid-stream");
            }
        }
    }

    async fn handle_ack(&mut self, ack: AckPayload) {
        let pending = match self.pending.take() {
            Some(pending) if pending.id == ack.id => pending,
            Some(other) => {
                // Not ours; put it back (leave acks are not awaited)
                tracing::debug!(id = %ack.id, "unmatched ack dropped");
                self.pending = Some(other);
                return;
            }
            None => {
                tracing::debug!(id = %ack.id, "unmatched ack dropped");
                return;
            }
        };

        match ack.status {
            AckStatus::Success => {
                let membership = GroupMembership {
                    group_id: ack.group_id.unwrap_or(pending.group_id),
                    display_name: ack.username.unwrap_or(pending.display_name),
                    joined_at: Utc::now(),
                };
                tracing::info!(group_id = %membership.group_id, "join acknowledged");
                {
                    let mut shared = self.shared.write().await;
                    shared.state = SessionState::Joined;
                    shared.membership = Some(membership.clone());
                }
                // Fresh membership starts from an empty map; the snapshot
                // frame follows
                self.presence.clear().await;
                if let Err(e) = self.publisher.start().await {
                    tracing::warn!("location watch not started: {}", e);
                    let _ = self.event_tx.send(SessionEvent::PublisherError {
                        reason: e.to_string(),
                    });
                }
                let _ = self.event_tx.send(SessionEvent::Joined(membership.clone()));
                let _ = pending.reply.send(Ok(membership));
            }
            AckStatus::Error => {
                let message = ack
                    .message
                    .unwrap_or_else(|| "join rejected by server".to_string());
                tracing::info!(group_id = %pending.group_id, "join rejected: {}", message);
                self.shared.write().await.state = SessionState::NoGroup;
                let _ = pending.reply.send(Err(BeaconError::JoinRejected { message }));
            }
        }
    }

    async fn is_joined(&self) -> bool {
        self.shared.read().await.state == SessionState::Joined
    }

    /// Common tail of every membership-destroying transition: stop the watch,
    /// clear presence, drop the membership record
    async fn teardown(&mut self) -> Option<GroupMembership> {
        self.publisher.stop().await;
        self.presence.clear().await;
        let mut shared = self.shared.write().await;
        shared.state = SessionState::NoGroup;
        shared.membership.take()
    }
}
