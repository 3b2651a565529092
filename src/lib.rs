// Tripbeacon - Live Group Location Sharing Client
//
// Client-side subsystem for sharing live positions within a trip group:
// a persistent duplex channel with bounded reconnection, a join/leave session
// state machine, a foreground sampling loop, and a presence store holding
// peers' last-known locations. UI layers consume presence snapshots, the
// self-sample cache and the session event stream; everything else is owned
// here.

pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod publisher;
pub mod session;
pub mod transport;

pub use config::{Accuracy, Config, ConnectionConfig, SamplePolicy};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::BeaconError;
pub use presence::PresenceStore;
pub use protocol::{
    AckPayload, AckStatus, ClientMessage, LocationSample, PeerLocation, ServerMessage,
    WelcomePayload,
};
pub use publisher::{FeedSource, LocationPublisher, LocationSource};
pub use session::{GroupMembership, GroupSession, SessionEvent, SessionState};
pub use transport::{memory_pair, MemoryTransport, Transport, WsTransport};

use crate::connection::LinkEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One live context per process; guards against a second hidden channel
static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

struct ContextGuard;

impl ContextGuard {
    fn acquire() -> Result<Self, BeaconError> {
        if CONTEXT_LIVE.swap(true, Ordering::SeqCst) {
            return Err(BeaconError::ContextInUse);
        }
        Ok(Self)
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_LIVE.store(false, Ordering::SeqCst);
    }
}

/// App-scoped owner of the one connection/session pair.
///
/// Constructed explicitly and passed by reference to whoever needs group or
/// location features; the constructor-time guard preserves "one connection
/// per app" without module-level mutable state. [`SessionContext::release`]
/// performs the full teardown and is callable from any owning scope, whether
/// a screen lifecycle, a navigation listener, or a test harness.
pub struct SessionContext {
    _guard: ContextGuard,
    connection: Arc<ConnectionManager>,
    session: GroupSession,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Build the context. Fails with `ContextInUse` while another live
    /// context exists in this process.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        source: Arc<dyn LocationSource>,
    ) -> Result<Self, BeaconError> {
        let guard = ContextGuard::acquire()?;
        let (connection, link_rx): (Arc<ConnectionManager>, mpsc::UnboundedReceiver<LinkEvent>) =
            ConnectionManager::new(config.connection, transport);
        let session = GroupSession::new(connection.clone(), source, config.sampling, link_rx);
        Ok(Self {
            _guard: guard,
            connection,
            session,
        })
    }

    /// Shorthand for a context over the production WebSocket transport
    pub fn with_websocket(
        config: Config,
        source: Arc<dyn LocationSource>,
    ) -> Result<Self, BeaconError> {
        let transport = Arc::new(WsTransport::new(config.connection.server_url.clone()));
        Self::new(config, transport, source)
    }

    /// Bring the channel up (idempotent); the explicit retry entry point
    /// after a terminal failure
    pub async fn connect(&self) -> Result<(), BeaconError> {
        self.connection.ensure_connected().await
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn session(&self) -> &GroupSession {
        &self.session
    }

    /// Full teardown: leave best-effort, stop the location watch, clear
    /// presence, close the channel. The context stays usable afterwards:
    /// `connect` and `join` start over.
    pub async fn release(&self) {
        self.session.release().await;
        self.connection.disconnect();
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        // The dispatcher stops once its command channel closes; the
        // connection task needs the explicit signal
        self.connection.disconnect();
    }
}
