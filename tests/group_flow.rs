// End-to-end session flows against a scripted in-memory server.
//
// The fake server speaks the same frames as the real tracker: welcome on
// accept, acks for join/leave, presence snapshots and deltas.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use tripbeacon::{
    memory_pair, AckPayload, BeaconError, ClientMessage, Config, ConnectionState, FeedSource,
    LocationSample, PeerLocation, ServerMessage, SessionContext, SessionEvent, SessionState,
    WelcomePayload,
};

// SessionContext enforces one live context per process, so these tests run
// under a serializing lock.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server half of one accepted link
struct ServerLink {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerLink {
    fn send(&self, msg: &ServerMessage) {
        self.to_client
            .send(serde_json::to_string(msg).expect("serialize server frame"))
            .expect("client link closed");
    }

    async fn recv(&mut self) -> ClientMessage {
        let text = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client link closed");
        serde_json::from_str(&text).expect("parse client frame")
    }

    fn assert_idle(&mut self) {
        assert!(
            matches!(
                self.from_client.try_recv(),
                Err(mpsc::error::TryRecvError::Empty)
            ),
            "unexpected client frame"
        );
    }
}

async fn accept(
    acceptor: &mut mpsc::UnboundedReceiver<tripbeacon::transport::MemoryLink>,
    peer_id: &str,
) -> ServerLink {
    let link = tokio::time::timeout(Duration::from_secs(2), acceptor.recv())
        .await
        .expect("timed out waiting for dial")
        .expect("transport dropped");
    let welcome = ServerMessage::Welcome(WelcomePayload {
        peer_id: peer_id.to_string(),
    });
    link.to_client
        .send(serde_json::to_string(&welcome).expect("serialize welcome"))
        .expect("client link closed");
    ServerLink {
        to_client: link.to_client,
        from_client: link.from_client,
    }
}

fn test_config() -> Config {
    let mut config = Config::new("mem://test");
    config.connection.reconnect_delay_ms = 5;
    config.connection.reconnect_delay_max_ms = 10;
    config.connection.connect_timeout_ms = 1000;
    config
}

fn build_context(
    config: Config,
) -> (
    SessionContext,
    mpsc::UnboundedReceiver<tripbeacon::transport::MemoryLink>,
    Arc<FeedSource>,
) {
    let (transport, acceptor) = memory_pair();
    let source = Arc::new(FeedSource::new());
    let ctx = SessionContext::new(config, Arc::new(transport), source.clone())
        .expect("context guard free");
    (ctx, acceptor, source)
}

/// Connect and accept in lockstep
async fn connected_context() -> (
    SessionContext,
    mpsc::UnboundedReceiver<tripbeacon::transport::MemoryLink>,
    Arc<FeedSource>,
    ServerLink,
) {
    let (ctx, mut acceptor, source) = build_context(test_config());
    let (res, link) = tokio::join!(ctx.connect(), accept(&mut acceptor, "me"));
    res.expect("connect");
    (ctx, acceptor, source, link)
}

/// Drive a join to success with the server acking and optionally snapshotting
async fn join_group(ctx: &SessionContext, link: &mut ServerLink, group_id: &str, username: &str) {
    let join_fut = ctx.session().join(group_id, username);
    let server_fut = async {
        match link.recv().await {
            ClientMessage::JoinGroup { id, group_id, username } => {
                link.send(&ServerMessage::Ack(
                    AckPayload::success(id).with_group(group_id, username),
                ));
            }
            other => panic!("expected join_group, got {:?}", other),
        }
    };
    let (membership, _) = tokio::join!(join_fut, server_fut);
    let membership = membership.expect("join acknowledged");
    assert_eq!(membership.group_id, group_id);
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

fn peer(id: &str, name: &str, lat: f64, ts: i64) -> PeerLocation {
    PeerLocation {
        peer_id: id.to_string(),
        username: name.to_string(),
        last_sample: LocationSample::new(lat, 100.5, ts),
    }
}

#[tokio::test]
async fn test_snapshot_update_departure_yields_exact_map() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source, mut link) = connected_context().await;
    let mut events = ctx.session().subscribe();

    join_group(&ctx, &mut link, "ROOM1", "Alice").await;

    // Snapshot includes self, which must never land in the map
    link.send(&ServerMessage::GroupLocations(vec![
        peer("me", "Alice", 13.70, 1000),
        peer("a", "A", 13.71, 1000),
        peer("b", "B", 13.72, 1000),
    ]));
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PresenceSnapshot { peers: 2 })
    })
    .await;

    let pos2 = peer("a", "A", 13.99, 2000);
    link.send(&ServerMessage::LocationUpdate(pos2.clone()));
    wait_for(&mut events, |e| matches!(e, SessionEvent::PeerUpdated(_))).await;

    link.send(&ServerMessage::UserLeft {
        peer_id: "b".to_string(),
    });
    wait_for(&mut events, |e| matches!(e, SessionEvent::PeerLeft { .. })).await;

    let snapshot = ctx.session().presence().snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0], pos2);
    assert!(ctx.session().presence().get("me").await.is_none());

    ctx.release().await;
}

#[tokio::test]
async fn test_leave_clears_presence_and_stops_watch() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source, mut link) = connected_context().await;

    let mut events = ctx.session().subscribe();
    join_group(&ctx, &mut link, "ROOM1", "Alice").await;
    assert!(ctx.session().publisher().is_active().await);

    link.send(&ServerMessage::GroupLocations(vec![peer(
        "a", "A", 13.71, 1000,
    )]));
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PresenceSnapshot { .. })
    })
    .await;

    ctx.session().leave().await.expect("leave");
    match link.recv().await {
        ClientMessage::LeaveGroup { .. } => {}
        other => panic!("expected leave_group, got {:?}", other),
    }

    assert_eq!(ctx.session().state().await, SessionState::NoGroup);
    assert!(ctx.session().membership().await.is_none());
    assert!(ctx.session().presence().is_empty().await);
    assert!(!ctx.session().publisher().is_active().await);

    // Idempotence: a second leave is a no-op with no further state change
    ctx.session().leave().await.expect("second leave");

    ctx.release().await;
}

#[tokio::test]
async fn test_join_rejected_returns_message_verbatim() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source, mut link) = connected_context().await;

    let join_fut = ctx.session().join("NOPE", "Alice");
    let server_fut = async {
        match link.recv().await {
            ClientMessage::JoinGroup { id, .. } => {
                link.send(&ServerMessage::Ack(AckPayload::error(id, "Invalid group ID")));
            }
            other => panic!("expected join_group, got {:?}", other),
        }
    };
    let (result, _) = tokio::join!(join_fut, server_fut);

    match result.unwrap_err() {
        BeaconError::JoinRejected { message } => assert_eq!(message, "Invalid group ID"),
        other => panic!("expected JoinRejected, got {:?}", other),
    }
    assert_eq!(ctx.session().state().await, SessionState::NoGroup);
    assert!(!ctx.session().publisher().is_active().await);

    ctx.release().await;
}

#[tokio::test]
async fn test_join_while_offline_sends_nothing() {
    let _serial = serial();
    init_tracing();
    let (ctx, mut acceptor, _source) = build_context(test_config());

    let err = ctx.session().join("ROOM1", "Alice").await.unwrap_err();
    assert!(matches!(err, BeaconError::NotConnected));

    // No dial, no wire message
    assert!(matches!(
        acceptor.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));

    ctx.release().await;
}

#[tokio::test]
async fn test_second_join_before_first_ack_is_rejected() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source, mut link) = connected_context().await;

    let first = ctx.session().join("A", "Alice");
    tokio::pin!(first);

    // Drive the first join onto the wire without letting it resolve
    let first_request = tokio::select! {
        msg = link.recv() => msg,
        _ = &mut first => panic!("join resolved without an ack"),
    };
    let ack_id = match first_request {
        ClientMessage::JoinGroup { id, group_id, .. } => {
            assert_eq!(group_id, "A");
            id
        }
        other => panic!("expected join_group, got {:?}", other),
    };

    // Second join while the first is pending: rejected, not raced
    let err = ctx.session().join("B", "Bob").await.unwrap_err();
    assert!(matches!(err, BeaconError::SessionBusy { .. }));
    link.assert_idle();

    // A stray snapshot before the ack must not populate the store
    link.send(&ServerMessage::GroupLocations(vec![peer(
        "x", "X", 1.0, 1000,
    )]));

    link.send(&ServerMessage::Ack(
        AckPayload::success(ack_id).with_group("A", "Alice"),
    ));
    let membership = first.await.expect("first join acknowledged");
    assert_eq!(membership.group_id, "A");
    assert!(ctx.session().presence().is_empty().await);

    ctx.release().await;
}

#[tokio::test]
async fn test_disconnect_invalidates_pending_join() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source, mut link) = connected_context().await;

    let first = ctx.session().join("A", "Alice");
    tokio::pin!(first);
    let _request = tokio::select! {
        msg = link.recv() => msg,
        _ = &mut first => panic!("join resolved without an ack"),
    };

    drop(link); // the link dies while the ack is outstanding

    let err = first.await.unwrap_err();
    assert!(matches!(err, BeaconError::Disconnected { .. }));
    assert_eq!(ctx.session().state().await, SessionState::NoGroup);

    ctx.release().await;
}

#[tokio::test]
async fn test_samples_are_published_and_cached() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, source, mut link) = connected_context().await;

    join_group(&ctx, &mut link, "ROOM1", "Alice").await;
    assert!(ctx.session().publisher().is_active().await);

    let sample = LocationSample::new(13.7563, 100.5018, 1000);
    source.push(sample.clone());

    match link.recv().await {
        ClientMessage::UpdateLocation(published) => assert_eq!(published, sample),
        other => panic!("expected update_location, got {:?}", other),
    }
    assert_eq!(ctx.session().publisher().last_sample().await, Some(sample));

    // Under both thresholds: dropped. Past the interval: published.
    source.push(LocationSample::new(13.7563, 100.5018, 1500));
    let later = LocationSample::new(13.7563, 100.5018, 5000);
    source.push(later.clone());
    match link.recv().await {
        ClientMessage::UpdateLocation(published) => assert_eq!(published, later),
        other => panic!("expected update_location, got {:?}", other),
    }

    ctx.release().await;
}

#[tokio::test]
async fn test_permission_denied_keeps_membership_and_allows_retry() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, source, mut link) = connected_context().await;
    source.set_permission(false);
    let mut events = ctx.session().subscribe();

    join_group(&ctx, &mut link, "ROOM1", "Alice").await;

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PublisherError { .. })
    })
    .await;
    assert_eq!(ctx.session().state().await, SessionState::Joined);
    assert!(!ctx.session().publisher().is_active().await);

    // The user grants access; start() is the retry entry point
    source.set_permission(true);
    ctx.session().publisher().start().await.expect("watch starts");
    assert!(ctx.session().publisher().is_active().await);

    ctx.release().await;
}

#[tokio::test]
async fn test_exhausted_reconnects_are_terminal() {
    let _serial = serial();
    init_tracing();
    let mut config = test_config();
    config.connection.max_reconnect_attempts = 3;
    let (ctx, mut acceptor, _source) = build_context(config);

    let (res, mut link) = tokio::join!(ctx.connect(), accept(&mut acceptor, "me"));
    res.expect("connect");
    join_group(&ctx, &mut link, "ROOM1", "Alice").await;

    let mut events = ctx.session().subscribe();
    drop(acceptor); // every reconnect dial will be refused
    drop(link);

    let event = wait_for(&mut events, |e| {
        matches!(
            e,
            SessionEvent::Disconnected {
                terminal: true,
                ..
            }
        )
    })
    .await;
    match event {
        SessionEvent::Disconnected { reason, .. } => {
            assert!(reason.contains("exhausted"), "reason: {}", reason)
        }
        _ => unreachable!(),
    }

    assert_eq!(ctx.connection().state(), ConnectionState::Failed);
    assert_eq!(ctx.session().state().await, SessionState::NoGroup);
    assert!(ctx.session().membership().await.is_none());
    assert!(ctx.session().presence().is_empty().await);
    assert!(!ctx.session().publisher().is_active().await);

    ctx.release().await;
}

#[tokio::test]
async fn test_no_auto_rejoin_after_recovery() {
    let _serial = serial();
    init_tracing();
    let (ctx, mut acceptor, _source, mut link) = connected_context().await;
    join_group(&ctx, &mut link, "ROOM1", "Alice").await;

    drop(link); // transient loss; the acceptor is still alive
    let mut second = accept(&mut acceptor, "me-2").await;

    let mut state_rx = ctx.connection().watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Connected {
                break;
            }
            state_rx.changed().await.expect("state watch");
        }
    })
    .await
    .expect("reconnect");

    // Recovered, but still out of the group until an explicit join
    assert_eq!(ctx.session().state().await, SessionState::NoGroup);
    second.assert_idle();

    join_group(&ctx, &mut second, "ROOM1", "Alice").await;
    assert_eq!(ctx.session().state().await, SessionState::Joined);

    ctx.release().await;
}

#[tokio::test]
async fn test_release_is_a_full_teardown() {
    let _serial = serial();
    init_tracing();
    let (ctx, mut acceptor, _source, mut link) = connected_context().await;
    join_group(&ctx, &mut link, "ROOM1", "Alice").await;

    ctx.release().await;

    match link.recv().await {
        ClientMessage::LeaveGroup { .. } => {}
        other => panic!("expected leave_group, got {:?}", other),
    }
    assert_eq!(ctx.session().state().await, SessionState::NoGroup);
    assert!(ctx.session().presence().is_empty().await);
    assert!(!ctx.session().publisher().is_active().await);

    let mut state_rx = ctx.connection().watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Disconnected {
                break;
            }
            state_rx.changed().await.expect("state watch");
        }
    })
    .await
    .expect("disconnect");

    // The context stays usable: connect starts over
    let (res, _link) = tokio::join!(ctx.connect(), accept(&mut acceptor, "me-3"));
    res.expect("reconnect after release");
}

#[tokio::test]
async fn test_single_live_context_per_process() {
    let _serial = serial();
    init_tracing();
    let (ctx, _acceptor, _source) = build_context(test_config());

    let (transport, _acceptor2) = memory_pair();
    let err = SessionContext::new(
        test_config(),
        Arc::new(transport),
        Arc::new(FeedSource::new()),
    )
    .unwrap_err();
    assert!(matches!(err, BeaconError::ContextInUse));

    drop(ctx);
    let (transport, _acceptor3) = memory_pair();
    SessionContext::new(
        test_config(),
        Arc::new(transport),
        Arc::new(FeedSource::new()),
    )
    .expect("guard released on drop");
}
