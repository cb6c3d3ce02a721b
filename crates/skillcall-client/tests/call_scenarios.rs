//! End-to-end call lifecycle over the in-process relay and loopback network.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skillcall_client::{
    CallController, CallError, CallHandle, CallState, IncomingCall, LoopbackNetwork, MemoryRelay,
    ReconnectPolicy, SignalingTransport, TerminationReason, TransportEvent,
};
use skillcall_common::{
    CallConfig, IceCandidate, ReconnectSettings, SignalBody, SignalKind, SignalingMessage,
};
use skillcall_media::{DummyCapture, TrackSource};
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test step timed out")
}

fn test_config() -> CallConfig {
    CallConfig {
        negotiation_timeout_ms: 3_000,
        media_acquire_timeout_ms: 1_000,
        gather_timeout_ms: 200,
        duration_tick_ms: 50,
        reconnect: ReconnectSettings {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2.0,
            max_attempts: 3,
            jitter: false,
        },
        ..CallConfig::default()
    }
}

struct World {
    relay: MemoryRelay,
    net: LoopbackNetwork,
    config: CallConfig,
}

struct Party {
    name: String,
    handle: CallHandle,
    capture: DummyCapture,
    transport: SignalingTransport,
    incoming: mpsc::UnboundedReceiver<IncomingCall>,
}

impl World {
    fn new(config: CallConfig) -> Self {
        Self {
            relay: MemoryRelay::new(),
            net: LoopbackNetwork::new(),
            config,
        }
    }

    async fn party(&self, name: &str) -> Party {
        let token = format!("token-{name}");
        self.relay.register(&token, name);
        let transport = SignalingTransport::new(
            Arc::new(self.relay.connector()),
            ReconnectPolicy::from_settings(&self.config.reconnect),
        );
        transport.connect(&token).await.unwrap();

        let capture = DummyCapture::new();
        let (handle, incoming) = self.controller(&transport, &capture);
        Party {
            name: name.to_string(),
            handle,
            capture,
            transport,
            incoming,
        }
    }

    fn controller(
        &self,
        transport: &SignalingTransport,
        capture: &DummyCapture,
    ) -> (CallHandle, mpsc::UnboundedReceiver<IncomingCall>) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let handle = CallController::new(
            self.config.clone(),
            transport.clone(),
            Arc::new(capture.clone()),
            Arc::new(self.net.clone()),
        )
        .with_notifier(Arc::new(tx))
        .spawn();
        (handle, incoming)
    }
}

/// Caller dials `callee` directly; callee accepts once notified.
async fn connect_call(caller: &Party, callee: &mut Party, exchange_id: &str) {
    let handle = caller.handle.clone();
    let exchange = exchange_id.to_string();
    let target = callee.name.clone();
    let call = tokio::spawn(async move { handle.start_call_to(&exchange, Some(&target)).await });

    let incoming = within(callee.incoming.recv()).await.unwrap();
    assert_eq!(incoming.exchange_id, exchange_id);
    assert_eq!(incoming.caller_participant_id.as_deref(), Some(caller.name.as_str()));

    within(callee.handle.accept_incoming(exchange_id)).await.unwrap();
    within(call).await.unwrap().unwrap();
}

async fn wait_terminal(handle: &CallHandle) -> skillcall_client::CallSnapshot {
    within(handle.wait_for_state(CallState::is_terminal))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_call_reaches_active_on_both_sides() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;

    connect_call(&alice, &mut bob, "exch-1").await;

    let mut watch = alice.handle.watch();
    let snapshot = within(watch.wait_for(|s| s.remote_stream.is_some()))
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.state, CallState::Active);
    assert_eq!(snapshot.exchange_id.as_deref(), Some("exch-1"));
    assert_eq!(snapshot.remote_participant_id.as_deref(), Some("bob"));
    assert!(snapshot.media.audio_enabled);
    assert!(snapshot.media.video_enabled);
    assert!(snapshot.local_stream.is_some());
    assert_eq!(snapshot.remote_stream.map(|s| s.tracks.len()), Some(2));

    let bob_view = bob.handle.snapshot();
    assert_eq!(bob_view.state, CallState::Active);
    assert_eq!(bob_view.remote_participant_id.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_start_call_while_active_is_rejected() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    let err = alice.handle.start_call("exch-1").await.unwrap_err();
    assert_eq!(
        err,
        CallError::CallAlreadyInProgress {
            exchange_id: "exch-1".into()
        }
    );
    assert_eq!(alice.handle.state(), CallState::Active);

    // A second controller on the same session hits the transport's registry.
    let (second, _incoming) = world.controller(&alice.transport, &DummyCapture::new());
    let err = second.start_call("exch-1").await.unwrap_err();
    assert!(matches!(err, CallError::CallAlreadyInProgress { .. }));
    assert_eq!(second.state(), CallState::Idle);
    assert_eq!(alice.handle.state(), CallState::Active);
}

#[tokio::test]
async fn test_default_controllers_share_call_guard() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;

    let other_capture = DummyCapture::new();
    let (other, _other_incoming) = world.controller(&alice.transport, &other_capture);

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to("exch-1", Some("bob")).await });
    let mut watch = alice.handle.watch();
    within(watch.wait_for(|s| s.state != CallState::Idle))
        .await
        .unwrap();

    let err = other.start_call("exch-1").await.unwrap_err();
    assert_eq!(
        err,
        CallError::CallAlreadyInProgress {
            exchange_id: "exch-1".into()
        }
    );
    assert_eq!(other.state(), CallState::Idle);
    assert_eq!(other_capture.open_count(TrackSource::Microphone), 0);

    within(bob.incoming.recv()).await.unwrap();
    within(bob.handle.accept_incoming("exch-1")).await.unwrap();
    within(call).await.unwrap().unwrap();
    assert_eq!(alice.transport.registry().active_count(), 1);
}

#[tokio::test]
async fn test_offer_reaches_one_idle_controller() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    let (second, mut second_incoming) = world.controller(&bob.transport, &DummyCapture::new());

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to("exch-1", Some("bob")).await });

    let (winner, incoming) = within(async {
        tokio::select! {
            offer = bob.incoming.recv() => (bob.handle.clone(), offer.unwrap()),
            offer = second_incoming.recv() => (second.clone(), offer.unwrap()),
        }
    })
    .await;
    assert_eq!(incoming.exchange_id, "exch-1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.incoming.try_recv().is_err());
    assert!(second_incoming.try_recv().is_err());

    within(winner.accept_incoming("exch-1")).await.unwrap();
    within(call).await.unwrap().unwrap();
    assert_eq!(bob.transport.registry().active_count(), 1);
}

#[tokio::test]
async fn test_responder_joins_room_on_accept() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to("exch-2", Some("bob")).await });

    let incoming = within(bob.incoming.recv()).await.unwrap();
    assert_eq!(incoming.exchange_id, "exch-2");
    assert_eq!(world.relay.room_members("exch-2"), vec!["alice"]);
    assert!(bob.transport.joined_rooms().is_empty());

    within(bob.handle.accept_incoming("exch-2")).await.unwrap();
    within(call).await.unwrap().unwrap();

    assert_eq!(bob.transport.joined_rooms(), vec!["exch-2"]);
    assert_eq!(world.relay.room_members("exch-2"), vec!["alice", "bob"]);
    let answer = world
        .relay
        .routed_signals()
        .into_iter()
        .find(|m| m.kind() == SignalKind::Answer)
        .expect("answer routed");
    assert_eq!(answer.sender_participant_id.as_deref(), Some("bob"));
    assert_eq!(answer.target_participant_id.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_signaling_drop_keeps_call_active() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    let states = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let states = states.clone();
        let mut watch = alice.handle.watch();
        tokio::spawn(async move {
            while watch.changed().await.is_ok() {
                let state = watch.borrow_and_update().state;
                states.lock().unwrap().push(state);
            }
        })
    };

    let mut events = alice.transport.subscribe();
    assert!(world.relay.drop_connection("alice"));
    within(async {
        while let Some(event) = events.recv().await {
            if matches!(event, TransportEvent::Connected { .. }) {
                break;
            }
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    recorder.abort();

    assert_eq!(alice.handle.state(), CallState::Active);
    assert!(states
        .lock()
        .unwrap()
        .iter()
        .all(|s| *s == CallState::Active));
    assert_eq!(alice.capture.open_count(TrackSource::Microphone), 1);
    assert_eq!(alice.capture.open_count(TrackSource::Camera), 1);
    assert!(world
        .relay
        .room_members("exch-1")
        .contains(&"alice".to_string()));
}

#[tokio::test]
async fn test_reconnect_exhaustion_fails_call() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;
    assert!(alice.capture.live_tracks() > 0);

    world.relay.set_offline(true);
    world.relay.drop_connection("alice");

    let snapshot = wait_terminal(&alice.handle).await;
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(
        snapshot.termination,
        Some(TerminationReason::TransportReconnectExhausted)
    );
    assert_eq!(alice.capture.live_tracks(), 0);
    assert!(!alice.transport.registry().is_active("alice", "exch-1"));
}

#[tokio::test]
async fn test_revoked_screen_share_restores_camera() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    let state = alice.handle.set_screen_share(true).await.unwrap();
    assert!(state.screen_sharing);
    let again = alice.handle.set_screen_share(true).await.unwrap();
    assert_eq!(again, state);
    assert_eq!(alice.capture.open_count(TrackSource::Display), 1);

    alice.capture.revoke(TrackSource::Display);
    let mut watch = alice.handle.watch();
    let snapshot = within(watch.wait_for(|s| !s.media.screen_sharing))
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.state, CallState::Active);
    assert!(snapshot.media.video_enabled);
    assert_eq!(alice.capture.open_count(TrackSource::Camera), 2);
    let outgoing = snapshot
        .local_stream
        .and_then(|s| s.video)
        .expect("outgoing video");
    assert_eq!(outgoing.source(), TrackSource::Camera);
}

#[tokio::test]
async fn test_slow_camera_restore_after_revoke() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    assert!(alice.handle.set_screen_share(true).await.unwrap().screen_sharing);
    // Longer than the duration tick, so ticks land while the camera is reopening.
    alice.capture.set_open_delay(Some(Duration::from_millis(200)));
    alice.capture.revoke(TrackSource::Display);

    let mut watch = alice.handle.watch();
    let snapshot = within(watch.wait_for(|s| {
        !s.media.screen_sharing
            && s.local_stream
                .as_ref()
                .and_then(|stream| stream.video.as_ref())
                .is_some_and(|video| video.source() == TrackSource::Camera)
    }))
    .await
    .unwrap()
    .clone();
    assert_eq!(snapshot.state, CallState::Active);
    assert!(snapshot.media.video_enabled);
    assert_eq!(alice.capture.open_count(TrackSource::Camera), 2);
}

#[tokio::test]
async fn test_screen_share_round_trip() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    let before = alice.handle.snapshot().media;
    assert!(alice.handle.toggle_screen_share().await.unwrap().screen_sharing);
    let after = alice.handle.toggle_screen_share().await.unwrap();
    assert_eq!(after, before);
    assert_eq!(alice.handle.state(), CallState::Active);
}

#[tokio::test]
async fn test_toggles_gate_tracks_without_state_change() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    let muted = alice.handle.toggle_mute().await.unwrap();
    assert!(!muted.audio_enabled);
    let camera_off = alice.handle.toggle_camera().await.unwrap();
    assert!(!camera_off.video_enabled);
    let mic = alice
        .capture
        .last_opened(TrackSource::Microphone)
        .unwrap();
    assert!(!mic.is_enabled());
    assert!(!mic.is_ended());
    assert_eq!(alice.handle.state(), CallState::Active);
    assert!(alice.handle.toggle_mute().await.unwrap().audio_enabled);
}

#[tokio::test]
async fn test_end_call_is_idempotent_and_reaches_remote() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    connect_call(&alice, &mut bob, "exch-1").await;

    alice.handle.hang_up().await.unwrap();
    alice.handle.hang_up().await.unwrap();

    let ours = wait_terminal(&alice.handle).await;
    assert_eq!(ours.state, CallState::Ended);
    assert_eq!(ours.termination, Some(TerminationReason::LocalHangup));
    assert!(ours.local_stream.is_none());

    let theirs = wait_terminal(&bob.handle).await;
    assert_eq!(theirs.state, CallState::Ended);
    assert_eq!(theirs.termination, Some(TerminationReason::RemoteHangup));
    assert_ne!(
        TerminationReason::LocalHangup.describe(),
        TerminationReason::RemoteHangup.describe()
    );

    assert_eq!(alice.capture.live_tracks(), 0);
    assert_eq!(bob.capture.live_tracks(), 0);
    assert_eq!(alice.transport.registry().active_count(), 0);
    assert_eq!(bob.transport.registry().active_count(), 0);
    let ends = world
        .relay
        .routed_signals()
        .into_iter()
        .filter(|m| m.kind() == SignalKind::End)
        .count();
    assert_eq!(ends, 1);
    assert!(alice.transport.joined_rooms().is_empty());

    let err = alice.handle.start_call("exch-1").await.unwrap_err();
    assert_eq!(err, CallError::ControllerFinished);
}

#[tokio::test]
async fn test_permission_denied_fails_setup() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    alice.capture.deny(TrackSource::Camera);

    let err = alice
        .handle
        .start_call_to("exch-1", Some("bob"))
        .await
        .unwrap_err();
    assert_eq!(err, CallError::PermissionDenied(TrackSource::Camera));

    let snapshot = wait_terminal(&alice.handle).await;
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(snapshot.termination, Some(TerminationReason::PermissionDenied));
    assert_eq!(alice.capture.live_tracks(), 0);
    assert!(!alice.transport.registry().is_active("alice", "exch-1"));
    assert!(alice.transport.joined_rooms().is_empty());
}

#[tokio::test]
async fn test_unreachable_peer_times_out() {
    let config = CallConfig {
        negotiation_timeout_ms: 300,
        ..test_config()
    };
    let world = World::new(config);
    world.net.set_partitioned(true);
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to("exch-1", Some("bob")).await });
    within(bob.incoming.recv()).await.unwrap();
    let callee = bob.handle.clone();
    tokio::spawn(async move { callee.accept_incoming("exch-1").await });

    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err, CallError::NegotiationTimeout);
    let snapshot = wait_terminal(&alice.handle).await;
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(
        snapshot.termination,
        Some(TerminationReason::NegotiationTimeout)
    );
}

#[tokio::test]
async fn test_dropping_start_call_cancels() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let _bob = world.party("bob").await;

    let pending = tokio::time::timeout(
        Duration::from_millis(100),
        alice.handle.start_call_to("exch-1", Some("bob")),
    )
    .await;
    assert!(pending.is_err());

    let snapshot = wait_terminal(&alice.handle).await;
    assert_eq!(snapshot.state, CallState::Ended);
    assert_eq!(snapshot.termination, Some(TerminationReason::Cancelled));
    assert_eq!(alice.capture.live_tracks(), 0);

    within(async {
        loop {
            let cancelled = world
                .relay
                .routed_signals()
                .iter()
                .any(|m| m.kind() == SignalKind::End);
            if cancelled {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_invalid_operations_are_rejected() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;

    let err = alice.handle.toggle_mute().await.unwrap_err();
    assert_eq!(
        err,
        CallError::InvalidState {
            operation: "toggle_mute",
            state: CallState::Idle
        }
    );
    assert!(matches!(
        alice.handle.toggle_screen_share().await,
        Err(CallError::InvalidState { .. })
    ));
    assert_eq!(
        alice.handle.accept_incoming("exch-9").await,
        Err(CallError::NoPendingOffer("exch-9".into()))
    );
    assert_eq!(
        alice.handle.start_call("").await,
        Err(CallError::InvalidExchange)
    );
    alice.handle.hang_up().await.unwrap();
    assert_eq!(alice.handle.state(), CallState::Idle);
}

#[tokio::test]
async fn test_candidates_before_answer_are_kept() {
    let world = World::new(test_config());
    let alice = world.party("alice").await;
    let mut bob = world.party("bob").await;
    world.relay.hold_signals(Some(SignalKind::Answer));

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to("exch-1", Some("bob")).await });
    within(bob.incoming.recv()).await.unwrap();
    let callee = bob.handle.clone();
    let accepted = tokio::spawn(async move { callee.accept_incoming("exch-1").await });

    let mut answer = within(async {
        loop {
            if let Some(answer) = world.relay.take_held().into_iter().next() {
                break answer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let SignalBody::Answer(description) = &mut answer.body else {
        panic!("only answers are held");
    };
    let bundled = std::mem::take(&mut description.candidates);
    assert_eq!(bundled.len(), 1);
    let real = bundled[0].candidate.clone();
    let decoy = real.replacen("127.0.0.1", "127.0.0.2", 1);
    assert_ne!(decoy, real);

    // Candidates overtake the answer; the initiator must keep them until it lands.
    for line in [&decoy, &real] {
        let candidate = SignalingMessage::ice_candidate("exch-1", IceCandidate::new(line.clone()))
            .from_participant("bob")
            .to(Some("alice".into()));
        world.relay.inject(candidate);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.handle.state(), CallState::Negotiating);

    world.relay.hold_signals(None);
    world.relay.inject(answer);

    within(call).await.unwrap().unwrap();
    within(accepted).await.unwrap().unwrap();
    assert_eq!(alice.handle.state(), CallState::Active);
    assert_eq!(bob.handle.state(), CallState::Active);
    let applied = world.net.applied_candidates();
    assert!(applied.contains(&decoy));
    assert!(applied.contains(&real));
}
