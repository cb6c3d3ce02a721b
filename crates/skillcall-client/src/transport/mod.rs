//! Authenticated, room-scoped relay connection with automatic re-attachment.
//!
//! [`SignalingTransport`] owns one relay link at a time. A background driver forwards
//! inbound frames to subscribers in arrival order. When the link drops, the driver retries
//! under the [`ReconnectPolicy`] and re-joins every room that was joined before. Only then
//! does it publish [`TransportEvent::Connected`] again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use skillcall_common::{ChatMessage, Frame, PresenceUpdate, SignalKind, SignalingMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{CallRegistry, ReconnectPolicy, TransportError};

mod memory;
mod ws;

pub use memory::{MemoryConnector, MemoryRelay, ROUTED_HISTORY};
pub use ws::WsConnector;

/// A live authenticated link to the relay.
///
/// The link is considered lost when `inbound` yields `None`.
#[derive(Debug)]
pub struct TransportLink {
    pub participant_id: String,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The credential was rejected. Retrying with it cannot succeed.
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Opens authenticated links to a relay.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, token: &str) -> BoxFuture<'static, Result<TransportLink, ConnectError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    AuthFailed,
    /// Reconnect budget exhausted.
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { participant_id: String },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed { attempts: u32 },
    AuthFailed { reason: String },
    Signal(SignalingMessage),
    Chat(ChatMessage),
    Presence(PresenceUpdate),
}

struct Shared {
    status: TransportStatus,
    participant_id: Option<String>,
    token: Option<String>,
    rooms: BTreeSet<String>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: CallRegistry,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    fn emit(&mut self, event: TransportEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle to the signaling connection. Clones share the same link.
#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Inner>,
}

impl SignalingTransport {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                registry: CallRegistry::new(),
                shared: Mutex::new(Shared {
                    status: TransportStatus::Idle,
                    participant_id: None,
                    token: None,
                    rooms: BTreeSet::new(),
                    outbound: None,
                    subscribers: Vec::new(),
                    driver: None,
                }),
            }),
        }
    }

    /// Receive every event from now on, in arrival order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.lock().status
    }

    /// Participant id the relay assigned at authentication.
    pub fn participant_id(&self) -> Option<String> {
        self.inner.lock().participant_id.clone()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.inner.lock().rooms.iter().cloned().collect()
    }

    /// Calls and pending offers of this session. Shared by every clone.
    pub fn registry(&self) -> CallRegistry {
        self.inner.registry.clone()
    }

    /// Authenticate and open the link. The first attempt is not retried.
    pub async fn connect(&self, token: &str) -> Result<String, TransportError> {
        {
            let mut shared = self.inner.lock();
            match shared.status {
                TransportStatus::Connected => {
                    if let Some(id) = shared.participant_id.clone() {
                        return Ok(id);
                    }
                }
                TransportStatus::Connecting | TransportStatus::Reconnecting => {
                    return Err(TransportError::AlreadyConnecting);
                }
                _ => {}
            }
            shared.status = TransportStatus::Connecting;
        }

        match self.inner.connector.connect(token).await {
            Ok(link) => {
                let participant_id = link.participant_id.clone();
                self.attach(link, token.to_string());
                info!(participant = %participant_id, "signaling connected");
                Ok(participant_id)
            }
            Err(ConnectError::Auth(reason)) => {
                let mut shared = self.inner.lock();
                shared.status = TransportStatus::AuthFailed;
                shared.emit(TransportEvent::AuthFailed {
                    reason: reason.clone(),
                });
                warn!(%reason, "signaling authentication rejected");
                Err(TransportError::AuthFailed(reason))
            }
            Err(ConnectError::Network(reason)) => {
                self.inner.lock().status = TransportStatus::Idle;
                warn!(%reason, "could not reach signaling relay");
                Err(TransportError::Connect(reason))
            }
        }
    }

    fn attach(&self, link: TransportLink, token: String) {
        let mut shared = self.inner.lock();
        if let Some(old) = shared.driver.take() {
            old.abort();
        }
        shared.status = TransportStatus::Connected;
        shared.participant_id = Some(link.participant_id.clone());
        shared.token = Some(token);
        if let Err(room) = rejoin_rooms(&shared.rooms, &link.outbound) {
            warn!(exchange = %room, "room join not sent; the link will be replaced");
        }
        shared.outbound = Some(link.outbound);
        shared.emit(TransportEvent::Connected {
            participant_id: link.participant_id,
        });
        shared.driver = Some(tokio::spawn(drive(self.inner.clone(), link.inbound)));
    }

    /// Start receiving messages addressed to `exchange_id`.
    pub fn join_room(&self, exchange_id: &str) -> Result<(), TransportError> {
        let mut shared = self.inner.lock();
        let outbound = connected_outbound(&shared)?;
        if shared.rooms.contains(exchange_id) {
            return Ok(());
        }
        outbound
            .send(Frame::Signal(SignalingMessage::join(exchange_id)))
            .map_err(|_| TransportError::NotConnected)?;
        shared.rooms.insert(exchange_id.to_string());
        debug!(exchange = exchange_id, "joined room");
        Ok(())
    }

    /// Forget `exchange_id`. Membership is dropped even when the relay cannot be told.
    pub fn leave_room(&self, exchange_id: &str) -> Result<(), TransportError> {
        let mut shared = self.inner.lock();
        if !shared.rooms.remove(exchange_id) {
            return Ok(());
        }
        debug!(exchange = exchange_id, "left room");
        connected_outbound(&shared)?
            .send(Frame::Signal(SignalingMessage::leave(exchange_id)))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Send a message into a joined room. At-most-once; nothing is queued while detached.
    pub fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let shared = self.inner.lock();
        let outbound = connected_outbound(&shared)?;
        if !shared.rooms.contains(&message.exchange_id) {
            return Err(TransportError::RoomNotJoined(message.exchange_id));
        }
        if matches!(message.kind(), SignalKind::Join | SignalKind::Leave) {
            debug!(kind = %message.kind(), "membership sent through send(); prefer join_room/leave_room");
        }
        outbound
            .send(Frame::Signal(message))
            .map_err(|_| TransportError::NotConnected)
    }

    pub fn send_chat(&self, exchange_id: &str, body: &str) -> Result<(), TransportError> {
        let shared = self.inner.lock();
        let outbound = connected_outbound(&shared)?;
        if !shared.rooms.contains(exchange_id) {
            return Err(TransportError::RoomNotJoined(exchange_id.to_string()));
        }
        outbound
            .send(Frame::Chat(ChatMessage {
                exchange_id: exchange_id.to_string(),
                sender_participant_id: None,
                body: body.to_string(),
            }))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Tear the link down for good. Subscribers stay registered but nothing more arrives.
    pub fn close(&self) {
        let mut shared = self.inner.lock();
        if shared.status == TransportStatus::Closed {
            return;
        }
        shared.status = TransportStatus::Closed;
        shared.outbound = None;
        shared.rooms.clear();
        if let Some(driver) = shared.driver.take() {
            driver.abort();
        }
        info!("signaling transport closed");
    }
}

/// Queue a join for every room on a fresh link. Fails with the first room that could not
/// be sent, which means the link's writer is already gone.
fn rejoin_rooms(
    rooms: &BTreeSet<String>,
    outbound: &mpsc::UnboundedSender<Frame>,
) -> Result<(), String> {
    for room in rooms {
        outbound
            .send(Frame::Signal(SignalingMessage::join(room.clone())))
            .map_err(|_| room.clone())?;
    }
    Ok(())
}

fn connected_outbound(shared: &Shared) -> Result<mpsc::UnboundedSender<Frame>, TransportError> {
    match (&shared.status, &shared.outbound) {
        (TransportStatus::Connected, Some(outbound)) => Ok(outbound.clone()),
        _ => Err(TransportError::NotConnected),
    }
}

fn dispatch(inner: &Inner, frame: Frame) {
    let event = match frame {
        Frame::Signal(message) => TransportEvent::Signal(message),
        Frame::Chat(chat) => TransportEvent::Chat(chat),
        Frame::Presence(presence) => TransportEvent::Presence(presence),
        Frame::Error { message } => {
            warn!(%message, "relay reported an error");
            return;
        }
        other => {
            debug!(?other, "ignoring unexpected frame");
            return;
        }
    };
    inner.lock().emit(event);
}

/// Pump one link, then re-attach until the budget runs out.
async fn drive(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<Frame>) {
    loop {
        while let Some(frame) = inbound.recv().await {
            dispatch(&inner, frame);
        }

        let token = {
            let mut shared = inner.lock();
            if shared.status == TransportStatus::Closed {
                return;
            }
            shared.status = TransportStatus::Reconnecting;
            shared.outbound = None;
            shared.emit(TransportEvent::Disconnected);
            match shared.token.clone() {
                Some(token) => token,
                None => return,
            }
        };
        warn!("signaling link lost; reconnecting");

        let mut attempt = 0u32;
        let (mut shared, link) = loop {
            attempt += 1;
            let Some(delay) = inner.policy.delay(attempt) else {
                let attempts = attempt - 1;
                let mut shared = inner.lock();
                shared.status = TransportStatus::Failed;
                shared.emit(TransportEvent::ReconnectFailed { attempts });
                error!(attempts, "signaling reconnect budget exhausted");
                return;
            };

            inner
                .lock()
                .emit(TransportEvent::Reconnecting { attempt, delay });
            debug!(attempt, ?delay, "waiting before reconnect");
            tokio::time::sleep(delay).await;

            if inner.lock().status == TransportStatus::Closed {
                return;
            }
            match inner.connector.connect(&token).await {
                Ok(link) => {
                    let mut shared = inner.lock();
                    if shared.status == TransportStatus::Closed {
                        return;
                    }
                    match rejoin_rooms(&shared.rooms, &link.outbound) {
                        Ok(()) => break (shared, link),
                        Err(room) => {
                            warn!(attempt, exchange = %room, "re-join failed; link discarded");
                        }
                    }
                }
                Err(ConnectError::Auth(reason)) => {
                    let mut shared = inner.lock();
                    shared.status = TransportStatus::AuthFailed;
                    shared.emit(TransportEvent::AuthFailed {
                        reason: reason.clone(),
                    });
                    error!(%reason, "credential rejected on reconnect");
                    return;
                }
                Err(ConnectError::Network(reason)) => {
                    warn!(attempt, %reason, "reconnect attempt failed");
                }
            }
        };

        shared.status = TransportStatus::Connected;
        shared.participant_id = Some(link.participant_id.clone());
        shared.outbound = Some(link.outbound);
        info!(attempt, rooms = shared.rooms.len(), "signaling re-attached");
        shared.emit(TransportEvent::Connected {
            participant_id: link.participant_id,
        });
        drop(shared);
        inbound = link.inbound;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
            2.0,
            max_attempts,
        )
    }

    async fn next_matching<F>(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        pred: F,
    ) -> TransportEvent
    where
        F: Fn(&TransportEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.expect("transport event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let relay = MemoryRelay::new();
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        assert_eq!(
            transport.send(SignalingMessage::join("ex")),
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.join_room("ex"), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_requires_joined_room() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        transport.connect("tok-a").await.unwrap();
        let offer = SignalingMessage::offer("ex-1", skillcall_common::SessionDescription::offer("v=0"));
        assert_eq!(
            transport.send(offer.clone()),
            Err(TransportError::RoomNotJoined("ex-1".into()))
        );
        transport.join_room("ex-1").unwrap();
        assert!(transport.send(offer).is_ok());
    }

    #[tokio::test]
    async fn test_bad_token_is_terminal() {
        let relay = MemoryRelay::new();
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        let mut events = transport.subscribe();
        let err = transport.connect("nope").await.unwrap_err();
        assert!(matches!(err, TransportError::AuthFailed(_)));
        assert_eq!(transport.status(), TransportStatus::AuthFailed);
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::AuthFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_not_retried() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        relay.set_offline(true);
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        let err = transport.connect("tok-a").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(transport.status(), TransportStatus::Idle);
        assert_eq!(relay.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_rooms_before_connected() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(5));
        transport.connect("tok-a").await.unwrap();
        transport.join_room("ex-1").unwrap();
        transport.join_room("ex-2").unwrap();
        tokio::task::yield_now().await;
        let mut events = transport.subscribe();

        relay.drop_connection("alice");
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert!(!relay.room_members("ex-1").contains(&"alice".to_string()));

        let reconnecting = events.recv().await.unwrap();
        assert_eq!(
            reconnecting,
            TransportEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        next_matching(&mut events, |e| matches!(e, TransportEvent::Connected { .. })).await;
        assert_eq!(transport.status(), TransportStatus::Connected);

        // Joins were queued on the new link ahead of Connected; let the relay route them.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(relay.room_members("ex-1").contains(&"alice".to_string()));
        assert!(relay.room_members("ex-2").contains(&"alice".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_once() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        transport.connect("tok-a").await.unwrap();
        let mut events = transport.subscribe();

        relay.set_offline(true);
        relay.drop_connection("alice");

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Reconnecting { delay, .. } => delays.push(delay),
                TransportEvent::ReconnectFailed { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(transport.status(), TransportStatus::Failed);
        assert_eq!(transport.send_chat("ex", "hi"), Err(TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_reconnecting() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        let transport = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(5));
        transport.connect("tok-a").await.unwrap();
        transport.close();
        relay.drop_connection("alice");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.status(), TransportStatus::Closed);
        assert_eq!(relay.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        relay.register("tok-b", "bob");
        let alice = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        let bob = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(3));
        alice.connect("tok-a").await.unwrap();
        bob.connect("tok-b").await.unwrap();
        let mut bob_events = bob.subscribe();
        bob.join_room("ex").unwrap();
        while !relay.room_members("ex").contains(&"bob".to_string()) {
            tokio::task::yield_now().await;
        }
        alice.join_room("ex").unwrap();
        next_matching(&mut bob_events, |e| {
            matches!(e, TransportEvent::Signal(m) if m.kind() == SignalKind::Join)
        })
        .await;

        for i in 0..10 {
            alice.send_chat("ex", &format!("msg {i}")).unwrap();
        }
        for i in 0..10 {
            match next_matching(&mut bob_events, |e| matches!(e, TransportEvent::Chat(_))).await {
                TransportEvent::Chat(chat) => {
                    assert_eq!(chat.body, format!("msg {i}"));
                    assert_eq!(chat.sender_participant_id.as_deref(), Some("alice"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    /// Hands out one link whose writer is already gone, then defers to the relay.
    struct DeadWriterOnce {
        relay: MemoryConnector,
        armed: Mutex<bool>,
        parked: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    }

    impl Connector for DeadWriterOnce {
        fn connect(&self, token: &str) -> BoxFuture<'static, Result<TransportLink, ConnectError>> {
            let mut armed = self.armed.lock().unwrap();
            if *armed {
                *armed = false;
                let (outbound, _) = mpsc::unbounded_channel();
                let (in_tx, inbound) = mpsc::unbounded_channel();
                // Keep the reader open so only the writer side is broken.
                self.parked.lock().unwrap().push(in_tx);
                return Box::pin(async move {
                    Ok(TransportLink {
                        participant_id: "alice".into(),
                        outbound,
                        inbound,
                    })
                });
            }
            self.relay.connect(token)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rejoin_discards_link() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        let connector = Arc::new(DeadWriterOnce {
            relay: relay.connector(),
            armed: Mutex::new(false),
            parked: Mutex::new(Vec::new()),
        });
        let transport = SignalingTransport::new(connector.clone(), fast_policy(5));
        transport.connect("tok-a").await.unwrap();
        transport.join_room("ex-1").unwrap();
        let mut events = transport.subscribe();

        *connector.armed.lock().unwrap() = true;
        relay.drop_connection("alice");

        let mut attempts = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Reconnecting { attempt, .. } => attempts.push(attempt),
                TransportEvent::Connected { .. } => break,
                _ => {}
            }
        }
        assert_eq!(attempts, vec![1, 2]);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(relay.room_members("ex-1"), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_presence_follows_connections() {
        let relay = MemoryRelay::new();
        relay.register("tok-a", "alice");
        relay.register("tok-b", "bob");
        let alice = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(0));
        alice.connect("tok-a").await.unwrap();
        let mut events = alice.subscribe();

        let bob = SignalingTransport::new(Arc::new(relay.connector()), fast_policy(0));
        bob.connect("tok-b").await.unwrap();
        let online = next_matching(&mut events, |e| matches!(e, TransportEvent::Presence(_))).await;
        assert_eq!(
            online,
            TransportEvent::Presence(PresenceUpdate {
                participant_id: "bob".into(),
                online: true
            })
        );

        relay.drop_connection("bob");
        let offline = next_matching(&mut events, |e| matches!(e, TransportEvent::Presence(_))).await;
        assert_eq!(
            offline,
            TransportEvent::Presence(PresenceUpdate {
                participant_id: "bob".into(),
                online: false
            })
        );
    }
}
