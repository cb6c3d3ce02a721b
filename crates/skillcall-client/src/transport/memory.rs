use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use skillcall_common::{Frame, PresenceUpdate, SignalKind, SignalingMessage};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ConnectError, Connector, TransportLink};

/// Routed signals kept for inspection; older ones are forgotten.
pub const ROUTED_HISTORY: usize = 256;

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct RelayState {
    tokens: HashMap<String, String>,
    offline: bool,
    connections: HashMap<String, Connection>,
    rooms: HashMap<String, BTreeSet<String>>,
    next_connection: u64,
    connect_attempts: usize,
    routed: VecDeque<SignalingMessage>,
    hold: Option<SignalKind>,
    held: Vec<SignalingMessage>,
}

impl RelayState {
    fn deliver(&self, participant: &str, frame: Frame) {
        match self.connections.get(participant) {
            Some(conn) => {
                let _ = conn.tx.send(frame);
            }
            None => trace!(participant, "recipient offline; dropping frame"),
        }
    }

    fn fan_out(&self, exchange_id: &str, except: &str, frame: Frame) {
        let Some(members) = self.rooms.get(exchange_id) else {
            return;
        };
        for member in members.iter().filter(|m| m.as_str() != except) {
            self.deliver(member, frame.clone());
        }
    }

    fn is_member(&self, exchange_id: &str, participant: &str) -> bool {
        self.rooms
            .get(exchange_id)
            .is_some_and(|members| members.contains(participant))
    }

    fn route_signal(&mut self, participant: &str, message: SignalingMessage) {
        let message = message.from_participant(participant);
        if self.routed.len() == ROUTED_HISTORY {
            self.routed.pop_front();
        }
        self.routed.push_back(message.clone());
        if self.hold == Some(message.kind()) {
            trace!(participant, kind = %message.kind(), "signal held back");
            self.held.push(message);
            return;
        }
        self.forward(participant, message);
    }

    fn forward(&mut self, participant: &str, message: SignalingMessage) {
        let exchange_id = message.exchange_id.clone();

        match message.kind() {
            SignalKind::Join => {
                self.rooms
                    .entry(exchange_id.clone())
                    .or_default()
                    .insert(participant.to_string());
                self.fan_out(&exchange_id, participant, Frame::Signal(message));
            }
            SignalKind::Leave => {
                self.fan_out(&exchange_id, participant, Frame::Signal(message));
                self.remove_member(&exchange_id, participant);
            }
            _ => {
                if let Some(target) = message.target_participant_id.clone() {
                    self.deliver(&target, Frame::Signal(message));
                } else if self.is_member(&exchange_id, participant) {
                    self.fan_out(&exchange_id, participant, Frame::Signal(message));
                } else {
                    self.deliver(
                        participant,
                        Frame::Error {
                            message: format!("not a member of {exchange_id}"),
                        },
                    );
                }
            }
        }
    }

    fn remove_member(&mut self, exchange_id: &str, participant: &str) {
        if let Some(members) = self.rooms.get_mut(exchange_id) {
            members.remove(participant);
            if members.is_empty() {
                self.rooms.remove(exchange_id);
            }
        }
    }

    fn broadcast_presence(&self, participant: &str, online: bool) {
        let update = PresenceUpdate {
            participant_id: participant.to_string(),
            online,
        };
        for (other, conn) in &self.connections {
            if other != participant {
                let _ = conn.tx.send(Frame::Presence(update.clone()));
            }
        }
    }

    /// Forget a participant's connection and memberships, telling the rooms it left.
    fn detach(&mut self, participant: &str) {
        self.connections.remove(participant);
        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(participant))
            .map(|(exchange_id, _)| exchange_id.clone())
            .collect();
        for exchange_id in joined {
            let leave = SignalingMessage::leave(exchange_id.clone()).from_participant(participant);
            self.fan_out(&exchange_id, participant, Frame::Signal(leave));
            self.remove_member(&exchange_id, participant);
        }
        self.broadcast_presence(participant, false);
    }
}

/// In-process relay with the same routing rules as the hosted one.
///
/// Room messages fan out to every other member; targeted messages go straight to the
/// target even if it has not joined yet, which is how a callee first hears of an offer.
/// The relay stamps the sender on everything it forwards.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
        }
    }

    /// Accept `token` as the credential of `participant_id`.
    pub fn register(&self, token: &str, participant_id: &str) {
        self.lock()
            .tokens
            .insert(token.to_string(), participant_id.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.lock().tokens.remove(token);
    }

    /// While offline every connection attempt fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Cut a participant's current link as if the network dropped it.
    pub fn drop_connection(&self, participant_id: &str) -> bool {
        let mut state = self.lock();
        if !state.connections.contains_key(participant_id) {
            return false;
        }
        debug!(participant = participant_id, "relay dropping connection");
        state.detach(participant_id);
        true
    }

    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.lock().connections.contains_key(participant_id)
    }

    pub fn room_members(&self, exchange_id: &str) -> Vec<String> {
        self.lock()
            .rooms
            .get(exchange_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Park every signal of `kind` instead of delivering it; `None` resumes delivery.
    pub fn hold_signals(&self, kind: Option<SignalKind>) {
        self.lock().hold = kind;
    }

    /// Remove the parked signals without delivering them.
    pub fn take_held(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut self.lock().held)
    }

    /// Deliver `message` as if its stamped sender had just sent it. Holding does not apply.
    pub fn inject(&self, message: SignalingMessage) {
        let mut state = self.lock();
        match message.sender_participant_id.clone() {
            Some(sender) => state.forward(&sender, message),
            None => debug!("injected signal without a sender dropped"),
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// The most recent [`ROUTED_HISTORY`] signaling messages, oldest first, as stamped by
    /// the relay.
    pub fn routed_signals(&self) -> Vec<SignalingMessage> {
        self.lock().routed.iter().cloned().collect()
    }

    fn open(&self, token: &str) -> Result<TransportLink, ConnectError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.offline {
            return Err(ConnectError::Network("relay unreachable".into()));
        }
        let Some(participant_id) = state.tokens.get(token).cloned() else {
            return Err(ConnectError::Auth("unknown credential".into()));
        };

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel();
        state.next_connection += 1;
        let id = state.next_connection;
        if state
            .connections
            .insert(participant_id.clone(), Connection { id, tx: to_client })
            .is_some()
        {
            debug!(participant = %participant_id, "replaced existing relay connection");
        }
        state.broadcast_presence(&participant_id, true);
        drop(state);

        let relay = self.clone();
        let participant = participant_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                relay.route(&participant, id, frame);
            }
            relay.closed_by_client(&participant, id);
        });

        Ok(TransportLink {
            participant_id,
            outbound,
            inbound,
        })
    }

    fn route(&self, participant: &str, connection: u64, frame: Frame) {
        let mut state = self.lock();
        if state.connections.get(participant).map(|c| c.id) != Some(connection) {
            trace!(participant, "frame from stale connection dropped");
            return;
        }
        match frame {
            Frame::Signal(message) => state.route_signal(participant, message),
            Frame::Chat(mut chat) => {
                chat.sender_participant_id = Some(participant.to_string());
                let exchange_id = chat.exchange_id.clone();
                state.fan_out(&exchange_id, participant, Frame::Chat(chat));
            }
            other => debug!(?other, "relay ignoring client frame"),
        }
    }

    fn closed_by_client(&self, participant: &str, connection: u64) {
        let mut state = self.lock();
        if state.connections.get(participant).map(|c| c.id) == Some(connection) {
            debug!(participant, "client closed relay connection");
            state.detach(participant);
        }
    }
}

/// [`Connector`] into a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryConnector {
    relay: MemoryRelay,
}

impl Connector for MemoryConnector {
    fn connect(&self, token: &str) -> BoxFuture<'static, Result<TransportLink, ConnectError>> {
        let relay = self.relay.clone();
        let token = token.to_string();
        Box::pin(async move { relay.open(&token) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillcall_common::{EndNotice, SessionDescription, SignalBody};

    async fn open(relay: &MemoryRelay, token: &str) -> TransportLink {
        relay.connector().connect(token).await.unwrap()
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn next_signal(link: &mut TransportLink) -> SignalingMessage {
        loop {
            match link.inbound.try_recv() {
                Ok(Frame::Signal(message)) => return message,
                Ok(_) => continue,
                Err(e) => panic!("no signal queued: {e:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_auth_error() {
        let relay = MemoryRelay::new();
        let err = relay.connector().connect("missing").await.unwrap_err();
        assert!(matches!(err, ConnectError::Auth(_)));
    }

    #[tokio::test]
    async fn test_room_fan_out_excludes_sender_and_stamps() {
        let relay = MemoryRelay::new();
        relay.register("a", "alice");
        relay.register("b", "bob");
        let alice = open(&relay, "a").await;
        let mut bob = open(&relay, "b").await;

        bob.outbound
            .send(Frame::Signal(SignalingMessage::join("ex")))
            .unwrap();
        settle().await;
        alice
            .outbound
            .send(Frame::Signal(SignalingMessage::join("ex")))
            .unwrap();
        alice
            .outbound
            .send(Frame::Signal(SignalingMessage::offer(
                "ex",
                SessionDescription::offer("v=0"),
            )))
            .unwrap();
        settle().await;

        assert_eq!(next_signal(&mut bob).kind(), SignalKind::Join);
        let offer = next_signal(&mut bob);
        assert_eq!(offer.kind(), SignalKind::Offer);
        assert_eq!(offer.sender_participant_id.as_deref(), Some("alice"));
        assert_eq!(relay.room_members("ex"), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_targeted_message_reaches_non_member() {
        let relay = MemoryRelay::new();
        relay.register("a", "alice");
        relay.register("b", "bob");
        let alice = open(&relay, "a").await;
        let mut bob = open(&relay, "b").await;

        alice
            .outbound
            .send(Frame::Signal(
                SignalingMessage::offer("ex-2", SessionDescription::offer("v=0"))
                    .to(Some("bob".into())),
            ))
            .unwrap();
        settle().await;

        let offer = next_signal(&mut bob);
        assert_eq!(offer.exchange_id, "ex-2");
        assert!(relay.room_members("ex-2").is_empty());
    }

    #[tokio::test]
    async fn test_routed_history_is_bounded() {
        let relay = MemoryRelay::new();
        relay.register("a", "alice");
        let alice = open(&relay, "a").await;
        alice
            .outbound
            .send(Frame::Signal(SignalingMessage::join("ex")))
            .unwrap();
        for i in 0..ROUTED_HISTORY + 10 {
            alice
                .outbound
                .send(Frame::Signal(SignalingMessage::end("ex", format!("r{i}"))))
                .unwrap();
        }
        while relay.routed_signals().last().map(|m| m.body.clone())
            != Some(SignalBody::End(EndNotice {
                reason: format!("r{}", ROUTED_HISTORY + 9),
            }))
        {
            tokio::task::yield_now().await;
        }
        let routed = relay.routed_signals();
        assert_eq!(routed.len(), ROUTED_HISTORY);
        assert!(routed.iter().all(|m| m.kind() == SignalKind::End));
    }

    #[tokio::test]
    async fn test_held_signals_wait_for_injection() {
        let relay = MemoryRelay::new();
        relay.register("a", "alice");
        relay.register("b", "bob");
        let alice = open(&relay, "a").await;
        let mut bob = open(&relay, "b").await;
        relay.hold_signals(Some(SignalKind::Answer));

        alice
            .outbound
            .send(Frame::Signal(
                SignalingMessage::answer("ex", SessionDescription::answer("v=0"))
                    .to(Some("bob".into())),
            ))
            .unwrap();
        alice
            .outbound
            .send(Frame::Signal(
                SignalingMessage::end("ex", "bye").to(Some("bob".into())),
            ))
            .unwrap();
        settle().await;

        assert_eq!(next_signal(&mut bob).kind(), SignalKind::End);
        let held = relay.take_held();
        assert_eq!(held.len(), 1);
        relay.inject(held[0].clone());
        let answer = next_signal(&mut bob);
        assert_eq!(answer.kind(), SignalKind::Answer);
        assert_eq!(answer.sender_participant_id.as_deref(), Some("alice"));
        assert!(relay.take_held().is_empty());
    }

    #[tokio::test]
    async fn test_drop_connection_clears_membership() {
        let relay = MemoryRelay::new();
        relay.register("a", "alice");
        let mut alice = open(&relay, "a").await;
        alice
            .outbound
            .send(Frame::Signal(SignalingMessage::join("ex")))
            .unwrap();
        settle().await;
        assert_eq!(relay.room_members("ex"), vec!["alice"]);

        assert!(relay.drop_connection("alice"));
        assert!(relay.room_members("ex").is_empty());
        assert!(!relay.is_connected("alice"));
        assert!(alice.inbound.recv().await.is_none());
    }
}
