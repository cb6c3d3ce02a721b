//! Call lifecycle state machine.
//!
//! A [`CallController`] runs as one task that owns the [`MediaManager`], the [`PeerLink`]
//! and the [`CallSession`] for a single call. It is driven by commands from its
//! [`CallHandle`], by transport events, by peer and media events and by a duration tick.
//! Nothing else writes the call state. Observers read it through the `watch` snapshot.

use std::sync::Arc;

use skillcall_common::{
    CallConfig, IceCandidate, SdpKind, SessionDescription, SignalBody, SignalingMessage,
};
use skillcall_media::{CaptureBackend, MediaConstraints, MediaEvent, MediaManager, MediaTrackState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::peer::{
    PeerConnectionState, PeerEvent, PeerFactory, PeerLink, PeerTimeouts, RemoteStream,
};
use crate::registry::{CallClaim, CallRegistry, OfferClaim};
use crate::transport::{SignalingTransport, TransportEvent};
use crate::types::{
    CallSession, CallSnapshot, CallState, IncomingCall, IncomingCallNotifier, Role,
    TerminationReason,
};
use crate::{CallError, PeerError, TransportError};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    StartCall {
        exchange_id: String,
        callee: Option<String>,
        reply: Reply<Result<(), CallError>>,
    },
    AcceptIncoming {
        exchange_id: String,
        reply: Reply<Result<(), CallError>>,
    },
    EndCall {
        reason: TerminationReason,
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<Result<MediaTrackState, CallError>>,
    },
    ToggleCamera {
        reply: Reply<Result<MediaTrackState, CallError>>,
    },
    ScreenShare {
        /// `None` flips the current setting.
        enabled: Option<bool>,
        reply: Reply<Result<MediaTrackState, CallError>>,
    },
}

/// An offer received while idle.
struct PendingOffer {
    exchange_id: String,
    caller: Option<String>,
    description: SessionDescription,
    candidates: Vec<IceCandidate>,
    _claim: OfferClaim,
}

pub struct CallController {
    config: CallConfig,
    transport: SignalingTransport,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    registry: CallRegistry,
    peers: Arc<dyn PeerFactory>,
    notifier: Option<Arc<dyn IncomingCallNotifier>>,
    constraints: MediaConstraints,
    media: MediaManager,
    state: CallState,
    session: Option<CallSession>,
    claim: Option<CallClaim>,
    peer: Option<PeerLink>,
    remote_stream: Option<RemoteStream>,
    pending_offer: Option<PendingOffer>,
    setup_waiter: Option<Reply<Result<(), CallError>>>,
    snapshot: watch::Sender<CallSnapshot>,
}

impl CallController {
    /// Build a controller. It subscribes to `transport` right away, so nothing sent after
    /// this returns is missed.
    ///
    /// Controllers on the same transport share its [`CallRegistry`]: at most one of them holds
    /// a live call or an unanswered offer per exchange.
    pub fn new(
        config: CallConfig,
        transport: SignalingTransport,
        capture: Arc<dyn CaptureBackend>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let transport_events = transport.subscribe();
        let registry = transport.registry();
        let media = MediaManager::new(capture, config.media_acquire_timeout());
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Self {
            config,
            transport,
            transport_events,
            registry,
            peers,
            notifier: None,
            constraints: MediaConstraints::default(),
            media,
            state: CallState::Idle,
            session: None,
            claim: None,
            peer: None,
            remote_stream: None,
            pending_offer: None,
            setup_waiter: None,
            snapshot,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn IncomingCallNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn spawn(self) -> CallHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            commands,
            snapshot: self.snapshot.subscribe(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.config.duration_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                event = next_peer_event(&mut self.peer) => self.handle_peer_event(event).await,
                _ = self.media.display_revoked() => {
                    let event = self.media.handle_display_revoked().await;
                    self.handle_media_event(event);
                }
                _ = setup_abandoned(&mut self.setup_waiter) => {
                    info!(exchange = %self.exchange_label(), "call setup abandoned by caller");
                    self.setup_waiter = None;
                    self.terminate(TerminationReason::Cancelled);
                }
                _ = tick.tick(), if self.state == CallState::Active => self.publish(),
            }
        }

        if self.state.is_live() {
            self.terminate(TerminationReason::LocalHangup);
        }
        debug!("call controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                exchange_id,
                callee,
                reply,
            } => self.start_call(exchange_id, callee, reply).await,
            Command::AcceptIncoming { exchange_id, reply } => {
                self.accept_incoming(exchange_id, reply).await
            }
            Command::EndCall { reason, reply } => {
                if self.state.is_live() {
                    self.terminate(reason);
                } else if self.state == CallState::Idle && self.pending_offer.take().is_some() {
                    info!("incoming call dismissed");
                } else {
                    debug!(state = ?self.state, "end_call with no live call");
                }
                let _ = reply.send(());
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(self.toggle_camera());
            }
            Command::ScreenShare { enabled, reply } => {
                let result = self.screen_share(enabled).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Claim the exchange and open a session. Only valid while idle.
    fn begin(&mut self, exchange_id: &str, role: Role) -> Result<(), CallError> {
        match self.state {
            CallState::Idle => {}
            state if state.is_terminal() => return Err(CallError::ControllerFinished),
            _ => {
                return Err(CallError::CallAlreadyInProgress {
                    exchange_id: self
                        .session
                        .as_ref()
                        .map_or_else(|| exchange_id.to_string(), |s| s.exchange_id.clone()),
                })
            }
        }
        if exchange_id.trim().is_empty() {
            return Err(CallError::InvalidExchange);
        }
        let local = self
            .transport
            .participant_id()
            .ok_or(CallError::Transport(TransportError::NotConnected))?;
        self.claim = Some(self.registry.claim(&local, exchange_id)?);
        self.session = Some(CallSession::new(exchange_id.to_string(), local, role));
        Ok(())
    }

    async fn start_call(
        &mut self,
        exchange_id: String,
        callee: Option<String>,
        reply: Reply<Result<(), CallError>>,
    ) {
        if let Err(err) = self.begin(&exchange_id, Role::Initiator) {
            warn!(exchange = %exchange_id, "start_call rejected: {err}");
            let _ = reply.send(Err(err));
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.remote_participant_id = callee;
        }
        self.setup_waiter = Some(reply);
        self.transition(CallState::Initiating);

        if let Err(err) = self.setup_initiator().await {
            self.fail_call(err);
        }
    }

    async fn setup_initiator(&mut self) -> Result<(), CallError> {
        let exchange_id = self.exchange_label();
        self.transport.join_room(&exchange_id)?;

        let stream = self.media.acquire(self.constraints).await?;
        self.publish();

        let mut peer = PeerLink::create(
            Role::Initiator,
            &self.config.ice_servers,
            self.peers.as_ref(),
            PeerTimeouts::from_config(&self.config),
        )?;
        if let Some(sender) = peer.attach_local_stream(&stream)? {
            self.media.bind_video_sender(sender);
        }
        let peer = self.peer.insert(peer);
        peer.create_local_description().await?;
        Ok(())
    }

    async fn accept_incoming(&mut self, exchange_id: String, reply: Reply<Result<(), CallError>>) {
        let pending = match self.pending_offer.take() {
            Some(pending) if pending.exchange_id == exchange_id => pending,
            other => {
                self.pending_offer = other;
                let _ = reply.send(Err(CallError::NoPendingOffer(exchange_id)));
                return;
            }
        };
        if let Err(err) = self.begin(&exchange_id, Role::Responder) {
            warn!(exchange = %exchange_id, "accept_incoming rejected: {err}");
            self.pending_offer = Some(pending);
            let _ = reply.send(Err(err));
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.remote_participant_id = pending.caller.clone();
        }
        self.setup_waiter = Some(reply);
        self.transition(CallState::Negotiating);

        if let Err(err) = self.setup_responder(pending).await {
            self.fail_call(err);
        }
    }

    async fn setup_responder(&mut self, pending: PendingOffer) -> Result<(), CallError> {
        // The caller may have reached us directly; the room is joined only now.
        self.transport.join_room(&pending.exchange_id)?;

        let stream = self.media.acquire(self.constraints).await?;
        self.publish();

        let mut peer = PeerLink::create(
            Role::Responder,
            &self.config.ice_servers,
            self.peers.as_ref(),
            PeerTimeouts::from_config(&self.config),
        )?;
        if let Some(sender) = peer.attach_local_stream(&stream)? {
            self.media.bind_video_sender(sender);
        }
        let peer = self.peer.insert(peer);
        for candidate in pending.candidates {
            peer.add_remote_candidate(candidate).await?;
        }
        peer.apply_remote_description(pending.description).await?;
        peer.create_local_description().await?;
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(message) => self.handle_signal(message).await,
            TransportEvent::Connected { .. } => {
                debug!(exchange = %self.exchange_label(), "signaling attached");
            }
            TransportEvent::Disconnected => {
                if self.state.is_live() {
                    warn!(exchange = %self.exchange_label(), "signaling lost; call continues");
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, ?delay, "signaling reconnecting");
            }
            TransportEvent::ReconnectFailed { attempts } => {
                if self.state.is_live() {
                    error!(attempts, exchange = %self.exchange_label(), "signaling gone for good");
                    self.fail_call(CallError::TransportReconnectExhausted);
                }
            }
            TransportEvent::AuthFailed { reason } => {
                if self.state.is_live() {
                    error!(%reason, "signaling credential rejected mid-call");
                    self.fail_call(CallError::TransportAuthFailed);
                }
            }
            TransportEvent::Chat(_) | TransportEvent::Presence(_) => {}
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            self.handle_idle_signal(message);
            return;
        };
        if message.exchange_id != session.exchange_id {
            trace!(exchange = %message.exchange_id, "signal for another exchange ignored");
            return;
        }
        if message.sender_participant_id.as_deref() == Some(session.local_participant_id.as_str()) {
            return;
        }
        let mut resolved = false;
        if session.remote_participant_id.is_none() {
            if let Some(sender) = &message.sender_participant_id {
                debug!(remote = %sender, "remote participant resolved");
                session.remote_participant_id = Some(sender.clone());
                resolved = true;
            }
        }
        if resolved {
            self.publish();
        }

        match message.body {
            SignalBody::Join => debug!("remote participant joined the room"),
            SignalBody::Leave => info!("remote participant left the room"),
            SignalBody::Offer(_) => warn!("unexpected offer during a call ignored"),
            SignalBody::Answer(description) => {
                let Some(peer) = self.peer.as_mut() else {
                    warn!("answer arrived before the peer link exists");
                    return;
                };
                if peer.role() != Role::Initiator {
                    warn!("answer received by the responder ignored");
                    return;
                }
                match peer.apply_remote_description(description).await {
                    Ok(()) => debug!("remote answer applied"),
                    Err(PeerError::InvalidSignalingState(what)) => warn!("answer ignored: {what}"),
                    Err(err) => self.fail_call(err.into()),
                }
            }
            SignalBody::IceCandidate(candidate) => {
                if let Some(peer) = self.peer.as_mut() {
                    if let Err(e) = peer.add_remote_candidate(candidate).await {
                        warn!("remote candidate rejected: {e}");
                    }
                }
            }
            SignalBody::End(notice) => {
                info!(reason = %notice.reason, "remote ended the call");
                self.terminate(TerminationReason::RemoteHangup);
            }
        }
    }

    fn handle_idle_signal(&mut self, message: SignalingMessage) {
        if self.state != CallState::Idle {
            trace!(kind = %message.kind(), "signal after the call finished ignored");
            return;
        }
        let pending_here = self
            .pending_offer
            .as_ref()
            .is_some_and(|p| p.exchange_id == message.exchange_id);

        match message.body {
            SignalBody::Offer(description) => {
                if pending_here {
                    debug!(exchange = %message.exchange_id, "repeated offer replaces the stored one");
                    self.pending_offer = None;
                }
                let Some(local) = self.transport.participant_id() else {
                    return;
                };
                let Some(claim) = self.registry.claim_offer(&local, &message.exchange_id) else {
                    trace!(exchange = %message.exchange_id, "offer handled by another controller");
                    return;
                };
                let call = IncomingCall {
                    exchange_id: message.exchange_id.clone(),
                    caller_participant_id: message.sender_participant_id.clone(),
                };
                info!(exchange = %call.exchange_id, caller = ?call.caller_participant_id, "incoming call");
                self.pending_offer = Some(PendingOffer {
                    exchange_id: message.exchange_id,
                    caller: message.sender_participant_id,
                    description,
                    candidates: Vec::new(),
                    _claim: claim,
                });
                if let Some(notifier) = &self.notifier {
                    notifier.incoming_call(call);
                }
            }
            SignalBody::IceCandidate(candidate) if pending_here => {
                if let Some(pending) = self.pending_offer.as_mut() {
                    pending.candidates.push(candidate);
                }
            }
            SignalBody::End(_) if pending_here => {
                info!(exchange = %message.exchange_id, "caller gave up before we answered");
                self.pending_offer = None;
            }
            body => trace!(kind = %body.kind(), "signal ignored while idle"),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded(description) => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                let exchange_id = session.exchange_id.clone();
                let target = session.remote_participant_id.clone();
                let kind = description.kind;
                let message = match kind {
                    SdpKind::Offer => SignalingMessage::offer(exchange_id, description),
                    SdpKind::Answer => SignalingMessage::answer(exchange_id, description),
                }
                .to(target);
                if let Err(err) = self.transport.send(message) {
                    self.fail_call(err.into());
                    return;
                }
                info!(exchange = %self.exchange_label(), ?kind, "local description sent");
                if self.state == CallState::Initiating {
                    self.transition(CallState::Negotiating);
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                let message =
                    SignalingMessage::ice_candidate(session.exchange_id.clone(), candidate)
                        .to(session.remote_participant_id.clone());
                if let Err(e) = self.transport.send(message) {
                    debug!("late candidate not sent: {e}");
                }
            }
            PeerEvent::RemoteStreamAvailable(stream) => {
                debug!(tracks = stream.tracks.len(), "remote stream available");
                self.remote_stream = Some(stream);
                self.publish();
            }
            PeerEvent::StateChanged(state) => self.handle_peer_state(state),
        }
    }

    fn handle_peer_state(&mut self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                if self.state != CallState::Negotiating {
                    debug!(call_state = ?self.state, "peer connected outside negotiation");
                    return;
                }
                self.transition(CallState::Connected);
                if let Some(session) = self.session.as_mut() {
                    session.active_since = Some(Instant::now());
                }
                self.transition(CallState::Active);
                if let Some(waiter) = self.setup_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            PeerConnectionState::Failed => {
                let err = self
                    .peer
                    .as_ref()
                    .and_then(|peer| peer.failure().cloned())
                    .unwrap_or_else(|| PeerError::ConnectivityFailed("peer link failed".into()));
                self.fail_call(err.into());
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                if matches!(self.state, CallState::Connected | CallState::Active) {
                    self.fail_call(CallError::ConnectivityFailed(format!("peer link {state:?}")));
                }
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {
                debug!(?state, "peer state");
            }
        }
    }

    fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::ScreenShareRevoked {
                state,
                restore_error,
            } => {
                info!(?state, "screen share ended by the system");
                if let Some(e) = restore_error {
                    warn!("camera not restored after screen share: {e}");
                }
                self.publish();
            }
        }
    }

    fn require_active(&self, operation: &'static str) -> Result<(), CallError> {
        if self.state == CallState::Active {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn toggle_mute(&mut self) -> Result<MediaTrackState, CallError> {
        self.require_active("toggle_mute")?;
        let enabled = !self.media.state().audio_enabled;
        let state = self.media.set_audio_enabled(enabled)?;
        info!(muted = !enabled, "microphone toggled");
        self.publish();
        Ok(state)
    }

    fn toggle_camera(&mut self) -> Result<MediaTrackState, CallError> {
        self.require_active("toggle_camera")?;
        let enabled = !self.media.state().video_enabled;
        let state = self.media.set_video_enabled(enabled)?;
        info!(video = enabled, "camera toggled");
        self.publish();
        Ok(state)
    }

    async fn screen_share(&mut self, enabled: Option<bool>) -> Result<MediaTrackState, CallError> {
        self.require_active("screen_share")?;
        let share = enabled.unwrap_or(!self.media.state().screen_sharing);
        let result = if share {
            self.media.start_screen_share().await
        } else {
            self.media.stop_screen_share().await
        };
        // A failed restore still changes media state.
        self.publish();
        Ok(result?)
    }

    /// End the call because of `err`, answering a pending setup with the error itself.
    fn fail_call(&mut self, err: CallError) {
        if !self.state.is_live() {
            debug!("error after the call ended: {err}");
            return;
        }
        let waiter = self.setup_waiter.take();
        warn!(exchange = %self.exchange_label(), "call failed: {err}");
        self.terminate(err.termination_reason());
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(err));
        }
    }

    /// Move through `Ending` to the terminal state for `reason`. Runs cleanup once.
    fn terminate(&mut self, reason: TerminationReason) {
        if !self.state.is_live() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.termination = Some(reason);
            session.ended_at = Some(Instant::now());
        }
        self.transition(CallState::Ending);
        self.cleanup(reason);

        let terminal = if reason.is_failure() {
            CallState::Failed
        } else {
            CallState::Ended
        };
        self.transition(terminal);
        info!(exchange = %self.exchange_label(), %reason, "{}", reason.describe());

        if let Some(waiter) = self.setup_waiter.take() {
            let _ = waiter.send(Err(CallError::from(reason)));
        }
        self.session = None;
    }

    fn cleanup(&mut self, reason: TerminationReason) {
        self.media.release();
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        self.remote_stream = None;

        if let Some(session) = self.session.as_ref() {
            if reason != TerminationReason::RemoteHangup {
                let end = SignalingMessage::end(session.exchange_id.clone(), reason.as_str())
                    .to(session.remote_participant_id.clone());
                if let Err(e) = self.transport.send(end) {
                    debug!("end notice not sent: {e}");
                }
            }
            if let Err(e) = self.transport.leave_room(&session.exchange_id) {
                debug!("relay not told about leaving: {e}");
            }
        }
        self.claim = None;
    }

    fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "call state transition rejected");
            return false;
        }
        info!(exchange = %self.exchange_label(), from = ?self.state, to = ?next, "call state changed");
        self.state = next;
        if let Some(session) = self.session.as_mut() {
            session.state = next;
        }
        self.publish();
        true
    }

    fn exchange_label(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.exchange_id.clone())
            .unwrap_or_default()
    }

    fn publish(&self) {
        let media = self.media.state();
        let local_stream = self.media.is_acquired().then(|| self.media.local_stream());
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = self.state;
            snapshot.media = media;
            snapshot.local_stream = local_stream;
            snapshot.remote_stream = self.remote_stream.clone();
            if let Some(session) = &self.session {
                snapshot.exchange_id = Some(session.exchange_id.clone());
                snapshot.role = Some(session.role);
                snapshot.remote_participant_id = session.remote_participant_id.clone();
                snapshot.elapsed = session.elapsed();
                snapshot.termination = session.termination;
            }
        });
    }
}

async fn next_peer_event(peer: &mut Option<PeerLink>) -> PeerEvent {
    match peer {
        Some(peer) => match peer.next_event().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn setup_abandoned(waiter: &mut Option<Reply<Result<(), CallError>>>) {
    match waiter {
        Some(waiter) => waiter.closed().await,
        None => std::future::pending().await,
    }
}

/// Cheap, clonable front end to a running [`CallController`].
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::ControllerGone)?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    /// Call into `exchange_id`, offering to everyone in the room.
    ///
    /// Resolves once the call is `Active`. Dropping the future earlier cancels the call.
    pub async fn start_call(&self, exchange_id: &str) -> Result<(), CallError> {
        self.start_call_to(exchange_id, None).await
    }

    /// Like [`CallHandle::start_call`], addressing the offer to one participant so it
    /// reaches them before they join the room.
    pub async fn start_call_to(
        &self,
        exchange_id: &str,
        callee: Option<&str>,
    ) -> Result<(), CallError> {
        self.request(|reply| Command::StartCall {
            exchange_id: exchange_id.to_string(),
            callee: callee.map(str::to_string),
            reply,
        })
        .await?
    }

    /// Answer the offer pending for `exchange_id`. Resolves once the call is `Active`.
    pub async fn accept_incoming(&self, exchange_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptIncoming {
            exchange_id: exchange_id.to_string(),
            reply,
        })
        .await?
    }

    /// Hang up. A no-op when no call is live; dismisses a pending incoming call.
    pub async fn end_call(&self, reason: TerminationReason) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reason, reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.end_call(TerminationReason::LocalHangup).await
    }

    pub async fn toggle_mute(&self) -> Result<MediaTrackState, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    pub async fn toggle_camera(&self) -> Result<MediaTrackState, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    pub async fn toggle_screen_share(&self) -> Result<MediaTrackState, CallError> {
        self.request(|reply| Command::ScreenShare {
            enabled: None,
            reply,
        })
        .await?
    }

    pub async fn set_screen_share(&self, enabled: bool) -> Result<MediaTrackState, CallError> {
        self.request(|reply| Command::ScreenShare {
            enabled: Some(enabled),
            reply,
        })
        .await?
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, predicate: F) -> Result<CallSnapshot, CallError>
    where
        F: Fn(CallState) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot.state))
            .await
            .map_err(|_| CallError::ControllerGone)?;
        Ok(snapshot.clone())
    }
}
