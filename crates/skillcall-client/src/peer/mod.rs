//! Negotiated peer connection for one call.
//!
//! [`PeerLink`] drives a [`PeerBackend`] through non-trickle offer/answer: the local
//! description is shipped once gathering completes (or the gather timeout fires), with
//! every candidate bundled inside it. Remote candidates that beat the remote description
//! are buffered and applied right after it.

use std::collections::VecDeque;
use std::time::Duration;

use skillcall_common::{CallConfig, IceCandidate, IceServer, SdpKind, SessionDescription};
use skillcall_media::{LocalStream, VideoSender};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{PeerError, Role};

mod backend;
mod loopback;

pub use backend::{
    BackendEvent, PeerBackend, PeerConnectionState, PeerFactory, RemoteStream, RemoteTrack,
};
pub use loopback::{LoopbackBackend, LoopbackNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTimeouts {
    /// Bound on reaching `Connected`, counted from link creation.
    pub negotiation: Duration,
    /// How long to wait for candidates before shipping the description anyway.
    pub gather: Duration,
}

impl PeerTimeouts {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            negotiation: config.negotiation_timeout(),
            gather: config.gather_timeout(),
        }
    }
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The local description is ready to send to the other side.
    NegotiationNeeded(SessionDescription),
    /// A candidate found after the description was shipped.
    LocalCandidate(IceCandidate),
    RemoteStreamAvailable(RemoteStream),
    StateChanged(PeerConnectionState),
}

/// Offer/answer bookkeeping. Each description is set at most once.
#[derive(Debug, Clone, Default)]
pub struct NegotiationState {
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    /// Candidates held until the remote description is applied.
    pub buffered_remote_candidates: Vec<IceCandidate>,
    description_shipped: bool,
    gathered: Vec<IceCandidate>,
}

pub struct PeerLink {
    role: Role,
    backend: Box<dyn PeerBackend>,
    events: mpsc::UnboundedReceiver<BackendEvent>,
    negotiation: NegotiationState,
    state: PeerConnectionState,
    failure: Option<PeerError>,
    pending: VecDeque<PeerEvent>,
    remote_stream: RemoteStream,
    video_sender: Option<VideoSender>,
    timeouts: PeerTimeouts,
    deadline: Option<Instant>,
}

impl PeerLink {
    pub fn create(
        role: Role,
        ice_servers: &[IceServer],
        factory: &dyn PeerFactory,
        timeouts: PeerTimeouts,
    ) -> Result<Self, PeerError> {
        let mut backend = factory.create(role, ice_servers)?;
        let events = backend
            .take_events()
            .ok_or_else(|| PeerError::Backend("backend event stream already taken".into()))?;
        debug!(?role, "peer link created");
        Ok(Self {
            role,
            backend,
            events,
            negotiation: NegotiationState::default(),
            state: PeerConnectionState::New,
            failure: None,
            pending: VecDeque::new(),
            remote_stream: RemoteStream::default(),
            video_sender: None,
            timeouts,
            deadline: Some(Instant::now() + timeouts.negotiation),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn negotiation(&self) -> &NegotiationState {
        &self.negotiation
    }

    /// Why the link failed, once it has.
    pub fn failure(&self) -> Option<&PeerError> {
        self.failure.as_ref()
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn video_sender(&self) -> Option<&VideoSender> {
        self.video_sender.as_ref()
    }

    /// Add the local tracks. Must happen before the local description is created.
    pub fn attach_local_stream(
        &mut self,
        stream: &LocalStream,
    ) -> Result<Option<VideoSender>, PeerError> {
        self.ensure_open()?;
        if self.negotiation.local_description.is_some() {
            return Err(PeerError::InvalidSignalingState(
                "local stream attached after the local description",
            ));
        }
        for track in stream.tracks() {
            if let Some(sender) = self.backend.add_track(track)? {
                self.video_sender = Some(sender);
            }
        }
        Ok(self.video_sender.clone())
    }

    /// Create, apply and gather the offer (initiator) or answer (responder).
    ///
    /// Also queues [`PeerEvent::NegotiationNeeded`] with the returned description.
    pub async fn create_local_description(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.negotiation.local_description.is_some() {
            return Err(PeerError::InvalidSignalingState(
                "local description already created",
            ));
        }

        let mut description = match self.role {
            Role::Initiator => SessionDescription::offer(self.backend.create_offer().await?),
            Role::Responder => {
                if self.negotiation.remote_description.is_none() {
                    return Err(PeerError::InvalidSignalingState(
                        "answer requires the remote offer",
                    ));
                }
                SessionDescription::answer(self.backend.create_answer().await?)
            }
        };
        self.backend
            .set_local_description(description.clone())
            .await?;
        self.negotiation.local_description = Some(description.clone());

        match tokio::time::timeout(self.timeouts.gather, self.gather()).await {
            Ok(result) => result?,
            Err(_) => warn!(
                candidates = self.negotiation.gathered.len(),
                "candidate gathering timed out; sending what we have"
            ),
        }

        description.candidates = std::mem::take(&mut self.negotiation.gathered);
        self.negotiation.local_description = Some(description.clone());
        self.negotiation.description_shipped = true;
        debug!(
            kind = ?description.kind,
            candidates = description.candidates.len(),
            "local description ready"
        );
        self.pending
            .push_back(PeerEvent::NegotiationNeeded(description.clone()));
        Ok(description)
    }

    async fn gather(&mut self) -> Result<(), PeerError> {
        loop {
            match self.events.recv().await {
                Some(BackendEvent::GatheringComplete) => return Ok(()),
                Some(event) => self.handle_backend_event(event),
                None => return Err(PeerError::Backend("backend event stream closed".into())),
            }
        }
    }

    /// Apply the other side's description, then any candidates that arrived ahead of it.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.negotiation.remote_description.is_some() {
            return Err(PeerError::InvalidSignalingState(
                "remote description already applied",
            ));
        }
        let expected = match self.role {
            Role::Initiator => SdpKind::Answer,
            Role::Responder => SdpKind::Offer,
        };
        if description.kind != expected {
            return Err(PeerError::InvalidSignalingState(
                "remote description has the wrong type",
            ));
        }
        if self.role == Role::Initiator && self.negotiation.local_description.is_none() {
            return Err(PeerError::InvalidSignalingState(
                "answer received before the offer was created",
            ));
        }

        let mut bare = description.clone();
        let bundled = std::mem::take(&mut bare.candidates);
        self.backend.set_remote_description(bare).await?;
        self.negotiation.remote_description = Some(description);

        let buffered = std::mem::take(&mut self.negotiation.buffered_remote_candidates);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "flushing buffered remote candidates");
        }
        for candidate in bundled.into_iter().chain(buffered) {
            if let Err(e) = self.backend.add_ice_candidate(candidate).await {
                warn!("remote candidate rejected: {e}");
            }
        }
        Ok(())
    }

    /// Add one remote candidate, buffering it until the remote description is applied.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.state.is_terminal() {
            debug!("ignoring candidate for a finished link");
            return Ok(());
        }
        if self.negotiation.remote_description.is_none() {
            debug!("buffering remote candidate until the remote description arrives");
            self.negotiation.buffered_remote_candidates.push(candidate);
            return Ok(());
        }
        self.backend.add_ice_candidate(candidate).await
    }

    /// Next link event. `None` once the link is closed or failed and nothing is queued.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state.is_terminal() {
                return None;
            }

            let deadline = self.deadline;
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_backend_event(event),
                    None => self.fail(PeerError::ConnectivityFailed("backend went away".into())),
                },
                _ = sleep_until(deadline) => {
                    self.fail(PeerError::NegotiationTimeout(self.timeouts.negotiation));
                }
            }
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::LocalCandidate(candidate) => {
                if self.negotiation.description_shipped {
                    self.pending.push_back(PeerEvent::LocalCandidate(candidate));
                } else {
                    self.negotiation.gathered.push(candidate);
                }
            }
            BackendEvent::GatheringComplete => {}
            BackendEvent::RemoteTrack(track) => {
                debug!(id = %track.id, kind = ?track.kind, "remote track");
                self.remote_stream.tracks.push(track);
                if self.state == PeerConnectionState::Connected {
                    self.pending
                        .push_back(PeerEvent::RemoteStreamAvailable(self.remote_stream.clone()));
                }
            }
            BackendEvent::ConnectionState(state) => self.transition(state),
        }
    }

    fn transition(&mut self, state: PeerConnectionState) {
        if self.state.is_terminal() || self.state == state {
            return;
        }
        match state {
            PeerConnectionState::Failed => {
                self.fail(PeerError::ConnectivityFailed("connectivity checks failed".into()));
                return;
            }
            PeerConnectionState::Connected => {
                self.deadline = None;
                info!("peer connected");
            }
            _ => debug!(?state, "peer state"),
        }
        self.state = state;
        self.pending.push_back(PeerEvent::StateChanged(state));
        if state == PeerConnectionState::Connected && !self.remote_stream.tracks.is_empty() {
            self.pending
                .push_back(PeerEvent::RemoteStreamAvailable(self.remote_stream.clone()));
        }
    }

    fn fail(&mut self, err: PeerError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("peer link failed: {err}");
        self.state = PeerConnectionState::Failed;
        self.failure = Some(err);
        self.deadline = None;
        self.pending
            .push_back(PeerEvent::StateChanged(PeerConnectionState::Failed));
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.is_terminal() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Release the native connection. Idempotent.
    pub fn close(&mut self) {
        if self.state == PeerConnectionState::Closed {
            return;
        }
        self.backend.close();
        self.state = PeerConnectionState::Closed;
        self.deadline = None;
        self.pending.clear();
        debug!("peer link closed");
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
