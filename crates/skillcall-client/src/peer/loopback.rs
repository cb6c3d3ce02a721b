use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use skillcall_common::{IceCandidate, IceServer, SessionDescription};
use skillcall_media::{MediaTrack, TrackKind, VideoSender};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{BackendEvent, PeerBackend, PeerConnectionState, PeerFactory, RemoteTrack};
use crate::{PeerError, Role};

struct Endpoint {
    events: mpsc::UnboundedSender<BackendEvent>,
    local_set: bool,
    remote_ufrag: Option<String>,
    remote_candidates: HashSet<String>,
    tracks: Vec<RemoteTrack>,
    state: PeerConnectionState,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
    next_id: u64,
    partitioned: bool,
    stall_gathering: bool,
    applied: Vec<String>,
}

impl NetworkState {
    fn set_state(&mut self, ufrag: &str, state: PeerConnectionState) {
        let Some(endpoint) = self.endpoints.get_mut(ufrag) else {
            return;
        };
        if endpoint.state == state || endpoint.state.is_terminal() {
            return;
        }
        trace!(ufrag, ?state, "loopback endpoint state");
        endpoint.state = state;
        let _ = endpoint.events.send(BackendEvent::ConnectionState(state));
    }

    /// The peer this endpoint can reach, once it has both descriptions and the peer's candidate.
    fn reachable_peer(&self, ufrag: &str) -> Option<String> {
        let endpoint = self.endpoints.get(ufrag)?;
        let peer = endpoint.remote_ufrag.as_ref()?;
        (endpoint.local_set && endpoint.remote_candidates.contains(peer)).then(|| peer.clone())
    }

    fn try_connect(&mut self, ufrag: &str) {
        let Some(endpoint) = self.endpoints.get(ufrag) else {
            return;
        };
        if endpoint.state.is_terminal() {
            return;
        }
        if endpoint.local_set
            && endpoint.remote_ufrag.is_some()
            && endpoint.state == PeerConnectionState::New
        {
            self.set_state(ufrag, PeerConnectionState::Connecting);
        }

        if self.partitioned {
            return;
        }
        let Some(peer) = self.reachable_peer(ufrag) else {
            return;
        };
        if self.reachable_peer(&peer).as_deref() != Some(ufrag) {
            return;
        }

        for (me, other) in [(ufrag.to_string(), peer.clone()), (peer, ufrag.to_string())] {
            let Some(endpoint) = self.endpoints.get(&me) else {
                continue;
            };
            if endpoint.state != PeerConnectionState::Connecting {
                continue;
            }
            let tracks = self
                .endpoints
                .get(&other)
                .map(|e| e.tracks.clone())
                .unwrap_or_default();
            for track in tracks {
                let _ = endpoint.events.send(BackendEvent::RemoteTrack(track));
            }
            self.set_state(&me, PeerConnectionState::Connected);
        }
    }
}

/// In-process stand-in for the network between peers.
///
/// Two endpoints connect once each has set its own description and the other's, and
/// holds a candidate carrying the other's ICE username fragment. Nothing is sent on the
/// wire; the descriptions just have to reach the other side through signaling.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While partitioned no pair can connect, and pairs already up fail.
    pub fn set_partitioned(&self, partitioned: bool) {
        let mut state = self.lock();
        state.partitioned = partitioned;
        if !partitioned {
            return;
        }
        let up: Vec<String> = state
            .endpoints
            .iter()
            .filter(|(_, e)| e.state == PeerConnectionState::Connected)
            .map(|(ufrag, _)| ufrag.clone())
            .collect();
        for ufrag in up {
            state.set_state(&ufrag, PeerConnectionState::Disconnected);
            state.set_state(&ufrag, PeerConnectionState::Failed);
        }
    }

    /// Endpoints never report candidates, so gathering never completes.
    pub fn set_stall_gathering(&self, stall: bool) {
        self.lock().stall_gathering = stall;
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Every remote candidate line handed to an endpoint, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .endpoints
            .values()
            .filter(|e| e.state == PeerConnectionState::Connected)
            .count()
    }
}

impl PeerFactory for LoopbackNetwork {
    fn create(
        &self,
        role: Role,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn PeerBackend>, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let index = state.next_id;
        let ufrag = format!("lb{index:04}");
        state.endpoints.insert(
            ufrag.clone(),
            Endpoint {
                events: tx,
                local_set: false,
                remote_ufrag: None,
                remote_candidates: HashSet::new(),
                tracks: Vec::new(),
                state: PeerConnectionState::New,
            },
        );
        debug!(%ufrag, ?role, ice_servers = ice_servers.len(), "loopback endpoint created");

        Ok(Box::new(LoopbackBackend {
            network: self.clone(),
            ufrag,
            index,
            role,
            events: Some(rx),
            remote_set: false,
            closed: false,
        }))
    }
}

pub struct LoopbackBackend {
    network: LoopbackNetwork,
    ufrag: String,
    index: u64,
    role: Role,
    events: Option<mpsc::UnboundedReceiver<BackendEvent>>,
    remote_set: bool,
    closed: bool,
}

impl LoopbackBackend {
    fn render_sdp(&self) -> String {
        let tracks = self
            .network
            .lock()
            .endpoints
            .get(&self.ufrag)
            .map(|e| e.tracks.clone())
            .unwrap_or_default();
        let setup = match self.role {
            Role::Initiator => "actpass",
            Role::Responder => "active",
        };

        let mut sdp = String::new();
        let _ = writeln!(sdp, "v=0");
        let _ = writeln!(sdp, "o=- {} 2 IN IP4 127.0.0.1", self.index);
        let _ = writeln!(sdp, "s=-");
        let _ = writeln!(sdp, "a=ice-ufrag:{}", self.ufrag);
        let _ = writeln!(sdp, "a=setup:{setup}");
        for track in tracks {
            match track.kind {
                TrackKind::Audio => {
                    let _ = writeln!(sdp, "m=audio 9 UDP/TLS/RTP/SAVPF 111");
                }
                TrackKind::Video => {
                    let _ = writeln!(sdp, "m=video 9 UDP/TLS/RTP/SAVPF 96");
                }
            }
            let _ = writeln!(sdp, "a=msid:- {}", track.id);
        }
        sdp
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host ufrag {}",
                self.index,
                40000 + self.index,
                self.ufrag
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

fn sdp_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
}

fn candidate_ufrag(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    parts.find(|p| *p == "ufrag")?;
    parts.next()
}

impl PeerBackend for LoopbackBackend {
    fn create_offer(&mut self) -> BoxFuture<'_, Result<String, PeerError>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(self.render_sdp())
        })
    }

    fn create_answer(&mut self) -> BoxFuture<'_, Result<String, PeerError>> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.remote_set {
                return Err(PeerError::InvalidSignalingState(
                    "cannot answer without a remote offer",
                ));
            }
            Ok(self.render_sdp())
        })
    }

    fn set_local_description(
        &mut self,
        _description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let candidate = self.candidate();
            let mut state = self.network.lock();
            let stall = state.stall_gathering;
            if let Some(endpoint) = state.endpoints.get_mut(&self.ufrag) {
                endpoint.local_set = true;
                if !stall {
                    let _ = endpoint.events.send(BackendEvent::LocalCandidate(candidate));
                    let _ = endpoint.events.send(BackendEvent::GatheringComplete);
                }
            }
            state.try_connect(&self.ufrag);
            Ok(())
        })
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let remote = sdp_ufrag(&description.sdp)
                .ok_or_else(|| PeerError::Backend("remote description has no ice-ufrag".into()))?
                .to_string();
            if remote == self.ufrag {
                return Err(PeerError::Backend("remote description is our own".into()));
            }
            let mut state = self.network.lock();
            if let Some(endpoint) = state.endpoints.get_mut(&self.ufrag) {
                endpoint.remote_ufrag = Some(remote);
            }
            self.remote_set = true;
            state.try_connect(&self.ufrag);
            Ok(())
        })
    }

    fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.remote_set {
                return Err(PeerError::InvalidSignalingState(
                    "candidate added before remote description",
                ));
            }
            let ufrag = candidate_ufrag(&candidate.candidate)
                .ok_or_else(|| PeerError::Backend("malformed candidate".into()))?
                .to_string();
            let mut state = self.network.lock();
            state.applied.push(candidate.candidate);
            if let Some(endpoint) = state.endpoints.get_mut(&self.ufrag) {
                endpoint.remote_candidates.insert(ufrag);
            }
            state.try_connect(&self.ufrag);
            Ok(())
        })
    }

    fn add_track(&mut self, track: &MediaTrack) -> Result<Option<VideoSender>, PeerError> {
        self.ensure_open()?;
        let mut state = self.network.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.ufrag)
            .ok_or(PeerError::Closed)?;
        if endpoint.local_set {
            return Err(PeerError::InvalidSignalingState(
                "tracks must be added before the local description",
            ));
        }
        endpoint.tracks.push(RemoteTrack {
            id: track.id().to_string(),
            kind: track.kind(),
        });
        Ok(match track.kind() {
            TrackKind::Video => Some(VideoSender::new(Some(track.clone()))),
            TrackKind::Audio => None,
        })
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.network
            .lock()
            .set_state(&self.ufrag, PeerConnectionState::Closed);
    }
}

impl Drop for LoopbackBackend {
    fn drop(&mut self) {
        self.network.lock().endpoints.remove(&self.ufrag);
    }
}
