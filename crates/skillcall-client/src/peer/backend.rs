use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use skillcall_common::{IceCandidate, IceServer, SessionDescription};
use skillcall_media::{MediaTrack, TrackKind, VideoSender};
use tokio::sync::mpsc;

use crate::{PeerError, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

/// A track the other side is sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// What a backend reports after it is asked to do something.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    ConnectionState(PeerConnectionState),
    RemoteTrack(RemoteTrack),
}

/// One native peer connection.
///
/// Gathering starts when the local description is set. `add_ice_candidate` may reject
/// candidates that arrive before the remote description; [`super::PeerLink`] never sends
/// them early.
pub trait PeerBackend: Send + 'static {
    fn create_offer(&mut self) -> BoxFuture<'_, Result<String, PeerError>>;

    fn create_answer(&mut self) -> BoxFuture<'_, Result<String, PeerError>>;

    fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>>;

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>>;

    fn add_ice_candidate(&mut self, candidate: IceCandidate)
        -> BoxFuture<'_, Result<(), PeerError>>;

    /// Attach an outgoing track. Video tracks get a sender whose track can be swapped later.
    fn add_track(&mut self, track: &MediaTrack) -> Result<Option<VideoSender>, PeerError>;

    /// Event stream; can be taken once.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>>;

    fn close(&mut self);
}

/// Builds backends for new calls.
pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        role: Role,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn PeerBackend>, PeerError>;
}
