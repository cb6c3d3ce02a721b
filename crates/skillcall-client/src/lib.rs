//! SkillCall call client.
//!
//! One [`CallController`] per call coordinates three collaborators:
//!
//! - [`SignalingTransport`]: the shared, authenticated relay connection that carries
//!   room-scoped [`SignalingMessage`](skillcall_common::SignalingMessage)s.
//! - [`MediaManager`](skillcall_media::MediaManager): the local camera, microphone and
//!   display capture.
//! - [`PeerLink`]: the negotiated peer connection.
//!
//! Applications drive a call through its [`CallHandle`] and observe it through the
//! [`CallSnapshot`] watch channel.

#![forbid(unsafe_code)]

mod backoff;
mod controller;
mod error;
pub mod peer;
mod registry;
pub mod transport;
mod types;

pub use backoff::ReconnectPolicy;
pub use controller::{CallController, CallHandle};
pub use error::{CallError, PeerError, TransportError};
pub use peer::{LoopbackNetwork, PeerEvent, PeerLink, PeerTimeouts, RemoteStream};
pub use registry::{CallClaim, CallRegistry, OfferClaim};
pub use transport::{
    ConnectError, Connector, MemoryRelay, SignalingTransport, TransportEvent, TransportStatus,
    WsConnector,
};
pub use types::{
    CallSession, CallSnapshot, CallState, IncomingCall, IncomingCallNotifier, Role,
    TerminationReason,
};
