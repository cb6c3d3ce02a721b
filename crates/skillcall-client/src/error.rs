use std::time::Duration;

use skillcall_media::{MediaError, TrackSource};
use thiserror::Error;

use crate::types::{CallState, TerminationReason};

/// Signaling transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// `send`/`join_room` before `connect` resolved, or while re-attaching.
    #[error("signaling transport is not connected")]
    NotConnected,

    #[error("room {0} has not been joined")]
    RoomNotJoined(String),

    /// The relay rejected the bearer credential. Never retried.
    #[error("signaling authentication failed: {0}")]
    AuthFailed(String),

    #[error("signaling reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("could not reach signaling relay: {0}")]
    Connect(String),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
}

/// Negotiated-connection failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("no connectivity check succeeded within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("peer connectivity failed: {0}")]
    ConnectivityFailed(String),

    /// Operation not valid for the current offer/answer state.
    #[error("invalid signaling state: {0}")]
    InvalidSignalingState(&'static str),

    #[error("peer backend error: {0}")]
    Backend(String),

    #[error("peer link is closed")]
    Closed,
}

/// Errors surfaced by [`crate::CallHandle`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// A non-terminal call already exists for this exchange (or this controller is busy).
    #[error("a call for exchange {exchange_id} is already in progress")]
    CallAlreadyInProgress { exchange_id: String },

    #[error("permission denied for {0}")]
    PermissionDenied(TrackSource),

    #[error("{0} is not available")]
    DeviceUnavailable(TrackSource),

    #[error("local media error: {0}")]
    Media(MediaError),

    #[error("negotiation timed out")]
    NegotiationTimeout,

    #[error("connectivity failed: {0}")]
    ConnectivityFailed(String),

    #[error("signaling authentication failed")]
    TransportAuthFailed,

    #[error("signaling reconnect budget exhausted")]
    TransportReconnectExhausted,

    #[error("signaling error: {0}")]
    Transport(TransportError),

    #[error("negotiation error: {0}")]
    Peer(PeerError),

    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("exchange id must not be empty")]
    InvalidExchange,

    #[error("no incoming offer pending for exchange {0}")]
    NoPendingOffer(String),

    /// This controller already finished a call; create a new one.
    #[error("call controller already finished a call")]
    ControllerFinished,

    /// The call ended before setup completed.
    #[error("call ended: {0}")]
    Ended(TerminationReason),

    #[error("call controller has stopped")]
    ControllerGone,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(source) => CallError::PermissionDenied(source),
            MediaError::DeviceUnavailable(source) => CallError::DeviceUnavailable(source),
            other => CallError::Media(other),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::NegotiationTimeout(_) => CallError::NegotiationTimeout,
            PeerError::ConnectivityFailed(reason) => CallError::ConnectivityFailed(reason),
            other => CallError::Peer(other),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthFailed(_) => CallError::TransportAuthFailed,
            TransportError::ReconnectExhausted { .. } => CallError::TransportReconnectExhausted,
            other => CallError::Transport(other),
        }
    }
}

impl From<TerminationReason> for CallError {
    fn from(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::NegotiationTimeout => CallError::NegotiationTimeout,
            TerminationReason::TransportAuthFailed => CallError::TransportAuthFailed,
            TerminationReason::TransportReconnectExhausted => {
                CallError::TransportReconnectExhausted
            }
            other => CallError::Ended(other),
        }
    }
}

impl CallError {
    /// Termination reason recorded when this error ends a call.
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            CallError::PermissionDenied(_) => TerminationReason::PermissionDenied,
            CallError::DeviceUnavailable(_) => TerminationReason::DeviceUnavailable,
            CallError::Media(MediaError::AcquireTimeout(_)) => {
                TerminationReason::MediaAcquireTimeout
            }
            CallError::Media(_) => TerminationReason::MediaFailure,
            CallError::NegotiationTimeout => TerminationReason::NegotiationTimeout,
            CallError::ConnectivityFailed(_) => TerminationReason::ConnectivityFailed,
            CallError::TransportAuthFailed => TerminationReason::TransportAuthFailed,
            CallError::TransportReconnectExhausted => {
                TerminationReason::TransportReconnectExhausted
            }
            CallError::Transport(_) => TerminationReason::SignalingUnavailable,
            CallError::Ended(reason) => *reason,
            _ => TerminationReason::NegotiationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_map_to_typed_variants() {
        assert_eq!(
            CallError::from(MediaError::PermissionDenied(TrackSource::Camera)),
            CallError::PermissionDenied(TrackSource::Camera)
        );
        let timeout = CallError::from(MediaError::AcquireTimeout(Duration::from_secs(1)));
        assert_eq!(
            timeout.termination_reason(),
            TerminationReason::MediaAcquireTimeout
        );
    }

    #[test]
    fn test_transport_errors_map_to_typed_variants() {
        assert_eq!(
            CallError::from(TransportError::ReconnectExhausted { attempts: 3 }),
            CallError::TransportReconnectExhausted
        );
        assert_eq!(
            CallError::from(TransportError::NotConnected).termination_reason(),
            TerminationReason::SignalingUnavailable
        );
    }

    #[test]
    fn test_peer_timeout_maps_to_negotiation_timeout() {
        let err = CallError::from(PeerError::NegotiationTimeout(Duration::from_secs(20)));
        assert_eq!(err, CallError::NegotiationTimeout);
        assert_eq!(
            err.termination_reason(),
            TerminationReason::NegotiationTimeout
        );
    }
}
