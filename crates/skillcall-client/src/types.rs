use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillcall_media::{LocalStream, MediaTrackState};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::peer::RemoteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Lifecycle of one call.
///
/// ```text
/// Idle -> Initiating -> Negotiating -> Connected -> Active -> Ending -> Ended | Failed
/// ```
///
/// A responder goes straight from `Idle` to `Negotiating`. Every non-terminal state may
/// move to `Ending`; only `Ending` reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Initiating,
    Negotiating,
    Connected,
    Active,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// A call exists and has not started tearing down.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            CallState::Initiating
                | CallState::Negotiating
                | CallState::Connected
                | CallState::Active
        )
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Initiating)
                | (Idle, Negotiating)
                | (Initiating, Negotiating)
                | (Negotiating, Connected)
                | (Connected, Active)
                | (Initiating | Negotiating | Connected | Active, Ending)
                | (Ending, Ended)
                | (Ending, Failed)
        )
    }
}

/// Why a call reached a terminal state. Always present once a call has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    /// The caller abandoned `start_call` or `accept_incoming` before the call became active.
    Cancelled,
    PermissionDenied,
    DeviceUnavailable,
    MediaAcquireTimeout,
    MediaFailure,
    NegotiationTimeout,
    NegotiationFailed,
    ConnectivityFailed,
    SignalingUnavailable,
    TransportAuthFailed,
    TransportReconnectExhausted,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::LocalHangup => "local_hangup",
            TerminationReason::RemoteHangup => "remote_hangup",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::PermissionDenied => "permission_denied",
            TerminationReason::DeviceUnavailable => "device_unavailable",
            TerminationReason::MediaAcquireTimeout => "media_acquire_timeout",
            TerminationReason::MediaFailure => "media_failure",
            TerminationReason::NegotiationTimeout => "negotiation_timeout",
            TerminationReason::NegotiationFailed => "negotiation_failed",
            TerminationReason::ConnectivityFailed => "connectivity_failed",
            TerminationReason::SignalingUnavailable => "signaling_unavailable",
            TerminationReason::TransportAuthFailed => "transport_auth_failed",
            TerminationReason::TransportReconnectExhausted => "transport_reconnect_exhausted",
        }
    }

    /// Ends in `Failed` rather than `Ended`.
    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            TerminationReason::LocalHangup
                | TerminationReason::RemoteHangup
                | TerminationReason::Cancelled
        )
    }

    /// Text suitable for showing to the user.
    pub fn describe(self) -> &'static str {
        match self {
            TerminationReason::LocalHangup => "You ended the call.",
            TerminationReason::RemoteHangup => "The other participant ended the call.",
            TerminationReason::Cancelled => "The call was cancelled before it connected.",
            TerminationReason::PermissionDenied => {
                "Camera or microphone access was denied. Allow access and try again."
            }
            TerminationReason::DeviceUnavailable => "No camera or microphone was found.",
            TerminationReason::MediaAcquireTimeout => {
                "Your camera or microphone did not respond in time."
            }
            TerminationReason::MediaFailure => "Your camera or microphone could not be started.",
            TerminationReason::NegotiationTimeout => {
                "Could not connect to the other participant. Their network may be blocking calls."
            }
            TerminationReason::NegotiationFailed => "The call could not be set up.",
            TerminationReason::ConnectivityFailed => "The connection to the other participant was lost.",
            TerminationReason::SignalingUnavailable => "The call service is unreachable.",
            TerminationReason::TransportAuthFailed => "Your session expired. Sign in again.",
            TerminationReason::TransportReconnectExhausted => {
                "Lost connection to the call service and could not reconnect."
            }
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live record of one call. Owned by the controller and dropped on a terminal state.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub exchange_id: String,
    pub local_participant_id: String,
    /// Resolved from the first message the other side sends, if not known up front.
    pub remote_participant_id: Option<String>,
    pub role: Role,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub active_since: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub termination: Option<TerminationReason>,
}

impl CallSession {
    pub fn new(exchange_id: String, local_participant_id: String, role: Role) -> Self {
        Self {
            exchange_id,
            local_participant_id,
            remote_participant_id: None,
            role,
            state: CallState::Idle,
            created_at: Utc::now(),
            active_since: None,
            ended_at: None,
            termination: None,
        }
    }

    /// Time spent in `Active`; frozen once the call ends.
    pub fn elapsed(&self) -> Duration {
        match (self.active_since, self.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// Read-only view of a call, republished on every change and once per duration tick.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    pub exchange_id: Option<String>,
    pub role: Option<Role>,
    pub remote_participant_id: Option<String>,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
    pub media: MediaTrackState,
    pub elapsed: Duration,
    pub termination: Option<TerminationReason>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            exchange_id: None,
            role: None,
            remote_participant_id: None,
            local_stream: None,
            remote_stream: None,
            media: MediaTrackState::default(),
            elapsed: Duration::ZERO,
            termination: None,
        }
    }
}

/// An offer that arrived while idle, waiting for `accept_incoming`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub exchange_id: String,
    pub caller_participant_id: Option<String>,
}

/// Told about incoming offers so the UI can ask the user.
pub trait IncomingCallNotifier: Send + Sync {
    fn incoming_call(&self, call: IncomingCall);
}

impl IncomingCallNotifier for mpsc::UnboundedSender<IncomingCall> {
    fn incoming_call(&self, call: IncomingCall) {
        if self.send(call).is_err() {
            debug!("incoming call listener is gone");
        }
    }
}
