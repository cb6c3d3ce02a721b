//! Signaling wire protocol.
//!
//! A [`SignalingMessage`] is what call endpoints exchange through the relay. On the wire it is
//! a flat JSON object whose `type` decides the shape of `payload`:
//!
//! ```text
//! { "type": "join"|"leave"|"offer"|"answer"|"ice_candidate"|"end",
//!   "exchangeId": "...", "targetParticipantId"?: "...", "senderParticipantId"?: "...",
//!   "payload"?: SessionDescription | IceCandidate | { "reason": "..." } }
//! ```
//!
//! In Rust the payload is tied to the variant through [`SignalBody`], so an `offer` without a
//! session description cannot be constructed or decoded.
//!
//! Signaling shares one connection with chat and presence; [`Frame`] is the envelope the
//! transport actually writes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message discriminant as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    End,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::End => "end",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description. Candidates gathered before the description was shipped travel
/// with it (non-trickle negotiation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<IceCandidate>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
            candidates: Vec::new(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Payload of an `end` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndNotice {
    #[serde(default)]
    pub reason: String,
}

/// Variant-specific content of a [`SignalingMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Join,
    Leave,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    End(EndNotice),
}

impl SignalBody {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalBody::Join => SignalKind::Join,
            SignalBody::Leave => SignalKind::Leave,
            SignalBody::Offer(_) => SignalKind::Offer,
            SignalBody::Answer(_) => SignalKind::Answer,
            SignalBody::IceCandidate(_) => SignalKind::IceCandidate,
            SignalBody::End(_) => SignalKind::End,
        }
    }
}

/// One relay-only signaling message. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSignal", into = "RawSignal")]
pub struct SignalingMessage {
    pub exchange_id: String,
    pub target_participant_id: Option<String>,
    /// Stamped by the relay on delivery; ignored when sending.
    pub sender_participant_id: Option<String>,
    pub body: SignalBody,
}

impl SignalingMessage {
    pub fn new(exchange_id: impl Into<String>, body: SignalBody) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            target_participant_id: None,
            sender_participant_id: None,
            body,
        }
    }

    pub fn join(exchange_id: impl Into<String>) -> Self {
        Self::new(exchange_id, SignalBody::Join)
    }

    pub fn leave(exchange_id: impl Into<String>) -> Self {
        Self::new(exchange_id, SignalBody::Leave)
    }

    pub fn offer(exchange_id: impl Into<String>, description: SessionDescription) -> Self {
        Self::new(exchange_id, SignalBody::Offer(description))
    }

    pub fn answer(exchange_id: impl Into<String>, description: SessionDescription) -> Self {
        Self::new(exchange_id, SignalBody::Answer(description))
    }

    pub fn ice_candidate(exchange_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Self::new(exchange_id, SignalBody::IceCandidate(candidate))
    }

    pub fn end(exchange_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            exchange_id,
            SignalBody::End(EndNotice {
                reason: reason.into(),
            }),
        )
    }

    /// Address the message to a single participant instead of the whole room.
    pub fn to(mut self, participant_id: Option<String>) -> Self {
        self.target_participant_id = participant_id;
        self
    }

    pub fn from_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.sender_participant_id = Some(participant_id.into());
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.body.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignal {
    #[serde(rename = "type")]
    kind: SignalKind,
    exchange_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

fn required_payload<T: serde::de::DeserializeOwned>(
    kind: SignalKind,
    payload: Option<serde_json::Value>,
) -> Result<T> {
    let value = payload.ok_or_else(|| Error::protocol(format!("{kind} requires a payload")))?;
    serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("invalid {kind} payload: {e}")))
}

fn description_of(
    kind: SignalKind,
    expected: SdpKind,
    payload: Option<serde_json::Value>,
) -> Result<SessionDescription> {
    let description: SessionDescription = required_payload(kind, payload)?;
    if description.kind != expected {
        return Err(Error::protocol(format!(
            "{kind} carries a {:?} description",
            description.kind
        )));
    }
    Ok(description)
}

impl TryFrom<RawSignal> for SignalingMessage {
    type Error = Error;

    fn try_from(raw: RawSignal) -> Result<Self> {
        if raw.exchange_id.trim().is_empty() {
            return Err(Error::protocol("exchangeId must not be empty"));
        }

        let body = match raw.kind {
            SignalKind::Join => SignalBody::Join,
            SignalKind::Leave => SignalBody::Leave,
            SignalKind::Offer => {
                SignalBody::Offer(description_of(raw.kind, SdpKind::Offer, raw.payload)?)
            }
            SignalKind::Answer => {
                SignalBody::Answer(description_of(raw.kind, SdpKind::Answer, raw.payload)?)
            }
            SignalKind::IceCandidate => {
                SignalBody::IceCandidate(required_payload(raw.kind, raw.payload)?)
            }
            SignalKind::End => match raw.payload {
                Some(value) => SignalBody::End(
                    serde_json::from_value(value)
                        .map_err(|e| Error::protocol(format!("invalid end payload: {e}")))?,
                ),
                None => SignalBody::End(EndNotice::default()),
            },
        };

        Ok(Self {
            exchange_id: raw.exchange_id,
            target_participant_id: raw.target_participant_id,
            sender_participant_id: raw.sender_participant_id,
            body,
        })
    }
}

impl From<SignalingMessage> for RawSignal {
    fn from(msg: SignalingMessage) -> Self {
        let kind = msg.kind();
        // Plain data structs; conversion to a JSON value cannot fail.
        let payload = match msg.body {
            SignalBody::Join | SignalBody::Leave => None,
            SignalBody::Offer(desc) | SignalBody::Answer(desc) => serde_json::to_value(desc).ok(),
            SignalBody::IceCandidate(candidate) => serde_json::to_value(candidate).ok(),
            SignalBody::End(notice) => serde_json::to_value(notice).ok(),
        };
        Self {
            kind,
            exchange_id: msg.exchange_id,
            target_participant_id: msg.target_participant_id,
            sender_participant_id: msg.sender_participant_id,
            payload,
        }
    }
}

/// Chat event multiplexed over the signaling connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub exchange_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_participant_id: Option<String>,
    pub body: String,
}

/// Presence change for a participant known to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub participant_id: String,
    pub online: bool,
}

/// Envelope written to the relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "channel",
    content = "body",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Frame {
    /// First frame on every connection; carries the opaque bearer credential.
    Auth { token: String },
    AuthOk { participant_id: String },
    AuthFailed { reason: String },
    Signal(SignalingMessage),
    Chat(ChatMessage),
    Presence(PresenceUpdate),
    Error { message: String },
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
