//! Common error types for SkillCall.

use thiserror::Error;

/// Result type alias using SkillCall's shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared by every SkillCall crate: wire decoding, configuration, I/O.
///
/// Component-specific failures (media, negotiation, transport, call guard) have their own
/// enums next to the component that raises them.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (config file, socket, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol error (well-formed JSON with an invalid shape)
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
