//! Local capture for SkillCall calls.
//!
//! [`MediaManager`] owns the camera, microphone and display-capture tracks for one call.
//! Devices are reached through a [`CaptureBackend`]; [`DummyCapture`] is a deterministic
//! backend for tests and headless runs.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod capture;
mod dummy;
mod error;
mod manager;
mod track;

pub use capture::CaptureBackend;
pub use dummy::DummyCapture;
pub use error::MediaError;
pub use manager::{MediaEvent, MediaManager};
pub use track::{LocalStream, MediaTrack, VideoSender};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Device a track captures from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

impl TrackSource {
    pub const fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Display => TrackKind::Video,
        }
    }
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::Display => "display",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::AUDIO_VIDEO
    }
}

/// Local media flags, written only by [`MediaManager`].
///
/// While `screen_sharing` is set the outgoing video sender carries the display track and
/// `video_enabled` gates that track.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaTrackState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}
