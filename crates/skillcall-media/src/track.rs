use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::{TrackKind, TrackSource};

struct TrackInner {
    id: String,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle to one local capture track. Clones share the same underlying track.
///
/// Disabling a track gates its output (silence / black frames) without touching the
/// negotiated session. Stopping it releases the device; a stopped track never restarts.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the device. Also used by capture backends when the OS revokes access.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Receiver that flips to `true` once the track has ended.
    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.inner.ended.subscribe()
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// The local stream as currently wired: the microphone and whatever feeds outgoing video.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Outgoing video sender of a negotiated connection.
///
/// Replacing its track swaps the video source in place; no offer/answer cycle is needed.
#[derive(Clone, Default)]
pub struct VideoSender {
    slot: Arc<Mutex<Option<MediaTrack>>>,
}

impl VideoSender {
    pub fn new(track: Option<MediaTrack>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(track)),
        }
    }

    /// Swap the outgoing track, returning the previous one.
    pub fn replace_track(&self, track: Option<MediaTrack>) -> Option<MediaTrack> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, track)
    }

    pub fn track(&self) -> Option<MediaTrack> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn source(&self) -> Option<TrackSource> {
        self.track().map(|t| t.source())
    }
}

impl fmt::Debug for VideoSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoSender")
            .field("source", &self.source())
            .finish()
    }
}
