use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::{CaptureBackend, MediaError, MediaTrack, TrackSource};

#[derive(Default)]
struct DummyState {
    denied: HashSet<TrackSource>,
    missing: HashSet<TrackSource>,
    open_delay: Option<Duration>,
    opened: Vec<MediaTrack>,
    open_counts: HashMap<TrackSource, usize>,
}

/// Capture backend without devices. Every source opens instantly unless configured to
/// refuse, to be missing, or to stall.
#[derive(Clone, Default)]
pub struct DummyCapture {
    state: Arc<Mutex<DummyState>>,
}

impl DummyCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse access to `source` as if the user denied the prompt.
    pub fn deny(&self, source: TrackSource) {
        self.lock().denied.insert(source);
    }

    pub fn remove_device(&self, source: TrackSource) {
        self.lock().missing.insert(source);
    }

    pub fn restore_device(&self, source: TrackSource) {
        let mut state = self.lock();
        state.missing.remove(&source);
        state.denied.remove(&source);
    }

    /// Every open waits this long before answering.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.lock().open_delay = delay;
    }

    pub fn open_count(&self, source: TrackSource) -> usize {
        self.lock().open_counts.get(&source).copied().unwrap_or(0)
    }

    pub fn last_opened(&self, source: TrackSource) -> Option<MediaTrack> {
        self.lock()
            .opened
            .iter()
            .rev()
            .find(|t| t.source() == source)
            .cloned()
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.lock().opened.iter().filter(|t| !t.is_ended()).count()
    }

    /// Simulate the OS revoking `source` (e.g. the system "stop sharing" button).
    pub fn revoke(&self, source: TrackSource) {
        for track in self.lock().opened.iter().filter(|t| t.source() == source) {
            track.stop();
        }
    }
}

impl CaptureBackend for DummyCapture {
    fn open(&self, source: TrackSource) -> BoxFuture<'_, Result<MediaTrack, MediaError>> {
        Box::pin(async move {
            let delay = self.lock().open_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            if state.denied.contains(&source) {
                return Err(MediaError::PermissionDenied(source));
            }
            if state.missing.contains(&source) {
                return Err(MediaError::DeviceUnavailable(source));
            }

            let track = MediaTrack::new(source, format!("dummy {source}"));
            state.opened.push(track.clone());
            *state.open_counts.entry(source).or_insert(0) += 1;
            Ok(track)
        })
    }
}
