use futures::future::BoxFuture;

use crate::{MediaError, MediaTrack, TrackSource};

/// Platform capture seam.
///
/// `open` may suspend while the OS shows a permission prompt. A backend signals external
/// revocation (for example the OS "stop sharing" control) by calling [`MediaTrack::stop`] on
/// the track it handed out.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, source: TrackSource) -> BoxFuture<'_, Result<MediaTrack, MediaError>>;
}
