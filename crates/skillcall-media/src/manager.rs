use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    CaptureBackend, LocalStream, MediaConstraints, MediaError, MediaTrack, MediaTrackState,
    TrackKind, TrackSource, VideoSender,
};

/// Asynchronous changes MediaManager made on its own.
#[derive(Debug)]
pub enum MediaEvent {
    /// Display capture ended outside our control; the camera has been restored
    /// (unless `restore_error` says otherwise).
    ScreenShareRevoked {
        state: MediaTrackState,
        restore_error: Option<MediaError>,
    },
}

/// Owner of the local capture devices for one call.
///
/// Sole writer of [`MediaTrackState`]. Toggles are purely local: they gate tracks or swap the
/// track on the bound [`VideoSender`], never renegotiate.
pub struct MediaManager {
    backend: Arc<dyn CaptureBackend>,
    acquire_timeout: Duration,
    constraints: Option<MediaConstraints>,
    state: MediaTrackState,
    audio: Option<MediaTrack>,
    camera: Option<MediaTrack>,
    display: Option<MediaTrack>,
    display_ended: Option<watch::Receiver<bool>>,
    video_sender: Option<VideoSender>,
}

impl MediaManager {
    pub fn new(backend: Arc<dyn CaptureBackend>, acquire_timeout: Duration) -> Self {
        Self {
            backend,
            acquire_timeout,
            constraints: None,
            state: MediaTrackState::default(),
            audio: None,
            camera: None,
            display: None,
            display_ended: None,
            video_sender: None,
        }
    }

    pub fn state(&self) -> MediaTrackState {
        self.state
    }

    pub fn is_acquired(&self) -> bool {
        self.constraints.is_some()
    }

    pub fn local_stream(&self) -> LocalStream {
        LocalStream {
            audio: self.audio.clone(),
            video: self.outgoing_video(),
        }
    }

    fn outgoing_video(&self) -> Option<MediaTrack> {
        if self.state.screen_sharing {
            self.display.clone()
        } else {
            self.camera.clone()
        }
    }

    async fn open_before(
        &self,
        source: TrackSource,
        deadline: Instant,
    ) -> Result<MediaTrack, MediaError> {
        match tokio::time::timeout_at(deadline, self.backend.open(source)).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::AcquireTimeout(self.acquire_timeout)),
        }
    }

    /// Open the requested devices. Holding a stream already returns it unchanged.
    pub async fn acquire(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        if self.is_acquired() {
            debug!("local stream already held; reusing it");
            return Ok(self.local_stream());
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::EmptyConstraints);
        }

        let deadline = Instant::now() + self.acquire_timeout;

        let audio = if constraints.audio {
            Some(self.open_before(TrackSource::Microphone, deadline).await?)
        } else {
            None
        };

        let camera = if constraints.video {
            match self.open_before(TrackSource::Camera, deadline).await {
                Ok(track) => Some(track),
                Err(e) => {
                    if let Some(audio) = &audio {
                        audio.stop();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.state = MediaTrackState {
            audio_enabled: audio.is_some(),
            video_enabled: camera.is_some(),
            screen_sharing: false,
        };
        self.audio = audio;
        self.camera = camera;
        self.constraints = Some(constraints);

        info!(
            audio = constraints.audio,
            video = constraints.video,
            "acquired local stream"
        );
        Ok(self.local_stream())
    }

    /// Stop every track and forget the stream. Safe to call repeatedly.
    pub fn release(&mut self) {
        for track in [self.audio.take(), self.camera.take(), self.display.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
        self.display_ended = None;
        if let Some(sender) = self.video_sender.take() {
            sender.replace_track(None);
        }
        if self.constraints.take().is_some() {
            info!("released local stream");
        }
        self.state = MediaTrackState::default();
    }

    /// Attach the outgoing video sender of the negotiated connection.
    pub fn bind_video_sender(&mut self, sender: VideoSender) {
        sender.replace_track(self.outgoing_video());
        self.video_sender = Some(sender);
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<MediaTrackState, MediaError> {
        if !self.is_acquired() {
            return Err(MediaError::NotAcquired);
        }
        let audio = self
            .audio
            .as_ref()
            .ok_or(MediaError::TrackMissing(TrackKind::Audio))?;
        audio.set_enabled(enabled);
        self.state.audio_enabled = enabled;
        debug!(enabled, "audio gated");
        Ok(self.state)
    }

    /// Gate outgoing video. While sharing this gates the display track.
    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<MediaTrackState, MediaError> {
        if !self.is_acquired() {
            return Err(MediaError::NotAcquired);
        }
        let track = self
            .outgoing_video()
            .ok_or(MediaError::TrackMissing(TrackKind::Video))?;
        track.set_enabled(enabled);
        self.state.video_enabled = enabled;
        debug!(enabled, source = %track.source(), "video gated");
        Ok(self.state)
    }

    /// Swap outgoing video to display capture. A no-op while already sharing.
    pub async fn start_screen_share(&mut self) -> Result<MediaTrackState, MediaError> {
        if !self.is_acquired() {
            return Err(MediaError::NotAcquired);
        }
        if self.state.screen_sharing {
            return Ok(self.state);
        }

        let deadline = Instant::now() + self.acquire_timeout;
        let display = self.open_before(TrackSource::Display, deadline).await?;
        display.set_enabled(self.state.video_enabled || self.camera.is_none());

        if let Some(sender) = &self.video_sender {
            sender.replace_track(Some(display.clone()));
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }

        self.display_ended = Some(display.ended_signal());
        self.display = Some(display);
        self.state.screen_sharing = true;
        if self.constraints.is_some_and(|c| !c.video) {
            self.state.video_enabled = true;
        }

        info!("screen share started");
        Ok(self.state)
    }

    /// Restore camera capture on the outgoing sender. A no-op while not sharing.
    pub async fn stop_screen_share(&mut self) -> Result<MediaTrackState, MediaError> {
        if !self.state.screen_sharing {
            return Ok(self.state);
        }

        self.display_ended = None;
        let display = self.display.take();
        self.state.screen_sharing = false;

        let had_camera = self.constraints.is_some_and(|c| c.video);
        let camera = if had_camera {
            let deadline = Instant::now() + self.acquire_timeout;
            match self.open_before(TrackSource::Camera, deadline).await {
                Ok(camera) => {
                    camera.set_enabled(self.state.video_enabled);
                    Some(camera)
                }
                Err(e) => {
                    warn!("camera could not be restored after screen share: {}", e);
                    if let Some(display) = display {
                        display.stop();
                    }
                    if let Some(sender) = &self.video_sender {
                        sender.replace_track(None);
                    }
                    self.state.video_enabled = false;
                    return Err(e);
                }
            }
        } else {
            self.state.video_enabled = false;
            None
        };

        if let Some(sender) = &self.video_sender {
            sender.replace_track(camera.clone());
        }
        if let Some(display) = display {
            display.stop();
        }
        self.camera = camera;

        info!("screen share stopped");
        Ok(self.state)
    }

    /// Resolves once the display track being shared has ended outside our control.
    ///
    /// Cancel-safe: it only watches the track and changes nothing, so it can sit in a
    /// `select!`. Pending forever while not sharing. Follow it with
    /// [`MediaManager::handle_display_revoked`], which does the restore.
    pub async fn display_revoked(&mut self) {
        let Some(ended) = self.display_ended.as_mut() else {
            return std::future::pending().await;
        };
        // A closed channel means every handle to the track is gone; treat it as ended.
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// Put the camera back after [`MediaManager::display_revoked`] fired.
    pub async fn handle_display_revoked(&mut self) -> MediaEvent {
        warn!("display capture ended externally; restoring camera");
        let restore_error = self.stop_screen_share().await.err();
        MediaEvent::ScreenShareRevoked {
            state: self.state,
            restore_error,
        }
    }

    /// Wait for the next change MediaManager makes by itself.
    ///
    /// Not cancel-safe once the restore has begun. Inside a `select!` use
    /// [`MediaManager::display_revoked`] and call [`MediaManager::handle_display_revoked`]
    /// from the branch body instead.
    pub async fn next_event(&mut self) -> MediaEvent {
        self.display_revoked().await;
        self.handle_display_revoked().await
    }
}

impl Drop for MediaManager {
    fn drop(&mut self) {
        self.release();
    }
}
