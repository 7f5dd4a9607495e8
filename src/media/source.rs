//! Media Source
//!
//! Hält den aktiven lokalen Stream. Es ist immer höchstens ein Stream live;
//! jeder erfolgreiche Wechsel stoppt den alten und bindet die Vorschau neu.

use super::devices::{CaptureDevices, MediaError};
use super::stream::{MediaStream, SourceKind};
use crate::render::OutputSink;
use std::sync::Arc;

/// Lokale Medienquelle mit Mute- und Video-Status
pub struct MediaSource {
    devices: Arc<dyn CaptureDevices>,
    preview: Arc<dyn OutputSink>,
    stream: Option<MediaStream>,
    muted: bool,
    video_enabled: bool,
    active_kind: SourceKind,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn CaptureDevices>, preview: Arc<dyn OutputSink>) -> Self {
        Self {
            devices,
            preview,
            stream: None,
            muted: false,
            video_enabled: true,
            active_kind: SourceKind::Camera,
        }
    }

    /// Fordert einen neuen Stream an und macht ihn zum aktiven.
    ///
    /// Mute- und Video-Status werden auf die neuen Tracks übertragen.
    /// Schlägt die Anfrage fehl, bleibt der bisherige Stream unverändert.
    pub async fn acquire(&mut self, kind: SourceKind) -> Result<MediaStream, MediaError> {
        let stream = self.devices.capture(kind).await?;
        self.apply_flags(&stream);

        if let Some(old) = self.stream.replace(stream.clone()) {
            if old != stream {
                old.stop();
            }
        }
        self.active_kind = kind;
        self.preview.bind(Some(stream.clone()));

        tracing::info!("Local {:?} stream {} active", kind, stream.id());
        Ok(stream)
    }

    /// Wechselt die Quelle.
    ///
    /// Gleiche Quelle: das Gerät wird erst freigegeben, dann neu angefordert.
    /// Andere Quelle: erst anfordern, bei Fehler bleibt der alte Stream aktiv.
    pub async fn replace(&mut self, kind: SourceKind) -> Result<MediaStream, MediaError> {
        if kind == self.active_kind {
            if let Some(old) = self.stream.take() {
                old.stop();
                self.preview.bind(None);
            }
        }
        self.acquire(kind).await
    }

    /// Schaltet alle Audio-Tracks stumm bzw. wieder an
    pub fn set_muted(&mut self, muted: bool) -> Result<(), MediaError> {
        let stream = self.stream.as_ref().ok_or(MediaError::NoActiveStream)?;
        for track in stream.audio_tracks() {
            track.set_enabled(!muted);
        }
        self.muted = muted;
        tracing::debug!("Muted: {}", muted);
        Ok(())
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), MediaError> {
        let stream = self.stream.as_ref().ok_or(MediaError::NoActiveStream)?;
        for track in stream.video_tracks() {
            track.set_enabled(enabled);
        }
        self.video_enabled = enabled;
        tracing::debug!("Video enabled: {}", enabled);
        Ok(())
    }

    /// Stoppt den aktiven Stream und löst die Vorschau
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            self.preview.bind(None);
            tracing::info!("Local media released");
        }
    }

    fn apply_flags(&self, stream: &MediaStream) {
        for track in stream.audio_tracks() {
            track.set_enabled(!self.muted);
        }
        for track in stream.video_tracks() {
            track.set_enabled(self.video_enabled);
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn active_kind(&self) -> SourceKind {
        self.active_kind
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("stream", &self.stream.as_ref().map(|s| s.id()))
            .field("muted", &self.muted)
            .field("video_enabled", &self.video_enabled)
            .field("active_kind", &self.active_kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::WatchOutput;
    use crate::testing::FakeDevices;

    fn source() -> (MediaSource, Arc<FakeDevices>, WatchOutput) {
        let devices = Arc::new(FakeDevices::new());
        let preview = WatchOutput::new("local");
        let source = MediaSource::new(devices.clone(), Arc::new(preview.clone()));
        (source, devices, preview)
    }

    #[tokio::test]
    async fn test_acquire_binds_preview() {
        let (mut source, _, preview) = source();
        let stream = source.acquire(SourceKind::Camera).await.unwrap();

        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(preview.current(), Some(stream));
    }

    #[tokio::test]
    async fn test_replace_screen_twice_keeps_one_capture() {
        let (mut source, devices, preview) = source();
        source.acquire(SourceKind::Camera).await.unwrap();

        source.replace(SourceKind::Screen).await.unwrap();
        let second = source.replace(SourceKind::Screen).await.unwrap();

        assert_eq!(devices.live_count(), 1);
        assert_eq!(devices.issued().len(), 3);
        assert!(second.is_live());
        assert_eq!(preview.current(), Some(second));
        assert_eq!(source.active_kind(), SourceKind::Screen);
    }

    #[tokio::test]
    async fn test_toggle_mute_twice() {
        let (mut source, _, _) = source();
        let stream = source.acquire(SourceKind::Camera).await.unwrap();

        source.set_muted(true).unwrap();
        assert!(!stream.audio_tracks()[0].is_enabled());
        source.set_muted(false).unwrap();

        assert!(!source.muted());
        assert!(stream.audio_tracks()[0].is_enabled());
    }

    #[tokio::test]
    async fn test_toggle_without_stream_is_reported() {
        let (mut source, _, _) = source();
        assert_eq!(source.set_muted(true), Err(MediaError::NoActiveStream));
        assert_eq!(source.set_video_enabled(false), Err(MediaError::NoActiveStream));
        assert!(!source.muted());
        assert!(source.video_enabled());
    }

    #[tokio::test]
    async fn test_denied_screen_keeps_camera() {
        let (mut source, devices, preview) = source();
        let camera = source.acquire(SourceKind::Camera).await.unwrap();
        devices.deny(SourceKind::Screen);

        let result = source.replace(SourceKind::Screen).await;

        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert_eq!(source.active_kind(), SourceKind::Camera);
        assert_eq!(source.stream(), Some(&camera));
        assert!(camera.is_live());
        assert_eq!(preview.current(), Some(camera));
    }

    #[tokio::test]
    async fn test_flags_carry_over_to_new_stream() {
        let (mut source, _, _) = source();
        source.acquire(SourceKind::Camera).await.unwrap();
        source.set_muted(true).unwrap();
        source.set_video_enabled(false).unwrap();

        let screen = source.replace(SourceKind::Screen).await.unwrap();
        assert!(!screen.video_tracks()[0].is_enabled());

        let camera = source.replace(SourceKind::Camera).await.unwrap();
        assert!(!camera.audio_tracks()[0].is_enabled());
        assert!(!camera.video_tracks()[0].is_enabled());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (mut source, devices, preview) = source();
        source.acquire(SourceKind::Camera).await.unwrap();

        source.release();
        source.release();

        assert_eq!(devices.live_count(), 0);
        assert!(source.stream().is_none());
        assert!(preview.current().is_none());
    }
}
