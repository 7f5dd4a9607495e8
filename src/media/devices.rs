//! Capture-Geräte
//!
//! Abstraktion über die Plattform-Capture (Kamera, Mikrofon, Bildschirm).
//! `SystemDevices` nutzt cpal für das Mikrofon; Video-Quellen werden von der
//! Anwendung als `VideoCapturer` eingehängt. Ohne Kamera-Quelle liefert
//! `Camera` einen reinen Audio-Stream.

use super::microphone;
use super::stream::{CaptureGuard, MediaStream, MediaTrack, SourceKind, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("No active media stream")]
    NoActiveStream,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Plattform-Capture für lokale Streams
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Fordert einen Stream an: `Camera` liefert Audio + Video,
    /// `Screen` nur Video.
    async fn capture(&self, kind: SourceKind) -> Result<MediaStream, MediaError>;
}

/// Eine Video-Quelle (Kamera oder Bildschirm)
pub trait VideoCapturer: Send + Sync {
    /// Startet die Aufnahme in `track`. Die Aufnahme läuft, bis der
    /// zurückgegebene Guard gedroppt wird.
    fn start(&self, track: &MediaTrack) -> Result<CaptureGuard, MediaError>;
}

// ============================================================================
// SYSTEM DEVICES
// ============================================================================

/// Capture über die Geräte des Systems
#[derive(Default)]
pub struct SystemDevices {
    camera: Option<Arc<dyn VideoCapturer>>,
    screen: Option<Arc<dyn VideoCapturer>>,
}

impl SystemDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Setzt die Kamera-Quelle
    pub fn with_camera(mut self, capturer: impl VideoCapturer + 'static) -> Self {
        self.camera = Some(Arc::new(capturer));
        self
    }

    /// Setzt die Bildschirm-Quelle
    pub fn with_screen(mut self, capturer: impl VideoCapturer + 'static) -> Self {
        self.screen = Some(Arc::new(capturer));
        self
    }

    /// Startet den Video-Track der Quelle.
    ///
    /// Ohne eingehängte Kamera gibt es für `Camera` keinen Video-Track
    /// (`Ok(None)`), ohne Bildschirm-Quelle schlägt `Screen` fehl.
    fn start_video(
        capturer: Option<&Arc<dyn VideoCapturer>>,
        kind: SourceKind,
    ) -> Result<Option<MediaTrack>, MediaError> {
        let (capturer, label) = match (capturer, kind) {
            (Some(capturer), SourceKind::Camera) => (capturer, "camera"),
            (Some(capturer), SourceKind::Screen) => (capturer, "screen"),
            (None, SourceKind::Camera) => {
                tracing::warn!("No camera configured, capturing audio only");
                return Ok(None);
            }
            (None, SourceKind::Screen) => {
                return Err(MediaError::DeviceUnavailable(
                    "No screen capture source configured".to_string(),
                ))
            }
        };

        let track = MediaTrack::new(TrackKind::Video, label);
        let guard = capturer.start(&track)?;
        track.attach_guard(guard);
        Ok(Some(track))
    }
}

#[async_trait]
impl CaptureDevices for SystemDevices {
    async fn capture(&self, kind: SourceKind) -> Result<MediaStream, MediaError> {
        let mut tracks = Vec::new();

        if kind.wants_audio() {
            // Öffnen des Mikrofons blockiert bis der cpal-Stream läuft
            let track = tokio::task::spawn_blocking(microphone::open)
                .await
                .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))??;
            tracks.push(track);
        }

        let capturer = match kind {
            SourceKind::Camera => self.camera.as_ref(),
            SourceKind::Screen => self.screen.as_ref(),
        };

        match Self::start_video(capturer, kind) {
            Ok(track) => tracks.extend(track),
            Err(e) => {
                // Bereits geöffnete Geräte wieder freigeben
                for track in &tracks {
                    track.stop();
                }
                return Err(e);
            }
        }

        tracing::info!("Captured {:?} stream with {} track(s)", kind, tracks.len());
        Ok(MediaStream::new(tracks))
    }
}

impl std::fmt::Debug for SystemDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDevices")
            .field("camera", &self.camera.is_some())
            .field("screen", &self.screen.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeniedScreen;

    impl VideoCapturer for DeniedScreen {
        fn start(&self, _track: &MediaTrack) -> Result<CaptureGuard, MediaError> {
            Err(MediaError::PermissionDenied("display capture".to_string()))
        }
    }

    struct StaticScreen;

    impl VideoCapturer for StaticScreen {
        fn start(&self, _track: &MediaTrack) -> Result<CaptureGuard, MediaError> {
            Ok(Box::new(()))
        }
    }

    #[tokio::test]
    async fn test_screen_without_capturer_is_unavailable() {
        let devices = SystemDevices::new();
        let result = devices.capture(SourceKind::Screen).await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_camera_without_capturer_is_audio_only() {
        assert!(matches!(
            SystemDevices::start_video(None, SourceKind::Camera),
            Ok(None)
        ));
        assert!(matches!(
            SystemDevices::start_video(None, SourceKind::Screen),
            Err(MediaError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_camera_capturer_starts_video_track() {
        let camera: Arc<dyn VideoCapturer> = Arc::new(StaticScreen);
        let track = SystemDevices::start_video(Some(&camera), SourceKind::Camera)
            .unwrap()
            .unwrap();
        assert_eq!(track.kind(), TrackKind::Video);
        assert_eq!(track.label(), "camera");
    }

    #[tokio::test]
    async fn test_screen_permission_denied_is_propagated() {
        let devices = SystemDevices::new().with_screen(DeniedScreen);
        let result = devices.capture(SourceKind::Screen).await;
        assert_eq!(
            result.unwrap_err(),
            MediaError::PermissionDenied("display capture".to_string())
        );
    }

    #[tokio::test]
    async fn test_screen_stream_is_video_only() {
        let devices = SystemDevices::new().with_screen(StaticScreen);
        let stream = devices.capture(SourceKind::Screen).await.unwrap();
        assert!(stream.audio_tracks().is_empty());
        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream.video_tracks()[0].label(), "screen");
    }
}
