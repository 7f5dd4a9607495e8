//! Media Streams und Tracks
//!
//! Ein `MediaStream` ist ein geteiltes Handle auf ein Bündel von Tracks.
//! Klone verweisen immer auf denselben Stream, Änderungen (z.B. ein
//! neu hinzugefügter Remote-Track) sind für alle Besitzer sichtbar.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kapazität des Frame-Broadcasts pro Track
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// KINDS
// ============================================================================

/// Art eines einzelnen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Quelle des lokalen Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Kamera + Mikrofon
    Camera,
    /// Bildschirmfreigabe (nur Video)
    Screen,
}

impl SourceKind {
    /// Ob für diese Quelle ein Audio-Track angefordert wird
    pub fn wants_audio(self) -> bool {
        matches!(self, SourceKind::Camera)
    }
}

/// Ressource hinter einem Track, z.B. ein laufender Capture-Thread.
/// Wird beim Stoppen des Tracks gedroppt und gibt damit die Hardware frei.
pub type CaptureGuard = Box<dyn Send>;

/// Ein kodierter Media-Frame
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Vec<u8>,
    pub duration: Duration,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

struct TrackInner {
    id: Uuid,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: broadcast::Sender<MediaFrame>,
    guard: Mutex<Option<CaptureGuard>>,
}

/// Ein einzelner Audio- oder Video-Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Erstellt einen neuen, aktivierten Track
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                frames,
                guard: Mutex::new(None),
            }),
        }
    }

    /// Hängt die Capture-Ressource an den Track.
    ///
    /// Ist der Track bereits gestoppt, wird die Ressource sofort freigegeben.
    pub fn attach_guard(&self, guard: CaptureGuard) {
        let mut slot = self.inner.guard.lock();
        if self.is_stopped() {
            drop(guard);
            return;
        }
        *slot = Some(guard);
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
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

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stoppt den Track endgültig und gibt die Capture-Ressource frei
    pub fn stop(&self) {
        // Lock zuerst, damit attach_guard nicht dazwischenkommt
        let mut slot = self.inner.guard.lock();
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let guard = slot.take();
        drop(slot);
        drop(guard);
        tracing::debug!("Track stopped: {} ({:?})", self.inner.label, self.inner.kind);
    }

    /// Empfänger für alle Frames dieses Tracks
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Veröffentlicht einen Frame.
    ///
    /// Deaktivierte oder gestoppte Tracks verwerfen Frames und geben `false` zurück.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if self.is_stopped() || !self.is_enabled() {
            return false;
        }
        let _ = self.inner.frames.send(frame);
        true
    }

    /// Veröffentlicht einen Füll-Frame (Stille, Schwarzbild) eines
    /// deaktivierten Tracks, damit der Peer weiter RTP empfängt.
    ///
    /// Nur gestoppte Tracks verwerfen ihn.
    pub fn push_filler(&self, frame: MediaFrame) -> bool {
        if self.is_stopped() {
            return false;
        }
        let _ = self.inner.frames.send(frame);
        true
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

struct StreamInner {
    id: Uuid,
    tracks: RwLock<Vec<MediaTrack>>,
}

/// Bündel von Tracks einer Quelle (lokal) oder eines Peers (remote)
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    /// Leerer Stream, in den später Tracks eingefügt werden (Remote-Seite)
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.inner.tracks.write().push(track);
    }

    /// Stoppt alle Tracks und gibt deren Hardware frei
    pub fn stop(&self) {
        for track in self.inner.tracks.read().iter() {
            track.stop();
        }
    }

    /// Ob mindestens ein Track noch läuft
    pub fn is_live(&self) -> bool {
        self.inner.tracks.read().iter().any(|t| !t.is_stopped())
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MediaStream {}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_releases_guard() {
        let released = Arc::new(AtomicBool::new(false));
        let track = MediaTrack::new(TrackKind::Video, "camera");
        track.attach_guard(Box::new(DropFlag(Arc::clone(&released))));

        assert!(!released.load(Ordering::SeqCst));
        track.stop();
        assert!(released.load(Ordering::SeqCst));
        assert!(track.is_stopped());

        // Zweites stop() ist ein No-Op
        track.stop();
    }

    #[test]
    fn test_guard_on_stopped_track_is_released_immediately() {
        let released = Arc::new(AtomicBool::new(false));
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        track.stop();
        track.attach_guard(Box::new(DropFlag(Arc::clone(&released))));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disabled_track_drops_frames() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let mut rx = track.subscribe();

        track.set_enabled(false);
        assert!(!track.push_frame(MediaFrame {
            data: vec![1, 2, 3],
            duration: Duration::from_millis(20),
        }));
        assert!(rx.try_recv().is_err());

        track.set_enabled(true);
        assert!(track.push_frame(MediaFrame {
            data: vec![4],
            duration: Duration::from_millis(20),
        }));
        assert_eq!(rx.try_recv().unwrap().data, vec![4]);
    }

    #[test]
    fn test_filler_frames_pass_disabled_track() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let mut rx = track.subscribe();

        track.set_enabled(false);
        assert!(track.push_filler(MediaFrame {
            data: vec![0xFF; 160],
            duration: Duration::from_millis(20),
        }));
        assert_eq!(rx.try_recv().unwrap().data, vec![0xFF; 160]);

        track.stop();
        assert!(!track.push_filler(MediaFrame {
            data: vec![0xFF; 160],
            duration: Duration::from_millis(20),
        }));
    }

    #[test]
    fn test_stream_clones_share_tracks() {
        let stream = MediaStream::empty();
        let clone = stream.clone();
        clone.add_track(MediaTrack::new(TrackKind::Video, "remote"));

        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream, clone);
        assert_ne!(stream, MediaStream::empty());
    }

    #[test]
    fn test_stream_stop() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "camera"),
        ]);
        assert!(stream.is_live());
        stream.stop();
        assert!(!stream.is_live());
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }
}
