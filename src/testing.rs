//! Test-Doubles für Registry, Channel und Capture-Geräte

use crate::channel::{CallChannel, ChannelError, ChannelEvent, ChannelHandle, ChannelLink};
use crate::media::{CaptureDevices, MediaError, MediaStream, MediaTrack, SourceKind, TrackKind};
use crate::registry::{CallOffer, EndpointRegistry, RegistryError, RegistryEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    denied: Mutex<HashSet<SourceKind>>,
    issued: Mutex<Vec<MediaStream>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, kind: SourceKind) {
        self.denied.lock().insert(kind);
    }

    pub fn allow(&self, kind: SourceKind) {
        self.denied.lock().remove(&kind);
    }

    /// Alle bisher ausgegebenen Streams
    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }

    /// Anzahl der Streams, die noch Hardware halten
    pub fn live_count(&self) -> usize {
        self.issued.lock().iter().filter(|s| s.is_live()).count()
    }
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    async fn capture(&self, kind: SourceKind) -> Result<MediaStream, MediaError> {
        if self.denied.lock().contains(&kind) {
            return Err(MediaError::PermissionDenied(format!("{:?} denied", kind)));
        }

        let stream = match kind {
            SourceKind::Camera => MediaStream::new(vec![
                MediaTrack::new(TrackKind::Audio, "fake-mic"),
                MediaTrack::new(TrackKind::Video, "fake-camera"),
            ]),
            SourceKind::Screen => MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "fake-screen")]),
        };
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

pub struct FakeRegistry {
    assign: String,
    tx: Mutex<Option<mpsc::Sender<RegistryEvent>>>,
    rejected: Mutex<Vec<(CallOffer, String)>>,
    closes: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(assign: &str) -> Self {
        Self {
            assign: assign.to_string(),
            tx: Mutex::new(None),
            rejected: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: RegistryEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            tx.try_send(event).expect("registry channel full");
        }
    }

    /// Simuliert ein eingehendes Angebot und gibt es zurück
    pub fn offer(&self, remote_id: &str, call_id: &str) -> CallOffer {
        let offer = CallOffer::new(remote_id, call_id, "v=0 fake");
        self.emit(RegistryEvent::IncomingCall(offer.clone()));
        offer
    }

    pub fn rejected(&self) -> Vec<(CallOffer, String)> {
        self.rejected.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointRegistry for FakeRegistry {
    async fn open(&self) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError> {
        let (tx, rx) = mpsc::channel(16);
        tx.try_send(RegistryEvent::Assigned(self.assign.clone()))
            .expect("fresh channel");
        *self.tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn reject(&self, offer: &CallOffer, reason: &str) -> Result<(), RegistryError> {
        self.rejected.lock().push((offer.clone(), reason.to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.tx.lock().take();
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

pub struct FakeLink {
    remote_id: String,
    /// callId des Angebots, bei ausgehenden Anrufen leer
    pub call_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
    fail_replace: AtomicBool,
    replaced: Mutex<Vec<MediaStream>>,
}

impl FakeLink {
    /// Simuliert ein Ereignis der Gegenseite
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn replaced(&self) -> Vec<MediaStream> {
        self.replaced.lock().clone()
    }

    pub fn fail_replace(&self) {
        self.fail_replace.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelLink for FakeLink {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn replace_outbound(&self, local: &MediaStream) -> Result<(), ChannelError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(ChannelError::WebRtc("replace_track failed".to_string()));
        }
        self.replaced.lock().push(local.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeChannel {
    links: Mutex<Vec<Arc<FakeLink>>>,
    fail_next: Mutex<Option<ChannelError>>,
    placed: Mutex<Vec<String>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Der nächste Aufbau schlägt mit `error` fehl
    pub fn fail_next(&self, error: ChannelError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Arc<FakeLink> {
        self.links.lock().last().cloned().expect("no link opened")
    }

    /// Ziele aller ausgehenden Anrufe
    pub fn placed(&self) -> Vec<String> {
        self.placed.lock().clone()
    }

    fn open(&self, remote_id: &str, call_id: &str) -> Result<ChannelHandle, ChannelError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(FakeLink {
            remote_id: remote_id.to_string(),
            call_id: call_id.to_string(),
            events: tx,
            closed: AtomicBool::new(false),
            fail_replace: AtomicBool::new(false),
            replaced: Mutex::new(Vec::new()),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(ChannelHandle::new(link, rx))
    }
}

#[async_trait]
impl CallChannel for FakeChannel {
    async fn place(&self, remote_id: &str, _local: &MediaStream) -> Result<ChannelHandle, ChannelError> {
        self.placed.lock().push(remote_id.to_string());
        self.open(remote_id, "")
    }

    async fn answer(&self, offer: &CallOffer, _local: &MediaStream) -> Result<ChannelHandle, ChannelError> {
        self.open(&offer.remote_id, &offer.call_id)
    }
}
