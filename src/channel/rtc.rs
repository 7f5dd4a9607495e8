//! WebRTC Call Channel
//!
//! Eine `RTCPeerConnection` pro Verbindungsversuch. SDP und ICE Candidates
//! laufen über den `SignalingClient`, zugeordnet über die `callId`.
//!
//! Audio wird als PCMU (8 kHz) gesendet, Video als H.264. Jede Verbindung hat
//! dauerhaft einen Audio- und einen Video-Sender; beim Quellenwechsel wird
//! nur umgehängt, welcher lokale Track in welchen Sender gepumpt wird.

use super::{CallChannel, ChannelError, ChannelEvent, ChannelHandle, ChannelLink};
use crate::config::CallConfig;
use crate::media::{microphone, MediaFrame, MediaStream, MediaTrack, TrackKind};
use crate::registry::{CallOffer, SignalingClient, SignalingError, SignalingEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Wie lange ICE Candidates ohne zugehörige Verbindung aufbewahrt werden
const PENDING_CANDIDATE_TTL: Duration = Duration::from_secs(30);

/// Stream-ID der lokalen Tracks im SDP
const STREAM_ID: &str = "peer-call";

fn webrtc_err(e: webrtc::Error) -> ChannelError {
    ChannelError::WebRtc(e.to_string())
}

fn signaling_err(e: SignalingError) -> ChannelError {
    ChannelError::Signaling(e.to_string())
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server aus der Konfiguration
pub fn ice_servers(config: &CallConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    if !config.stun_servers.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }

    if let Some(turn) = &config.turn_server {
        servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

/// Constrained Baseline, wie ihn openh264 erzeugt
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: microphone::SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            sdp_fmtp_line: H264_FMTP.to_owned(),
            ..Default::default()
        },
    }
}

/// Dauer eines empfangenen Payloads (nur für PCMU bekannt: 1 Byte pro Sample)
fn remote_frame_duration(kind: TrackKind, payload_len: usize) -> Duration {
    match kind {
        TrackKind::Audio => {
            Duration::from_micros(payload_len as u64 * 1_000_000 / microphone::SAMPLE_RATE as u64)
        }
        TrackKind::Video => Duration::ZERO,
    }
}

// ============================================================================
// LINK TABLE
// ============================================================================

struct PendingCandidates {
    since: Instant,
    candidates: Vec<String>,
}

/// Aktive Verbindungen und früh eingetroffene Candidates, beides per callId
#[derive(Default)]
struct LinkTable {
    links: HashMap<String, Arc<RtcLink>>,
    pending: HashMap<String, PendingCandidates>,
}

impl LinkTable {
    /// Parkt einen Candidate, bis die Verbindung eingetragen ist.
    /// Verwaiste Einträge älter als die TTL fallen dabei raus.
    fn park_candidate(&mut self, now: Instant, call_id: String, candidate: String) {
        self.pending
            .retain(|_, p| now.duration_since(p.since) < PENDING_CANDIDATE_TTL);
        self.pending
            .entry(call_id)
            .or_insert_with(|| PendingCandidates {
                since: now,
                candidates: Vec::new(),
            })
            .candidates
            .push(candidate);
    }
}

// ============================================================================
// RTC LINK
// ============================================================================

#[derive(Default)]
struct CandidateQueue {
    remote_described: bool,
    queued: Vec<String>,
}

/// Ein lokaler Sender: der Sample-Track und ob gerade gesendet wird
struct Outbound {
    sender: Arc<RTCRtpSender>,
    track: Arc<TrackLocalStaticSample>,
    active: bool,
}

/// Eine Peer Connection zu einem Peer
struct RtcLink {
    call_id: String,
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<SignalingClient>,
    table: Weak<Mutex<LinkTable>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    remote_stream: MediaStream,
    announced: AtomicBool,
    closed: AtomicBool,
    candidates: Mutex<CandidateQueue>,
    outbound: tokio::sync::Mutex<HashMap<TrackKind, Outbound>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcLink {
    /// Registriert die Event Handler der Peer Connection
    fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(link) = weak.upgrade() else {
                        return;
                    };
                    tracing::info!("Peer connection state ({}): {:?}", link.call_id, s);

                    let event = match s {
                        // Remote-Tracks können später kommen, z.B. wenn der
                        // Peer noch keine Medien sendet
                        RTCPeerConnectionState::Connected => {
                            link.announce();
                            return;
                        }
                        RTCPeerConnectionState::Failed => {
                            ChannelEvent::Error("Peer connection failed".to_string())
                        }
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                            ChannelEvent::Closed
                        }
                        _ => return,
                    };
                    // Schließen nicht aus dem Handler der Connection heraus
                    tokio::spawn(async move { link.finish(event).await });
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(link), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    let json = match candidate.to_json() {
                        Ok(init) => serde_json::to_string(&init),
                        Err(e) => {
                            tracing::warn!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };
                    let Ok(json) = json else {
                        return;
                    };
                    if let Err(e) = link.signaling.send_ice_candidate_sync(
                        link.remote_id.clone(),
                        link.call_id.clone(),
                        json,
                    ) {
                        tracing::warn!("Failed to send ICE candidate: {}", e);
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _, _| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(link) = weak.upgrade() {
                    link.attach_remote_track(track);
                }
            })
        }));
    }

    /// Legt je einen Audio- und Video-Sender an
    async fn add_senders(&self) -> Result<(), ChannelError> {
        let mut outbound = self.outbound.lock().await;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let label = match kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(kind),
                label.to_string(),
                STREAM_ID.to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;

            // RTCP lesen, sonst laufen die Interceptors nicht
            let rtcp_sender = Arc::clone(&sender);
            self.readers.lock().push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp_sender.read(&mut buf).await.is_ok() {}
            }));

            outbound.insert(
                kind,
                Outbound {
                    sender,
                    track,
                    active: true,
                },
            );
        }
        Ok(())
    }

    /// Pumpt die Tracks von `local` in die Sender
    async fn attach_outbound(&self, local: &MediaStream) -> Result<(), ChannelError> {
        let stale = std::mem::take(&mut *self.pumps.lock());
        for pump in stale {
            pump.abort();
        }

        let mut outbound = self.outbound.lock().await;
        for (kind, out) in outbound.iter_mut() {
            match local.tracks_of(*kind).into_iter().next() {
                Some(track) => {
                    if !out.active {
                        out.sender
                            .replace_track(Some(
                                Arc::clone(&out.track) as Arc<dyn TrackLocal + Send + Sync>
                            ))
                            .await
                            .map_err(webrtc_err)?;
                        out.active = true;
                    }
                    let pump = spawn_pump(track, Arc::clone(&out.track));
                    self.pumps.lock().push(pump);
                }
                None => {
                    if out.active {
                        out.sender.replace_track(None).await.map_err(webrtc_err)?;
                        out.active = false;
                    }
                    tracing::debug!("No local {:?} track, sender idle", kind);
                }
            }
        }
        Ok(())
    }

    fn attach_remote_track(&self, remote: Arc<TrackRemote>) {
        let kind = match remote.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return,
        };
        tracing::info!("Received remote {:?} track: {:?}", kind, remote.codec());

        let track = MediaTrack::new(kind, format!("remote-{}", remote.id()));
        self.remote_stream.add_track(track.clone());

        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = remote.read_rtp().await {
                if track.is_stopped() {
                    break;
                }
                let duration = remote_frame_duration(kind, packet.payload.len());
                track.push_frame(MediaFrame {
                    data: packet.payload.to_vec(),
                    duration,
                });
            }
        });
        self.readers.lock().push(reader);
        self.announce();
    }

    /// Meldet den Remote-Stream einmalig, sobald Medien fließen können
    fn announce(&self) {
        if self.closed.load(Ordering::SeqCst) || self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .events
            .send(ChannelEvent::RemoteStream(self.remote_stream.clone()));
    }

    /// Setzt das SDP Answer des Peers
    async fn apply_answer(&self, sdp: String) -> Result<(), ChannelError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| ChannelError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)?;
        self.flush_candidates().await;
        Ok(())
    }

    /// Remote Description ist gesetzt, gepufferte Candidates anwenden
    async fn flush_candidates(&self) {
        let queued = {
            let mut queue = self.candidates.lock();
            queue.remote_described = true;
            std::mem::take(&mut queue.queued)
        };
        for candidate in queued {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn add_remote_candidate(&self, candidate: String) {
        {
            let mut queue = self.candidates.lock();
            if !queue.remote_described {
                queue.queued.push(candidate);
                return;
            }
        }
        self.apply_candidate(&candidate).await;
    }

    async fn apply_candidate(&self, candidate: &str) {
        let init: RTCIceCandidateInit = match serde_json::from_str(candidate) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!("Ignoring malformed ICE candidate: {}", e);
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    /// Beendet die Verbindung aufgrund eines Remote-Ereignisses
    async fn finish(&self, event: ChannelEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unregister();
        let _ = self.events.send(event);
        self.shutdown().await;
    }

    /// Verwirft einen fehlgeschlagenen Aufbau ohne Events
    async fn discard(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unregister();
        self.shutdown().await;
    }

    fn unregister(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.lock();
        let ours = table
            .links
            .get(&self.call_id)
            .is_some_and(|link| std::ptr::eq(Arc::as_ptr(link), self));
        if ours {
            table.links.remove(&self.call_id);
        }
    }

    async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.pumps.lock());
        tasks.append(&mut self.readers.lock());
        for task in tasks {
            task.abort();
        }
        self.remote_stream.stop();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        tracing::debug!("Link {} to {} shut down", self.call_id, self.remote_id);
    }
}

#[async_trait]
impl ChannelLink for RtcLink {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn replace_outbound(&self, local: &MediaStream) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.attach_outbound(local).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unregister();
        if let Err(e) = self
            .signaling
            .hangup(self.remote_id.clone(), self.call_id.clone())
            .await
        {
            tracing::warn!("Failed to send hangup: {}", e);
        }
        self.shutdown().await;
    }
}

/// Schreibt die Frames eines lokalen Tracks in einen Sample-Track
fn spawn_pump(track: MediaTrack, sample_track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut frames = track.subscribe();
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let sample = Sample {
                        data: frame.data.into(),
                        duration: frame.duration,
                        ..Default::default()
                    };
                    if let Err(e) = sample_track.write_sample(&sample).await {
                        tracing::debug!("Failed to write sample: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Outbound {} lagged, {} frames skipped", track.label(), skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// WEBRTC CHANNEL
// ============================================================================

/// `CallChannel` auf Basis von webrtc-rs
pub struct WebRtcChannel {
    signaling: Arc<SignalingClient>,
    ice_servers: Vec<RTCIceServer>,
    table: Arc<Mutex<LinkTable>>,
    dispatcher: JoinHandle<()>,
}

impl WebRtcChannel {
    /// Erstellt den Channel. Muss innerhalb einer Tokio-Runtime laufen.
    pub fn new(signaling: Arc<SignalingClient>, config: &CallConfig) -> Self {
        let table = Arc::new(Mutex::new(LinkTable::default()));
        let dispatcher = tokio::spawn(Self::dispatch(signaling.subscribe(), Arc::clone(&table)));

        Self {
            signaling,
            ice_servers: ice_servers(config),
            table,
            dispatcher,
        }
    }

    /// Verteilt Signaling-Nachrichten an die passende Verbindung
    async fn dispatch(
        mut events: broadcast::Receiver<SignalingEvent>,
        table: Arc<Mutex<LinkTable>>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Signaling events lagged, {} skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                SignalingEvent::AnswerReceived { call_id, sdp, .. } => {
                    let link = table.lock().links.get(&call_id).cloned();
                    match link {
                        Some(link) => {
                            if let Err(e) = link.apply_answer(sdp).await {
                                tracing::error!("Failed to apply answer for {}: {}", call_id, e);
                                link.finish(ChannelEvent::Error(e.to_string())).await;
                            }
                        }
                        None => tracing::debug!("Answer for unknown call {}", call_id),
                    }
                }

                SignalingEvent::IceCandidateReceived {
                    call_id, candidate, ..
                } => {
                    let link = {
                        let mut table = table.lock();
                        let link = table.links.get(&call_id).cloned();
                        if link.is_none() {
                            table.park_candidate(Instant::now(), call_id.clone(), candidate.clone());
                        }
                        link
                    };
                    if let Some(link) = link {
                        link.add_remote_candidate(candidate).await;
                    }
                }

                SignalingEvent::CallRejected {
                    call_id, reason, ..
                } => {
                    if let Some(link) = Self::take(&table, &call_id) {
                        link.finish(ChannelEvent::Rejected(reason)).await;
                    }
                }

                SignalingEvent::CallEnded { call_id, .. } => {
                    if let Some(link) = Self::take(&table, &call_id) {
                        link.finish(ChannelEvent::Closed).await;
                    }
                }

                _ => {}
            }
        }
    }

    fn take(table: &Mutex<LinkTable>, call_id: &str) -> Option<Arc<RtcLink>> {
        let mut table = table.lock();
        table.pending.remove(call_id);
        table.links.remove(call_id)
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, ChannelError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(Arc::new(
            api.new_peer_connection(config).await.map_err(webrtc_err)?,
        ))
    }

    /// Baut eine Verbindung auf und trägt sie unter `call_id` ein
    async fn open_link(
        &self,
        remote_id: &str,
        call_id: &str,
    ) -> Result<(Arc<RtcLink>, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let pc = self.create_peer_connection().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let link = Arc::new(RtcLink {
            call_id: call_id.to_string(),
            remote_id: remote_id.to_string(),
            pc,
            signaling: Arc::clone(&self.signaling),
            table: Arc::downgrade(&self.table),
            events: events_tx,
            remote_stream: MediaStream::empty(),
            announced: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            candidates: Mutex::new(CandidateQueue::default()),
            outbound: tokio::sync::Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
        });
        link.install_handlers();

        let duplicate = {
            let mut table = self.table.lock();
            if table.links.contains_key(call_id) {
                true
            } else {
                let parked = table
                    .pending
                    .remove(call_id)
                    .map(|p| p.candidates)
                    .unwrap_or_default();
                link.candidates.lock().queued.extend(parked);
                table.links.insert(call_id.to_string(), Arc::clone(&link));
                false
            }
        };
        if duplicate {
            link.discard().await;
            return Err(ChannelError::WebRtc(format!("Call {} already in progress", call_id)));
        }

        if let Err(e) = link.add_senders().await {
            link.discard().await;
            return Err(e);
        }

        Ok((link, events_rx))
    }
}

#[async_trait]
impl CallChannel for WebRtcChannel {
    async fn place(
        &self,
        remote_id: &str,
        local: &MediaStream,
    ) -> Result<ChannelHandle, ChannelError> {
        let call_id = Uuid::new_v4().to_string();
        tracing::info!("Placing call {} to {}", call_id, remote_id);

        let (link, events) = self.open_link(remote_id, &call_id).await?;

        let setup = async {
            link.attach_outbound(local).await?;
            let offer = link.pc.create_offer(None).await.map_err(webrtc_err)?;
            link.pc
                .set_local_description(offer.clone())
                .await
                .map_err(webrtc_err)?;
            self.signaling
                .send_offer(remote_id.to_string(), call_id.clone(), offer.sdp)
                .await
                .map_err(signaling_err)
        };

        if let Err(e) = setup.await {
            link.discard().await;
            return Err(e);
        }

        Ok(ChannelHandle::new(link, events))
    }

    async fn answer(
        &self,
        offer: &CallOffer,
        local: &MediaStream,
    ) -> Result<ChannelHandle, ChannelError> {
        tracing::info!("Answering call {} from {}", offer.call_id, offer.remote_id);

        let (link, events) = self.open_link(&offer.remote_id, &offer.call_id).await?;

        let setup = async {
            let remote = RTCSessionDescription::offer(offer.payload.clone())
                .map_err(|e| ChannelError::InvalidSdp(e.to_string()))?;
            link.pc
                .set_remote_description(remote)
                .await
                .map_err(webrtc_err)?;
            link.attach_outbound(local).await?;

            let answer = link.pc.create_answer(None).await.map_err(webrtc_err)?;
            link.pc
                .set_local_description(answer.clone())
                .await
                .map_err(webrtc_err)?;
            link.flush_candidates().await;

            self.signaling
                .send_answer(offer.remote_id.clone(), offer.call_id.clone(), answer.sdp)
                .await
                .map_err(signaling_err)
        };

        if let Err(e) = setup.await {
            link.discard().await;
            return Err(e);
        }

        Ok(ChannelHandle::new(link, events))
    }
}

impl Drop for WebRtcChannel {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("links", &self.table.lock().links.len())
            .finish()
    }
}
