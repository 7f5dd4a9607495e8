//! Session Controller
//!
//! Verbindet MediaSource, EndpointRegistry und CallChannel zu genau einer
//! aktiven CallSession. Alle Zustandsänderungen laufen über `&mut self`
//! innerhalb von `run()`; Hilfs-Tasks leiten Channel-Events nur in die
//! Inbox weiter, markiert mit der `SessionId` ihrer Session.

use super::call::{CallSession, CallState, Direction, SessionError, SessionId};
use crate::channel::{CallChannel, ChannelError, ChannelEvent};
use crate::media::{CaptureDevices, MediaError, MediaSource, MediaStream, SourceKind};
use crate::registry::{CallOffer, EndpointRegistry, RegistryError, RegistryEvent};
use crate::render::Renderer;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Ablehnungsgrund bei laufendem Anruf
pub const REJECT_BUSY: &str = "busy";

/// Ablehnungsgrund solange keine lokalen Medien bereit sind
pub const REJECT_MEDIA_UNAVAILABLE: &str = "media-unavailable";

/// Ablehnungsgrund, wenn die Verbindung zum Anrufer nicht aufgebaut werden kann
pub const REJECT_FAILED: &str = "answer-failed";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ============================================================================
// COMMANDS & EVENTS
// ============================================================================

/// Befehle der Bedienoberfläche
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    ToggleMute,
    ToggleVideo,
    ShareScreen,
    ShareCamera,
    HangUp,
    /// Auflegen und lokale Medien freigeben
    Leave,
    RetryMedia,
}

/// Beobachtbarer Zustand für die Oberfläche
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub my_id: Option<String>,
    pub muted: bool,
    pub video_enabled: bool,
    pub active_kind: SourceKind,
    pub call_state: CallState,
    pub remote_id: Option<String>,
    /// Ohne lokale Medien sind keine Anrufe möglich
    pub media_ready: bool,
}

impl ControllerState {
    pub fn mute_label(&self) -> &'static str {
        if self.muted {
            "Unmute"
        } else {
            "Mute"
        }
    }

    pub fn video_label(&self) -> &'static str {
        if self.video_enabled {
            "Disable Video"
        } else {
            "Enable Video"
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    /// Meldung für den Benutzer
    Notice(String),
}

/// Channel-Event mit der Session, aus der es stammt
#[derive(Debug)]
struct SessionEnvelope {
    session: SessionId,
    event: ChannelEvent,
}

/// Ergebnis eines angewendeten Channel-Events
enum Applied {
    RemoteBound(MediaStream),
    Ended(String),
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

pub struct SessionController {
    registry: Arc<dyn EndpointRegistry>,
    channel: Arc<dyn CallChannel>,
    media: MediaSource,
    renderer: Renderer,
    session: Option<CallSession>,
    my_id: Option<String>,
    registry_events: Option<mpsc::Receiver<RegistryEvent>>,
    inbox_tx: mpsc::UnboundedSender<SessionEnvelope>,
    inbox_rx: mpsc::UnboundedReceiver<SessionEnvelope>,
    event_tx: broadcast::Sender<ControllerEvent>,
    torn_down: bool,
}

impl SessionController {
    pub fn new(
        registry: Arc<dyn EndpointRegistry>,
        channel: Arc<dyn CallChannel>,
        devices: Arc<dyn CaptureDevices>,
        renderer: Renderer,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);

        Self {
            registry,
            channel,
            media: MediaSource::new(devices, Arc::clone(&renderer.local)),
            renderer,
            session: None,
            my_id: None,
            registry_events: None,
            inbox_tx,
            inbox_rx,
            event_tx,
            torn_down: false,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        ControllerState {
            my_id: self.my_id.clone(),
            muted: self.media.muted(),
            video_enabled: self.media.video_enabled(),
            active_kind: self.media.active_kind(),
            call_state: self.call_state(),
            remote_id: self
                .session
                .as_ref()
                .and_then(|s| s.remote_id())
                .map(str::to_string),
            media_ready: self.media.stream().is_some(),
        }
    }

    pub fn call_state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(CallState::Idle)
    }

    pub fn my_id(&self) -> Option<&str> {
        self.my_id.as_deref()
    }

    /// Registriert den Endpunkt und fordert die Kamera an.
    ///
    /// Ein Medienfehler wird gemeldet, ist aber nicht fatal: Anrufe sind
    /// bis `retry_media()` nicht möglich.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        let (opened, acquired) = tokio::join!(
            self.registry.open(),
            self.media.acquire(SourceKind::Camera)
        );

        if let Err(e) = acquired {
            tracing::warn!("Local media unavailable: {}", e);
            self.notice(format!("Camera unavailable: {}", e));
        }

        self.registry_events = Some(opened?);
        self.publish_state();
        Ok(())
    }

    /// Event-Loop: Registry, Channel-Events und Benutzerbefehle.
    ///
    /// Endet, wenn der Befehlskanal geschlossen wird, und räumt dann auf.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                event = next_registry_event(&mut self.registry_events) => match event {
                    Some(event) => self.handle_registry_event(event).await,
                    None => {
                        tracing::info!("Registry event stream ended");
                        self.registry_events = None;
                    }
                },
                Some(envelope) = self.inbox_rx.recv() => {
                    self.handle_channel_event(envelope).await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
            }
        }

        self.teardown().await;
    }

    /// Führt einen Befehl aus, Fehler werden als Notice gemeldet
    pub async fn execute(&mut self, command: Command) {
        tracing::debug!("Command: {:?}", command);

        let result = match command {
            Command::Call(remote_id) => self.call(&remote_id).await,
            Command::ToggleMute => self.toggle_mute(),
            Command::ToggleVideo => self.toggle_video(),
            Command::ShareScreen => self.share_screen().await,
            Command::ShareCamera => self.share_camera().await,
            Command::HangUp => self.hang_up().await,
            Command::Leave => self.leave().await,
            Command::RetryMedia => self.retry_media().await,
        };

        if let Err(e) = result {
            tracing::warn!("Command failed: {}", e);
            self.notice(e.to_string());
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Ruft einen Peer an
    pub async fn call(&mut self, remote_id: &str) -> Result<(), ControllerError> {
        if self.session.as_ref().is_some_and(|s| s.is_active()) {
            return Err(SessionError::AlreadyInCall.into());
        }

        let mut session = CallSession::new();
        let local = self.media.stream().cloned();

        match session
            .place(self.channel.as_ref(), remote_id, local.as_ref())
            .await
        {
            Ok(events) => {
                self.forward_events(session.id(), events);
                self.session = Some(session);
                self.publish_state();
                Ok(())
            }
            Err(e @ SessionError::TransportFailure(_)) => {
                self.session = Some(session);
                self.publish_state();
                Err(e.into())
            }
            // Validierungsfehler, Zustand unverändert
            Err(e) => Err(e.into()),
        }
    }

    pub fn toggle_mute(&mut self) -> Result<(), ControllerError> {
        let muted = !self.media.muted();
        self.media.set_muted(muted)?;
        self.publish_state();
        Ok(())
    }

    pub fn toggle_video(&mut self) -> Result<(), ControllerError> {
        let enabled = !self.media.video_enabled();
        self.media.set_video_enabled(enabled)?;
        self.publish_state();
        Ok(())
    }

    pub async fn share_screen(&mut self) -> Result<(), ControllerError> {
        self.switch_source(SourceKind::Screen).await
    }

    pub async fn share_camera(&mut self) -> Result<(), ControllerError> {
        self.switch_source(SourceKind::Camera).await
    }

    /// Legt auf, die lokalen Medien bleiben aktiv
    pub async fn hang_up(&mut self) -> Result<(), ControllerError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.is_active())
            .ok_or(SessionError::NoActiveCall)?;

        session.hang_up().await?;
        self.renderer.remote.bind(None);
        self.publish_state();
        Ok(())
    }

    /// Verlässt den Anruf ganz und gibt Kamera/Bildschirm frei
    pub async fn leave(&mut self) -> Result<(), ControllerError> {
        let result = self.hang_up().await;
        self.media.release();
        self.publish_state();

        match result {
            Err(ControllerError::Session(SessionError::NoActiveCall)) => Ok(()),
            other => other,
        }
    }

    /// Fordert die lokalen Medien erneut an
    pub async fn retry_media(&mut self) -> Result<(), ControllerError> {
        if self.media.stream().is_some() {
            return Ok(());
        }
        let kind = self.media.active_kind();
        self.media.acquire(kind).await?;
        self.publish_state();
        Ok(())
    }

    /// Räumt alles auf. Mehrfaches Aufrufen ist unkritisch.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.hang_up().await {
                tracing::debug!("Hang up during teardown: {}", e);
            }
        }
        self.registry.close().await;
        self.registry_events = None;
        self.media.release();
        self.renderer.remote.bind(None);

        tracing::info!("Session controller torn down");
        self.publish_state();
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    async fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Assigned(id) => {
                if id.trim().is_empty() {
                    tracing::warn!("Ignoring empty identity from registry");
                    return;
                }
                if let Some(current) = &self.my_id {
                    tracing::warn!("Ignoring second identity {} (keeping {})", id, current);
                    return;
                }
                tracing::info!("Assigned identity {}", id);
                self.my_id = Some(id);
                self.publish_state();
            }
            RegistryEvent::IncomingCall(offer) => self.handle_offer(offer).await,
            RegistryEvent::Disconnected => {
                tracing::warn!("Lost connection to registry");
                self.notice("Disconnected from signaling server".to_string());
            }
        }
    }

    async fn handle_offer(&mut self, offer: CallOffer) {
        tracing::info!("Incoming call {} from {}", offer.call_id, offer.remote_id);

        let glare = match self.session.as_ref() {
            Some(session) if session.is_active() => Some(self.yields_to(session, &offer)),
            _ => None,
        };

        match glare {
            Some(false) => {
                tracing::info!("Busy, rejecting call from {}", offer.remote_id);
                self.reject(&offer, REJECT_BUSY).await;
                return;
            }
            Some(true) => {
                tracing::info!("Simultaneous call with {}, yielding", offer.remote_id);
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.abandon().await {
                        tracing::warn!("Failed to abandon outbound call: {}", e);
                    }
                }
            }
            None => {}
        }

        let Some(local) = self.media.stream().cloned() else {
            tracing::warn!(
                "Dropping call from {}: local media not ready",
                offer.remote_id
            );
            self.reject(&offer, REJECT_MEDIA_UNAVAILABLE).await;
            return;
        };

        let mut session = CallSession::new();
        match session
            .answer(self.channel.as_ref(), &offer, Some(&local))
            .await
        {
            Ok(events) => {
                self.forward_events(session.id(), events);
                self.session = Some(session);
                self.notice(format!("Incoming call from {}", offer.remote_id));
            }
            Err(e) => {
                tracing::error!("Failed to answer call from {}: {}", offer.remote_id, e);
                self.reject(&offer, REJECT_FAILED).await;
                self.session = Some(session);
                self.notice(e.to_string());
            }
        }
        self.publish_state();
    }

    /// Gleichzeitiger Anruf: die kleinere ID gibt ihren Versuch auf
    fn yields_to(&self, session: &CallSession, offer: &CallOffer) -> bool {
        session.state() == CallState::Placing
            && session.direction() == Some(Direction::Outbound)
            && session.remote_id() == Some(offer.remote_id.as_str())
            && self
                .my_id
                .as_deref()
                .is_some_and(|me| me < offer.remote_id.as_str())
    }

    async fn handle_channel_event(&mut self, envelope: SessionEnvelope) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.id() == envelope.session)
        else {
            tracing::debug!(
                "Discarding {:?} for stale session {}",
                envelope.event,
                envelope.session
            );
            return;
        };

        let applied = match envelope.event {
            ChannelEvent::RemoteStream(stream) => session
                .on_remote_stream(stream.clone())
                .map(|_| Applied::RemoteBound(stream)),
            ChannelEvent::Rejected(reason) => {
                let message = match &reason {
                    Some(reason) => format!("Call rejected: {}", reason),
                    None => "Call rejected".to_string(),
                };
                session.on_rejected(reason).await.map(|_| Applied::Ended(message))
            }
            ChannelEvent::Closed => session
                .on_remote_closed()
                .await
                .map(|_| Applied::Ended("Call ended by remote peer".to_string())),
            ChannelEvent::Error(message) => Err(session.on_channel_error(&message).await),
        };

        match applied {
            Ok(Applied::RemoteBound(stream)) => self.renderer.remote.bind(Some(stream)),
            Ok(Applied::Ended(message)) => {
                self.renderer.remote.bind(None);
                self.notice(message);
            }
            Err(SessionError::StaleEvent) => {
                tracing::debug!("Discarding event for closed session {}", envelope.session);
                return;
            }
            Err(e @ SessionError::TransportFailure(_)) => {
                self.renderer.remote.bind(None);
                self.notice(e.to_string());
            }
            Err(e) => {
                tracing::warn!("Unexpected channel event: {}", e);
                return;
            }
        }
        self.publish_state();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn switch_source(&mut self, kind: SourceKind) -> Result<(), ControllerError> {
        let stream = match self.media.replace(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                // Gleiche Quelle: das alte Gerät ist bereits freigegeben
                if self.media.stream().is_none() {
                    self.drop_outbound().await;
                    self.publish_state();
                }
                return Err(e.into());
            }
        };

        if let Some(session) = self.session.as_mut().filter(|s| s.is_active()) {
            if let Err(e) = session.renegotiate(&stream).await {
                tracing::warn!("Renegotiation failed: {}", e);
                self.notice(format!("Could not update the call: {}", e));
            }
        }

        self.publish_state();
        Ok(())
    }

    /// Der laufende Anruf sendet nach einem Geräteverlust nichts mehr
    async fn drop_outbound(&mut self) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_active()) else {
            return;
        };
        if let Err(e) = session.renegotiate(&MediaStream::empty()).await {
            tracing::warn!("Failed to stop outbound media: {}", e);
        }
        self.notice("Local media lost, the call is no longer sending".to_string());
    }

    /// Leitet die Events eines Channels in die Inbox
    fn forward_events(&self, session: SessionId, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbox.send(SessionEnvelope { session, event }).is_err() {
                    break;
                }
            }
        });
    }

    async fn reject(&self, offer: &CallOffer, reason: &str) {
        if let Err(e) = self.registry.reject(offer, reason).await {
            tracing::warn!("Failed to reject call from {}: {}", offer.remote_id, e);
        }
    }

    fn notice(&self, message: String) {
        let _ = self.event_tx.send(ControllerEvent::Notice(message));
    }

    fn publish_state(&self) {
        let _ = self.event_tx.send(ControllerEvent::StateChanged(self.state()));
    }
}

async fn next_registry_event(
    events: &mut Option<mpsc::Receiver<RegistryEvent>>,
) -> Option<RegistryEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("session", &self.session)
            .finish()
    }
}
