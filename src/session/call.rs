//! Call Session
//!
//! Zustandsautomat eines einzelnen Anrufs:
//!
//! ```text
//! Idle ──place──▶ Placing ───remote stream──▶ Connected ──▶ Closed
//! Idle ──answer─▶ Answering ─remote stream──▶ Connected ──▶ Closed
//! ```
//!
//! `Closed` ist endgültig, ein neuer Anruf braucht eine neue Session.
//! Jede Transition wird geprüft; Ereignisse für eine geschlossene Session
//! liefern `SessionError::StaleEvent`.

use crate::channel::{CallChannel, ChannelEvent, ChannelLink};
use crate::media::MediaStream;
use crate::registry::CallOffer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No local media available")]
    NoLocalMedia,

    #[error("Invalid call target")]
    InvalidTarget,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Event for a closed session")]
    StaleEvent,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Cannot {action} in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: CallState,
    },
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Noch nichts passiert
    Idle,
    /// Ausgehender Anruf wird aufgebaut
    Placing,
    /// Eingehender Anruf wird angenommen
    Answering,
    /// Medien des Peers sind da
    Connected,
    /// Anruf beendet
    Closed,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Placing => "placing",
            CallState::Answering => "answering",
            CallState::Connected => "connected",
            CallState::Closed => "closed",
        }
    }

    fn is_live(self) -> bool {
        matches!(
            self,
            CallState::Placing | CallState::Answering | CallState::Connected
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Warum eine Session geschlossen wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LocalHangup,
    RemoteHangup,
    Rejected(Option<String>),
    TransportFailure(String),
    /// Eigener Anruf zugunsten des gleichzeitigen Anrufs der Gegenseite aufgegeben
    Yielded,
}

/// Identität einer Session, an der späte Ereignisse erkannt werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    id: SessionId,
    direction: Option<Direction>,
    remote_id: Option<String>,
    state: CallState,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    link: Option<Arc<dyn ChannelLink>>,
    started_at: DateTime<Utc>,
    close_reason: Option<CloseReason>,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            id: SessionId(Uuid::new_v4()),
            direction: None,
            remote_id: None,
            state: CallState::Idle,
            local_stream: None,
            remote_stream: None,
            link: None,
            started_at: Utc::now(),
            close_reason: None,
        }
    }

    /// Startet einen ausgehenden Anruf.
    ///
    /// Validierungsfehler lassen die Session in `Idle` und erreichen den
    /// Channel nie. Schlägt der Aufbau fehl, ist die Session `Closed`.
    pub async fn place(
        &mut self,
        channel: &dyn CallChannel,
        remote_id: &str,
        local: Option<&MediaStream>,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, SessionError> {
        self.expect(CallState::Idle, "place")?;
        let local = local.ok_or(SessionError::NoLocalMedia)?;
        let remote_id = remote_id.trim();
        if remote_id.is_empty() {
            return Err(SessionError::InvalidTarget);
        }

        self.begin(Direction::Outbound, remote_id, local, CallState::Placing);

        match channel.place(remote_id, local).await {
            Ok(handle) => {
                let (link, events) = handle.into_parts();
                self.link = Some(link);
                Ok(events)
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Nimmt ein eingehendes Angebot an
    pub async fn answer(
        &mut self,
        channel: &dyn CallChannel,
        offer: &CallOffer,
        local: Option<&MediaStream>,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, SessionError> {
        self.expect(CallState::Idle, "answer")?;
        let local = local.ok_or(SessionError::NoLocalMedia)?;

        self.begin(Direction::Inbound, &offer.remote_id, local, CallState::Answering);

        match channel.answer(offer, local).await {
            Ok(handle) => {
                let (link, events) = handle.into_parts();
                self.link = Some(link);
                Ok(events)
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    /// Remote-Stream ist angekommen
    pub fn on_remote_stream(&mut self, stream: MediaStream) -> Result<(), SessionError> {
        match self.state {
            CallState::Placing | CallState::Answering => {
                tracing::info!("Session {} connected", self.id);
                self.state = CallState::Connected;
                self.remote_stream = Some(stream);
                Ok(())
            }
            CallState::Connected => {
                self.remote_stream = Some(stream);
                Ok(())
            }
            CallState::Closed => Err(SessionError::StaleEvent),
            state => Err(SessionError::InvalidTransition {
                action: "receive remote stream",
                state,
            }),
        }
    }

    /// Die Gegenseite hat aufgelegt
    pub async fn on_remote_closed(&mut self) -> Result<(), SessionError> {
        self.expect_live("close")?;
        self.close(CloseReason::RemoteHangup).await;
        Ok(())
    }

    /// Die Gegenseite hat abgelehnt
    pub async fn on_rejected(&mut self, reason: Option<String>) -> Result<(), SessionError> {
        match self.state {
            CallState::Placing => {
                self.close(CloseReason::Rejected(reason)).await;
                Ok(())
            }
            CallState::Closed => Err(SessionError::StaleEvent),
            state => Err(SessionError::InvalidTransition {
                action: "be rejected",
                state,
            }),
        }
    }

    /// Transportfehler. Gibt den Fehler zurück, der gemeldet werden soll.
    pub async fn on_channel_error(&mut self, message: &str) -> SessionError {
        if let Err(e) = self.expect_live("fail") {
            return e;
        }
        let link = self.finish(CloseReason::TransportFailure(message.to_string()));
        if let Some(link) = link {
            link.close().await;
        }
        SessionError::TransportFailure(message.to_string())
    }

    /// Legt auf. Auf einer geschlossenen Session ein No-Op.
    pub async fn hang_up(&mut self) -> Result<(), SessionError> {
        match self.state {
            CallState::Closed => Ok(()),
            CallState::Idle => Err(SessionError::InvalidTransition {
                action: "hang up",
                state: CallState::Idle,
            }),
            _ => {
                self.close(CloseReason::LocalHangup).await;
                Ok(())
            }
        }
    }

    /// Gibt einen ausgehenden Versuch auf (gleichzeitiger Anruf der Gegenseite)
    pub async fn abandon(&mut self) -> Result<(), SessionError> {
        self.expect(CallState::Placing, "abandon")?;
        self.close(CloseReason::Yielded).await;
        Ok(())
    }

    /// Schickt einen neuen lokalen Stream über die bestehende Verbindung
    pub async fn renegotiate(&mut self, stream: &MediaStream) -> Result<(), SessionError> {
        self.expect_live("renegotiate")?;
        let link = self.link.as_ref().ok_or(SessionError::InvalidTransition {
            action: "renegotiate",
            state: self.state,
        })?;

        link.replace_outbound(stream)
            .await
            .map_err(|e| SessionError::TransportFailure(e.to_string()))?;
        self.local_stream = Some(stream.clone());
        tracing::info!("Session {} now sending stream {}", self.id, stream.id());
        Ok(())
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// `Placing`, `Answering` oder `Connected`
    pub fn is_active(&self) -> bool {
        self.state.is_live()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn expect(&self, expected: CallState, action: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }

    fn expect_live(&self, action: &'static str) -> Result<(), SessionError> {
        match self.state {
            CallState::Closed => Err(SessionError::StaleEvent),
            CallState::Idle => Err(SessionError::InvalidTransition {
                action,
                state: CallState::Idle,
            }),
            _ => Ok(()),
        }
    }

    fn begin(&mut self, direction: Direction, remote_id: &str, local: &MediaStream, state: CallState) {
        self.direction = Some(direction);
        self.remote_id = Some(remote_id.to_string());
        self.local_stream = Some(local.clone());
        self.state = state;
        self.started_at = Utc::now();
        tracing::info!("Session {} {:?} call with {}", self.id, direction, remote_id);
    }

    /// Aufbau fehlgeschlagen, ohne Link
    fn fail(&mut self, message: String) -> SessionError {
        tracing::error!("Session {} transport failure: {}", self.id, message);
        self.finish(CloseReason::TransportFailure(message.clone()));
        SessionError::TransportFailure(message)
    }

    async fn close(&mut self, reason: CloseReason) {
        if let Some(link) = self.finish(reason) {
            link.close().await;
        }
    }

    /// Setzt `Closed` und gibt den Link zum Schließen heraus
    fn finish(&mut self, reason: CloseReason) -> Option<Arc<dyn ChannelLink>> {
        tracing::info!("Session {} closed: {:?}", self.id, reason);
        self.state = CallState::Closed;
        self.close_reason = Some(reason);
        self.remote_stream = None;
        self.local_stream = None;
        self.link.take()
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("close_reason", &self.close_reason)
            .finish()
    }
}
