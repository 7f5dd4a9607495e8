//! Endpoint Registry
//!
//! Vergibt die eigene Peer-ID und liefert eingehende Anrufe.
//! Die Standard-Implementierung ist der WebSocket `SignalingClient`.

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::{ClientMessage, ServerMessage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub type RegistryError = SignalingError;

/// Ein eingehendes Anruf-Angebot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOffer {
    /// Peer-ID des Anrufers
    pub remote_id: String,
    /// Kennung des Verbindungsversuchs
    pub call_id: String,
    /// SDP Offer
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl CallOffer {
    pub fn new(remote_id: impl Into<String>, call_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            call_id: call_id.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Eigene Peer-ID, kommt genau einmal und immer zuerst
    Assigned(String),
    IncomingCall(CallOffer),
    /// Verbindung zur Registry verloren
    Disconnected,
}

/// Registrierung beim Vermittlungsdienst
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Registriert den Endpunkt. Das erste Event ist immer `Assigned`.
    async fn open(&self) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError>;

    /// Lehnt ein Angebot ab, ohne eine Verbindung aufzubauen
    async fn reject(&self, offer: &CallOffer, reason: &str) -> Result<(), RegistryError>;

    async fn close(&self);
}
