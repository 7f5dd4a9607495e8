//! Call Channel
//!
//! Baut die Medienverbindung zu genau einem Peer auf. Jeder Versuch liefert
//! einen `ChannelHandle`: den Link zum Steuern und einen Event-Kanal, über
//! den Remote-Stream, Ablehnung und Verbindungsende gemeldet werden.

mod rtc;

pub use rtc::{ice_servers, WebRtcChannel};

use crate::media::MediaStream;
use crate::registry::CallOffer;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Channel closed")]
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Ereignisse eines einzelnen Verbindungsversuchs
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Medien des Peers sind da (höchstens einmal pro Versuch)
    RemoteStream(MediaStream),

    /// Der Peer hat abgelehnt
    Rejected(Option<String>),

    /// Der Peer hat aufgelegt oder die Verbindung ist weg
    Closed,

    /// Transportfehler
    Error(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Steuerung einer bestehenden Verbindung
#[async_trait]
pub trait ChannelLink: Send + Sync {
    fn remote_id(&self) -> &str;

    /// Tauscht die ausgehenden Tracks gegen die von `local`
    async fn replace_outbound(&self, local: &MediaStream) -> Result<(), ChannelError>;

    /// Schließt die Verbindung. Mehrfaches Aufrufen ist unkritisch.
    async fn close(&self);
}

/// Aufbau von Verbindungen
#[async_trait]
pub trait CallChannel: Send + Sync {
    /// Ruft `remote_id` an und sendet `local`
    async fn place(&self, remote_id: &str, local: &MediaStream)
        -> Result<ChannelHandle, ChannelError>;

    /// Nimmt ein Angebot an und sendet `local`
    async fn answer(&self, offer: &CallOffer, local: &MediaStream)
        -> Result<ChannelHandle, ChannelError>;
}

/// Ergebnis eines Verbindungsaufbaus
pub struct ChannelHandle {
    pub link: Arc<dyn ChannelLink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelHandle {
    pub fn new(link: Arc<dyn ChannelLink>, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { link, events }
    }

    pub fn into_parts(self) -> (Arc<dyn ChannelLink>, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.link, self.events)
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("remote_id", &self.link.remote_id())
            .finish()
    }
}
