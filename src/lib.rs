//! Peer Call - P2P Audio/Video Call Engine
//!
//! Eine einzelne Audio/Video-Verbindung zwischen zwei Endpunkten mit:
//! - WebSocket Signaling-Server für Peer-ID und Anruf-Vermittlung
//! - WebRTC für die Medienverbindung
//! - Kamera/Mikrofon oder Bildschirmfreigabe als lokale Quelle
//! - Explizitem Zustandsautomaten pro Anruf

pub mod channel;
pub mod config;
pub mod media;
pub mod registry;
pub mod render;
pub mod session;

#[cfg(test)]
mod testing;

use channel::WebRtcChannel;
use config::CallConfig;
use media::CaptureDevices;
use registry::{SignalingClient, SignalingError};
use render::Renderer;
use session::SessionController;
use std::sync::Arc;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging. `RUST_LOG` hat Vorrang vor den Defaults.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peer_call=debug,webrtc=warn"));

    // Ein zweiter Aufruf (z.B. in Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// WIRING
// ============================================================================

/// Baut einen Controller mit Signaling-Server und WebRTC.
///
/// Muss innerhalb einer Tokio-Runtime aufgerufen werden. Verbunden wird erst
/// mit `SessionController::start()`.
pub fn connect(
    config: &CallConfig,
    devices: Arc<dyn CaptureDevices>,
    renderer: Renderer,
) -> Result<SessionController, SignalingError> {
    tracing::info!("Signaling server: {}", config.signaling_url);

    let signaling = Arc::new(SignalingClient::new(config)?);
    let channel = Arc::new(WebRtcChannel::new(Arc::clone(&signaling), config));

    Ok(SessionController::new(signaling, channel, devices, renderer))
}
