//! Konfiguration
//!
//! Reihenfolge: eingebaute Defaults ← `config.json` im App-Konfigurations-
//! verzeichnis ← Umgebungsvariablen.
//!
//! - Linux: `~/.config/peer-call/config.json`
//! - macOS: `~/Library/Application Support/com.peer-call.peer-call/config.json`
//! - Windows: `%APPDATA%/peer-call/peer-call/config/config.json`

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Signaling-Server, falls nichts anderes konfiguriert ist
pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:8787";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ============================================================================
// CONFIG
// ============================================================================

/// TURN-Server Zugangsdaten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Laufzeit-Konfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Basis-URL des Signaling-Servers (http/https/ws/wss)
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    pub turn_server: Option<TurnServer>,
    pub registration_timeout_secs: u64,
    /// Idle-Timeout des Servers verlangt regelmäßige Heartbeats
    pub heartbeat_interval_secs: u64,
    /// V4L2-Gerät der Kamera (nur mit Feature `video-capture`)
    pub camera_device: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_server: None,
            registration_timeout_secs: 10,
            heartbeat_interval_secs: 25,
            camera_device: "/dev/video0".to_string(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.websocket_url()?;
        Ok(config)
    }

    /// Pfad der Konfigurationsdatei (falls ein Home-Verzeichnis existiert)
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "peer-call", "peer-call")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Überschreibt Werte aus Umgebungsvariablen
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(device) = lookup("PEER_CALL_CAMERA") {
            self.camera_device = device;
        }

        let turn = (
            lookup("PEER_CALL_TURN_URL"),
            lookup("PEER_CALL_TURN_USERNAME"),
            lookup("PEER_CALL_TURN_CREDENTIAL"),
        );
        if let (Some(url), Some(username), Some(credential)) = turn {
            self.turn_server = Some(TurnServer {
                url,
                username,
                credential,
            });
        }
    }

    /// WebSocket-Endpunkt des Signaling-Servers (`<base>/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.signaling_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot switch scheme".to_string()))?;

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_websocket_url_from_http() {
        let config = CallConfig {
            signaling_url: "https://signal.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://signal.example.com/ws"
        );

        let config = CallConfig::default();
        assert_eq!(config.websocket_url().unwrap().as_str(), "ws://127.0.0.1:8787/ws");
    }

    #[test]
    fn test_websocket_url_rejects_unknown_scheme() {
        let config = CallConfig {
            signaling_url: "ftp://signal.example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.websocket_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{ "signaling_url": "wss://signal.example.com" }"#).unwrap();
        assert_eq!(config.signaling_url, "wss://signal.example.com");
        assert_eq!(config.stun_servers.len(), 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.camera_device, "/dev/video0");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SIGNALING_URL", "wss://override.example.com"),
            ("PEER_CALL_TURN_URL", "turn:turn.example.com:3478"),
            ("PEER_CALL_TURN_USERNAME", "user"),
            ("PEER_CALL_TURN_CREDENTIAL", "secret"),
            ("PEER_CALL_CAMERA", "/dev/video2"),
        ]);

        let mut config = CallConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.signaling_url, "wss://override.example.com");
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(
            config.turn_server,
            Some(TurnServer {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            })
        );
    }

    #[test]
    fn test_incomplete_turn_env_is_ignored() {
        let mut config = CallConfig::default();
        config.apply_overrides(|key| {
            (key == "PEER_CALL_TURN_URL").then(|| "turn:turn.example.com".to_string())
        });
        assert!(config.turn_server.is_none());
    }
}
