//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung:
//! - Registrierung und Vergabe der Peer-ID
//! - Heartbeat-Keeping
//! - Weiterleitung von Offers, Answers, ICE Candidates und Hangups
//!   als `SignalingEvent`s

use super::messages::{ClientMessage, ServerMessage};
use super::{CallOffer, EndpointRegistry, RegistryEvent};
use crate::config::CallConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Puffergröße der internen Kanäle
const CHANNEL_CAPACITY: usize = 100;

/// Eigener, verlustfreier Kanal für `open()`: Identität, Angebote, Verbindungsende
type RegistryFeed = Arc<RwLock<Option<mpsc::Sender<RegistryEvent>>>>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid signaling configuration: {0}")]
    InvalidConfig(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Already connected to signaling server")]
    AlreadyConnected,

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Registrierung erfolgreich
    Registered { peer_id: String },

    /// Eingehender Anruf
    IncomingOffer {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// SDP Answer erhalten
    AnswerReceived {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// ICE Candidate erhalten
    IceCandidateReceived {
        from_peer_id: String,
        call_id: String,
        candidate: String,
    },

    /// Anruf abgelehnt
    CallRejected {
        by_peer_id: String,
        call_id: String,
        reason: Option<String>,
    },

    /// Anruf beendet
    CallEnded { by_peer_id: String, call_id: String },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    ws_url: Url,
    registration_timeout: Duration,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    registry_tx: RegistryFeed,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(config: &CallConfig) -> Result<Self, SignalingError> {
        let ws_url = config
            .websocket_url()
            .map_err(|e| SignalingError::InvalidConfig(e.to_string()))?;
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self {
            ws_url,
            registration_timeout: config.registration_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
            registry_tx: Arc::new(RwLock::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die aktuelle Peer-ID zurück (falls registriert)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server und registriert diesen Endpunkt.
    ///
    /// Gibt die vom Server vergebene Peer-ID zurück.
    pub async fn connect_and_register(&self) -> Result<String, SignalingError> {
        if self.is_connected() {
            return Err(SignalingError::AlreadyConnected);
        }

        tracing::info!("Connecting to signaling server: {}", self.ws_url);

        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        *self.tx.write() = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.peer_id = None;
        }
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für Registrierungs-Response
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let sender = Arc::clone(&self.tx);
        let event_tx = self.event_tx.clone();
        let registry_tx = Arc::clone(&self.registry_tx);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(
                                server_msg,
                                &state,
                                &event_tx,
                                &registry_tx,
                                &reg_tx,
                            )
                            .await
                        }
                        Err(e) => tracing::warn!("Ignoring unparseable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            state.write().is_connected = false;
            sender.write().take();
            let _ = event_tx.send(SignalingEvent::Disconnected);
            let feed = registry_tx.write().take();
            if let Some(feed) = feed {
                let _ = feed.send(RegistryEvent::Disconnected).await;
            }
        });

        // Write-Task, endet sobald alle Sender gedroppt sind
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        self.tasks.lock().push(read_task);

        self.send(ClientMessage::Register).await?;

        let peer_id = match tokio::time::timeout(self.registration_timeout, reg_rx.recv()).await {
            Ok(Some(Ok(peer_id))) => peer_id,
            Ok(Some(Err(e))) => {
                self.disconnect();
                return Err(e);
            }
            Ok(None) => {
                self.disconnect();
                return Err(SignalingError::RegistrationFailed("No response".to_string()));
            }
            Err(_) => {
                self.disconnect();
                return Err(SignalingError::RegistrationFailed("Timeout".to_string()));
            }
        };

        self.start_heartbeat();
        Ok(peer_id)
    }

    /// Trennt die Verbindung. Mehrfaches Aufrufen ist unkritisch.
    pub fn disconnect(&self) {
        // Sender droppen beendet den Write-Task inklusive Close-Frame
        self.tx.write().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let was_connected = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.is_connected, false)
        };
        let feed = self.registry_tx.write().take();
        if was_connected {
            tracing::info!("Disconnected from signaling server");
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
            if let Some(feed) = feed {
                let _ = feed.try_send(RegistryEvent::Disconnected);
            }
        }
    }

    /// Sendet ein SDP Offer
    pub async fn send_offer(
        &self,
        to_peer_id: String,
        call_id: String,
        sdp: String,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Offer {
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
        })
        .await
    }

    /// Sendet ein SDP Answer
    pub async fn send_answer(
        &self,
        to_peer_id: String,
        call_id: String,
        sdp: String,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Answer {
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
        })
        .await
    }

    /// Sendet einen ICE Candidate synchron (non-blocking), für Callbacks
    /// der Peer Connection
    pub fn send_ice_candidate_sync(
        &self,
        to_peer_id: String,
        call_id: String,
        candidate: String,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.try_send(ClientMessage::IceCandidate {
            from_peer_id,
            to_peer_id,
            call_id,
            candidate,
        })
    }

    /// Lehnt einen Anruf ab
    pub async fn reject_call(
        &self,
        to_peer_id: String,
        call_id: String,
        reason: Option<String>,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::RejectCall {
            from_peer_id,
            to_peer_id,
            call_id,
            reason,
        })
        .await
    }

    /// Beendet einen Anruf
    pub async fn hangup(&self, to_peer_id: String, call_id: String) -> Result<(), SignalingError> {
        let from_peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send(ClientMessage::Hangup {
            from_peer_id,
            to_peer_id,
            call_id,
        })
        .await
    }

    /// Sendet eine Nachricht
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        let text = encode(&message)?;
        tx.send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Sendet eine Nachricht synchron (try_send ist non-blocking)
    fn try_send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        let text = encode(&message)?;
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Startet den Heartbeat-Task
    fn start_heartbeat(&self) {
        let state = Arc::clone(&self.state);
        let sender = Arc::clone(&self.tx);
        let interval = self.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Erster Tick feuert sofort
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let (connected, peer_id) = {
                    let s = state.read();
                    (s.is_connected, s.peer_id.clone())
                };
                let (true, Some(peer_id)) = (connected, peer_id) else {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                };

                let Some(tx) = sender.read().clone() else {
                    break;
                };
                let sent = encode(&ClientMessage::Heartbeat { peer_id })
                    .and_then(|text| tx.try_send(text).map_err(|e| SignalingError::SendFailed(e.to_string())));
                if let Err(e) = sent {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Reicht ein Event an `open()` weiter. Wartet bei vollem Kanal, statt
    /// Angebote zu verwerfen.
    async fn feed(registry_tx: &RegistryFeed, event: RegistryEvent) {
        let feed = registry_tx.read().clone();
        if let Some(feed) = feed {
            if feed.send(event).await.is_err() {
                tracing::debug!("Registry receiver dropped");
            }
        }
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        registry_tx: &RegistryFeed,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { peer_id, .. } => {
                tracing::info!("Registered with peer_id {}", peer_id);
                state.write().peer_id = Some(peer_id.clone());
                let _ = reg_tx.send(Ok(peer_id.clone())).await;
                Self::feed(registry_tx, RegistryEvent::Assigned(peer_id.clone())).await;
                let _ = event_tx.send(SignalingEvent::Registered { peer_id });
            }

            ServerMessage::IncomingOffer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let offer = CallOffer::new(from_peer_id.clone(), call_id.clone(), sdp.clone());
                Self::feed(registry_tx, RegistryEvent::IncomingCall(offer)).await;
                let _ = event_tx.send(SignalingEvent::IncomingOffer {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingAnswer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::AnswerReceived {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingIceCandidate {
                from_peer_id,
                call_id,
                candidate,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IceCandidateReceived {
                    from_peer_id,
                    call_id,
                    candidate,
                });
            }

            ServerMessage::CallRejected {
                by_peer_id,
                call_id,
                reason,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::CallRejected {
                    by_peer_id,
                    call_id,
                    reason,
                });
            }

            ServerMessage::CallEnded {
                by_peer_id,
                call_id,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::CallEnded {
                    by_peer_id,
                    call_id,
                });
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Während der Registrierung wartet connect_and_register darauf
                let _ = reg_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }
}

/// Serialisiert eine Nachricht und ergänzt den Zeitstempel
fn encode(message: &ClientMessage) -> Result<String, SignalingError> {
    let mut value =
        serde_json::to_value(message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::Number(Utc::now().timestamp_millis().into()),
        );
    }
    serde_json::to_string(&value).map_err(|e| SignalingError::SendFailed(e.to_string()))
}

// ============================================================================
// ENDPOINT REGISTRY
// ============================================================================

#[async_trait]
impl EndpointRegistry for SignalingClient {
    async fn open(&self) -> Result<mpsc::Receiver<RegistryEvent>, SignalingError> {
        // Vor dem Verbinden einhängen, damit kein früher Anruf verloren geht.
        // `Assigned` kommt aus der Registrierung und ist damit immer das erste Event.
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self.registry_tx.write() = Some(tx);

        if let Err(e) = self.connect_and_register().await {
            self.registry_tx.write().take();
            return Err(e);
        }
        Ok(rx)
    }

    async fn reject(&self, offer: &CallOffer, reason: &str) -> Result<(), SignalingError> {
        self.reject_call(
            offer.remote_id.clone(),
            offer.call_id.clone(),
            Some(reason.to_string()),
        )
        .await
    }

    async fn close(&self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("ws_url", &self.ws_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_adds_timestamp() {
        let text = encode(&ClientMessage::Heartbeat {
            peer_id: "p-1".to_string(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["peerId"], "p-1");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = SignalingClient::new(&CallConfig::default()).unwrap();
        assert!(!client.is_connected());
        assert!(client.peer_id().is_none());

        let result = client
            .hangup("bob".to_string(), "c-1".to_string())
            .await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test]
    async fn test_server_messages_become_events() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        let (event_tx, mut events) = broadcast::channel(8);
        let (feed_tx, mut feed) = mpsc::channel(8);
        let registry_tx: RegistryFeed = Arc::new(RwLock::new(Some(feed_tx)));
        let (reg_tx, mut reg_rx) = mpsc::channel(1);

        SignalingClient::handle_server_message(
            ServerMessage::Registered {
                peer_id: "p-42".to_string(),
                timestamp: 0,
            },
            &state,
            &event_tx,
            &registry_tx,
            &reg_tx,
        )
        .await;
        assert_eq!(reg_rx.recv().await.unwrap().unwrap(), "p-42");
        assert_eq!(state.read().peer_id.as_deref(), Some("p-42"));
        assert!(matches!(
            events.recv().await.unwrap(),
            SignalingEvent::Registered { ref peer_id } if peer_id == "p-42"
        ));

        SignalingClient::handle_server_message(
            ServerMessage::IncomingOffer {
                from_peer_id: "bob".to_string(),
                call_id: "c-7".to_string(),
                sdp: "v=0".to_string(),
                timestamp: 0,
            },
            &state,
            &event_tx,
            &registry_tx,
            &reg_tx,
        )
        .await;
        assert!(matches!(
            events.recv().await.unwrap(),
            SignalingEvent::IncomingOffer { ref from_peer_id, ref call_id, .. }
                if from_peer_id == "bob" && call_id == "c-7"
        ));

        assert!(matches!(
            feed.recv().await.unwrap(),
            RegistryEvent::Assigned(ref id) if id == "p-42"
        ));
        assert!(matches!(
            feed.recv().await.unwrap(),
            RegistryEvent::IncomingCall(ref offer) if offer.call_id == "c-7"
        ));
    }

    #[tokio::test]
    async fn test_offers_survive_event_burst() {
        let state = Arc::new(RwLock::new(ClientState::default()));
        // Niemand liest den Broadcast, er läuft sofort über
        let (event_tx, _events) = broadcast::channel(1);
        let (feed_tx, mut feed) = mpsc::channel(8);
        let registry_tx: RegistryFeed = Arc::new(RwLock::new(Some(feed_tx)));
        let (reg_tx, _reg_rx) = mpsc::channel(1);

        for n in 0..3 {
            SignalingClient::handle_server_message(
                ServerMessage::IncomingIceCandidate {
                    from_peer_id: "bob".to_string(),
                    call_id: "c-0".to_string(),
                    candidate: "{}".to_string(),
                    timestamp: 0,
                },
                &state,
                &event_tx,
                &registry_tx,
                &reg_tx,
            )
            .await;
            SignalingClient::handle_server_message(
                ServerMessage::IncomingOffer {
                    from_peer_id: format!("peer-{}", n),
                    call_id: format!("c-{}", n),
                    sdp: "v=0".to_string(),
                    timestamp: 0,
                },
                &state,
                &event_tx,
                &registry_tx,
                &reg_tx,
            )
            .await;
        }

        for n in 0..3 {
            match feed.try_recv() {
                Ok(RegistryEvent::IncomingCall(offer)) => {
                    assert_eq!(offer.call_id, format!("c-{}", n))
                }
                _ => panic!("offer {} missing", n),
            }
        }
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = SignalingClient::new(&CallConfig::default()).unwrap();
        let mut events = client.subscribe();
        client.disconnect();
        client.disconnect();
        // Nie verbunden, also kein Disconnected-Event
        assert!(events.try_recv().is_err());
    }
}
