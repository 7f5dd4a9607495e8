//! Message Types für das Signaling-Protokoll
//!
//! JSON-Textframes über WebSocket. Feldnamen sind camelCase, der
//! Nachrichtentyp steht im Feld `type`. Jede Client-Nachricht bekommt beim
//! Senden zusätzlich einen `timestamp` (Millisekunden).
//!
//! Anruf-bezogene Nachrichten tragen eine `callId`, damit Antworten, ICE
//! Candidates und Hangups genau einem Verbindungsversuch zugeordnet werden,
//! auch wenn beide Seiten gleichzeitig anrufen.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Registrierung, der Server vergibt die Peer-ID
    Register,

    /// SDP Offer an einen Peer
    Offer {
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// SDP Answer auf ein Offer
    Answer {
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        sdp: String,
    },

    IceCandidate {
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        candidate: String,
    },

    /// Anruf ablehnen
    RejectCall {
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Anruf beenden
    Hangup {
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
    },

    Heartbeat {
        peer_id: String,
    },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered { peer_id: String, timestamp: i64 },

    /// Eingehendes SDP Offer
    IncomingOffer {
        from_peer_id: String,
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Answer
    IncomingAnswer {
        from_peer_id: String,
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehender ICE Candidate
    IncomingIceCandidate {
        from_peer_id: String,
        call_id: String,
        candidate: String,
        timestamp: i64,
    },

    /// Anruf wurde abgelehnt
    CallRejected {
        by_peer_id: String,
        call_id: String,
        #[serde(default)]
        reason: Option<String>,
        timestamp: i64,
    },

    /// Anruf wurde beendet
    CallEnded {
        by_peer_id: String,
        call_id: String,
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let msg = ClientMessage::Offer {
            from_peer_id: "alice".to_string(),
            to_peer_id: "bob".to_string(),
            call_id: "c-1".to_string(),
            sdp: "v=0".to_string(),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "offer",
                "fromPeerId": "alice",
                "toPeerId": "bob",
                "callId": "c-1",
                "sdp": "v=0"
            })
        );
    }

    #[test]
    fn test_register_and_reject_wire_format() {
        let json = serde_json::to_value(&ClientMessage::Register).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "register" }));

        let json = serde_json::to_value(&ClientMessage::RejectCall {
            from_peer_id: "bob".to_string(),
            to_peer_id: "alice".to_string(),
            call_id: "c-1".to_string(),
            reason: None,
        })
        .unwrap();
        assert_eq!(json["type"], "reject_call");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_parse_server_messages() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"registered","peerId":"p-123","timestamp":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Registered {
                peer_id: "p-123".to_string(),
                timestamp: 1700000000000,
            }
        );

        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"incoming_ice_candidate","fromPeerId":"bob","callId":"c-9","candidate":"{}","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ServerMessage::IncomingIceCandidate { ref call_id, .. } if call_id == "c-9"
        ));

        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"call_rejected","byPeerId":"bob","callId":"c-9","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(msg, ServerMessage::CallRejected { reason: None, .. }));
    }

    #[test]
    fn test_unknown_server_message_is_rejected() {
        assert!(serde_json::from_str::<ServerMessage>(r#"{"type":"bogus","timestamp":1}"#).is_err());
    }
}
