//! Protocol requests, messages and the datagram codec
//!
//! Two vocabularies share the wire:
//!
//! ```text
//! Peer                     Rendezvous                      Peer
//!   │                          │                             │
//!   │── Request::Registration ►│        (keep-alive, no reply)
//!   │── Request::Holepunch ───►│                             │
//!   │◄─ Message::Handshake ────│───── Message::Handshake ───►│
//!   │                          │                             │
//!   │── Request::Signaling ───►│────── Message::Signal ─────►│
//!   │                          │                             │
//!   │◄───────── Message::Holepunch / Message::Ack ──────────►│
//! ```
//!
//! Requests travel peer → server; messages travel server → peer or
//! peer → peer. Both are single JSON documents with an integer `type`
//! tag. The enums here are closed: a tag outside the known set is a
//! decode error, never a silently-ignored default branch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Endpoint;

// ============================================================================
// Constants
// ============================================================================

/// Maximum accepted datagram payload (64 KB covers any candidate blob)
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Request type tags (peer → server)
pub const REQ_REGISTRATION: u8 = 0;
pub const REQ_HOLEPUNCH: u8 = 1;
pub const REQ_SIGNALING: u8 = 2;

/// Message type tags (server → peer, peer → peer)
pub const MSG_REGISTRATION: u8 = 0;
pub const MSG_HOLEPUNCH: u8 = 1;
pub const MSG_PAYLOAD: u8 = 2;
pub const MSG_HANDSHAKE: u8 = 3;
pub const MSG_SIGNAL: u8 = 4;
pub const MSG_ACK: u8 = 5;

// ============================================================================
// Requests (peer → server)
// ============================================================================

/// A handshake request sent by a peer to the rendezvous server
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Fire-and-forget keep-alive; the server upserts the sender's
    /// registration and sends nothing back.
    Registration { peer_id: String },

    /// Ask the server to broker a handshake with a named remote peer.
    Holepunch { peer_id: String, remote_id: String },

    /// Carry an opaque candidate payload for the server to relay to the
    /// named remote peer. The payload is never inspected.
    Signaling {
        peer_id: String,
        remote_id: String,
        signal: Value,
    },
}

impl Request {
    /// Id of the peer that sent this request
    pub fn peer_id(&self) -> &str {
        match self {
            Request::Registration { peer_id } => peer_id,
            Request::Holepunch { peer_id, .. } => peer_id,
            Request::Signaling { peer_id, .. } => peer_id,
        }
    }
}

/// Raw wire shape of a request.
///
/// serde's derived enum representations cannot express an integer
/// `type` tag alongside optional fields, so the codec goes through this
/// mirror struct and converts to the closed enum.
#[derive(Serialize, Deserialize)]
struct RawRequest {
    #[serde(rename = "type")]
    tag: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal: Option<Value>,
}

// ============================================================================
// Messages (server → peer, peer → peer)
// ============================================================================

/// A protocol message delivered to a peer
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Registration echo; reserved on the wire, never sent by this server.
    Registration,

    /// A bare punch probe aimed at the remote's observed endpoint.
    Holepunch,

    /// Application payload wrapper.
    Payload { body: Value },

    /// Handshake resolution: the id and observed endpoint of the
    /// counterpart peer, as registered at the rendezvous server.
    Handshake { id: String, endpoint: Endpoint },

    /// Relayed opaque candidate payload.
    Signal { body: Value },

    /// Confirmation that a punch probe arrived; carries only its tag.
    Ack,
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    tag: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

// ============================================================================
// Codec
// ============================================================================

/// Encode a request as a JSON datagram payload
pub fn encode_request(request: &Request) -> Result<Vec<u8>, EncodeError> {
    let raw = match request {
        Request::Registration { peer_id } => RawRequest {
            tag: REQ_REGISTRATION,
            peer_id: Some(peer_id.clone()),
            remote_id: None,
            signal: None,
        },
        Request::Holepunch { peer_id, remote_id } => RawRequest {
            tag: REQ_HOLEPUNCH,
            peer_id: Some(peer_id.clone()),
            remote_id: Some(remote_id.clone()),
            signal: None,
        },
        Request::Signaling {
            peer_id,
            remote_id,
            signal,
        } => RawRequest {
            tag: REQ_SIGNALING,
            peer_id: Some(peer_id.clone()),
            remote_id: Some(remote_id.clone()),
            signal: Some(signal.clone()),
        },
    };

    finish_encode(serde_json::to_vec(&raw))
}

/// Decode a request from a datagram payload
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeError> {
    let raw: RawRequest =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    match raw.tag {
        REQ_REGISTRATION => Ok(Request::Registration {
            peer_id: require(raw.peer_id, "peer_id")?,
        }),
        REQ_HOLEPUNCH => Ok(Request::Holepunch {
            peer_id: require(raw.peer_id, "peer_id")?,
            remote_id: require(raw.remote_id, "remote_id")?,
        }),
        REQ_SIGNALING => Ok(Request::Signaling {
            peer_id: require(raw.peer_id, "peer_id")?,
            remote_id: require(raw.remote_id, "remote_id")?,
            signal: require(raw.signal, "signal")?,
        }),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

/// Encode a message as a JSON datagram payload
pub fn encode_message(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let raw = match message {
        Message::Registration => RawMessage {
            tag: MSG_REGISTRATION,
            id: None,
            endpoint: None,
            body: None,
        },
        Message::Holepunch => RawMessage {
            tag: MSG_HOLEPUNCH,
            id: None,
            endpoint: None,
            body: None,
        },
        Message::Payload { body } => RawMessage {
            tag: MSG_PAYLOAD,
            id: None,
            endpoint: None,
            body: Some(body.clone()),
        },
        Message::Handshake { id, endpoint } => RawMessage {
            tag: MSG_HANDSHAKE,
            id: Some(id.clone()),
            endpoint: Some(endpoint.clone()),
            body: None,
        },
        Message::Signal { body } => RawMessage {
            tag: MSG_SIGNAL,
            id: None,
            endpoint: None,
            body: Some(body.clone()),
        },
        Message::Ack => RawMessage {
            tag: MSG_ACK,
            id: None,
            endpoint: None,
            body: None,
        },
    };

    finish_encode(serde_json::to_vec(&raw))
}

/// Decode a message from a datagram payload
pub fn decode_message(payload: &[u8]) -> Result<Message, DecodeError> {
    let raw: RawMessage =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    match raw.tag {
        MSG_REGISTRATION => Ok(Message::Registration),
        MSG_HOLEPUNCH => Ok(Message::Holepunch),
        MSG_PAYLOAD => Ok(Message::Payload {
            body: require(raw.body, "body")?,
        }),
        MSG_HANDSHAKE => Ok(Message::Handshake {
            id: require(raw.id, "id")?,
            endpoint: require(raw.endpoint, "endpoint")?,
        }),
        MSG_SIGNAL => Ok(Message::Signal {
            body: require(raw.body, "body")?,
        }),
        MSG_ACK => Ok(Message::Ack),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn finish_encode(result: serde_json::Result<Vec<u8>>) -> Result<Vec<u8>, EncodeError> {
    let payload = result.map_err(|e| EncodeError::Serialization(e.to_string()))?;
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(EncodeError::TooLarge(payload.len()));
    }
    Ok(payload)
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T, DecodeError> {
    field.ok_or(DecodeError::MissingField(name))
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while encoding a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Payload exceeds the maximum datagram size
    TooLarge(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::TooLarge(size) => {
                write!(
                    f,
                    "payload too large: {} bytes (max {})",
                    size, MAX_DATAGRAM_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur while decoding a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not a well-formed document
    Malformed(String),
    /// The type tag is outside the known set
    UnknownTag(u8),
    /// A field required by the tagged kind is absent
    MissingField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(e) => write!(f, "malformed payload: {}", e),
            DecodeError::UnknownTag(tag) => write!(f, "unknown type tag {}", tag),
            DecodeError::MissingField(field) => write!(f, "missing field '{}'", field),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let requests = [
            Request::Registration {
                peer_id: "alice".to_string(),
            },
            Request::Holepunch {
                peer_id: "alice".to_string(),
                remote_id: "bob".to_string(),
            },
            Request::Signaling {
                peer_id: "alice".to_string(),
                remote_id: "bob".to_string(),
                signal: json!({"candidate": "udp 203.0.113.50 50000", "sdpMLineIndex": 0}),
            },
        ];

        for request in requests {
            let encoded = encode_request(&request).unwrap();
            let decoded = decode_request(&encoded).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let messages = [
            Message::Registration,
            Message::Holepunch,
            Message::Payload {
                body: json!("punch"),
            },
            Message::Handshake {
                id: "bob".to_string(),
                endpoint: Endpoint::new("203.0.113.50", 50000),
            },
            Message::Signal {
                body: json!({"type": "offer", "sdp": "v=0..."}),
            },
            Message::Ack,
        ];

        for message in messages {
            let encoded = encode_message(&message).unwrap();
            let decoded = decode_message(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_wire_tags_are_fixed() {
        // The tag values are the protocol; peers written against the
        // original server depend on them.
        let encoded = encode_request(&Request::Registration {
            peer_id: "a".to_string(),
        })
        .unwrap();
        let doc: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(doc["type"], json!(0));

        let encoded = encode_request(&Request::Holepunch {
            peer_id: "a".to_string(),
            remote_id: "b".to_string(),
        })
        .unwrap();
        let doc: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(doc["type"], json!(1));

        let encoded = encode_message(&Message::Handshake {
            id: "b".to_string(),
            endpoint: Endpoint::new("10.0.0.1", 9),
        })
        .unwrap();
        let doc: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(doc["type"], json!(3));

        let encoded = encode_message(&Message::Ack).unwrap();
        let doc: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(doc["type"], json!(5));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let payload = br#"{"type": 42}"#;
        assert_eq!(decode_message(payload), Err(DecodeError::UnknownTag(42)));
        assert_eq!(decode_request(payload), Err(DecodeError::UnknownTag(42)));
    }

    #[test]
    fn test_missing_required_field() {
        // Registration without a peer id is unusable; the server drops it.
        assert_eq!(
            decode_request(br#"{"type": 0}"#),
            Err(DecodeError::MissingField("peer_id"))
        );
        // Holepunch without a remote names nobody to reach.
        assert_eq!(
            decode_request(br#"{"type": 1, "peer_id": "a"}"#),
            Err(DecodeError::MissingField("remote_id"))
        );
        assert_eq!(
            decode_message(br#"{"type": 3, "id": "b"}"#),
            Err(DecodeError::MissingField("endpoint"))
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            decode_request(b"not json at all"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_message(b"{\"type\": \"HANDSHAKE\"}"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_signal_body_is_opaque() {
        // Whatever blob the negotiation engine produces must come out
        // byte-identical in structure on the far side.
        let blob = json!({
            "candidate": {"foundation": "1", "port": 54321, "nested": [1, 2, {"deep": true}]},
            "usernameFragment": "x7q2"
        });

        let request = Request::Signaling {
            peer_id: "a".to_string(),
            remote_id: "b".to_string(),
            signal: blob.clone(),
        };
        let encoded = encode_request(&request).unwrap();
        match decode_request(&encoded).unwrap() {
            Request::Signaling { signal, .. } => assert_eq!(signal, blob),
            other => panic!("expected Signaling, got {:?}", other),
        }

        let message = Message::Signal { body: blob.clone() };
        let encoded = encode_message(&message).unwrap();
        match decode_message(&encoded).unwrap() {
            Message::Signal { body } => assert_eq!(body, blob),
            other => panic!("expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let request = Request::Signaling {
            peer_id: "a".to_string(),
            remote_id: "b".to_string(),
            signal: json!("x".repeat(MAX_DATAGRAM_SIZE)),
        };

        assert!(matches!(
            encode_request(&request),
            Err(EncodeError::TooLarge(_))
        ));
    }
}
