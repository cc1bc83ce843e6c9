//! Protocol types for room-addressed WebSocket sync.
//!
//! Messages are CBOR-encoded and internally tagged by `type`. Field names
//! use camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::awareness::PresenceState;

/// The only protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1";

/// Message types for the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProtocolMessage {
    /// Join message - sent by client to open a room session
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "senderId")]
        sender_id: String,
        room: String,
        #[serde(rename = "supportedProtocolVersions")]
        supported_protocol_versions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<PeerMetadata>,
    },
    /// Leave message - sent by client before disconnecting
    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// Peer message - sent by server to confirm the handshake
    #[serde(rename = "peer")]
    Peer {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(rename = "selectedProtocolVersion")]
        selected_protocol_version: String,
    },
    /// Request message - first sync message for a document on a connection
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Sync message - ongoing sync messages
    #[serde(rename = "sync")]
    Sync {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Awareness message - full presence state of one connection.
    /// A missing state removes the connection's entry.
    #[serde(rename = "awareness")]
    Awareness {
        #[serde(rename = "senderId")]
        sender_id: String,
        clock: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<PresenceState>,
    },
    /// Error message from server
    #[serde(rename = "error")]
    Error { message: String },
}

/// Metadata sent with join message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMetadata {
    #[serde(rename = "isEphemeral")]
    pub is_ephemeral: bool,
    #[serde(rename = "userAgent", default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for PeerMetadata {
    fn default() -> Self {
        Self {
            is_ephemeral: true,
            user_agent: Some(format!("sharedstate-core/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl ProtocolMessage {
    /// Encode message as CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode message from CBOR bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(data)
    }
}

/// Generate a random peer ID for this connection.
pub fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::Point;
    use crate::player::PlayerIdentity;

    #[test]
    fn test_generate_peer_id() {
        let id1 = generate_peer_id();
        let id2 = generate_peer_id();
        assert_ne!(id1, id2);
        assert!(uuid::Uuid::parse_str(&id1).is_ok());
    }

    #[test]
    fn test_join_message_encode_decode() {
        let msg = ProtocolMessage::Join {
            sender_id: "peer123".to_string(),
            room: "/blog".to_string(),
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
            metadata: Some(PeerMetadata::default()),
        };

        let encoded = msg.encode().unwrap();
        let decoded = ProtocolMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_request_message_encode_decode() {
        let msg = ProtocolMessage::Request {
            document_id: "doc123".to_string(),
            sender_id: "peer1".to_string(),
            target_id: "peer2".to_string(),
            data: vec![1, 2, 3, 4, 5],
        };

        let encoded = msg.encode().unwrap();
        match ProtocolMessage::decode(&encoded).unwrap() {
            ProtocolMessage::Request {
                document_id, data, ..
            } => {
                assert_eq!(document_id, "doc123");
                assert_eq!(data, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("Expected Request message, got {:?}", other),
        }
    }

    #[test]
    fn test_awareness_message_encode_decode() {
        let mut state = PresenceState::new(PlayerIdentity::generate());
        state.cursor = Some(Point::new(4.0, 2.0));
        state
            .elements
            .insert("likes".to_string(), serde_json::json!({"hovering": true}));

        let update = ProtocolMessage::Awareness {
            sender_id: "peer1".to_string(),
            clock: 7,
            state: Some(state),
        };
        let encoded = update.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&encoded).unwrap(), update);

        let removal = ProtocolMessage::Awareness {
            sender_id: "peer1".to_string(),
            clock: 8,
            state: None,
        };
        let encoded = removal.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&encoded).unwrap(), removal);
    }

    #[test]
    fn test_wire_tag_and_field_names() {
        let msg = ProtocolMessage::Leave {
            sender_id: "peer123".to_string(),
        };
        let encoded = msg.encode().unwrap();
        let raw: ciborium::value::Value = ciborium::from_reader(encoded.as_slice()).unwrap();
        let map = raw.as_map().unwrap();
        let keys: Vec<&str> = map.iter().filter_map(|(k, _)| k.as_text()).collect();
        assert!(keys.contains(&"type"));
        assert!(keys.contains(&"senderId"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ProtocolMessage::decode(&[0xff, 0x00, 0x13]).is_err());
    }
}
