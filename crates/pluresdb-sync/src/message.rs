//! Wire messages exchanged between mesh peers.
//!
//! Messages are UTF-8 JSON objects carried as discrete text frames on a
//! WebSocket. `originId` names the peer whose write produced the message;
//! it survives relaying unchanged so every peer can suppress its own
//! updates coming back around.

use pluresdb_core::{NodeId, NodeRecord, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    /// A merged record travelling to peers.
    Put {
        #[serde(rename = "originId")]
        origin_id: PeerId,
        node: NodeRecord,
    },
    /// A record removal.
    Delete {
        #[serde(rename = "originId")]
        origin_id: PeerId,
        id: NodeId,
    },
    /// Ask the receiving peer to stream its current state back on this
    /// link, one put per record.
    SyncRequest {
        #[serde(rename = "originId")]
        origin_id: PeerId,
    },
}

impl MeshMessage {
    pub fn origin_id(&self) -> &str {
        match self {
            MeshMessage::Put { origin_id, .. }
            | MeshMessage::Delete { origin_id, .. }
            | MeshMessage::SyncRequest { origin_id } => origin_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_and_field_names() {
        let message = MeshMessage::SyncRequest {
            origin_id: "peer-1".to_string(),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], json!("sync_request"));
        assert_eq!(encoded["originId"], json!("peer-1"));

        let message = MeshMessage::Delete {
            origin_id: "peer-1".to_string(),
            id: "record-9".to_string(),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], json!("delete"));
        assert_eq!(encoded["id"], json!("record-9"));
    }

    #[test]
    fn put_round_trips_with_record() {
        let raw = json!({
            "type": "put",
            "originId": "A",
            "node": {
                "id": "k",
                "data": {"x": 1},
                "timestamp": 100,
                "state": {"x": 100},
                "vectorClock": {"A": 1}
            }
        });
        let message: MeshMessage = serde_json::from_value(raw).unwrap();
        match &message {
            MeshMessage::Put { origin_id, node } => {
                assert_eq!(origin_id, "A");
                assert_eq!(node.id, "k");
                assert_eq!(node.vector_clock.get("A"), 1);
            }
            other => panic!("expected put, got {other:?}"),
        }

        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: MeshMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_message_kinds_fail_to_parse() {
        assert!(serde_json::from_str::<MeshMessage>(r#"{"type":"gossip"}"#).is_err());
        assert!(serde_json::from_str::<MeshMessage>("not json at all").is_err());
    }
}
