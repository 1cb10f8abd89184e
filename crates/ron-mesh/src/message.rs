/// Wire messages exchanged between mesh peers.
use serde::{Deserialize, Serialize};

use crate::topology::Topology;

/// One mesh record. `id` is the reliable-send ID for data (mirrored by
/// the ACK) or the lollipop sequence for an MSA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub source: String,
    /// Re-rolled each node start; scopes MSA sequence numbers.
    pub instance: u64,
    pub id: u64,
    /// Final recipients of a data message; empty for MSA/ACK.
    pub recipients: Vec<String>,
    /// Nodes this message has already visited; floods skip them.
    pub current_route: Vec<String>,
    pub payload: MeshPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshPayload {
    /// Topology snapshot at link setup. `solicited` marks a node still
    /// below its degree.
    Handshake { solicited: bool, topology: Topology },
    /// Mesh State Announcement: the source's adjacency list.
    Msa { neighbors: Vec<String> },
    /// Hop acknowledgement, `id` mirrors the acknowledged message.
    Ack,
    /// Application bytes for the named subsystem pump.
    Data { channel: String, body: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let mut topology = Topology::new();
        topology.set_neighbors("a", ["b".to_string()]);

        let messages = [
            MeshMessage {
                source: "a".into(),
                instance: 7,
                id: 0,
                recipients: Vec::new(),
                current_route: Vec::new(),
                payload: MeshPayload::Handshake {
                    solicited: true,
                    topology,
                },
            },
            MeshMessage {
                source: "a".into(),
                instance: 7,
                id: 3,
                recipients: Vec::new(),
                current_route: vec!["a".into()],
                payload: MeshPayload::Msa {
                    neighbors: vec!["b".into()],
                },
            },
            MeshMessage {
                source: "b".into(),
                instance: 9,
                id: 12,
                recipients: vec!["c".into()],
                current_route: vec!["b".into()],
                payload: MeshPayload::Data {
                    channel: "iom".into(),
                    body: b"payload".to_vec(),
                },
            },
        ];

        for message in &messages {
            let bytes = ron_proto::to_record(message).unwrap();
            let decoded: MeshMessage = ron_proto::from_record(&bytes).unwrap();
            assert_eq!(&decoded, message);
        }
    }
}
