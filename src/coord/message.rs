use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coord::core::{ProcessId, Protocol};
use crate::coord::error::CoordError;

/// Total-order multicast traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum MulticastMessage {
    /// Application payload, stamped by its originator
    Message {
        sender_id: ProcessId,
        timestamp: u64,
        content: String,
    },
    /// Acknowledgement of the payload identified by (original_timestamp, original_sender_id)
    Ack {
        sender_id: ProcessId,
        timestamp: u64,
        original_timestamp: u64,
        original_sender_id: ProcessId,
        ack_sender_id: ProcessId,
    },
}

/// Outcome carried by a mutual exclusion REPLY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Ok,
    /// Sent by older peers when deferring; carries no permission
    Busy,
}

/// Ricart-Agrawala traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum MutexMessage {
    Request {
        sender_id: ProcessId,
        timestamp: u64,
        resource_id: String,
    },
    Reply {
        sender_id: ProcessId,
        timestamp: u64,
        resource_id: String,
        recipient_id: ProcessId,
        status: ReplyStatus,
    },
}

/// Inverted Bully traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum BullyMessage {
    Election {
        sender_id: ProcessId,
        #[serde(default)]
        timestamp: u64,
    },
    Ok {
        sender_id: ProcessId,
        #[serde(default)]
        timestamp: u64,
    },
    Coordinator {
        sender_id: ProcessId,
        #[serde(default)]
        timestamp: u64,
        leader_id: ProcessId,
    },
    Ping {
        sender_id: ProcessId,
    },
    Pong {
        sender_id: ProcessId,
    },
}

/// Best node seen in a subtree during a wave election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ProcessId,
    pub capacity: u64,
}

impl Candidate {
    pub fn new(id: ProcessId, capacity: u64) -> Self {
        Self { id, capacity }
    }

    /// Higher capacity wins; equal capacities go to the lower id.
    pub fn outranks(&self, other: &Candidate) -> bool {
        self.capacity > other.capacity || (self.capacity == other.capacity && self.id < other.id)
    }
}

/// Spanning-tree wave election traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum TreeMessage {
    Election {
        sender_id: ProcessId,
        election_id: ProcessId,
    },
    /// `best_node == None` is the null ACK (`{"id":-1,"capacity":-1}` on the wire)
    Ack {
        sender_id: ProcessId,
        election_id: ProcessId,
        #[serde(with = "null_candidate")]
        best_node: Option<Candidate>,
    },
    Coordinator {
        sender_id: ProcessId,
        #[serde(default)]
        timestamp: u64,
        leader_id: ProcessId,
    },
}

mod null_candidate {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Candidate;

    #[derive(Serialize, Deserialize)]
    struct RawCandidate {
        id: i64,
        capacity: i64,
    }

    pub fn serialize<S: Serializer>(
        candidate: &Option<Candidate>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let raw = match candidate {
            Some(candidate) => RawCandidate {
                id: i64::from(candidate.id),
                capacity: i64::try_from(candidate.capacity).unwrap_or(i64::MAX),
            },
            None => RawCandidate {
                id: -1,
                capacity: -1,
            },
        };
        raw.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Candidate>, D::Error> {
        let raw = RawCandidate::deserialize(deserializer)?;
        if raw.capacity < 0 {
            return Ok(None);
        }
        let id = u32::try_from(raw.id).map_err(D::Error::custom)?;
        Ok(Some(Candidate::new(id, raw.capacity as u64)))
    }
}

/// Any message a process can receive, grouped by protocol family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Multicast(MulticastMessage),
    Mutex(MutexMessage),
    Bully(BullyMessage),
    Tree(TreeMessage),
    /// A well-formed record whose tag the running protocol does not know
    Unrecognized { tag: String },
}

impl Message {
    /// Decodes one newline-delimited JSON record for the given protocol family
    pub fn decode(protocol: Protocol, line: &str) -> Result<Self, CoordError> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| CoordError::MalformedMessage(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordError::MalformedMessage("record has no `type` field".into()))?
            .to_string();

        if !protocol.message_types().contains(&tag.as_str()) {
            return Ok(Self::Unrecognized { tag });
        }

        let malformed = |e: serde_json::Error| CoordError::MalformedMessage(format!("{tag}: {e}"));
        let message = match protocol {
            Protocol::Multicast => Self::Multicast(serde_json::from_value(value).map_err(malformed)?),
            Protocol::Mutex => Self::Mutex(serde_json::from_value(value).map_err(malformed)?),
            Protocol::Bully => Self::Bully(serde_json::from_value(value).map_err(malformed)?),
            Protocol::Tree => Self::Tree(serde_json::from_value(value).map_err(malformed)?),
        };
        Ok(message)
    }

    /// Encodes the message as a single JSON record without the trailing newline
    pub fn encode(&self) -> Result<String, CoordError> {
        let encoded = match self {
            Self::Multicast(message) => serde_json::to_string(message),
            Self::Mutex(message) => serde_json::to_string(message),
            Self::Bully(message) => serde_json::to_string(message),
            Self::Tree(message) => serde_json::to_string(message),
            Self::Unrecognized { tag } => {
                return Err(CoordError::UnknownMessageType(tag.clone()));
            }
        };
        encoded.map_err(|e| CoordError::MalformedMessage(e.to_string()))
    }

    /// Gets the sender, if the message carries one
    pub fn sender_id(&self) -> Option<ProcessId> {
        let sender = match self {
            Self::Multicast(MulticastMessage::Message { sender_id, .. })
            | Self::Multicast(MulticastMessage::Ack { sender_id, .. })
            | Self::Mutex(MutexMessage::Request { sender_id, .. })
            | Self::Mutex(MutexMessage::Reply { sender_id, .. })
            | Self::Bully(BullyMessage::Election { sender_id, .. })
            | Self::Bully(BullyMessage::Ok { sender_id, .. })
            | Self::Bully(BullyMessage::Coordinator { sender_id, .. })
            | Self::Bully(BullyMessage::Ping { sender_id })
            | Self::Bully(BullyMessage::Pong { sender_id })
            | Self::Tree(TreeMessage::Election { sender_id, .. })
            | Self::Tree(TreeMessage::Ack { sender_id, .. })
            | Self::Tree(TreeMessage::Coordinator { sender_id, .. }) => *sender_id,
            Self::Unrecognized { .. } => return None,
        };
        Some(sender)
    }

    /// Lamport timestamp carried by the message; PING/PONG and the tree wave carry none
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Self::Multicast(MulticastMessage::Message { timestamp, .. })
            | Self::Multicast(MulticastMessage::Ack { timestamp, .. })
            | Self::Mutex(MutexMessage::Request { timestamp, .. })
            | Self::Mutex(MutexMessage::Reply { timestamp, .. })
            | Self::Bully(BullyMessage::Election { timestamp, .. })
            | Self::Bully(BullyMessage::Ok { timestamp, .. })
            | Self::Bully(BullyMessage::Coordinator { timestamp, .. })
            | Self::Tree(TreeMessage::Coordinator { timestamp, .. }) => Some(*timestamp),
            _ => None,
        }
    }

    /// Protocol family the message belongs to
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::Multicast(_) => Some(Protocol::Multicast),
            Self::Mutex(_) => Some(Protocol::Mutex),
            Self::Bully(_) => Some(Protocol::Bully),
            Self::Tree(_) => Some(Protocol::Tree),
            Self::Unrecognized { .. } => None,
        }
    }

    /// Returns the wire tag for logging
    pub fn message_type(&self) -> &str {
        match self {
            Self::Multicast(MulticastMessage::Message { .. }) => "MESSAGE",
            Self::Multicast(MulticastMessage::Ack { .. }) => "ACK",
            Self::Mutex(MutexMessage::Request { .. }) => "REQUEST",
            Self::Mutex(MutexMessage::Reply { .. }) => "REPLY",
            Self::Bully(BullyMessage::Election { .. }) => "ELECTION",
            Self::Bully(BullyMessage::Ok { .. }) => "OK",
            Self::Bully(BullyMessage::Coordinator { .. }) => "COORDINATOR",
            Self::Bully(BullyMessage::Ping { .. }) => "PING",
            Self::Bully(BullyMessage::Pong { .. }) => "PONG",
            Self::Tree(TreeMessage::Election { .. }) => "ELECTION",
            Self::Tree(TreeMessage::Ack { .. }) => "ACK",
            Self::Tree(TreeMessage::Coordinator { .. }) => "COORDINATOR",
            Self::Unrecognized { tag } => tag,
        }
    }
}

impl From<MulticastMessage> for Message {
    fn from(message: MulticastMessage) -> Self {
        Self::Multicast(message)
    }
}

impl From<MutexMessage> for Message {
    fn from(message: MutexMessage) -> Self {
        Self::Mutex(message)
    }
}

impl From<BullyMessage> for Message {
    fn from(message: BullyMessage) -> Self {
        Self::Bully(message)
    }
}

impl From<TreeMessage> for Message {
    fn from(message: TreeMessage) -> Self {
        Self::Tree(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reference_multicast_ack() {
        let line = r#"{"type":"ACK","originalTimestamp":4,"originalSenderId":2,"ackSenderId":3,"timestamp":9,"senderId":3}"#;
        let message = Message::decode(Protocol::Multicast, line).unwrap();
        assert_eq!(
            message,
            Message::Multicast(MulticastMessage::Ack {
                sender_id: 3,
                timestamp: 9,
                original_timestamp: 4,
                original_sender_id: 2,
                ack_sender_id: 3,
            })
        );
        assert_eq!(message.timestamp(), Some(9));
        assert_eq!(message.sender_id(), Some(3));
    }

    #[test]
    fn test_encode_uses_camel_case_fields() {
        let message = Message::from(MutexMessage::Reply {
            sender_id: 1,
            timestamp: 7,
            resource_id: "r1".to_string(),
            recipient_id: 2,
            status: ReplyStatus::Ok,
        });
        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "REPLY");
        assert_eq!(value["resourceId"], "r1");
        assert_eq!(value["recipientId"], 2);
        assert_eq!(value["status"], "OK");
    }

    #[test]
    fn test_bully_messages_without_timestamp_decode() {
        let message = Message::decode(Protocol::Bully, r#"{"type":"ELECTION","senderId":4}"#).unwrap();
        assert_eq!(
            message,
            Message::Bully(BullyMessage::Election {
                sender_id: 4,
                timestamp: 0
            })
        );
        let ping = Message::decode(Protocol::Bully, r#"{"type":"PING","senderId":2}"#).unwrap();
        assert_eq!(ping.timestamp(), None);
    }

    #[test]
    fn test_null_ack_wire_shape() {
        let null_ack = Message::from(TreeMessage::Ack {
            sender_id: 5,
            election_id: 9,
            best_node: None,
        });
        let encoded = null_ack.encode().unwrap();
        assert!(encoded.contains(r#""bestNode":{"id":-1,"capacity":-1}"#));
        assert_eq!(Message::decode(Protocol::Tree, &encoded).unwrap(), null_ack);

        let line = r#"{"type":"ACK","electionId":3,"senderId":6,"bestNode":{"id":7,"capacity":95}}"#;
        match Message::decode(Protocol::Tree, line).unwrap() {
            Message::Tree(TreeMessage::Ack { best_node, .. }) => {
                assert_eq!(best_node, Some(Candidate::new(7, 95)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_unrecognized_not_error() {
        let message = Message::decode(Protocol::Mutex, r#"{"type":"PING","senderId":1}"#).unwrap();
        assert_eq!(
            message,
            Message::Unrecognized {
                tag: "PING".to_string()
            }
        );
        assert!(message.encode().is_err());
    }

    #[test]
    fn test_malformed_records() {
        assert!(matches!(
            Message::decode(Protocol::Multicast, "not json"),
            Err(CoordError::MalformedMessage(_))
        ));
        assert!(matches!(
            Message::decode(Protocol::Multicast, r#"{"senderId":1}"#),
            Err(CoordError::MalformedMessage(_))
        ));
        // Known tag, missing fields
        assert!(matches!(
            Message::decode(Protocol::Multicast, r#"{"type":"MESSAGE","senderId":1}"#),
            Err(CoordError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_candidate_ranking() {
        let low = Candidate::new(2, 20);
        let high = Candidate::new(9, 90);
        assert!(high.outranks(&low));
        assert!(!low.outranks(&high));
        // Ties go to the lower id
        assert!(Candidate::new(3, 50).outranks(&Candidate::new(4, 50)));
        assert!(!Candidate::new(4, 50).outranks(&Candidate::new(3, 50)));
    }
}
