//! Wire messages.
//!
//! Every message is a JSON object with a mandatory `Type` tag; the remaining
//! fields belong to the variant. One line on the control stream carries one
//! message.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::object::{ObjectInfo, Operation};

/// What a `Request` or `Push` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    /// A tracked file or directory.
    Object,
    /// A peer record from `org/peers/`.
    Peer,
    /// The authentication record.
    Auth,
    /// The full recursive model dump.
    Model,
}

/// Side-channel facts carried by `Notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    /// The sender has applied the removal of the identification.
    Removed,
    /// The sender stores no object under the identification.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockAction {
    Request,
    Accept,
    Release,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateMessage {
    pub operation: Operation,
    pub object: ObjectInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestMessage {
    pub object_type: ObjectType,
    pub identification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotifyMessage {
    pub kind: NotifyKind,
    pub identification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushMessage {
    pub identification: String,
    pub object_type: ObjectType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LockMessage {
    pub action: LockAction,
}

/// Challenge envelope: a fresh 24-byte nonce and the sealed varint counter,
/// both base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationMessage {
    pub nonce: String,
    pub encrypted: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Message {
    Update(UpdateMessage),
    Request(RequestMessage),
    Notify(NotifyMessage),
    Push(PushMessage),
    Lock(LockMessage),
    Authentication(AuthenticationMessage),
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Message> {
        Ok(serde_json::from_str(line)?)
    }

    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Update(_) => "Update",
            Message::Request(_) => "Request",
            Message::Notify(_) => "Notify",
            Message::Push(_) => "Push",
            Message::Lock(_) => "Lock",
            Message::Authentication(_) => "Authentication",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionVector;

    #[test]
    fn envelope_carries_type_tag() {
        let msg = Message::Lock(LockMessage {
            action: LockAction::Request,
        });
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""Type":"Lock""#), "{json}");
        assert!(json.contains(r#""Action":"Request""#), "{json}");
    }

    #[test]
    fn update_round_trip() {
        let mut version = VersionVector::new();
        version.set("aabbccdd00112233", 1);
        let msg = Message::Update(UpdateMessage {
            operation: Operation::Create,
            object: ObjectInfo {
                identification: "0011223344556677".into(),
                name: "notes.txt".into(),
                path: "notes.txt".into(),
                directory: false,
                shadow: false,
                version,
                content: Some(crate::hashing::hash_bytes(b"hello")),
                objects: None,
            },
        });
        let line = msg.encode().unwrap();
        assert!(line.contains(r#""Type":"Update""#));
        let back = Message::decode(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        assert!(Message::decode(r#"{"Type":"Gossip","Payload":1}"#).is_err());
        assert!(Message::decode("not json").is_err());
    }

    #[test]
    fn request_round_trip() {
        let msg = Message::Request(RequestMessage {
            object_type: ObjectType::Model,
            identification: crate::ids::MODEL_IDENTIFICATION.into(),
        });
        let back = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }
}
