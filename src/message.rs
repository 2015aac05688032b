use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Free-form message/user metadata: a JSON-shaped bag of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    Null,
}

pub type Metadata = HashMap<String, MetadataValue>;

impl MetadataValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Emoji,
    Gift,
    System,
    Join,
    Leave,
    Typing,
    ReadReceipt,
}

impl MessageType {
    /// Server-originated types bypass user-content validation.
    pub fn is_server_generated(self) -> bool {
        matches!(self, Self::System | Self::Join | Self::Leave)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Chat wire message. Serialized as-is over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Message {
    fn base(message_type: MessageType, room_id: &str, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: String::new(),
            username: String::new(),
            message_type,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
            edited_at: None,
            deleted_at: None,
            is_deleted: false,
        }
    }

    /// Server notice delivered to a single user (rate-limit and moderation
    /// rejections).
    pub fn system(room_id: &str, content: impl Into<String>) -> Self {
        Self::base(MessageType::System, room_id, content)
    }

    pub fn join(room_id: &str, user_id: &str, username: &str, user_count: usize) -> Self {
        let mut msg = Self::base(
            MessageType::Join,
            room_id,
            format!("{username} joined the room"),
        );
        msg.user_id = user_id.to_string();
        msg.username = username.to_string();
        msg.metadata = Some(HashMap::from([(
            "user_count".to_string(),
            MetadataValue::Number(user_count as f64),
        )]));
        msg
    }

    pub fn leave(room_id: &str, user_id: &str, username: &str, user_count: usize) -> Self {
        let mut msg = Self::base(
            MessageType::Leave,
            room_id,
            format!("{username} left the room"),
        );
        msg.user_id = user_id.to_string();
        msg.username = username.to_string();
        msg.metadata = Some(HashMap::from([(
            "user_count".to_string(),
            MetadataValue::Number(user_count as f64),
        )]));
        msg
    }

    pub fn typing(room_id: &str, user_id: &str, username: &str, is_typing: bool) -> Self {
        let mut msg = Self::base(MessageType::Typing, room_id, "");
        msg.user_id = user_id.to_string();
        msg.username = username.to_string();
        msg.metadata = Some(HashMap::from([(
            "is_typing".to_string(),
            MetadataValue::Bool(is_typing),
        )]));
        msg
    }

    /// `metadata.is_typing`, defaulting to false when absent or mistyped.
    pub fn typing_flag(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("is_typing"))
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let msg = Message::join("r1", "u1", "alice", 3);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        assert!(json.contains("\"user_count\":3.0") || json.contains("\"user_count\":3"));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_type, MessageType::Join);
        assert_eq!(parsed.room_id, "r1");
        assert_eq!(parsed.username, "alice");
    }

    #[test]
    fn inbound_message_with_minimal_fields() {
        // Clients send only type + content; the server stamps the rest.
        let parsed: Message =
            serde_json::from_str(r#"{"type":"text","content":"hello"}"#).unwrap();
        assert_eq!(parsed.message_type, MessageType::Text);
        assert_eq!(parsed.content, "hello");
        assert!(parsed.id.is_empty());
        assert!(!parsed.is_deleted);
    }

    #[test]
    fn typing_flag_extraction() {
        let msg = Message::typing("r", "u", "alice", true);
        assert!(msg.typing_flag());

        let msg = Message::system("r", "notice");
        assert!(!msg.typing_flag());

        // Mistyped metadata defaults to false.
        let parsed: Message = serde_json::from_str(
            r#"{"type":"typing","metadata":{"is_typing":"yes"}}"#,
        )
        .unwrap();
        assert!(!parsed.typing_flag());
    }

    #[test]
    fn server_generated_types() {
        assert!(MessageType::System.is_server_generated());
        assert!(MessageType::Join.is_server_generated());
        assert!(MessageType::Leave.is_server_generated());
        assert!(!MessageType::Text.is_server_generated());
        assert!(!MessageType::Gift.is_server_generated());
    }

    #[test]
    fn read_receipt_snake_case() {
        let json = serde_json::to_string(&MessageType::ReadReceipt).unwrap();
        assert_eq!(json, "\"read_receipt\"");
    }

    #[test]
    fn metadata_value_accessors() {
        assert_eq!(MetadataValue::Bool(true).as_bool(), Some(true));
        assert_eq!(MetadataValue::Number(2.5).as_f64(), Some(2.5));
        assert_eq!(MetadataValue::String("x".into()).as_str(), Some("x"));
        assert_eq!(MetadataValue::Null.as_bool(), None);
    }
}
