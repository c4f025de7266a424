//! Protocol message definitions
//!
//! Defines the JSON frames exchanged between browser clients and the relay.
//! Clients send bare chat inputs (`{"text": "hi"}`); the server answers with
//! frames tagged by `type`. There is no envelope versioning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::relay::{ConversationId, UserId};

/// Longest accepted client-side de-duplication id
pub const MAX_CLIENT_ID_LENGTH: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// A chat message as typed by a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatInput {
    /// Message text
    pub text: String,
    /// Opaque id chosen by the client, echoed back so it can de-duplicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ChatInput {
    /// Create a chat input without a client id
    #[allow(dead_code)]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            client_id: None,
        }
    }

    /// Parse and validate a chat input from JSON
    pub fn from_json(json: &str, max_text_len: usize) -> ProtocolResult<Self> {
        let input: Self = serde_json::from_str(json)?;
        input.validate(max_text_len)?;
        Ok(input)
    }

    /// Validate message contents
    pub fn validate(&self, max_text_len: usize) -> ProtocolResult<()> {
        if self.text.trim().is_empty() {
            return Err(ProtocolError::ValidationError(
                "text cannot be empty".to_string(),
            ));
        }
        if self.text.len() > max_text_len {
            return Err(ProtocolError::ValidationError(format!(
                "text exceeds maximum length of {} bytes",
                max_text_len
            )));
        }
        if let Some(id) = &self.client_id {
            if id.is_empty() || id.len() > MAX_CLIENT_ID_LENGTH {
                return Err(ProtocolError::ValidationError(format!(
                    "client_id must be between 1 and {} bytes",
                    MAX_CLIENT_ID_LENGTH
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// A message as delivered to every connection in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Server-assigned message id
    pub id: Uuid,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Message text
    pub text: String,
    /// Time the relay accepted the message
    pub timestamp: DateTime<Utc>,
    /// Client de-duplication id, if the sender supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ChatMessage {
    /// Stamp an accepted input with an id and the current time
    pub fn accept(conversation_id: ConversationId, sender_id: UserId, input: ChatInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            text: input.text,
            timestamp: Utc::now(),
            client_id: input.client_id,
        }
    }
}

/// Frames sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A chat message
    Message(ChatMessage),

    /// Error response, sent only to the connection that caused it
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        code: ErrorCode,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Payload was not a valid chat input
    InvalidMessage,
    /// Sender is not a member of the conversation
    NotMember,
    /// Token rejected
    AuthFailed,
    /// Membership could not be checked
    StoreUnavailable,
}

impl ServerFrame {
    /// Create an Error frame
    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerFrame::Error {
            message: message.into(),
            code,
        }
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame from JSON (primarily for testing)
    #[allow(dead_code)]
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<ProtocolError> for ServerFrame {
    fn from(err: ProtocolError) -> Self {
        ServerFrame::error(err.to_string(), ErrorCode::InvalidMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_input() {
        let input = ChatInput::from_json(r#"{"text":"hi"}"#, 1024).unwrap();
        assert_eq!(input.text, "hi");
        assert!(input.client_id.is_none());
    }

    #[test]
    fn test_parse_input_with_client_id() {
        let input =
            ChatInput::from_json(r#"{"text":"hi","client_id":"c-1","extra":true}"#, 1024).unwrap();
        assert_eq!(input.client_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let result = ChatInput::from_json("hello there", 1024);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));

        let result = ChatInput::from_json(r#"{"message":"hi"}"#, 1024);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_empty_text_validation() {
        let result = ChatInput::new("   ").validate(1024);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_text_max_length() {
        let result = ChatInput::new("x".repeat(11)).validate(10);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
        assert!(ChatInput::new("x".repeat(10)).validate(10).is_ok());
    }

    #[test]
    fn test_client_id_validation() {
        let mut input = ChatInput::new("hi");
        input.client_id = Some(String::new());
        assert!(input.validate(1024).is_err());
        input.client_id = Some("x".repeat(MAX_CLIENT_ID_LENGTH + 1));
        assert!(input.validate(1024).is_err());
    }

    #[test]
    fn test_message_frame_shape() {
        let mut input = ChatInput::new("hi");
        input.client_id = Some("c-9".to_string());
        let frame = ServerFrame::Message(ChatMessage::accept(7, 42, input));
        let json = frame.to_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["sender_id"], 42);
        assert_eq!(value["conversation_id"], 7);
        assert_eq!(value["client_id"], "c-9");
        assert!(value["timestamp"].is_string());
        assert!(value["id"].is_string());
    }

    #[test]
    fn test_error_frame_shape() {
        let json = ServerFrame::error("nope", ErrorCode::NotMember)
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"nope","code":"not_member"}"#);
    }

    #[test]
    fn test_protocol_error_to_frame() {
        let err = ProtocolError::ValidationError("test error".to_string());
        match ServerFrame::from(err) {
            ServerFrame::Error { message, code } => {
                assert!(message.contains("test error"));
                assert_eq!(code, ErrorCode::InvalidMessage);
            }
            _ => panic!("Expected Error frame"),
        }
    }
}
