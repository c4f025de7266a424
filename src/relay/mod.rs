//! Conversation relay
//!
//! Accepts connections bound to a (conversation, token) pair, fans each
//! inbound chat message out to every connection of the same conversation,
//! and forgets connections when they go away. The relay only talks to its
//! collaborators through [`TokenValidator`] and [`ConversationStore`], so it
//! does not know about HTTP, SQL or sockets.

mod connection;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use connection::{CloseReason, Connection, ConnectionId, Outbound};
pub use registry::ConnectionRegistry;

use crate::config::Settings;
use crate::server::{ChatInput, ChatMessage, ErrorCode, ProtocolError, ServerFrame};
use crate::store::{Store, StoreError};

/// Routing key of a conversation
pub type ConversationId = i64;

/// Identity of an authenticated user
pub type UserId = i64;

/// Errors that can occur during relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid or expired token")]
    Unauthorized,

    #[error("Malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("User {user_id} is not a member of conversation {conversation_id}")]
    NotMember {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Error code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Unauthorized => ErrorCode::AuthFailed,
            RelayError::Malformed(_) => ErrorCode::InvalidMessage,
            RelayError::NotMember { .. } => ErrorCode::NotMember,
            RelayError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
        }
    }
}

impl From<&RelayError> for ServerFrame {
    fn from(err: &RelayError) -> Self {
        ServerFrame::error(err.to_string(), err.code())
    }
}

/// Resolves login tokens to users
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// The token's user, or `None` when the token is unknown or expired
    async fn validate_token(&self, token: &str) -> Result<Option<UserId>, StoreError>;
}

/// Membership checks and message persistence
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Whether `user_id` may post to `conversation_id`
    async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, StoreError>;

    /// Store a delivered message
    async fn persist(
        &self,
        conversation_id: ConversationId,
        message: &ChatMessage,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl ConversationStore for Store {
    async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        Store::is_member(self, conversation_id, user_id).await
    }

    async fn persist(
        &self,
        conversation_id: ConversationId,
        message: &ChatMessage,
    ) -> Result<(), StoreError> {
        self.save_message(
            conversation_id,
            message.sender_id,
            &message.text,
            message.timestamp,
        )
        .await
        .map(|_| ())
    }
}

/// Delivery policy for the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Deliver messages back to their sender as well
    pub echo_to_sender: bool,
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// Longest accepted message text, in bytes
    pub max_text_len: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RelayPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            echo_to_sender: settings.relay.echo_to_sender,
            outbound_queue: settings.relay.outbound_queue.max(1),
            max_text_len: settings.relay.max_text_len,
        }
    }
}

/// Result of relaying one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Id assigned to the message
    pub message_id: Uuid,
    /// Connections the message was queued on
    pub delivered: usize,
    /// Connections dropped because they could not keep up
    pub dropped: Vec<ConnectionId>,
}

/// The per-conversation fan-out relay
pub struct Relay {
    registry: ConnectionRegistry,
    tokens: Arc<dyn TokenValidator>,
    conversations: Arc<dyn ConversationStore>,
    policy: RelayPolicy,
}

impl Relay {
    pub fn new(
        tokens: Arc<dyn TokenValidator>,
        conversations: Arc<dyn ConversationStore>,
        policy: RelayPolicy,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            tokens,
            conversations,
            policy,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Authenticate a new socket and subscribe it to a conversation
    ///
    /// A missing, unknown or expired token registers nothing.
    pub async fn connect(
        &self,
        conversation_id: ConversationId,
        token: Option<&str>,
    ) -> RelayResult<(Connection, Outbound)> {
        let token = token.filter(|t| !t.is_empty()).ok_or(RelayError::Unauthorized)?;
        let user_id = self
            .tokens
            .validate_token(token)
            .await?
            .ok_or(RelayError::Unauthorized)?;

        let (connection, outbound) =
            Connection::open(conversation_id, user_id, self.policy.outbound_queue);
        self.registry
            .insert(conversation_id, connection.id(), connection.handle());

        info!(
            conversation_id,
            user_id,
            connection_id = %connection.id(),
            peers = self.registry.connection_count(conversation_id),
            "Connection joined conversation"
        );
        Ok((connection, outbound))
    }

    /// Relay one inbound payload from `connection` to its conversation
    ///
    /// Errors are meant for the sender only; nothing is broadcast when one
    /// is returned. Persistence runs in the background and its failure does
    /// not affect delivery.
    pub async fn on_message(&self, connection: &Connection, payload: &str) -> RelayResult<Delivery> {
        let input = ChatInput::from_json(payload, self.policy.max_text_len)?;

        let conversation_id = connection.conversation_id();
        let user_id = connection.user_id();
        if !self.conversations.is_member(conversation_id, user_id).await? {
            return Err(RelayError::NotMember {
                conversation_id,
                user_id,
            });
        }

        let message = ChatMessage::accept(conversation_id, user_id, input);
        let frame = ServerFrame::Message(message.clone()).to_json()?;

        let message_id = message.id;
        self.persist_in_background(message);

        let skip = (!self.policy.echo_to_sender).then(|| connection.id());
        let report = self.registry.broadcast(conversation_id, &frame, skip);

        Ok(Delivery {
            message_id,
            delivered: report.delivered,
            dropped: report.dropped,
        })
    }

    /// Forget a connection. Safe to call more than once.
    pub fn on_disconnect(&self, connection: &Connection) -> bool {
        let removed = self
            .registry
            .remove(connection.conversation_id(), connection.id());
        if removed {
            info!(
                conversation_id = connection.conversation_id(),
                user_id = connection.user_id(),
                connection_id = %connection.id(),
                "Connection left conversation"
            );
        }
        removed
    }

    /// Disconnect a user who lost membership of a conversation
    pub fn evict(&self, conversation_id: ConversationId, user_id: UserId) -> usize {
        let evicted = self
            .registry
            .evict_user(conversation_id, user_id, CloseReason::Removed);
        if evicted > 0 {
            info!(
                conversation_id,
                user_id, evicted, "Removed member disconnected from conversation"
            );
        }
        evicted
    }

    /// Ask every open connection to close
    pub fn shutdown(&self) {
        self.registry.close_all(CloseReason::Shutdown);
    }

    fn persist_in_background(&self, message: ChatMessage) {
        let conversations = Arc::clone(&self.conversations);
        tokio::spawn(async move {
            if let Err(e) = conversations
                .persist(message.conversation_id, &message)
                .await
            {
                warn!(
                    conversation_id = message.conversation_id,
                    message_id = %message.id,
                    "Failed to persist message: {}",
                    e
                );
            }
        });
    }
}
