//! Relay connections
//!
//! A `Connection` is the relay's view of one open socket. Frames reach the
//! socket through a bounded queue drained by the transport's writer task;
//! the relay never writes to a socket directly.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConversationId, UserId};
use crate::server::ServerFrame;

/// Unique id of a connection for its lifetime
pub type ConnectionId = Uuid;

/// Why a connection was closed by the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The outbound queue overflowed during a broadcast
    QueueFull,
    /// A socket write did not finish within the send timeout
    WriteTimeout,
    /// The user was removed from the conversation
    Removed,
    /// The server is shutting down
    Shutdown,
    /// The client went away first
    PeerClosed,
}

/// One-shot close signal shared by the relay and the transport
#[derive(Debug, Default)]
pub struct Closer {
    token: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl Closer {
    /// Request a close. The first reason wins; later calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Whether a close was requested
    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given by the first `close` call
    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolve once a close was requested
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Registry-side handle used to deliver frames to a connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: UserId,
    pub(crate) sender: mpsc::Sender<String>,
    pub(crate) closer: Arc<Closer>,
}

/// Receiving end of a connection's outbound queue
#[derive(Debug)]
pub struct Outbound {
    pub receiver: mpsc::Receiver<String>,
    pub closer: Arc<Closer>,
}

/// A live connection bound to one conversation and one user
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    conversation_id: ConversationId,
    user_id: UserId,
    sender: mpsc::Sender<String>,
    closer: Arc<Closer>,
}

impl Connection {
    /// Create a connection and its outbound queue
    pub(crate) fn open(
        conversation_id: ConversationId,
        user_id: UserId,
        capacity: usize,
    ) -> (Self, Outbound) {
        let (sender, receiver) = mpsc::channel(capacity);
        let closer = Arc::new(Closer::default());
        let connection = Self {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            sender,
            closer: Arc::clone(&closer),
        };
        (connection, Outbound { receiver, closer })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Handle stored in the registry
    pub(crate) fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            user_id: self.user_id,
            sender: self.sender.clone(),
            closer: Arc::clone(&self.closer),
        }
    }

    /// Queue a frame for this connection only
    ///
    /// Returns `false` when the frame could not be queued; a full queue
    /// also closes the connection.
    pub fn reply(&self, frame: &ServerFrame) -> bool {
        let Ok(json) = frame.to_json() else {
            return false;
        };
        match self.sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.closer.close(CloseReason::QueueFull);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request the transport to close the socket
    pub fn close(&self, reason: CloseReason) {
        self.closer.close(reason);
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Resolve once a close was requested
    pub async fn closed(&self) {
        self.closer.closed().await
    }
}
