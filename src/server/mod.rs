//! WebSocket server module
//!
//! Carries relay traffic between browser clients and the conversation relay:
//! the wire protocol, the accept loop and the per-connection tasks.

mod handler;
mod protocol;
mod websocket;

pub use protocol::{ChatInput, ChatMessage, ErrorCode, ProtocolError, ServerFrame};
pub use websocket::{RelayServer, ServerConfig};
