//! Authentication
//!
//! Password storage and the token store used by both the HTTP API and the
//! relay.

mod password;
mod service;

#[cfg(test)]
pub use password::PasswordError;
pub use service::{AuthError, AuthService, LoginSession};
