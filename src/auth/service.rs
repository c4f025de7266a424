//! Account registration, login and token validation

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::password::{generate_token, hash_password, verify_password, PasswordError, DEFAULT_COST};
use crate::config::Settings;
use crate::relay::{TokenValidator, UserId};
use crate::store::{Store, StoreError, User};

/// Longest accepted username, in characters
pub const MAX_USERNAME_LENGTH: usize = 50;

/// Errors that can occur during authentication
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("User '{0}' already exists")]
    UserExists(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// What a client receives after logging in
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoginSession {
    pub token: String,
    pub uid: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Issues and checks login tokens on top of the store
#[derive(Clone)]
pub struct AuthService {
    store: Store,
    token_ttl: Duration,
    min_password_len: usize,
    hash_cost: u32,
}

impl AuthService {
    pub fn new(store: Store, token_ttl: Duration, min_password_len: usize) -> Self {
        Self {
            store,
            token_ttl,
            min_password_len,
            hash_cost: DEFAULT_COST,
        }
    }

    pub fn from_settings(store: Store, settings: &Settings) -> Self {
        Self::new(store, settings.token_ttl(), settings.auth.min_password_len)
            .with_hash_cost(settings.auth.bcrypt_cost)
    }

    /// Use a different bcrypt cost for new digests
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Create an account. New users join the World Channel.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        avatar: Option<&str>,
    ) -> AuthResult<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::Invalid("username cannot be empty".to_string()));
        }
        if username.chars().count() > MAX_USERNAME_LENGTH {
            return Err(AuthError::Invalid(format!(
                "username exceeds maximum length of {} characters",
                MAX_USERNAME_LENGTH
            )));
        }
        if password.chars().count() < self.min_password_len {
            return Err(AuthError::Invalid(format!(
                "password must be at least {} characters",
                self.min_password_len
            )));
        }
        let avatar = avatar.map(str::trim).filter(|a| !a.is_empty());

        let digest = hash_password(password, self.hash_cost).await?;
        let uid = match self.store.register_user(username, &digest, avatar).await {
            Ok(uid) => uid,
            Err(StoreError::Conflict(_)) => return Err(AuthError::UserExists(username.to_string())),
            Err(e) => return Err(e.into()),
        };

        info!(uid, username, "User registered");
        Ok(uid)
    }

    /// Check credentials and issue a fresh token
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<LoginSession> {
        let user = self
            .store
            .find_user_by_name(username.trim())
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !verify_password(password, &user.password_hash).await? {
            debug!(uid = user.id, "Rejected login with wrong password");
            return Err(AuthError::WrongPassword);
        }

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.token_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));
        let token = generate_token();
        self.store
            .create_session(user.id, &token, now, expires_at)
            .await?;
        self.store.touch_login(user.id).await?;

        info!(uid = user.id, "User logged in");
        Ok(LoginSession {
            token,
            uid: user.id,
            username: user.username,
            avatar: user.avatar,
            expires_at,
        })
    }

    /// Forget a token. Unknown tokens are ignored.
    pub async fn logout(&self, token: &str) -> AuthResult<()> {
        if self.store.delete_session(token).await? {
            debug!("Session closed");
        }
        Ok(())
    }

    /// The user behind a live token
    pub async fn authenticate(&self, token: &str) -> AuthResult<User> {
        let uid = self
            .validate_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        self.store
            .get_user(uid)
            .await?
            .ok_or(AuthError::InvalidToken)
    }

    /// Drop sessions that expired before now
    pub async fn purge_expired(&self) -> AuthResult<usize> {
        let purged = self.store.purge_expired_sessions(Utc::now()).await?;
        if purged > 0 {
            info!("Purged {} expired sessions", purged);
        }
        Ok(purged)
    }
}

#[async_trait]
impl TokenValidator for AuthService {
    async fn validate_token(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let Some(session) = self.store.find_session(token).await? else {
            return Ok(None);
        };
        if session.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(session.uid))
    }
}
