//! Password digests and login tokens
//!
//! Digests are bcrypt strings. Hashing and verification run on the
//! blocking thread pool.

use rand::RngCore;
use thiserror::Error;
use tracing::debug;

const TOKEN_BYTES: usize = 32;

/// bcrypt cost applied to new digests
pub const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

/// Errors that can occur while hashing a password
#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("bcrypt failure: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    #[error("hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Hash a password with a fresh salt
pub async fn hash_password(password: &str, cost: u32) -> Result<String, PasswordError> {
    let password = password.to_string();
    let digest = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
    Ok(digest)
}

/// Check a password against a stored digest. Malformed digests never match.
pub async fn verify_password(password: &str, digest: &str) -> Result<bool, PasswordError> {
    let password = password.to_string();
    let digest = digest.to_string();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &digest)).await?;
    match verified {
        Ok(matches) => Ok(matches),
        Err(e) => {
            debug!("Stored digest is unusable: {}", e);
            Ok(false)
        }
    }
}

/// A fresh 256-bit login token, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
