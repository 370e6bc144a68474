//! Long-lived bearer tokens stored only as a slow digest.

use std::sync::Arc;

use {
    base64::Engine,
    chrono::{TimeDelta, Utc},
    mememo_common::{Error, Result},
    mememo_config::AuthConfig,
    rand::RngCore,
    secrecy::Secret,
    sha2::{Digest, Sha256},
    tracing::{debug, info},
};

use crate::{
    store::AuthStore,
    types::{BearerTokenRecord, User},
};

/// Number of chained SHA-256 passes applied to a plaintext token.
pub const DIGEST_ROUNDS: usize = 10_000;

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Stored identifier for a plaintext token.
pub fn token_digest(plaintext: &str) -> String {
    let mut digest = Sha256::digest(plaintext.as_bytes());
    for _ in 1..DIGEST_ROUNDS {
        digest = Sha256::digest(digest);
    }
    format!("{digest:x}")
}

pub struct BearerTokenAuthority {
    store: Arc<dyn AuthStore>,
    expiry: TimeDelta,
}

impl BearerTokenAuthority {
    pub fn new(store: Arc<dyn AuthStore>, config: &AuthConfig) -> Self {
        Self {
            store,
            expiry: config.token_expiry.as_chrono(),
        }
    }

    /// Issue a token for `username`, invalidating any earlier one.
    ///
    /// The plaintext is returned once and cannot be recovered afterwards.
    pub async fn issue(&self, username: &str) -> Result<Secret<String>> {
        if self.store.get_user(username).await?.is_none() {
            return Err(Error::not_found("user", username));
        }
        let plaintext = generate_token();
        let record = BearerTokenRecord {
            id: token_digest(&plaintext),
            username: username.to_string(),
            expiry: Utc::now() + self.expiry,
        };
        self.store.put_token(&record).await?;
        info!(user = %username, "bearer token issued");
        Ok(Secret::new(plaintext))
    }

    /// The user bound to `plaintext`, or `None` for unknown or expired tokens.
    pub async fn resolve(&self, plaintext: &str) -> Result<Option<User>> {
        let id = token_digest(plaintext.trim());
        let Some(record) = self.store.get_token(&id).await? else {
            return Ok(None);
        };
        if record.expiry <= Utc::now() {
            debug!(user = %record.username, "expired bearer token presented");
            return Ok(None);
        }
        self.store.get_user(&record.username).await
    }

    pub async fn revoke(&self, username: &str) -> Result<()> {
        if !self.store.delete_tokens(username).await? {
            return Err(Error::not_found("token", username));
        }
        info!(user = %username, "bearer token revoked");
        Ok(())
    }
}
