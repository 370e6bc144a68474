//! Bundle of the authorities a gateway needs, sharing one store.

use std::sync::Arc;

use {
    mememo_auth::{
        AuthStore, BearerTokenAuthority, GrantAuthority, ThirdPartyAuthGateway, User,
        password::verify_password,
    },
    mememo_common::{Error, Result},
    mememo_config::AuthConfig,
    tracing::warn,
};

pub struct AuthServices {
    pub store: Arc<dyn AuthStore>,
    pub grants: GrantAuthority,
    pub third_party: ThirdPartyAuthGateway,
    pub tokens: BearerTokenAuthority,
}

impl AuthServices {
    pub fn new(store: Arc<dyn AuthStore>, config: &AuthConfig) -> Self {
        Self {
            grants: GrantAuthority::new(Arc::clone(&store), config),
            third_party: ThirdPartyAuthGateway::new(Arc::clone(&store), config),
            tokens: BearerTokenAuthority::new(Arc::clone(&store), config),
            store,
        }
    }

    /// Password login. Unknown users and password-less accounts fail the
    /// same way as a wrong password.
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        match self.store.get_user(username).await? {
            Some(user)
                if user
                    .password_hash
                    .as_deref()
                    .is_some_and(|hash| verify_password(password, hash)) =>
            {
                Ok(user)
            },
            _ => {
                warn!(user = %username, "password login failed");
                Err(Error::authentication("invalid username or password"))
            },
        }
    }

    pub async fn token_login(&self, plaintext: &str) -> Result<User> {
        self.tokens
            .resolve(plaintext)
            .await?
            .ok_or_else(|| Error::authentication("invalid or expired token"))
    }
}
