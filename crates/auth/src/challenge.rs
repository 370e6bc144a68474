//! Challenge-response binding of external identities to local users.
//!
//! ```text
//! Unregistered --issue--> Pending --redeem(ok)--> Authenticated
//!      ^                     |                        |
//!      +--expired/mismatch---+        <--issue--------+
//! ```
//! A superuser may `override` any identity straight to Authenticated.

use std::sync::Arc;

use {
    chrono::{TimeDelta, Utc},
    mememo_common::{Error, Result},
    mememo_config::AuthConfig,
    rand::Rng,
    tracing::{info, warn},
};

use crate::{
    context::CallContext,
    password::safe_equal,
    store::AuthStore,
    types::{THIRD_PARTY_GATEWAY, ThirdPartyAuthRequest, User},
};

fn generate_challenge() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}

pub struct ThirdPartyAuthGateway {
    store: Arc<dyn AuthStore>,
    challenge_expiry: TimeDelta,
    auth_expiry: TimeDelta,
}

impl ThirdPartyAuthGateway {
    pub fn new(store: Arc<dyn AuthStore>, config: &AuthConfig) -> Self {
        Self {
            store,
            challenge_expiry: config.challenge_expiry.as_chrono(),
            auth_expiry: config.third_party_expiry.as_chrono(),
        }
    }

    fn require_gateway(gateway: &CallContext) -> Result<()> {
        if gateway.is_superuser() || gateway.has_permission(THIRD_PARTY_GATEWAY) {
            Ok(())
        } else {
            Err(Error::authorization([THIRD_PARTY_GATEWAY]))
        }
    }

    /// Start (or restart) a challenge for `identity`, replacing any record.
    ///
    /// The returned request carries the code; callers relaying to the
    /// external user must not echo it back through the gateway.
    pub async fn issue(
        &self,
        gateway: &CallContext,
        identity: &str,
        alias: &str,
    ) -> Result<ThirdPartyAuthRequest> {
        Self::require_gateway(gateway)?;
        let request = ThirdPartyAuthRequest {
            identity: identity.to_string(),
            alias: alias.to_string(),
            challenge: generate_challenge(),
            expiry: Utc::now() + self.challenge_expiry,
            user: None,
        };
        self.store.put_challenge(&request).await?;
        info!(identity, alias, gateway = %gateway.username(), "third-party challenge issued");
        Ok(request)
    }

    /// Redeem the pending challenge for `identity`.
    ///
    /// Expiry or mismatch deletes the pending record.
    pub async fn redeem(
        &self,
        gateway: &CallContext,
        identity: &str,
        challenge: &str,
    ) -> Result<User> {
        Self::require_gateway(gateway)?;
        let Some(request) = self.store.get_challenge(identity).await? else {
            return Err(Error::challenge("no pending challenge"));
        };
        if request.challenge.is_empty() {
            return Err(Error::challenge("no pending challenge"));
        }
        if request.is_expired(Utc::now()) {
            self.store.delete_challenge(identity).await?;
            warn!(identity, "third-party challenge expired");
            return Err(Error::challenge("challenge expired"));
        }
        if !safe_equal(&request.challenge, challenge.trim()) {
            self.store.delete_challenge(identity).await?;
            warn!(identity, "third-party challenge mismatch");
            return Err(Error::challenge("challenge mismatch"));
        }
        let user = self.bind(request).await?;
        info!(identity, user = %user.username, "third-party identity authenticated");
        Ok(user)
    }

    /// Operator recovery: authenticate `identity` as `alias` without a challenge.
    pub async fn override_identity(
        &self,
        operator: &CallContext,
        identity: &str,
        alias: &str,
    ) -> Result<User> {
        if !operator.is_superuser() {
            return Err(Error::authorization(["superuser"]));
        }
        let request = ThirdPartyAuthRequest {
            identity: identity.to_string(),
            alias: alias.to_string(),
            challenge: String::new(),
            expiry: Utc::now(),
            user: None,
        };
        let user = self.bind(request).await?;
        info!(
            identity,
            user = %user.username,
            operator = %operator.username(),
            "third-party identity overridden"
        );
        Ok(user)
    }

    /// Clear the challenge, bind (creating if needed) the alias user and
    /// extend the expiry to the long-lived window.
    async fn bind(&self, mut request: ThirdPartyAuthRequest) -> Result<User> {
        let user = match self.store.get_user(&request.alias).await? {
            Some(user) => user,
            None => {
                let user = User::new(request.alias.clone());
                self.store.put_user(&user).await?;
                user
            },
        };
        request.challenge.clear();
        request.user = Some(user.username.clone());
        request.expiry = Utc::now() + self.auth_expiry;
        self.store.put_challenge(&request).await?;
        Ok(user)
    }

    /// The local user bound to an authenticated, unexpired identity.
    pub async fn resolve(&self, identity: &str) -> Result<User> {
        let request = self
            .store
            .get_challenge(identity)
            .await?
            .filter(|r| r.is_authenticated() && !r.is_expired(Utc::now()))
            .ok_or_else(|| {
                Error::authentication(format!("identity not authenticated: {identity}"))
            })?;
        let username = request.user.unwrap_or_default();
        self.store
            .get_user(&username)
            .await?
            .ok_or_else(|| {
                Error::authentication(format!("bound user no longer exists: {username}"))
            })
    }

    /// Every challenge or binding record, pending ones included.
    pub async fn list(&self) -> Result<Vec<ThirdPartyAuthRequest>> {
        self.store.list_challenges().await
    }
}
