use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Permission held by a trusted gateway that vouches for third-party users.
pub const THIRD_PARTY_GATEWAY: &str = "mememo.third_party_gateway";

/// Permission to run administrative functions without being a superuser.
pub const GATEKEEPER: &str = "mememo.gatekeeper";

/// A local user account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: Option<String>,
    pub is_superuser: bool,
    /// Argon2 PHC string. `None` for users that can only log in by token or
    /// through a third-party gateway.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            is_superuser: false,
            password_hash: None,
        }
    }

    #[must_use]
    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("is_superuser", &self.is_superuser)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A grant held by a user until `expiry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantAssignment {
    pub username: String,
    pub grant: String,
    pub expiry: DateTime<Utc>,
}

/// One live challenge or binding for an external identity.
///
/// Pending while `challenge` is non-empty and `user` is unset; authenticated
/// once the challenge has been cleared and a user bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartyAuthRequest {
    pub identity: String,
    pub alias: String,
    pub challenge: String,
    pub expiry: DateTime<Utc>,
    pub user: Option<String>,
}

impl ThirdPartyAuthRequest {
    pub fn is_authenticated(&self) -> bool {
        self.challenge.is_empty() && self.user.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Stored form of a bearer token. `id` is the digest, never the plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerTokenRecord {
    pub id: String,
    pub username: String,
    pub expiry: DateTime<Utc>,
}
