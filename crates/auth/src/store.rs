//! Persistence trait for accounts, grants, challenges and tokens.

use {async_trait::async_trait, mememo_common::Result};

use crate::types::{BearerTokenRecord, GrantAssignment, ThirdPartyAuthRequest, User};

/// Persistence backend for everything the authorization layer reads.
///
/// Listing methods return rows in a stable order (by username, code or
/// identity) so admin output is deterministic.
#[async_trait]
pub trait AuthStore: Send + Sync {
    // ── Users ───────────────────────────────────────────────────────────────
    async fn get_user(&self, username: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;
    /// Insert or replace a user.
    async fn put_user(&self, user: &User) -> Result<()>;
    /// Delete a user with its permissions, assignments, tokens and bindings.
    async fn delete_user(&self, username: &str) -> Result<bool>;

    // ── System permissions ─────────────────────────────────────────────────
    async fn permissions(&self, username: &str) -> Result<Vec<String>>;
    async fn add_permission(&self, username: &str, permission: &str) -> Result<()>;
    async fn remove_permission(&self, username: &str, permission: &str) -> Result<bool>;

    // ── Grants ──────────────────────────────────────────────────────────────
    /// Register a grant code. Returns `false` if it already existed.
    async fn create_grant(&self, code: &str) -> Result<bool>;
    async fn grant_exists(&self, code: &str) -> Result<bool>;
    async fn list_grants(&self) -> Result<Vec<String>>;
    /// Delete a grant code and every assignment of it.
    async fn delete_grant(&self, code: &str) -> Result<bool>;
    async fn assignments(&self, username: &str) -> Result<Vec<GrantAssignment>>;
    /// Insert or replace the assignment for `(username, grant)`.
    async fn assign_grant(&self, assignment: &GrantAssignment) -> Result<()>;
    async fn unassign_grant(&self, username: &str, code: &str) -> Result<bool>;

    // ── Third-party challenges ─────────────────────────────────────────────
    async fn get_challenge(&self, identity: &str) -> Result<Option<ThirdPartyAuthRequest>>;
    /// Atomically replace whatever record exists for the identity.
    async fn put_challenge(&self, request: &ThirdPartyAuthRequest) -> Result<()>;
    async fn delete_challenge(&self, identity: &str) -> Result<bool>;
    async fn list_challenges(&self) -> Result<Vec<ThirdPartyAuthRequest>>;

    // ── Bearer tokens ──────────────────────────────────────────────────────
    async fn get_token(&self, id: &str) -> Result<Option<BearerTokenRecord>>;
    /// Store a token, deleting any prior token of the same user first.
    async fn put_token(&self, token: &BearerTokenRecord) -> Result<()>;
    async fn delete_tokens(&self, username: &str) -> Result<bool>;
}
