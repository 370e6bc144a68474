//! In-memory store for tests and throwaway deployments.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use {async_trait::async_trait, mememo_common::Result};

use crate::{
    store::AuthStore,
    types::{BearerTokenRecord, GrantAssignment, ThirdPartyAuthRequest, User},
};

#[derive(Default)]
struct State {
    users: BTreeMap<String, User>,
    permissions: BTreeMap<String, BTreeSet<String>>,
    grants: BTreeSet<String>,
    /// username -> grant -> assignment
    assignments: BTreeMap<String, BTreeMap<String, GrantAssignment>>,
    challenges: BTreeMap<String, ThirdPartyAuthRequest>,
    tokens: BTreeMap<String, BearerTokenRecord>,
}

/// In-memory store backed by ordered maps. No persistence.
#[derive(Default)]
pub struct InMemoryAuthStore {
    state: Mutex<State>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl AuthStore for InMemoryAuthStore {
    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        Ok(self.with(|s| s.users.get(username).cloned()))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.with(|s| s.users.values().cloned().collect()))
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        self.with(|s| s.users.insert(user.username.clone(), user.clone()));
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        Ok(self.with(|s| {
            s.permissions.remove(username);
            s.assignments.remove(username);
            s.tokens.retain(|_, t| t.username != username);
            s.challenges
                .retain(|_, c| c.user.as_deref() != Some(username));
            s.users.remove(username).is_some()
        }))
    }

    async fn permissions(&self, username: &str) -> Result<Vec<String>> {
        Ok(self.with(|s| {
            s.permissions
                .get(username)
                .map(|p| p.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn add_permission(&self, username: &str, permission: &str) -> Result<()> {
        self.with(|s| {
            s.permissions
                .entry(username.to_string())
                .or_default()
                .insert(permission.to_string())
        });
        Ok(())
    }

    async fn remove_permission(&self, username: &str, permission: &str) -> Result<bool> {
        Ok(self.with(|s| {
            s.permissions
                .get_mut(username)
                .is_some_and(|p| p.remove(permission))
        }))
    }

    async fn create_grant(&self, code: &str) -> Result<bool> {
        Ok(self.with(|s| s.grants.insert(code.to_string())))
    }

    async fn grant_exists(&self, code: &str) -> Result<bool> {
        Ok(self.with(|s| s.grants.contains(code)))
    }

    async fn list_grants(&self) -> Result<Vec<String>> {
        Ok(self.with(|s| s.grants.iter().cloned().collect()))
    }

    async fn delete_grant(&self, code: &str) -> Result<bool> {
        Ok(self.with(|s| {
            for held in s.assignments.values_mut() {
                held.remove(code);
            }
            s.grants.remove(code)
        }))
    }

    async fn assignments(&self, username: &str) -> Result<Vec<GrantAssignment>> {
        Ok(self.with(|s| {
            s.assignments
                .get(username)
                .map(|a| a.values().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn assign_grant(&self, assignment: &GrantAssignment) -> Result<()> {
        self.with(|s| {
            s.assignments
                .entry(assignment.username.clone())
                .or_default()
                .insert(assignment.grant.clone(), assignment.clone())
        });
        Ok(())
    }

    async fn unassign_grant(&self, username: &str, code: &str) -> Result<bool> {
        Ok(self.with(|s| {
            s.assignments
                .get_mut(username)
                .is_some_and(|a| a.remove(code).is_some())
        }))
    }

    async fn get_challenge(&self, identity: &str) -> Result<Option<ThirdPartyAuthRequest>> {
        Ok(self.with(|s| s.challenges.get(identity).cloned()))
    }

    async fn put_challenge(&self, request: &ThirdPartyAuthRequest) -> Result<()> {
        self.with(|s| {
            s.challenges
                .insert(request.identity.clone(), request.clone())
        });
        Ok(())
    }

    async fn delete_challenge(&self, identity: &str) -> Result<bool> {
        Ok(self.with(|s| s.challenges.remove(identity).is_some()))
    }

    async fn list_challenges(&self) -> Result<Vec<ThirdPartyAuthRequest>> {
        Ok(self.with(|s| s.challenges.values().cloned().collect()))
    }

    async fn get_token(&self, id: &str) -> Result<Option<BearerTokenRecord>> {
        Ok(self.with(|s| s.tokens.get(id).cloned()))
    }

    async fn put_token(&self, token: &BearerTokenRecord) -> Result<()> {
        self.with(|s| {
            s.tokens.retain(|_, t| t.username != token.username);
            s.tokens.insert(token.id.clone(), token.clone());
        });
        Ok(())
    }

    async fn delete_tokens(&self, username: &str) -> Result<bool> {
        Ok(self.with(|s| {
            let before = s.tokens.len();
            s.tokens.retain(|_, t| t.username != username);
            s.tokens.len() != before
        }))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::Utc};

    #[tokio::test]
    async fn delete_user_cascades() {
        let store = InMemoryAuthStore::new();
        store.put_user(&User::new("alice")).await.unwrap();
        store.add_permission("alice", "mememo.gatekeeper").await.unwrap();
        store.create_grant("ledger:all").await.unwrap();
        store
            .assign_grant(&GrantAssignment {
                username: "alice".into(),
                grant: "ledger:all".into(),
                expiry: Utc::now(),
            })
            .await
            .unwrap();
        store
            .put_token(&BearerTokenRecord {
                id: "digest".into(),
                username: "alice".into(),
                expiry: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_user("alice").await.unwrap());
        assert!(store.permissions("alice").await.unwrap().is_empty());
        assert!(store.assignments("alice").await.unwrap().is_empty());
        assert!(store.get_token("digest").await.unwrap().is_none());
        assert!(!store.delete_user("alice").await.unwrap());
    }

    #[tokio::test]
    async fn purge_grant_removes_assignments() {
        let store = InMemoryAuthStore::new();
        store.create_grant("task:add").await.unwrap();
        assert!(!store.create_grant("task:add").await.unwrap());
        store
            .assign_grant(&GrantAssignment {
                username: "bob".into(),
                grant: "task:add".into(),
                expiry: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.delete_grant("task:add").await.unwrap());
        assert!(store.assignments("bob").await.unwrap().is_empty());
        assert!(!store.grant_exists("task:add").await.unwrap());
    }
}
