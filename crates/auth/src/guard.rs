//! Grant and permission evaluation.
//!
//! Grants (`service:name`, assigned per user with an expiry) and system
//! permissions (`mememo.*`) are separate namespaces. Superusers pass every
//! check.

use std::{collections::BTreeSet, sync::Arc};

use {
    chrono::{TimeDelta, Utc},
    mememo_common::{Error, Result},
    mememo_config::AuthConfig,
    tracing::{debug, warn},
};

use crate::{
    context::CallContext,
    grant::parse_grant,
    store::AuthStore,
    types::{GrantAssignment, User},
};

/// Requirement attached to a handler and checked right before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Policy {
    /// Any authenticated caller.
    #[default]
    Open,
    AllGrants(Vec<String>),
    AnyGrant(Vec<String>),
    AllPermissions(Vec<String>),
    AnyPermission(Vec<String>),
}

impl Policy {
    pub fn all_grants<I: IntoIterator<Item = S>, S: Into<String>>(grants: I) -> Self {
        Self::AllGrants(grants.into_iter().map(Into::into).collect())
    }

    pub fn any_grant<I: IntoIterator<Item = S>, S: Into<String>>(grants: I) -> Self {
        Self::AnyGrant(grants.into_iter().map(Into::into).collect())
    }

    pub fn any_permission<I: IntoIterator<Item = S>, S: Into<String>>(perms: I) -> Self {
        Self::AnyPermission(perms.into_iter().map(Into::into).collect())
    }

    pub fn check(&self, ctx: &CallContext) -> Result<()> {
        let result = match self {
            Self::Open => Ok(()),
            Self::AllGrants(required) => require_all(ctx, required, CallContext::has_grant),
            Self::AnyGrant(required) => require_any(ctx, required, CallContext::has_grant),
            Self::AllPermissions(required) => {
                require_all(ctx, required, CallContext::has_permission)
            },
            Self::AnyPermission(required) => {
                require_any(ctx, required, CallContext::has_permission)
            },
        };
        if let Err(ref e) = result {
            warn!(
                user = %ctx.username(),
                function = %ctx.function_name,
                error = %e,
                "authorization denied"
            );
        }
        result
    }
}

fn require_all(
    ctx: &CallContext,
    required: &[String],
    holds: fn(&CallContext, &str) -> bool,
) -> Result<()> {
    if ctx.is_superuser() {
        return Ok(());
    }
    let missing: Vec<&String> = required.iter().filter(|r| !holds(ctx, r)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::authorization(missing.into_iter().cloned()))
    }
}

fn require_any(
    ctx: &CallContext,
    required: &[String],
    holds: fn(&CallContext, &str) -> bool,
) -> Result<()> {
    if ctx.is_superuser() || required.is_empty() || required.iter().any(|r| holds(ctx, r)) {
        Ok(())
    } else {
        Err(Error::authorization(required.iter().cloned()))
    }
}

/// Caller must hold every grant in `required`.
pub fn require_all_grants(ctx: &CallContext, required: &[String]) -> Result<()> {
    require_all(ctx, required, CallContext::has_grant)
}

/// Caller must hold at least one grant in `required`.
pub fn require_any_grant(ctx: &CallContext, required: &[String]) -> Result<()> {
    require_any(ctx, required, CallContext::has_grant)
}

// ── Authority ────────────────────────────────────────────────────────────────

/// Builds call contexts from stored grants and manages assignments.
pub struct GrantAuthority {
    store: Arc<dyn AuthStore>,
    grant_lifetime: TimeDelta,
    enforce_expiry: bool,
}

impl GrantAuthority {
    pub fn new(store: Arc<dyn AuthStore>, config: &AuthConfig) -> Self {
        Self {
            store,
            grant_lifetime: config.grant_lifetime.as_chrono(),
            enforce_expiry: config.enforce_grant_expiry,
        }
    }

    pub fn store(&self) -> &Arc<dyn AuthStore> {
        &self.store
    }

    /// Grant codes currently held by `username`.
    ///
    /// Expired assignments are only dropped when expiry enforcement is on.
    pub async fn active_grants(&self, username: &str) -> Result<BTreeSet<String>> {
        let now = Utc::now();
        Ok(self
            .store
            .assignments(username)
            .await?
            .into_iter()
            .filter(|a| !self.enforce_expiry || a.expiry > now)
            .map(|a| a.grant)
            .collect())
    }

    /// Resolve the full call context for `user` calling `function_name`.
    pub async fn context(
        &self,
        user: User,
        function_name: impl Into<String>,
        args: Vec<String>,
    ) -> Result<CallContext> {
        let permissions = self
            .store
            .permissions(&user.username)
            .await?
            .into_iter()
            .collect();
        let grants = self.active_grants(&user.username).await?;
        Ok(CallContext {
            user,
            permissions,
            grants,
            function_name: function_name.into(),
            args,
        })
    }

    /// Register a new grant code.
    pub async fn create_grant(&self, code: &str) -> Result<String> {
        let code = parse_grant(code)?;
        if !self.store.create_grant(&code).await? {
            return Err(Error::validation(format!("grant already exists: {code}")));
        }
        debug!(grant = %code, "grant created");
        Ok(code)
    }

    /// Assign an existing grant to an existing user for the grant lifetime.
    pub async fn assign(&self, username: &str, code: &str) -> Result<GrantAssignment> {
        let code = parse_grant(code)?;
        if self.store.get_user(username).await?.is_none() {
            return Err(Error::not_found("user", username));
        }
        if !self.store.grant_exists(&code).await? {
            return Err(Error::not_found("grant", code));
        }
        let assignment = GrantAssignment {
            username: username.to_string(),
            grant: code,
            expiry: Utc::now() + self.grant_lifetime,
        };
        self.store.assign_grant(&assignment).await?;
        debug!(user = %username, grant = %assignment.grant, "grant assigned");
        Ok(assignment)
    }

    pub async fn revoke(&self, username: &str, code: &str) -> Result<()> {
        let code = parse_grant(code)?;
        if !self.store.unassign_grant(username, &code).await? {
            return Err(Error::not_found("grant assignment", format!("{username} {code}")));
        }
        debug!(user = %username, grant = %code, "grant revoked");
        Ok(())
    }

    /// Delete a grant code and every assignment of it.
    pub async fn purge(&self, code: &str) -> Result<()> {
        let code = parse_grant(code)?;
        if !self.store.delete_grant(&code).await? {
            return Err(Error::not_found("grant", code));
        }
        debug!(grant = %code, "grant purged");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::store_memory::InMemoryAuthStore};

    fn ctx(user: User, grants: &[&str], permissions: &[&str]) -> CallContext {
        CallContext {
            user,
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            grants: grants.iter().map(|s| s.to_string()).collect(),
            function_name: "ledger".into(),
            args: Vec::new(),
        }
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn any_of_passes_where_all_of_fails() {
        let caller = ctx(User::new("bob"), &["svc:sub"], &[]);
        let required = list(&["svc:all", "svc:sub"]);
        assert!(require_any_grant(&caller, &required).is_ok());

        let err = require_all_grants(&caller, &required).unwrap_err();
        match err {
            Error::Authorization { missing } => assert_eq!(missing, vec!["svc:all"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn any_of_lists_all_candidates_when_none_held() {
        let caller = ctx(User::new("bob"), &[], &[]);
        let err = require_any_grant(&caller, &list(&["svc:all", "svc:sub"])).unwrap_err();
        assert_eq!(err.to_string(), "not authorized, missing: svc:all, svc:sub");
    }

    #[test]
    fn superuser_bypasses_everything() {
        let root = ctx(User::new("root").superuser(), &[], &[]);
        assert!(Policy::all_grants(["a:b", "c:d"]).check(&root).is_ok());
        assert!(Policy::any_permission(["mememo.gatekeeper"]).check(&root).is_ok());
    }

    #[test]
    fn grants_and_permissions_do_not_mix() {
        let caller = ctx(User::new("gk"), &[], &["mememo.gatekeeper"]);
        assert!(Policy::any_permission(["mememo.gatekeeper"]).check(&caller).is_ok());
        assert!(Policy::any_grant(["mememo.gatekeeper"]).check(&caller).is_err());
    }

    #[test]
    fn open_and_empty_policies_pass() {
        let caller = ctx(User::new("bob"), &[], &[]);
        assert!(Policy::Open.check(&caller).is_ok());
        assert!(Policy::AnyGrant(Vec::new()).check(&caller).is_ok());
        assert!(Policy::AllGrants(Vec::new()).check(&caller).is_ok());
    }

    async fn authority(enforce: bool) -> GrantAuthority {
        let store = Arc::new(InMemoryAuthStore::new());
        store.put_user(&User::new("bob")).await.unwrap();
        let config = AuthConfig {
            enforce_grant_expiry: enforce,
            ..AuthConfig::default()
        };
        GrantAuthority::new(store, &config)
    }

    #[tokio::test]
    async fn assign_requires_existing_grant_and_user() {
        let auth = authority(false).await;
        assert!(matches!(
            auth.assign("bob", "ledger:all").await.unwrap_err(),
            Error::NotFound { kind: "grant", .. }
        ));
        auth.create_grant("ledger:all").await.unwrap();
        assert!(matches!(
            auth.assign("nobody", "ledger:all").await.unwrap_err(),
            Error::NotFound { kind: "user", .. }
        ));
        let assignment = auth.assign("bob", "ledger:all").await.unwrap();
        assert!(assignment.expiry > Utc::now() + TimeDelta::days(364));

        let ctx = auth
            .context(User::new("bob"), "ledger", Vec::new())
            .await
            .unwrap();
        assert!(ctx.has_grant("ledger:all"));
    }

    #[tokio::test]
    async fn malformed_grant_code_is_rejected() {
        let auth = authority(false).await;
        assert!(matches!(
            auth.create_grant("ledger").await.unwrap_err(),
            Error::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn expired_assignments_kept_unless_enforced() {
        for (enforce, expected) in [(false, true), (true, false)] {
            let auth = authority(enforce).await;
            auth.store()
                .assign_grant(&GrantAssignment {
                    username: "bob".into(),
                    grant: "task:add".into(),
                    expiry: Utc::now() - TimeDelta::days(1),
                })
                .await
                .unwrap();
            let grants = auth.active_grants("bob").await.unwrap();
            assert_eq!(grants.contains("task:add"), expected, "enforce={enforce}");
        }
    }

    #[tokio::test]
    async fn revoke_and_purge() {
        let auth = authority(false).await;
        auth.create_grant("task:add").await.unwrap();
        auth.assign("bob", "task:add").await.unwrap();
        auth.revoke("bob", "task:add").await.unwrap();
        assert!(auth.revoke("bob", "task:add").await.is_err());
        auth.purge("task:add").await.unwrap();
        assert!(auth.purge("task:add").await.is_err());
    }
}
