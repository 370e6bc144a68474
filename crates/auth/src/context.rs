use std::collections::{BTreeMap, BTreeSet};

use mememo_common::{Error, Result};

use crate::types::User;

/// Resolved caller of one function call.
///
/// Built by [`crate::GrantAuthority::context`]; the same shape is produced
/// for directly authenticated users and for users vouched for by a gateway.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user: User,
    /// System-level permissions, e.g. `mememo.gatekeeper`.
    pub permissions: BTreeSet<String>,
    /// Active service-qualified grant codes, e.g. `ledger:all`.
    pub grants: BTreeSet<String>,
    pub function_name: String,
    pub args: Vec<String>,
}

impl CallContext {
    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn is_superuser(&self) -> bool {
        self.user.is_superuser
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn has_grant(&self, grant: &str) -> bool {
        self.grants.contains(grant)
    }

    /// Environment handed to a service subprocess on behalf of this caller.
    ///
    /// Fails when an argument holds a NUL byte, which can be neither quoted
    /// nor passed through the environment.
    pub fn env(&self) -> Result<BTreeMap<String, String>> {
        let join = |set: &BTreeSet<String>, sep: &str| {
            set.iter().map(String::as_str).collect::<Vec<_>>().join(sep)
        };
        let args = shlex::try_join(self.args.iter().map(String::as_str))
            .map_err(|_| Error::validation("arguments must not contain NUL bytes"))?;

        Ok(BTreeMap::from([
            ("MEMEMO_USERNAME".to_string(), self.user.username.clone()),
            (
                "MEMEMO_EMAIL".to_string(),
                self.user.email.clone().unwrap_or_default(),
            ),
            ("MEMEMO_PERMISSIONS".to_string(), join(&self.permissions, " ")),
            ("MEMEMO_GRANTS".to_string(), join(&self.grants, ",")),
            ("MEMEMO_FUNCTION".to_string(), self.function_name.clone()),
            ("MEMEMO_ARGS".to_string(), args),
        ]))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_exports_caller() {
        let mut user = User::new("lain");
        user.email = Some("lain@wired.net".into());
        let ctx = CallContext {
            user,
            permissions: ["mememo.gatekeeper", "mememo.third_party_gateway"]
                .map(String::from)
                .into(),
            grants: ["ledger:all", "task:add"].map(String::from).into(),
            function_name: "weather".into(),
            args: vec!["new york".into(), "it's".into()],
        };
        let env = ctx.env().unwrap();
        assert_eq!(env["MEMEMO_USERNAME"], "lain");
        assert_eq!(env["MEMEMO_EMAIL"], "lain@wired.net");
        assert_eq!(
            env["MEMEMO_PERMISSIONS"],
            "mememo.gatekeeper mememo.third_party_gateway"
        );
        assert_eq!(env["MEMEMO_GRANTS"], "ledger:all,task:add");
        assert_eq!(env["MEMEMO_FUNCTION"], "weather");
        assert_eq!(
            shlex::split(&env["MEMEMO_ARGS"]).unwrap(),
            vec!["new york", "it's"]
        );
    }

    #[test]
    fn nul_byte_in_args_is_rejected() {
        let ctx = CallContext {
            user: User::new("lain"),
            permissions: BTreeSet::new(),
            grants: BTreeSet::new(),
            function_name: "weather".into(),
            args: vec!["oslo".into(), "to\0day".into()],
        };
        let err = ctx.env().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
