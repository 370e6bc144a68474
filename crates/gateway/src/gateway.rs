//! Call and message entry points.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use {
    mememo_auth::{AuthStore, CallContext, THIRD_PARTY_GATEWAY, User},
    mememo_common::{Error, Result},
    mememo_config::MememoConfig,
    mememo_services::{ServiceManager, StateStore},
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{admin::AdminService, auth::AuthServices, session::SessionTable};

// ── Built-in function names ─────────────────────────────────────────────────

pub const AUTH: &str = "auth";
pub const AUTH3P: &str = "auth3p";
pub const TOKEN: &str = "token";
pub const WHOAMI: &str = "whoami";
pub const HELP: &str = "help";

/// Outcome of one call as seen by the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    pub text: String,
}

impl Reply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
        }
    }

    pub fn error(err: &Error) -> Self {
        Self {
            ok: false,
            text: err.to_string(),
        }
    }
}

impl From<Result<String>> for Reply {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(text) => Self::ok(text),
            Err(e) => Self::error(&e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Function,
    Message,
}

pub struct Gateway {
    sessions: SessionTable,
    auth: Arc<AuthServices>,
    manager: Arc<ServiceManager>,
}

impl Gateway {
    /// Build the service manager from `config` with the admin service
    /// installed, sharing `store` for every authority.
    pub fn from_config(
        config: &MememoConfig,
        store: Arc<dyn AuthStore>,
        state: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let auth = Arc::new(AuthServices::new(store, &config.auth));
        let mut manager = ServiceManager::from_config(config, state, cancel)?;
        manager.register_builtin(Arc::new(AdminService::new(Arc::clone(&auth))));
        Ok(Self::new(
            auth,
            Arc::new(manager),
            config.auth.session_timeout.as_duration(),
        ))
    }

    pub fn new(
        auth: Arc<AuthServices>,
        manager: Arc<ServiceManager>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            sessions: SessionTable::new(session_timeout),
            auth,
            manager,
        }
    }

    pub fn auth(&self) -> &Arc<AuthServices> {
        &self.auth
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn connect(&self, conn_id: &str) -> Result<()> {
        self.sessions.connect(conn_id)
    }

    pub fn disconnect(&self, conn_id: &str) -> bool {
        self.sessions.disconnect(conn_id)
    }

    /// Invoke `function` with `args` on behalf of the session `conn_id`.
    pub async fn call(&self, conn_id: &str, function: &str, args: Vec<String>) -> Reply {
        let result = self.try_call(conn_id, function, args, Route::Function).await;
        Self::log_outcome(conn_id, function, &result);
        result.into()
    }

    /// Route a free-text message by the sigil of its first word.
    ///
    /// The text is split with shell quoting rules. Sessions acting as a
    /// third-party gateway prefix it with `<identity> <alias>`.
    pub async fn message(&self, conn_id: &str, text: &str) -> Reply {
        let result = self.try_message(conn_id, text).await;
        Self::log_outcome(conn_id, "message", &result);
        result.into()
    }

    fn log_outcome(conn_id: &str, function: &str, result: &Result<String>) {
        match result {
            Ok(_) => debug!(conn_id, function, "call succeeded"),
            Err(e) if e.is_caller_fault() => debug!(conn_id, function, error = %e, "call rejected"),
            Err(e) => warn!(conn_id, function, error = %e, "call failed"),
        }
    }

    async fn try_message(&self, conn_id: &str, text: &str) -> Result<String> {
        let mut words =
            shlex::split(text).ok_or_else(|| Error::validation("unbalanced quotes in message"))?;
        let skip = if self.session_is_gateway(conn_id).await? {
            2
        } else {
            0
        };
        if words.len() <= skip {
            return Err(Error::validation("empty message"));
        }
        let function = words.remove(skip);
        self.try_call(conn_id, &function, words, Route::Message).await
    }

    /// The session's account as currently stored, `None` while anonymous.
    ///
    /// A session whose account was deleted after login is logged out.
    async fn session_user(&self, conn_id: &str) -> Result<Option<User>> {
        let Some(user) = self.sessions.user(conn_id)? else {
            return Ok(None);
        };
        match self.auth.store.get_user(&user.username).await? {
            Some(current) => Ok(Some(current)),
            None => {
                self.sessions.logout(conn_id);
                warn!(conn_id, user = %user.username, "account removed, session logged out");
                Err(Error::authentication("account no longer exists"))
            },
        }
    }

    async fn session_is_gateway(&self, conn_id: &str) -> Result<bool> {
        match self.session_user(conn_id).await? {
            Some(user) => Ok(self
                .auth
                .store
                .permissions(&user.username)
                .await?
                .iter()
                .any(|p| p == THIRD_PARTY_GATEWAY)),
            None => Ok(false),
        }
    }

    async fn try_call(
        &self,
        conn_id: &str,
        function: &str,
        args: Vec<String>,
        route: Route,
    ) -> Result<String> {
        let Some(user) = self.session_user(conn_id).await? else {
            return self.login(conn_id, function, &args).await;
        };
        let ctx = self.auth.grants.context(user, function, args).await?;

        if !ctx.has_permission(THIRD_PARTY_GATEWAY) {
            if matches!(function, AUTH | TOKEN) {
                return self.login(conn_id, function, &ctx.args).await;
            }
            return self.dispatch(ctx, route).await;
        }

        // Gateway sessions relay calls for external identities.
        let [identity, alias, rest @ ..] = ctx.args.as_slice() else {
            return Err(Error::validation(
                "third-party gateway calls must start with <identity> <alias>",
            ));
        };
        let function = if function == AUTH { AUTH3P } else { function };
        if function == AUTH3P {
            return self
                .auth3p(&ctx, identity, alias, rest.first().map(String::as_str))
                .await;
        }
        let user = self.auth.third_party.resolve(identity).await?;
        debug!(
            gateway = %ctx.username(),
            identity = %identity,
            user = %user.username,
            function,
            "relaying third-party call"
        );
        let relayed = self
            .auth
            .grants
            .context(user, function, rest.to_vec())
            .await?;
        self.dispatch(relayed, route).await
    }

    /// Login functions available to anonymous sessions.
    async fn login(&self, conn_id: &str, function: &str, args: &[String]) -> Result<String> {
        let user = match (function, args) {
            (AUTH, [username, password]) => self.auth.login(username, password).await?,
            (AUTH, _) => return Err(Error::validation("usage: auth <username> <password>")),
            (TOKEN, [token]) => self.auth.token_login(token).await?,
            (TOKEN, _) => return Err(Error::validation("usage: token <token>")),
            (AUTH3P, _) => return Err(Error::authorization([THIRD_PARTY_GATEWAY])),
            _ => return Err(Error::authentication("not logged in")),
        };
        let reply = format!("Logged in as {}.", user.username);
        self.sessions.authenticate(conn_id, user)?;
        Ok(reply)
    }

    async fn auth3p(
        &self,
        gateway: &CallContext,
        identity: &str,
        alias: &str,
        challenge: Option<&str>,
    ) -> Result<String> {
        match challenge {
            None => {
                self.auth.third_party.issue(gateway, identity, alias).await?;
                Ok(format!(
                    "Challenge issued for {identity}. Ask an operator for the code."
                ))
            },
            Some(code) => {
                let user = self.auth.third_party.redeem(gateway, identity, code).await?;
                info!(identity, user = %user.username, "third-party login");
                Ok(format!("{identity} is now authenticated as {}.", user.username))
            },
        }
    }

    async fn dispatch(&self, ctx: CallContext, route: Route) -> Result<String> {
        match ctx.function_name.as_str() {
            WHOAMI => Ok(describe(&ctx)),
            HELP => Ok(self.manager.help_text()),
            AUTH3P => {
                let [identity, alias, rest @ ..] = ctx.args.as_slice() else {
                    return Err(Error::validation(
                        "usage: auth3p <identity> <alias> [challenge]",
                    ));
                };
                self.auth3p(&ctx, identity, alias, rest.first().map(String::as_str))
                    .await
            },
            function => {
                let service = match route {
                    Route::Function => self.manager.get_function_handler(function)?,
                    Route::Message => {
                        let line = std::iter::once(function)
                            .chain(ctx.args.iter().map(String::as_str))
                            .collect::<Vec<_>>()
                            .join(" ");
                        self.manager.get_message_handler(&line)?
                    },
                };
                debug!(
                    service = %service.name(),
                    function,
                    user = %ctx.username(),
                    "dispatching call"
                );
                service.call(&ctx).await
            },
        }
    }
}

fn describe(ctx: &CallContext) -> String {
    let list = |set: &BTreeSet<String>| {
        if set.is_empty() {
            "(none)".to_string()
        } else {
            set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
        }
    };
    format!(
        "user: {}{}\npermissions: {}\ngrants: {}",
        ctx.username(),
        if ctx.is_superuser() {
            " (superuser)"
        } else {
            ""
        },
        list(&ctx.permissions),
        list(&ctx.grants),
    )
}
