//! The `admin` built-in service: users, permissions, grants, tokens and
//! third-party identities.
//!
//! Every subcommand requires superuser or the `mememo.gatekeeper`
//! permission. Operations that touch a superuser account, or create one,
//! require the caller to be a superuser as well.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::SecondsFormat,
    mememo_auth::{CallContext, GATEKEEPER, Policy, User, password::hash_password},
    mememo_common::{Error, Result},
    mememo_services::{CommandContext, CommandDispatcher, CommandDoc, Service},
    secrecy::ExposeSecret,
    tracing::info,
};

use crate::auth::AuthServices;

/// Function name the admin service answers to.
pub const ADMIN: &str = "admin";

type Admin = CommandDispatcher<AuthServices>;
type Ctx = CommandContext<AuthServices>;

pub struct AdminService {
    commands: Admin,
}

impl AdminService {
    pub fn new(auth: Arc<AuthServices>) -> Self {
        let mut commands = CommandDispatcher::new(auth);
        register_users(&mut commands);
        register_permissions(&mut commands);
        register_grants(&mut commands);
        register_tokens(&mut commands);
        register_identities(&mut commands);
        Self { commands }
    }
}

#[async_trait]
impl Service for AdminService {
    fn name(&self) -> &str {
        ADMIN
    }

    fn handles_function(&self, name: &str) -> bool {
        name == ADMIN
    }

    fn help_text(&self) -> String {
        format!(
            "{ADMIN} <command> [args..]\n    Manage users, grants and tokens. See `{ADMIN} help`."
        )
    }

    async fn call(&self, ctx: &CallContext) -> Result<String> {
        self.commands.dispatch(ctx.clone()).await
    }
}

fn gatekeeper() -> Policy {
    Policy::any_permission([GATEKEEPER])
}

fn require_superuser(caller: &CallContext) -> Result<()> {
    if caller.is_superuser() {
        Ok(())
    } else {
        Err(Error::authorization(["superuser"]))
    }
}

async fn existing_user(ctx: &Ctx, username: &str) -> Result<User> {
    ctx.state
        .store
        .get_user(username)
        .await?
        .ok_or_else(|| Error::not_found("user", username))
}

/// Load `username`, refusing gatekeepers who target a superuser.
async fn managed_user(ctx: &Ctx, username: &str) -> Result<User> {
    let user = existing_user(ctx, username).await?;
    if user.is_superuser {
        require_superuser(&ctx.call)?;
    }
    Ok(user)
}

fn lines(items: impl IntoIterator<Item = String>) -> String {
    let out: Vec<String> = items.into_iter().collect();
    if out.is_empty() {
        "(none)".to_string()
    } else {
        out.join("\n")
    }
}

// ── Users ───────────────────────────────────────────────────────────────────

fn register_users(d: &mut Admin) {
    d.register(
        "useradd",
        CommandDoc::new(
            "admin useradd <username> [password] [superuser]",
            "Create a user. Only superusers may create superusers.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                mememo_common::ensure(
                    !username.trim().is_empty() && !username.contains(char::is_whitespace),
                    "username must be a single word",
                )?;
                if ctx.state.store.get_user(username).await?.is_some() {
                    return Err(Error::validation(format!("user already exists: {username}")));
                }
                let mut user = User::new(username);
                if let Some(password) = ctx.args.get(1) {
                    user.password_hash = Some(hash_password(password)?);
                }
                match ctx.args.get(2).map(String::as_str) {
                    None => {},
                    Some("superuser") => {
                        require_superuser(&ctx.call)?;
                        user.is_superuser = true;
                    },
                    Some(other) => {
                        return Err(Error::validation(format!("unknown user flag: {other}")));
                    },
                }
                ctx.state.store.put_user(&user).await?;
                info!(
                    user = %username,
                    superuser = user.is_superuser,
                    by = %ctx.call.username(),
                    "user created"
                );
                Ok(format!("Created user {username}."))
            })
        }),
    );

    d.register(
        "userdel",
        CommandDoc::new(
            "admin userdel <username>",
            "Delete a user with its permissions, grants and token.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                managed_user(&ctx, username).await?;
                ctx.state.store.delete_user(username).await?;
                info!(user = %username, by = %ctx.call.username(), "user deleted");
                Ok(format!("Deleted user {username}."))
            })
        }),
    );

    d.register(
        "users",
        CommandDoc::new("admin users", "List users."),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let users = ctx.state.store.list_users().await?;
                Ok(lines(users.into_iter().map(|u| {
                    if u.is_superuser {
                        format!("{} (superuser)", u.username)
                    } else {
                        u.username
                    }
                })))
            })
        }),
    );

    d.register(
        "passwd",
        CommandDoc::new("admin passwd <username> <password>", "Set a user's password."),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                let password = ctx.arg(1, "password")?;
                let mut user = managed_user(&ctx, username).await?;
                user.password_hash = Some(hash_password(password)?);
                ctx.state.store.put_user(&user).await?;
                info!(user = %username, by = %ctx.call.username(), "password changed");
                Ok(format!("Password set for {username}."))
            })
        }),
    );
}

// ── Permissions ─────────────────────────────────────────────────────────────

fn register_permissions(d: &mut Admin) {
    d.register(
        "permit",
        CommandDoc::new(
            "admin permit <username> <permission>",
            "Give a user a system permission, e.g. mememo.third_party_gateway.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                let permission = ctx.arg(1, "permission")?;
                managed_user(&ctx, username).await?;
                // Gatekeepers cannot mint other gatekeepers.
                if permission == GATEKEEPER {
                    require_superuser(&ctx.call)?;
                }
                ctx.state.store.add_permission(username, permission).await?;
                info!(user = %username, permission, by = %ctx.call.username(), "permission added");
                Ok(format!("{username} now has {permission}."))
            })
        }),
    );

    d.register(
        "forbid",
        CommandDoc::new(
            "admin forbid <username> <permission>",
            "Take a system permission away from a user.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                let permission = ctx.arg(1, "permission")?;
                managed_user(&ctx, username).await?;
                if !ctx.state.store.remove_permission(username, permission).await? {
                    return Err(Error::not_found(
                        "permission",
                        format!("{username} {permission}"),
                    ));
                }
                info!(
                    user = %username,
                    permission,
                    by = %ctx.call.username(),
                    "permission removed"
                );
                Ok(format!("{username} no longer has {permission}."))
            })
        }),
    );

    d.register(
        "perms",
        CommandDoc::new("admin perms <username>", "List a user's permissions."),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                existing_user(&ctx, username).await?;
                Ok(lines(ctx.state.store.permissions(username).await?))
            })
        }),
    );
}

// ── Grants ──────────────────────────────────────────────────────────────────

fn register_grants(d: &mut Admin) {
    d.register(
        "mkgrant",
        CommandDoc::new(
            "admin mkgrant <service:grant>",
            "Register a grant code so it can be assigned.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let code = ctx.state.grants.create_grant(ctx.arg(0, "grant")?).await?;
                Ok(format!("Created grant {code}."))
            })
        }),
    );

    d.register(
        "grant",
        CommandDoc::new(
            "admin grant <username> <service:grant>",
            "Assign a grant to a user for the configured grant lifetime.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                let assignment = ctx
                    .state
                    .grants
                    .assign(username, ctx.arg(1, "grant")?)
                    .await?;
                Ok(format!(
                    "{username} holds {} until {}.",
                    assignment.grant,
                    assignment.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
                ))
            })
        }),
    );

    d.register(
        "revoke",
        CommandDoc::new(
            "admin revoke <username> <service:grant>",
            "Remove a grant from a user.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                let code = ctx.arg(1, "grant")?;
                ctx.state.grants.revoke(username, code).await?;
                Ok(format!("Revoked {code} from {username}."))
            })
        }),
    );

    d.register(
        "purge",
        CommandDoc::new(
            "admin purge <service:grant>",
            "Delete a grant code and every assignment of it.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let code = ctx.arg(0, "grant")?;
                ctx.state.grants.purge(code).await?;
                Ok(format!("Purged grant {code}."))
            })
        }),
    );

    d.register(
        "grants",
        CommandDoc::new(
            "admin grants [username]",
            "List every grant code, or the assignments of one user with expiry.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let Some(username) = ctx.args.first() else {
                    return Ok(lines(ctx.state.store.list_grants().await?));
                };
                existing_user(&ctx, username).await?;
                let assignments = ctx.state.store.assignments(username).await?;
                Ok(lines(assignments.into_iter().map(|a| {
                    format!(
                        "{} until {}",
                        a.grant,
                        a.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
                    )
                })))
            })
        }),
    );
}

// ── Tokens ──────────────────────────────────────────────────────────────────

fn register_tokens(d: &mut Admin) {
    d.register(
        "token",
        CommandDoc::new(
            "admin token <username>",
            "Issue a bearer token, replacing any earlier one. It is shown only once.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                managed_user(&ctx, username).await?;
                let token = ctx.state.tokens.issue(username).await?;
                Ok(token.expose_secret().clone())
            })
        }),
    );

    d.register(
        "rmtoken",
        CommandDoc::new("admin rmtoken <username>", "Revoke a user's bearer token."),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let username = ctx.arg(0, "username")?;
                managed_user(&ctx, username).await?;
                ctx.state.tokens.revoke(username).await?;
                Ok(format!("Revoked the token of {username}."))
            })
        }),
    );
}

// ── Third-party identities ──────────────────────────────────────────────────

fn register_identities(d: &mut Admin) {
    d.register(
        "challenges",
        CommandDoc::new(
            "admin challenges",
            "List third-party identities with their pending codes or bound users.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let records = ctx.state.third_party.list().await?;
                Ok(lines(records.into_iter().map(|r| {
                    let expiry = r.expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
                    match r.user {
                        Some(user) if r.challenge.is_empty() => format!(
                            "{} ({}): authenticated as {user} until {expiry}",
                            r.identity, r.alias
                        ),
                        _ => format!(
                            "{} ({}): pending code {} until {expiry}",
                            r.identity, r.alias, r.challenge
                        ),
                    }
                })))
            })
        }),
    );

    d.register(
        "override",
        CommandDoc::new(
            "admin override <identity> <alias>",
            "Authenticate a third-party identity as alias without a challenge. Superuser only.",
        ),
        gatekeeper(),
        Box::new(|ctx| {
            Box::pin(async move {
                let identity = ctx.arg(0, "identity")?;
                let alias = ctx.arg(1, "alias")?;
                let user = ctx
                    .state
                    .third_party
                    .override_identity(&ctx.call, identity, alias)
                    .await?;
                Ok(format!("{identity} is now authenticated as {}.", user.username))
            })
        }),
    );
}
