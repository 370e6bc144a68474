use std::sync::Arc;

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    mememo_auth::{AuthStore, SqliteAuthStore, User, password::hash_password},
    mememo_config::MememoConfig,
    mememo_gateway::AuthServices,
    secrecy::ExposeSecret,
};

#[derive(Subcommand)]
pub enum UserAction {
    /// Create a user.
    Add {
        name: String,
        /// Make the user a superuser.
        #[arg(long, default_value_t = false)]
        superuser: bool,
        /// Password for `auth` logins. Token-only users need none.
        #[arg(long, env = "MEMEMO_PASSWORD")]
        password: Option<String>,
    },
    /// Issue a bearer token, replacing any earlier one.
    Token { name: String },
}

pub async fn handle_user(config: &MememoConfig, action: UserAction) -> Result<()> {
    let store = Arc::new(SqliteAuthStore::open(&config.database_path()).await?);
    match action {
        UserAction::Add {
            name,
            superuser,
            password,
        } => add(store.as_ref(), &name, superuser, password.as_deref()).await,
        UserAction::Token { name } => {
            let auth = AuthServices::new(store, &config.auth);
            let token = auth.tokens.issue(&name).await?;
            println!("{}", token.expose_secret());
            Ok(())
        },
    }
}

async fn add(
    store: &dyn AuthStore,
    name: &str,
    superuser: bool,
    password: Option<&str>,
) -> Result<()> {
    if store.get_user(name).await?.is_some() {
        bail!("user already exists: {name}");
    }
    let mut user = User::new(name);
    user.is_superuser = superuser;
    user.password_hash = password.map(hash_password).transpose()?;
    store.put_user(&user).await?;
    println!(
        "Created {}{name}.",
        if superuser {
            "superuser "
        } else {
            "user "
        }
    );
    Ok(())
}
