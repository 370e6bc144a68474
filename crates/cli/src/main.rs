mod service_commands;
mod user_commands;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    mememo_auth::SqliteAuthStore,
    mememo_config::MememoConfig,
    mememo_gateway::Gateway,
    mememo_services::FileStateStore,
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "mememo", about = "mememo: pluggable service orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (default: ./mememo.{toml,yaml,yml,json}, then the user config dir).
    #[arg(long, global = true, env = "MEMEMO_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides `orchestrator.data_dir`).
    #[arg(long, global = true, env = "MEMEMO_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the maintenance loop until Ctrl-C (default when no subcommand is provided).
    Serve,
    /// Run one maintenance sweep and exit.
    Update,
    /// Invoke a dynamic service as the operator, bypassing grants.
    Invoke {
        service: String,
        args: Vec<String>,
    },
    /// Print the help text of every installed service.
    Services,
    /// Call a function through the gateway, authenticated by bearer token.
    Call {
        #[arg(long, env = "MEMEMO_TOKEN")]
        token: String,
        function: String,
        args: Vec<String>,
        /// Print the reply as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// User management.
    User {
        #[command(subcommand)]
        action: user_commands::UserAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MememoConfig> {
    let mut config = mememo_config::discover_and_load(cli.config.as_deref())?;
    if let Some(ref dir) = cli.data_dir {
        config.orchestrator.data_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Open the auth database and state directory and build a gateway.
async fn open_gateway(
    config: &MememoConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Gateway> {
    let store = Arc::new(SqliteAuthStore::open(&config.database_path()).await?);
    let state = Arc::new(FileStateStore::new(config.services_dir()));
    Ok(Gateway::from_config(config, store, state, cancel)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = load_config(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir().display(),
        "mememo starting"
    );

    match cli.command {
        None | Some(Commands::Serve) => service_commands::serve(&config).await,
        Some(Commands::Update) => service_commands::update(&config).await,
        Some(Commands::Invoke { service, args }) => {
            service_commands::invoke(&config, &service, args).await
        },
        Some(Commands::Services) => service_commands::services(&config).await,
        Some(Commands::Call {
            token,
            function,
            args,
            json,
        }) => service_commands::call(&config, &token, &function, args, json).await,
        Some(Commands::User { action }) => user_commands::handle_user(&config, action).await,
    }
}
