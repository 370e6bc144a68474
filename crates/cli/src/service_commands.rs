use std::time::Duration;

use {
    anyhow::{Context, Result, bail},
    mememo_auth::{CallContext, User},
    mememo_config::MememoConfig,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

use crate::open_gateway;

const CLI_CONN: &str = "cli";

pub async fn serve(config: &MememoConfig) -> Result<()> {
    let gateway = open_gateway(config, CancellationToken::new()).await?;
    let manager = gateway.manager();
    manager.start().await;
    info!(
        services = manager.dynamic_services().len(),
        poll_delay = %config.orchestrator.poll_delay,
        "serving, press Ctrl-C to stop"
    );

    let reap_every = config
        .auth
        .session_timeout
        .as_duration()
        .max(Duration::from_secs(1));
    let mut reap = tokio::time::interval(reap_every);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to listen for Ctrl-C")?;
                break;
            },
            _ = reap.tick() => {
                gateway.sessions().reap_expired();
            },
        }
    }
    info!("shutting down");
    manager.stop().await;
    Ok(())
}

pub async fn update(config: &MememoConfig) -> Result<()> {
    let gateway = open_gateway(config, CancellationToken::new()).await?;
    gateway.manager().update().await?;
    Ok(())
}

/// Run a dynamic service without a caller. Trailing arguments are passed as
/// a superuser `operator` call so the service still sees them.
pub async fn invoke(config: &MememoConfig, service: &str, args: Vec<String>) -> Result<()> {
    let gateway = open_gateway(config, CancellationToken::new()).await?;
    let manager = gateway.manager();
    let Some(svc) = manager.dynamic_service(service) else {
        bail!("no such service: {service}");
    };
    let operator = (!args.is_empty()).then(|| CallContext {
        user: User::new("operator").superuser(),
        permissions: Default::default(),
        grants: Default::default(),
        function_name: service.to_string(),
        args,
    });
    let output = svc.invoke(manager.epoch(), operator.as_ref(), true).await?;
    print!("{output}");
    Ok(())
}

pub async fn services(config: &MememoConfig) -> Result<()> {
    let gateway = open_gateway(config, CancellationToken::new()).await?;
    println!("{}", gateway.manager().help_text());
    Ok(())
}

/// Log in with `token` on a fresh session and call `function`.
pub async fn call(
    config: &MememoConfig,
    token: &str,
    function: &str,
    args: Vec<String>,
    json: bool,
) -> Result<()> {
    let gateway = open_gateway(config, CancellationToken::new()).await?;
    gateway.connect(CLI_CONN)?;
    let login = gateway
        .call(CLI_CONN, "token", vec![token.to_string()])
        .await;
    if !login.ok {
        bail!(login.text);
    }
    let reply = gateway.call(CLI_CONN, function, args).await;
    gateway.disconnect(CLI_CONN);

    if json {
        println!("{}", serde_json::to_string(&reply)?);
    } else if reply.ok {
        print!("{}", reply.text);
        if !reply.text.ends_with('\n') {
            println!();
        }
    }
    if !reply.ok {
        bail!(reply.text);
    }
    Ok(())
}
