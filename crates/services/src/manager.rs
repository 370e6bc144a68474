//! Service routing and the periodic maintenance sweep.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    mememo_common::{Error, Result},
    mememo_config::{CompactDuration, MememoConfig},
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    dynamic::DynamicService,
    process::CommandRunner,
    service::Service,
    state::{StateKey, StateStore},
};

/// State scope holding the manager's own sweep timestamps.
///
/// Starts with a dot so it can never collide with a service name.
pub const MANAGER_SCOPE: &str = ".manager";

pub struct ServiceManager {
    epoch: String,
    builtins: Vec<Arc<dyn Service>>,
    dynamic: Vec<Arc<DynamicService>>,
    state: Arc<dyn StateStore>,
    poll_delay: Duration,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    /// Build a manager with a fresh random epoch and every enabled
    /// dynamic service from `config`.
    pub fn from_config(
        config: &MememoConfig,
        state: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let epoch = uuid::Uuid::new_v4().to_string();
        let commands = CommandRunner::new(
            config.orchestrator.command_timeout.as_duration(),
            cancel.clone(),
        );
        let git = CommandRunner::new(config.orchestrator.git_timeout.as_duration(), cancel.clone());
        let services_dir = config.services_dir();

        let dynamic = config
            .enabled_services()
            .map(|(name, definition)| {
                DynamicService::new(
                    name.as_str(),
                    definition.clone(),
                    epoch.as_str(),
                    &services_dir,
                    config.env.clone(),
                    Arc::clone(&state),
                    commands.clone(),
                    git.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(epoch = %epoch, services = dynamic.len(), "service manager created");
        Ok(Self {
            epoch,
            builtins: Vec::new(),
            dynamic,
            state,
            poll_delay: config.orchestrator.poll_delay.as_duration(),
            cancel,
            loop_handle: Mutex::new(None),
        })
    }

    /// Install a built-in service. Registration order is lookup order.
    pub fn register_builtin(&mut self, service: Arc<dyn Service>) {
        debug!(service = %service.name(), "built-in service registered");
        self.builtins.push(service);
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn dynamic_services(&self) -> &[Arc<DynamicService>] {
        &self.dynamic
    }

    pub fn dynamic_service(&self, name: &str) -> Option<&Arc<DynamicService>> {
        self.dynamic.iter().find(|s| s.name() == name)
    }

    fn all(&self) -> impl Iterator<Item = Arc<dyn Service>> + '_ {
        self.builtins.iter().cloned().chain(
            self.dynamic
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn Service>),
        )
    }

    /// First service claiming the function `name`; built-ins first.
    pub fn get_function_handler(&self, name: &str) -> Result<Arc<dyn Service>> {
        self.all()
            .find(|s| s.handles_function(name))
            .ok_or_else(|| Error::not_found("function", name))
    }

    /// First service claiming a raw message; dynamic services first.
    pub fn get_message_handler(&self, text: &str) -> Result<Arc<dyn Service>> {
        self.dynamic
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Service>)
            .chain(self.builtins.iter().cloned())
            .find(|s| s.handles_message(text))
            .ok_or_else(|| Error::not_found("message handler", text.trim()))
    }

    /// Help blocks of every installed service, sorted.
    pub fn help_text(&self) -> String {
        let mut blocks: Vec<String> = self.all().map(|s| s.help_text()).collect();
        blocks.sort();
        blocks.join("\n")
    }

    /// Run every due dynamic service once, isolating failures per service.
    pub async fn update(&self) -> Result<()> {
        let started = Utc::now();
        info!(epoch = %self.epoch, "update sweep starting");
        let mut ran = 0usize;
        let mut failed = 0usize;

        for svc in &self.dynamic {
            if self.cancel.is_cancelled() {
                warn!("update sweep cancelled");
                return Err(Error::Cancelled);
            }
            match svc.is_due(started).await {
                Ok(true) => {},
                Ok(false) => continue,
                Err(e) => {
                    error!(service = %svc.name(), error = %e, "failed to read schedule state");
                    failed += 1;
                    continue;
                },
            }
            ran += 1;
            if let Err(e) = self.sweep_one(svc).await {
                failed += 1;
                error!(service = %svc.name(), error = %e, "scheduled update failed");
            }
        }

        let now = Utc::now();
        self.state
            .set_time(MANAGER_SCOPE, StateKey::LastUpdate, now)
            .await?;
        self.state
            .set_time(
                MANAGER_SCOPE,
                StateKey::NextUpdate,
                now + CompactDuration(self.poll_delay).as_chrono(),
            )
            .await?;
        info!(
            ran,
            failed,
            duration_ms = (now - started).num_milliseconds(),
            "update sweep finished"
        );
        Ok(())
    }

    async fn sweep_one(&self, svc: &DynamicService) -> Result<()> {
        svc.prepare(&self.epoch, None).await?;
        svc.invoke(&self.epoch, None, false).await?;
        svc.mark_updated(Utc::now()).await
    }

    /// Sleep in poll-delay increments until the next sweep is due, sweep,
    /// and repeat until cancelled.
    pub async fn scheduled_update(&self) {
        loop {
            let next = match self.state.get_time(MANAGER_SCOPE, StateKey::NextUpdate).await {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "failed to read next update time");
                    None
                },
            };
            let remaining = next
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .unwrap_or_default();

            if !remaining.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(remaining.min(self.poll_delay)) => continue,
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                res = self.update() => {
                    if let Err(e) = res {
                        error!(error = %e, "update sweep failed");
                        // Avoid spinning when the state store itself is failing.
                        tokio::select! {
                            () = self.cancel.cancelled() => break,
                            () = tokio::time::sleep(self.poll_delay) => {},
                        }
                    }
                },
            }
        }
        info!("maintenance loop stopped");
    }

    /// Spawn the maintenance loop.
    pub async fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.scheduled_update().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(poll_delay_secs = self.poll_delay.as_secs(), "maintenance loop started");
    }

    /// Cancel the loop and every in-flight subprocess, then wait for the loop.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "maintenance loop ended abnormally");
        }
    }
}
