/// Config schema types (orchestrator, auth, service definitions).
use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::duration::CompactDuration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MememoConfig {
    pub orchestrator: OrchestratorConfig,
    pub auth: AuthConfig,
    /// Exported into the environment of every dynamic service subprocess.
    pub env: BTreeMap<String, String>,
    /// Dynamic service definitions, keyed by service name.
    pub services: BTreeMap<String, ServiceDefinition>,
}

impl MememoConfig {
    /// Root directory for all persistent state.
    pub fn data_dir(&self) -> PathBuf {
        self.orchestrator
            .data_dir
            .clone()
            .unwrap_or_else(crate::loader::default_data_dir)
    }

    /// Directory holding one working directory per dynamic service.
    pub fn services_dir(&self) -> PathBuf {
        self.data_dir().join("services")
    }

    /// SQLite database path for users, grants, challenges and tokens.
    pub fn database_path(&self) -> PathBuf {
        self.auth
            .database
            .clone()
            .unwrap_or_else(|| self.data_dir().join("mememo.db"))
    }

    /// Enabled service definitions in name order.
    pub fn enabled_services(&self) -> impl Iterator<Item = (&String, &ServiceDefinition)> {
        self.services.iter().filter(|(_, def)| def.enabled)
    }
}

/// Maintenance loop and subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Interval between scheduled sweeps.
    pub poll_delay: CompactDuration,
    /// Upper bound on a single `setup`, `run` or `respond` execution.
    pub command_timeout: CompactDuration,
    /// Upper bound on a single git clone/fetch/reset.
    pub git_timeout: CompactDuration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            poll_delay: CompactDuration::from_secs(5 * 60),
            command_timeout: CompactDuration::from_secs(10 * 60),
            git_timeout: CompactDuration::from_secs(5 * 60),
        }
    }
}

/// Authentication and authorization windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// SQLite database path. Defaults to `<data_dir>/mememo.db`.
    pub database: Option<PathBuf>,
    /// How long an unauthenticated session may stay connected.
    pub session_timeout: CompactDuration,
    /// Lifetime of a new grant assignment.
    pub grant_lifetime: CompactDuration,
    /// How long an issued third-party challenge stays redeemable.
    pub challenge_expiry: CompactDuration,
    /// How long a redeemed third-party identity stays authenticated.
    pub third_party_expiry: CompactDuration,
    /// Lifetime of an issued bearer token.
    pub token_expiry: CompactDuration,
    /// Ignore grant assignments whose expiry has passed.
    ///
    /// Off by default: assignments historically never expired in practice.
    pub enforce_grant_expiry: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        const DAY: u64 = 24 * 60 * 60;
        Self {
            database: None,
            session_timeout: CompactDuration::from_secs(5 * 60),
            grant_lifetime: CompactDuration::from_secs(365 * DAY),
            challenge_expiry: CompactDuration::from_secs(60 * 60),
            third_party_expiry: CompactDuration::from_secs(90 * DAY),
            token_expiry: CompactDuration::from_secs(365 * DAY),
            enforce_grant_expiry: false,
        }
    }
}

/// Static declaration of one pluggable, subprocess-backed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Git repository to clone. Absent or empty means a local service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Shell command producing the service output.
    pub run: String,
    /// Shell command run after clone and on every refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    /// Shell command that post-processes `run` output fed on stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Regex matched against the full function name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handles: Option<String>,
    /// Literal first tokens that route free-text messages to this service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sigils: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CompactDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<CompactDuration>,
    /// Standard 5-field cron expression for scheduled pre-warming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub required_grants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceDefinition {
    /// A local, uncached, unscheduled service that runs `run`.
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            repo: None,
            run: run.into(),
            setup: None,
            respond: None,
            env: BTreeMap::new(),
            handles: None,
            sigils: Vec::new(),
            cache: None,
            refresh: None,
            schedule: None,
            required_grants: Vec::new(),
            doc: None,
            usage: None,
            enabled: true,
        }
    }

    /// Whether the service is backed by a git repository.
    pub fn is_remote(&self) -> bool {
        self.repo.as_deref().is_some_and(|r| !r.trim().is_empty())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn service_definition_defaults() {
        let def: ServiceDefinition = toml::from_str(r#"run = "echo hello""#).unwrap();
        assert!(def.enabled);
        assert!(!def.is_remote());
        assert!(def.cache.is_none());
        assert!(def.required_grants.is_empty());
    }

    #[test]
    fn empty_repo_is_local() {
        let mut def = ServiceDefinition::new("true");
        def.repo = Some("  ".into());
        assert!(!def.is_remote());
        def.repo = Some("https://example.com/weather.git".into());
        assert!(def.is_remote());
    }

    #[test]
    fn full_config_from_yaml() {
        let yaml = r#"
orchestrator:
  poll_delay: 1m
auth:
  challenge_expiry: 30m
env:
  TZ: UTC
services:
  weather:
    repo: https://example.com/weather.git
    setup: ./install.sh
    run: ./weather.sh
    handles: "^weather$"
    cache: 10m
    refresh: 1D
    schedule: "0 * * * *"
    required_grants: ["weather:read"]
    usage: "`weather`"
    doc: "Current conditions."
  disabled:
    run: "false"
    enabled: false
"#;
        let cfg: MememoConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.orchestrator.poll_delay.as_duration(), Duration::from_secs(60));
        assert_eq!(
            cfg.auth.challenge_expiry.as_duration(),
            Duration::from_secs(1_800)
        );
        assert_eq!(cfg.env.get("TZ").map(String::as_str), Some("UTC"));
        let weather = &cfg.services["weather"];
        assert_eq!(weather.cache.unwrap().as_duration(), Duration::from_secs(600));
        assert_eq!(weather.schedule.as_deref(), Some("0 * * * *"));
        let enabled: Vec<_> = cfg.enabled_services().map(|(n, _)| n.as_str()).collect();
        assert_eq!(enabled, vec!["weather"]);
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let mut cfg = MememoConfig::default();
        cfg.orchestrator.data_dir = Some(PathBuf::from("/srv/mememo"));
        assert_eq!(cfg.services_dir(), PathBuf::from("/srv/mememo/services"));
        assert_eq!(cfg.database_path(), PathBuf::from("/srv/mememo/mememo.db"));
    }
}
