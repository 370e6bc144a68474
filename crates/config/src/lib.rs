//! Configuration loading and env substitution.
//!
//! Config files: `mememo.toml`, `mememo.yaml`, or `mememo.json`
//! Searched in `./` then `~/.config/mememo/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in all values.

pub mod duration;
pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    duration::{CompactDuration, parse_duration},
    loader::{config_dir, default_data_dir, discover_and_load, find_config_file, load_config},
    schema::{AuthConfig, MememoConfig, OrchestratorConfig, ServiceDefinition},
};
