use std::path::{Path, PathBuf};

use {
    mememo_common::{Error, Result},
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::MememoConfig};

mememo_common::impl_context!();

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["mememo.toml", "mememo.yaml", "mememo.yml", "mememo.json"];

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "mememo")
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<MememoConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Load `explicit` if given, otherwise discover a config file.
///
/// Search order:
/// 1. `./mememo.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/mememo/mememo.{toml,yaml,yml,json}` (user-global)
///
/// An explicit path must load. A discovered file that fails to parse is
/// logged and replaced by defaults.
pub fn discover_and_load(explicit: Option<&Path>) -> Result<MememoConfig> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading config");
        return load_config(path);
    }
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return Ok(MememoConfig::default());
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            Ok(MememoConfig::default())
        },
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/mememo/`).
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().to_path_buf())
}

/// Platform data directory, or `./.mememo` when no home is available.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".mememo"))
}

fn parse_config(raw: &str, path: &Path) -> Result<MememoConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let ctx = || format!("invalid config {}", path.display());

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| Error::external(ctx(), e)),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| Error::external(ctx(), e)),
        "json" => serde_json::from_str(raw).map_err(|e| Error::external(ctx(), e)),
        _ => Err(Error::validation(format!("unsupported config format: .{ext}"))),
    }
}
