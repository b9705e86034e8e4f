use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::ImssConfig};

const CONFIG_FILENAMES: &[&str] = &["imss.toml", "imss.yaml", "imss.yml", "imss.json"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, #[source] source: std::io::Error },
    #[error("unsupported config format: .{0}")]
    UnsupportedFormat(String),
    #[error("failed to parse {path} as TOML: {source}")]
    Toml { path: PathBuf, #[source] source: toml::de::Error },
    #[error("failed to parse {path} as YAML: {source}")]
    Yaml { path: PathBuf, #[source] source: serde_yaml::Error },
    #[error("failed to parse {path} as JSON: {source}")]
    Json { path: PathBuf, #[source] source: serde_json::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Load config from the given path (any supported format), with
/// `${ENV_VAR}` substitution applied to the raw text before parsing.
pub fn load_config(path: &Path) -> Result<ImssConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./imss.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/imss/imss.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ImssConfig::default()` if no config file is found or it fails
/// to load — a missing/bad config should never prevent startup.
pub fn discover_and_load() -> ImssConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    ImssConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "imss") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/imss/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "imss").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("imss.toml")
}

/// Serialize `config` to TOML and write it to the user-global config path.
pub fn save_config(config: &ImssConfig) -> Result<PathBuf, ConfigError> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write { path: path.clone(), source: e })?;
    }
    let toml_str = toml::to_string_pretty(config)?;
    std::fs::write(&path, toml_str).map_err(|e| ConfigError::Write { path: path.clone(), source: e })?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> Result<ImssConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| ConfigError::Toml { path: path.to_path_buf(), source: e }),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| ConfigError::Yaml { path: path.to_path_buf(), source: e }),
        "json" => serde_json::from_str(raw).map_err(|e| ConfigError::Json { path: path.to_path_buf(), source: e }),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_env_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imss.toml");
        std::env::set_var("IMSS_CONFIG_TEST_BIND", "10.0.0.5");
        std::fs::write(&path, "[server]\nbind = \"${IMSS_CONFIG_TEST_BIND}\"\nport = 9090\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.bind, "10.0.0.5");
        assert_eq!(cfg.server.port, 9090);
        std::env::remove_var("IMSS_CONFIG_TEST_BIND");
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imss.yaml");
        std::fs::write(&path, "server:\n  bind: 127.0.0.1\n  port: 7070\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.server.port, 7070);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imss.ini");
        std::fs::write(&path, "bind = 127.0.0.1").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults_in_discover_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let cfg = discover_and_load();
        std::env::set_current_dir(original).unwrap();
        assert_eq!(cfg.server.port, ImssConfig::default().server.port);
    }
}
