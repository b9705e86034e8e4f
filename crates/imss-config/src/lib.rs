//! Configuration loading and env substitution for the gateway and logic
//! processes.
//!
//! Config files: `imss.toml`, `imss.yaml`, or `imss.json`.
//! Searched in `./` then `~/.config/imss/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use loader::{config_dir, discover_and_load, find_or_default_config_path, load_config, save_config, ConfigError};
pub use schema::{BrokerConfig, DedupConfig, HeartbeatConfig, ImssConfig, KvConfig, RingConfig, ServerConfig};
