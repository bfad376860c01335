//! Configuration loading for the aegis gateway.
//!
//! Config files are discovered as `aegis.{toml,yaml,yml,json}` in the
//! working directory, then in `~/.config/aegis/`. `${ENV_VAR}` placeholders
//! are substituted before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file,
        find_or_default_config_path, load_config, save_config, set_config_dir,
    },
    schema::{AegisConfig, CacheConfig, RateLimitConfig, ServerConfig},
};
