use std::path::{Path, PathBuf};

use {
    aegis_config::{
        AegisConfig, discover_and_load, find_config_file, find_or_default_config_path, load_config,
        save_config,
    },
    anyhow::Result,
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective config as TOML.
    Show {
        /// Print JSON instead.
        #[arg(long)]
        json: bool,
    },
    /// Load and validate the config, reporting every problem.
    Check,
    /// Write a config file populated with defaults.
    Init {
        /// Destination (defaults to the discovered or user config path).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print which config file would be loaded.
    Path,
}

/// Explicit file if given, otherwise the normal discovery chain.
pub fn resolve(path: Option<&Path>) -> Result<AegisConfig> {
    match path {
        Some(path) => load_config(path),
        None => discover_and_load(),
    }
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show { json } => show(path, json),
        ConfigAction::Check => check(path),
        ConfigAction::Init { path: dest, force } => init(dest, force),
        ConfigAction::Path => {
            match path.map(Path::to_path_buf).or_else(find_config_file) {
                Some(found) => println!("{}", found.display()),
                None => println!("no config file found, defaults in use"),
            }
            Ok(())
        },
    }
}

fn show(path: Option<&Path>, json: bool) -> Result<()> {
    let config = resolve(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn check(path: Option<&Path>) -> Result<()> {
    let config = resolve(path)?;
    let breakers = config.breaker_configs();
    println!("config ok");
    println!("  listen:    {}:{}", config.server.bind, config.server.port);
    println!(
        "  breakers:  {}",
        breakers.keys().cloned().collect::<Vec<_>>().join(", ")
    );
    println!(
        "  cache:     {}",
        config.cache.redis_url.as_deref().unwrap_or("in-memory")
    );
    println!(
        "  websocket: max {} connections",
        config.websocket.max_connections
    );
    Ok(())
}

fn init(dest: Option<PathBuf>, force: bool) -> Result<()> {
    let dest = dest.unwrap_or_else(find_or_default_config_path);
    save_config(&AegisConfig::default(), &dest, force)?;
    println!("wrote {}", dest.display());
    Ok(())
}
