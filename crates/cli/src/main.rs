mod config_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "aegis", about = "Aegis: resilience and realtime gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of searching `./` and `~/.config/aegis/`.
    #[arg(long, global = true, env = "AEGIS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
        /// Overrides `cache.redis_url`.
        #[arg(long, env = "AEGIS_REDIS_URL")]
        redis_url: Option<String>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "aegis starting");

    match cli.command {
        Commands::Gateway {
            bind,
            port,
            redis_url,
        } => {
            let mut config = config_commands::resolve(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if redis_url.is_some() {
                config.cache.redis_url = redis_url;
            }
            aegis_gateway::start_gateway(config).await
        },
        Commands::Config { action } => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn gateway_flags_parse() {
        let cli = Cli::parse_from(["aegis", "--json-logs", "gateway", "--port", "9001"]);
        assert!(cli.json_logs);
        match cli.command {
            Commands::Gateway { port, bind, .. } => {
                assert_eq!(port, Some(9001));
                assert_eq!(bind, None);
            },
            Commands::Config { .. } => panic!("parsed the wrong subcommand"),
        }
    }
}
