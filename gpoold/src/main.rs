use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use gpool_core::{logging::init_logging, DaemonConfig};
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info};

pub mod daemon;

use daemon::PoolDaemon;

/// Command-line flags that map onto configuration keys
const OVERRIDES: &[(&str, &str)] = &[
    ("bind", "stratum_server.address"),
    ("port", "stratum_server.port"),
    ("node", "node.address"),
    ("node-port", "node.stratum_port"),
    ("diff", "node.diff"),
    ("database", "database.url"),
    ("log-level", "logging.level"),
];

fn cli() -> Command {
    Command::new("gpoold")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Stratum relay between miners and a mining node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (.toml or .json)")
                .default_value("gpoold.toml"),
        )
        .arg(Arg::new("bind").long("bind").value_name("ADDR").help("Stratum listen address"))
        .arg(Arg::new("port").short('p').long("port").value_name("PORT").help("Stratum listen port"))
        .arg(Arg::new("node").long("node").value_name("HOST").help("Node address"))
        .arg(Arg::new("node-port").long("node-port").value_name("PORT").help("Node stratum port"))
        .arg(Arg::new("diff").long("diff").value_name("DIFF").help("Default session difficulty"))
        .arg(Arg::new("database").long("database").value_name("URL").help("Ledger database URL"))
        .arg(Arg::new("log-level").long("log-level").value_name("LEVEL").help("Log level filter"))
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration and exit"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(Path::new)
        .context("missing configuration path")?;

    let overrides: HashMap<String, String> = OVERRIDES
        .iter()
        .filter_map(|(flag, key)| {
            matches
                .get_one::<String>(flag)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect();

    let config = DaemonConfig::load_from_sources(Some(config_path), Some(overrides))
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    if matches.get_flag("check") {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config.logging).context("failed to initialize logging")?;

    if config_path.exists() {
        info!("Loaded configuration from {}", config_path.display());
    } else {
        info!("No configuration file at {}, using defaults", config_path.display());
    }

    let mut daemon = PoolDaemon::new(config)?;

    if let Err(e) = daemon.start().await {
        error!("Failed to start daemon: {}", e);
        return Err(e).context("failed to start gpoold");
    }

    daemon.run_until_shutdown().await.context("gpoold exited with an error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }

    #[test]
    fn test_flags_map_to_overrides() {
        let matches = cli()
            .try_get_matches_from(["gpoold", "--port", "4000", "--node", "10.0.0.2", "--check"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("port").map(String::as_str), Some("4000"));
        assert_eq!(matches.get_one::<String>("config").map(String::as_str), Some("gpoold.toml"));
        assert!(matches.get_flag("check"));

        let flags: Vec<&str> = OVERRIDES.iter().map(|(flag, _)| *flag).collect();
        for flag in flags {
            assert!(cli().get_arguments().any(|arg| arg.get_id() == flag));
        }
    }
}
