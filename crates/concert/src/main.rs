//! Concert - Main entry point
//!
//! Keeps ACME certificates for Consul-tagged services valid.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use concert::signals::spawn_shutdown_listener;
use concert::Concert;
use concert_config::ConcertConfig;

/// Concert - ACME certificates for services in the Consul catalog
#[derive(Parser, Debug)]
#[command(name = "concert")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CONCERT_CONFIG",
        default_value = "concert.yml"
    )]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Test configuration file and exit
fn test_config(path: &Path) -> Result<()> {
    let config = ConcertConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;

    info!("Configuration test successful:");
    info!("  - Consul at {}", config.consul_address);
    info!("  - CA directory {}", config.ca_dir);
    info!("  - DNS-01 provider {}", config.dns01_provider_name);
    info!(
        "  - renewal threshold {}, reconcile interval {}",
        humantime::format_duration(config.renewal_ttl),
        humantime::format_duration(config.reconcile_interval)
    );

    println!(
        "concert: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

async fn run(path: &Path) -> Result<()> {
    info!(path = %path.display(), "Loading configuration");
    let config = ConcertConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;

    let shutdown = CancellationToken::new();
    let signals = spawn_shutdown_listener(shutdown.clone());

    let concert = Concert::bootstrap(&config, shutdown.clone())
        .await
        .context("Failed to start concert")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Concert started");
    concert.run().await;

    shutdown.cancel();
    signals.await.context("Signal listener panicked")?;
    info!("Concert stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    if cli.test {
        return test_config(&cli.config);
    }

    run(&cli.config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["concert"]).unwrap();
        assert!(!cli.test);
        assert!(!cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "concert",
            "-c",
            "/etc/concert.yml",
            "-t",
            "--verbose",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/concert.yml"));
        assert!(cli.test);
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
