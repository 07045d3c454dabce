//! vmgridd — the VMGrid daemon.
//!
//! Opens the state store, loads the configured compute sites and drives
//! the lifecycle orchestrator from three periodic triggers:
//! - Billing (`bill_tick`)
//! - VM monitoring (`refresh_vms` + load collection)
//! - Template monitoring (`refresh_templates`)
//!
//! # Usage
//!
//! ```text
//! vmgridd standalone --config vmgrid.toml --data-dir /var/lib/vmgrid
//! vmgridd check-config --config vmgrid.toml
//! ```

mod standalone;
mod triggers;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use vmgrid_core::VmGridConfig;

#[derive(Parser)]
#[command(name = "vmgridd", about = "VMGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the triggers against simulated compute sites.
    Standalone {
        /// Path to vmgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/vmgrid")]
        data_dir: PathBuf,

        /// Override the billing interval ("5s", "1m").
        #[arg(long, value_parser = parse_interval)]
        billing_interval: Option<u64>,

        /// Override the VM monitoring interval.
        #[arg(long, value_parser = parse_interval)]
        vm_monitoring_interval: Option<u64>,

        /// Override the template monitoring interval.
        #[arg(long, value_parser = parse_interval)]
        template_monitoring_interval: Option<u64>,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vmgridd=debug,vmgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            billing_interval,
            vm_monitoring_interval,
            template_monitoring_interval,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(secs) = billing_interval {
                config.schedule.billing_interval_secs = secs;
            }
            if let Some(secs) = vm_monitoring_interval {
                config.schedule.vm_monitoring_interval_secs = secs;
            }
            if let Some(secs) = template_monitoring_interval {
                config.schedule.template_monitoring_interval_secs = secs;
            }
            config.validate()?;
            standalone::run(config, data_dir).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<VmGridConfig> {
    match path {
        Some(path) => {
            let config = VmGridConfig::from_file(path)?;
            info!(path = %path.display(), sites = config.sites.len(), "configuration loaded");
            Ok(config)
        }
        None => {
            info!("no configuration file given, using defaults");
            Ok(VmGridConfig::default())
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = VmGridConfig::from_file(path)?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    info!(path = %path.display(), "configuration is valid");
    Ok(())
}

fn parse_interval(s: &str) -> Result<u64, String> {
    match vmgrid_core::parse_duration_secs(s) {
        Some(0) => Err("interval must be positive".to_string()),
        Some(secs) => Ok(secs),
        None => Err(format!("invalid interval: {s}")),
    }
}
