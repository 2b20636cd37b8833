//! linkbond demo CLI: run two bonded overlay endpoints over loopback UDP.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use linkbond_core::{BondTemplate, Policy};
use tokio::sync::watch;

use linkbond::config::{self, DemoConfig, DEFAULT_CONFIG_FILE};
use linkbond::proto::FrameCrypto;
use linkbond::runtime;

/// linkbond - multipath link-bonding demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Override config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run two endpoints against each other over loopback (default)
    Demo {
        /// Bonding policy override (active-backup, broadcast, balance-rr,
        /// balance-xor, balance-aware)
        #[arg(long)]
        policy: Option<String>,
        /// Run duration override, in seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Simulated links per endpoint
        #[arg(long)]
        paths: Option<usize>,
    },
    /// Write a default config file (with a fresh pre-shared key)
    InitConfig {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Print the config file path
    PrintConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    match cli.command.unwrap_or(Command::Demo {
        policy: None,
        seconds: None,
        paths: None,
    }) {
        Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        Command::InitConfig { force } => {
            let mut cfg = DemoConfig::default();
            cfg.psk_hex = Some(config::encode_hex_key(&FrameCrypto::generate_key()));
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        Command::Demo {
            policy,
            seconds,
            paths,
        } => {
            let mut cfg = config::load(&config_path)?;
            if let Some(policy) = policy {
                // Rebuild the template so policy-specific defaults apply.
                let policy = policy.parse::<Policy>()?;
                let mut template = BondTemplate::new(cfg.template.alias.clone(), policy);
                template.failover_interval = cfg.template.failover_interval;
                cfg.template = template;
            }
            if let Some(seconds) = seconds {
                cfg.run_seconds = seconds;
            }
            if let Some(paths) = paths {
                cfg.paths_per_node = paths.clamp(1, 16);
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            });

            let (alpha, beta) = runtime::run_demo(cfg, stop_rx).await?;
            for report in [alpha, beta] {
                tracing::info!(
                    endpoint = report.name.as_str(),
                    healthy = report.healthy,
                    paths = report.nominated,
                    frames_in = report.frames_in,
                    frames_out = report.frames_out,
                    flows = report.flows,
                    "endpoint summary"
                );
            }
            Ok(())
        }
    }
}
