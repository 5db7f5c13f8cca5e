//! Command-line interface for steward.
//!
//! Provides commands for running the reconciliation engine over a manifest
//! file and for inspecting the resolved configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::EngineConfig;

pub mod run;

/// steward - reconciliation engine for local development resources
#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (skips .steward/config.yaml discovery)
    #[arg(short, long, global = true, env = "STEWARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile manifests until interrupted (Ctrl-C)
    Run {
        /// Pre-evaluated manifest file (YAML)
        #[arg(short, long)]
        manifests: PathBuf,

        /// Stop once every manifest has built; fail on the first build error
        #[arg(long)]
        exit_on_done: bool,
    },

    /// Show resolved configuration (debug)
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = EngineConfig::load_from(self.config.as_deref())?;
        match self.command {
            Commands::Run {
                manifests,
                exit_on_done,
            } => {
                run::execute(config, &manifests, exit_on_done, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                        std::future::pending::<()>().await;
                    }
                })
                .await
            }
            Commands::Config { json } => show_config(&config, json),
        }
    }
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &EngineConfig, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(cfg).context("Failed to serialize config")?;
        println!("{}", out);
        return Ok(());
    }

    println!("steward configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_deref()
            .map(Path::display)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Reconcile:");
    println!("  Not-ready retries: {}", cfg.not_ready_retry.max_retries);
    println!("  Not-ready delay:   {}ms", cfg.not_ready_retry.delay.as_millis());
    println!();
    println!("Trigger queue document: {}", cfg.trigger_queue_name);
    println!("Max log events:         {}", cfg.max_log_events);
    println!("Watch debounce:         {}ms", cfg.watch_debounce.as_millis());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["steward", "run", "--manifests", "m.yaml"]).unwrap();
        match cli.command {
            Commands::Run {
                manifests,
                exit_on_done,
            } => {
                assert_eq!(manifests, PathBuf::from("m.yaml"));
                assert!(!exit_on_done);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cli =
            Cli::try_parse_from(["steward", "run", "-m", "m.yaml", "--exit-on-done"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run {
                exit_on_done: true,
                ..
            }
        ));
    }

    #[test]
    fn test_config_flag_is_global() {
        let cli = Cli::try_parse_from(["steward", "config", "--json", "-c", "x.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
        assert!(matches!(cli.command, Commands::Config { json: true }));
    }

    #[test]
    fn test_show_config_json() {
        assert!(show_config(&EngineConfig::default(), true).is_ok());
    }
}
