pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{load_config_from_path, RegistryConfig};
use crate::telemetry::LogFormat;

#[derive(Parser)]
#[command(name = "devmesh")]
#[command(about = "Run dev workers that can find and call each other")]
#[command(version)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Front a running worker runtime: buffer across reloads, publish to the registry
    Dev(DevArgs),
    /// Inspect the shared dev registry
    Registry(RegistryArgs),
}

#[derive(clap::Args)]
pub struct DevArgs {
    /// Path to the worker config
    #[arg(long, short, default_value = crate::config::CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Origin of the running worker runtime, e.g. http://127.0.0.1:8788
    #[arg(long)]
    pub upstream: String,

    /// Debugger websocket of the runtime
    #[arg(long)]
    pub inspector_upstream: Option<String>,

    /// Override the public port from the config
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the inspector port from the config
    #[arg(long)]
    pub inspector_port: Option<u16>,

    /// Force live reload on (overrides the config)
    #[arg(long)]
    pub live_reload: bool,

    /// Shared registry directory
    #[arg(long, env = crate::config::REGISTRY_PATH_ENV)]
    pub registry: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct RegistryArgs {
    /// Shared registry directory
    #[arg(long, global = true, env = crate::config::REGISTRY_PATH_ENV)]
    pub registry: Option<PathBuf>,

    /// Worker config whose `[registry]` section (path, ttl) applies
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: RegistryCommands,
}

impl RegistryArgs {
    /// Registry settings from `--config`, with `--registry` taking precedence
    /// for the directory.
    pub fn registry_config(&self) -> anyhow::Result<RegistryConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from_path(path)?.registry,
            None => RegistryConfig::default(),
        };
        if let Some(path) = &self.registry {
            config.path = Some(path.clone());
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// List live workers
    List(RegistryListArgs),
    /// Look up one worker, optionally waiting for it to appear
    Resolve(RegistryResolveArgs),
    /// Delete stale and unreadable entries
    Prune,
}

#[derive(clap::Args)]
pub struct RegistryListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct RegistryResolveArgs {
    /// Worker name
    pub name: String,

    /// How long to wait for the worker to register
    #[arg(long, default_value = "0")]
    pub wait_ms: u64,
}
