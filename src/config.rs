use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::environment::{EnvSnapshot, SeedResources};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "steelchat")]
#[command(about = "Chat with a backend embedded in this process")]
pub struct Args {
    // Pin the backend to a port instead of picking a free one
    #[arg(short, long)]
    pub port: Option<u16>,

    // Application data directory (default: <platform data dir>/SteelChat)
    #[arg(long)]
    pub app_support: Option<PathBuf>,

    // Bundle root with docstore.db, web/index.html and tmp/ to seed from
    #[arg(long)]
    pub resources: Option<PathBuf>,

    // Models the embedded backend advertises; the first one is selected
    #[arg(short, long = "model", default_value = "llama3.2")]
    pub models: Vec<String>,

    // System prompt sent with every exchange
    #[arg(short, long, default_value = "")]
    pub system: String,

    // Seconds to wait for the backend to finish setting up
    #[arg(long, default_value_t = 30)]
    pub ready_timeout: u64,

    // Seconds to wait for the health endpoint to answer
    #[arg(long, default_value_t = 30)]
    pub health_timeout: u64,
}

impl Args {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout)
    }

    // Everything the supervisor needs; `env` is the one read of the process environment
    pub fn backend_config(&self, env: EnvSnapshot) -> BackendConfig {
        BackendConfig {
            port: self.port,
            app_support: self.app_support.clone().unwrap_or_else(default_app_support),
            seeds: self
                .resources
                .as_deref()
                .map(SeedResources::from_bundle)
                .unwrap_or_default(),
            env,
        }
    }
}

/// Explicit configuration for [`crate::supervisor::EmbeddedBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `None` picks a free loopback port.
    pub port: Option<u16>,
    pub app_support: PathBuf,
    pub seeds: SeedResources,
    pub env: EnvSnapshot,
}

impl BackendConfig {
    pub fn new(app_support: impl Into<PathBuf>) -> Self {
        Self {
            port: None,
            app_support: app_support.into(),
            seeds: SeedResources::default(),
            env: EnvSnapshot::new(),
        }
    }
}

pub fn default_app_support() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("SteelChat")
}

// Read the process environment once, at the edge
pub fn env_snapshot() -> EnvSnapshot {
    std::env::vars_os()
        .filter_map(|(k, v)| k.into_string().ok().map(|k| (k, v)))
        .collect()
}
