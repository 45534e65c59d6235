use clap::Parser;
use std::path::PathBuf;

use walkie_core::config;

#[derive(Parser, Debug)]
#[command(name = "walkie")]
#[command(author = "Walkie Team")]
#[command(version)]
#[command(about = "Peer-to-peer push-to-talk over a shared room topic", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "walkie.toml")]
    pub config: PathBuf,

    /// Join an existing room by its 64-character topic instead of creating one
    #[arg(short, long)]
    pub join: Option<String>,

    /// Display name announced to other participants
    #[arg(short, long)]
    pub name: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Negotiate without WebRTC; audio rides the signaling connection
    #[arg(long, action)]
    pub relay: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, config::ConfigError> {
        config::Config::load(&self.config)
    }
}
