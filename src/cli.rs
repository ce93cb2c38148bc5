use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{Config, DEFAULT_CONFIG_FILE};

/// Tunnel IP traffic inside ICMP Echo packets
#[derive(Parser, Debug, Clone)]
#[command(name = "pingtun")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Remote tunnel endpoint, overrides `remote` from the file
    #[arg(long = "remote")]
    pub remote: Option<Ipv4Addr>,

    /// Validate the configuration and exit
    #[arg(long = "check")]
    pub check: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(remote) = self.remote {
            config.remote = Some(remote);
        }
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
