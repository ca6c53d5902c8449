pub mod config;
pub mod invalidate;
pub mod ping;
pub mod serve;
pub mod status;
pub mod tables;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use hostmaster_server::paths::DEFAULT_LISTEN;
use hostmaster_server::protocol::PROTOCOL_V2;
use hostmaster_server::{Hello, MasterClient};

/// Where the master config lives.
#[derive(Args, Debug)]
pub struct ConfigPathArg {
    /// Config file (defaults to ~/.hostmaster/master.yaml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// How to reach and log in to a running master.
#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Master address.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub addr: String,

    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub secret: String,
}

impl ConnectArgs {
    pub fn connect(&self) -> Result<MasterClient> {
        let hello = Hello {
            protocol_version: PROTOCOL_V2,
            username: self.user.clone(),
            secret: self.secret.clone(),
            daemon_host: None,
        };
        MasterClient::connect(self.addr.as_str(), hello)
            .with_context(|| format!("failed to connect to master at {}", self.addr))
    }
}
