//! `hostmaster ping` — reachability and credential check.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use super::ConnectArgs;

/// Arguments for `hostmaster ping`.
#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

impl PingArgs {
    pub fn run(self) -> Result<()> {
        let started = Instant::now();
        let mut client = self.connect.connect()?;
        client.call("ping", Value::Null).context("ping failed")?;
        println!(
            "{} {} (connection {}, protocol v{}) in {} ms",
            "pong".green().bold(),
            self.connect.addr,
            client.connection_id(),
            client.protocol_version(),
            started.elapsed().as_millis(),
        );
        Ok(())
    }
}
