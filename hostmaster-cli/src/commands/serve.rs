//! `hostmaster serve` — run the master in the foreground.

use anyhow::{Context, Result};
use clap::Args;

use hostmaster_server::{start_blocking, MasterConfig};

use super::ConfigPathArg;

/// Arguments for `hostmaster serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigPathArg,
}

impl ServeArgs {
    pub fn run(self) -> Result<()> {
        let config = MasterConfig::load(self.config.config.as_deref())
            .context("failed to load master config")?;
        start_blocking(config).context("master exited with error")
    }
}
