//! `hostmaster config` — show the effective configuration.

use anyhow::{Context, Result};
use clap::Args;

use hostmaster_server::MasterConfig;

use super::ConfigPathArg;

/// Arguments for `hostmaster config`.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub config: ConfigPathArg,
}

impl ConfigArgs {
    pub fn run(self) -> Result<()> {
        let config = MasterConfig::load(self.config.config.as_deref())
            .context("failed to load master config")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&config.redacted())
                .context("failed to render config JSON")?
        );
        Ok(())
    }
}
