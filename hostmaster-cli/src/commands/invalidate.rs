//! `hostmaster invalidate` — operator-issued cache invalidation.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::json;

use hostmaster_core::{HostId, TableId};

use super::ConnectArgs;

/// Arguments for `hostmaster invalidate`.
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Table name, e.g. `net_binds`.
    pub table: String,

    /// Limit the invalidation to one host.
    #[arg(long)]
    pub host: Option<String>,

    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Debug, Deserialize)]
struct Summary {
    tables: Vec<TableId>,
    sessions: usize,
    #[serde(default)]
    tokens: Vec<serde_json::Value>,
}

impl InvalidateArgs {
    pub fn run(self) -> Result<()> {
        let table: TableId = self.table.parse()?;
        let host = self.host.map(HostId::from);

        let mut client = self.connect.connect()?;
        let reply = client
            .call("invalidate", json!({ "table": table, "host": host }))
            .with_context(|| format!("failed to invalidate {table}"))?;
        let summary: Summary =
            serde_json::from_value(reply).context("unexpected invalidate reply")?;

        println!(
            "{} {} table(s), delivered to {} session(s), {} daemon sync token(s)",
            "invalidated".green().bold(),
            summary.tables.len(),
            summary.sessions,
            summary.tokens.len(),
        );
        for table in &summary.tables {
            println!("  {table}");
        }
        Ok(())
    }
}
