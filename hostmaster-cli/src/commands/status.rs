//! `hostmaster status` — live view of a running master.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use super::ConnectArgs;

/// Arguments for `hostmaster status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    sessions: Vec<SessionJson>,
    pending_tokens: usize,
    down_hosts: Vec<DownHostJson>,
}

#[derive(Debug, Deserialize)]
struct SessionJson {
    connection_id: u64,
    peer: String,
    username: Option<String>,
    daemon_host: Option<String>,
    protocol_version: Option<u16>,
    queued_batches: usize,
}

#[derive(Debug, Deserialize)]
struct DownHostJson {
    host: String,
    retry_in_ms: u64,
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "id")]
    id: u64,
    #[tabled(rename = "peer")]
    peer: String,
    #[tabled(rename = "user")]
    user: String,
    #[tabled(rename = "daemon host")]
    daemon_host: String,
    #[tabled(rename = "protocol")]
    protocol: String,
    #[tabled(rename = "queued")]
    queued: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let mut client = self.connect.connect()?;
        let reply = client.call("status", Value::Null).context("status failed")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&reply).context("failed to render status JSON")?
            );
            return Ok(());
        }

        let report: StatusReport =
            serde_json::from_value(reply).context("unexpected status reply")?;
        println!(
            "{} sessions | {} pending sync tokens | {} daemons down",
            report.sessions.len(),
            report.pending_tokens,
            report.down_hosts.len(),
        );

        let rows: Vec<SessionRow> = report
            .sessions
            .into_iter()
            .map(|s| SessionRow {
                id: s.connection_id,
                peer: s.peer,
                user: s.username.unwrap_or_else(|| "-".to_string()),
                daemon_host: s.daemon_host.unwrap_or_default(),
                protocol: s
                    .protocol_version
                    .map(|v| format!("v{v}"))
                    .unwrap_or_else(|| "-".to_string()),
                queued: s.queued_batches,
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        for down in report.down_hosts {
            println!(
                "{} {} (retry in {}s)",
                "DOWN".red().bold(),
                down.host,
                down.retry_in_ms / 1000,
            );
        }
        Ok(())
    }
}
