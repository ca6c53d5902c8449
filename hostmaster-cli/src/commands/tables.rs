//! `hostmaster tables` — the table catalogue and its cascade map.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use hostmaster_core::TableId;

/// Arguments for `hostmaster tables`.
#[derive(Args, Debug)]
pub struct TablesArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct TableJson {
    table: TableId,
    cascades: Vec<TableId>,
    affects_daemon_connectors: bool,
}

#[derive(Tabled)]
struct TableRow {
    #[tabled(rename = "table")]
    table: String,
    #[tabled(rename = "cascades to")]
    cascades: String,
    #[tabled(rename = "connectors")]
    connectors: String,
}

impl TablesArgs {
    pub fn run(self) -> Result<()> {
        if self.json {
            let rows: Vec<TableJson> = TableId::ALL
                .iter()
                .map(|table| TableJson {
                    table: *table,
                    cascades: table.cascades().to_vec(),
                    affects_daemon_connectors: table.affects_daemon_connectors(),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to render tables JSON")?
            );
            return Ok(());
        }

        let rows: Vec<TableRow> = TableId::ALL
            .iter()
            .map(|table| TableRow {
                table: table.name().to_string(),
                cascades: table
                    .cascades()
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", "),
                connectors: if table.affects_daemon_connectors() {
                    "■".yellow().bold().to_string()
                } else {
                    String::new()
                },
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{} tables", TableId::ALL.len());
        Ok(())
    }
}
