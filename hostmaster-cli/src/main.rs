//! hostmaster — control-plane master CLI.
//!
//! # Usage
//!
//! ```text
//! hostmaster serve [--config <path>]
//! hostmaster config [--config <path>]
//! hostmaster tables [--json]
//! hostmaster invalidate <table> [--host <host>] --user <name> --secret <secret> [--addr <addr>]
//! hostmaster ping --user <name> --secret <secret> [--addr <addr>]
//! hostmaster status --user <name> --secret <secret> [--addr <addr>] [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigArgs, invalidate::InvalidateArgs, ping::PingArgs, serve::ServeArgs,
    status::StatusArgs, tables::TablesArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "hostmaster",
    version,
    about = "Run and operate the hosting control-plane master",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the master in the foreground until ctrl-c.
    Serve(ServeArgs),

    /// Print the effective configuration with secrets masked.
    Config(ConfigArgs),

    /// List schema tables and what each cascades to.
    Tables(TablesArgs),

    /// Invalidate a table for every account on a running master.
    Invalidate(InvalidateArgs),

    /// Check that a master is reachable and accepts the credentials.
    Ping(PingArgs),

    /// Show sessions, pending sync tokens and down daemons.
    Status(StatusArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => args.run(),
        Commands::Config(args) => args.run(),
        Commands::Tables(args) => args.run(),
        Commands::Invalidate(args) => args.run(),
        Commands::Ping(args) => args.run(),
        Commands::Status(args) => args.run(),
    }
}
