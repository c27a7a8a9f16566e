//! DeskBridge CLI - companion tool for the peer-to-peer remote desktop engine
//!
//! The interactive client embeds `deskbridge-core` directly; this binary
//! covers the offline chores around it: the local identifier, the address
//! book, configuration and liveness checks against the broker.
//!
//! ## Quick Start
//!
//! ```bash
//! # Show the identifier other devices connect to
//! deskbridge id
//!
//! # Check which contacts are online
//! deskbridge status
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config_path = cli.config_path();

    match cli.command {
        Command::Id(args) => commands::id::run(&args),
        Command::Contacts(args) => commands::contacts::run(args),
        Command::Recent(args) => commands::contacts::run_recent(&args),
        Command::Status(args) => commands::status::run(args, &config_path).await,
        Command::Config(args) => commands::config::run(args, &config_path),
        Command::Secret(args) => commands::secret::run(&args, &config_path),
        Command::Completions(args) => commands::completions::run(args.action),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "warn,deskbridge=debug,deskbridge_core=debug"
    } else {
        "warn,deskbridge=info,deskbridge_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
