//! `kiln` command-line entry point.
//!
//! Configuration comes from `KILN_*` environment variables; logs go to
//! stderr and are filtered with `RUST_LOG` (default `kiln=info`).

mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use commands::App;
use kiln_core::KilnConfig;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = KilnConfig::from_env();
    config.validate_warn();

    match App::new(config, cli.json).run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!(error = ?e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays clean for command output.
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("kiln=info".parse()?)
                .add_directive("kiln_core=info".parse()?)
                .add_directive("kiln_image=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}
