mod cli;
mod commands;
mod error;
mod input;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match &cli.command {
        Command::Fetch(args) => {
            let report = commands::fetch::run(args).await?;
            output::render_report(&report, cli.format, cli.pretty)?;

            if !report.is_complete() {
                return Ok(ExitCode::from(3));
            }
        }
        Command::Cache(args) => {
            let value = commands::cache::run(args)?;
            output::render(&value, cli.pretty)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so stdout stays machine-readable. `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tokenfetch={level},tokenfetch_core={level},tokenfetch_warehouse={level}"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
