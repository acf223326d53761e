use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delegate_core::config::Config;
use delegate_core::logging;

#[derive(Parser)]
#[command(name = "delegate-bot")]
#[command(version)]
#[command(about = "Agent orchestration bot for Telegram")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: $DELEGATE_HOME/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Show every call instead of one-line summaries
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll Telegram and run jobs (default)
    Run,
    /// Run a single prompt and print the result
    Ask {
        /// The prompt to run
        prompt: String,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("load config")?;
    let _guard = logging::init(&config.logging)?;

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move {
        match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => {
                delegate_bot::run(config, cli.verbose).await?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::Ask { prompt } => {
                let outcome = delegate_bot::ask(config, &prompt, cli.verbose).await?;
                Ok(if outcome.is_success() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        }
    })
}
