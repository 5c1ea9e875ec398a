// Gantry CLI
// Validate, plan and run workflow definitions locally

mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;

/// Run GitHub Actions style workflows on this machine
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
pub struct Cli {
    /// Log level for engine diagnostics (overrides GANTRY_LOG)
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a definition for schema, dependency and schedule errors
    Validate(commands::validate::ValidateArgs),

    /// Show what an event would run: activation, DAG levels and matrix instances
    Plan(commands::plan::PlanArgs),

    /// Execute a definition for an event
    Run(commands::run::RunArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(cli.log_level)?;

    let code = match cli.command {
        Command::Validate(args) => commands::validate::execute(args),
        Command::Plan(args) => commands::plan::execute(args),
        Command::Run(args) => commands::run::execute(args).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
