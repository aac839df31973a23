mod commands;
mod errors;
mod logging;
mod paths;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{plugins, run, workspace};

/// Command line arguments for the drydock orchestrator.
#[derive(Debug, Parser)]
#[command(
    name = "drydock",
    author,
    version,
    about = "Monorepo build-and-task orchestrator",
    propagate_version = true
)]
struct Cli {
    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, global = true)]
    machine_readable: bool,

    /// trace, debug, info, warn, error, fatal, or panic.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command across the workspace.
    Run(run::RunArgs),
    /// Inspect or scaffold a workspace.
    #[command(subcommand)]
    Workspace(workspace::WorkspaceCommand),
    /// Manage installed plugins.
    #[command(subcommand)]
    Plugins(plugins::PluginsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.machine_readable);

    let result = match cli.command {
        Commands::Run(args) => run::run(args).await,
        Commands::Workspace(cmd) => workspace::run(cmd).await,
        Commands::Plugins(cmd) => plugins::run(cmd).await,
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_collects_trailing_args() {
        let cli = Cli::try_parse_from(["drydock", "run", "build", "--", "extra", "flags"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.command, "build");
                assert_eq!(args.args, vec!["extra", "flags"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_parse_before_subcommand() {
        let cli = Cli::try_parse_from(["drydock", "--log-level", "debug", "run", "test"]).unwrap();
        assert_eq!(cli.log_level, "debug");
    }
}
