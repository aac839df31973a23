use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use drydock_core::WorkspaceConfig;
use std::path::PathBuf;

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
    /// Scaffold a new `workspace.conf`.
    Init(InitArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    pub name: String,
    /// Directory to scaffold into. Defaults to the current directory.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

pub async fn run(cmd: WorkspaceCommand) -> Result<()> {
    match cmd {
        WorkspaceCommand::Init(args) => {
            let workspace = WorkspaceConfig::scaffold(&args.name, &args.dir).with_context(|| {
                format!("failed to scaffold workspace `{}` in {}", args.name, args.dir.display())
            })?;
            println!("created {} at {}", workspace.name, args.dir.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(subcommand)]
        command: WorkspaceCommand,
    }

    #[test]
    fn init_defaults_dir_to_cwd() {
        let wrapper = Wrapper::try_parse_from(["drydock", "init", "my-ws"]).unwrap();
        let WorkspaceCommand::Init(args) = wrapper.command;
        assert_eq!(args.name, "my-ws");
        assert_eq!(args.dir, PathBuf::from("."));
    }
}
