use crate::{errors, paths};
use anyhow::{Context, Result};
use clap::Args;
use drydock_core::host::registry::GlobalRegistry;
use drydock_core::host::PluginRegistry;
use drydock_core::{Executor, WorkspaceConfig};
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Command to run, e.g. `build` or `test`.
    pub command: String,
    /// Extra arguments forwarded to the command (reserved for future use).
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("can't determine current directory")?;
    let workspace = WorkspaceConfig::discover(&cwd).context("failed to discover a drydock workspace")?;

    let config_dir = paths::config_dir()?;
    let registry = GlobalRegistry::load(&config_dir)?;
    let plugins = Arc::new(
        PluginRegistry::bootstrap(&registry)
            .await
            .context("failed to start plugins")?,
    );

    let executor = Executor::new(Arc::clone(&plugins));
    let outcome = executor.run_command(&workspace, &args.command, &args.args).await;
    plugins.shutdown_all().await;

    outcome.map_err(errors::into_anyhow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: RunArgs,
    }

    #[test]
    fn trailing_args_are_collected() {
        let wrapper = Wrapper::try_parse_from(["drydock", "test", "--filter", "foo"]).unwrap();
        assert_eq!(wrapper.args.command, "test");
        assert_eq!(wrapper.args.args, vec!["--filter", "foo"]);
    }
}
