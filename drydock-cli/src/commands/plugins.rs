use crate::paths;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use drydock_core::host::registry::GlobalRegistry;
use drydock_core::host::PluginProcess;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Subcommand)]
pub enum PluginsCommand {
    /// List registered plugins.
    List,
    /// Install a plugin from a directory containing a `plugin.json` manifest.
    Install(InstallArgs),
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    pub path: PathBuf,
}

/// Mirrors the original's `PluginJSON`: name, how to launch it, and the
/// capabilities it's expected to advertise on `Install`.
#[derive(Debug, Deserialize)]
struct PluginManifest {
    name: String,
    executable: String,
    #[serde(default)]
    settings_schema: serde_json::Value,
    #[serde(default)]
    plugin_types: Vec<String>,
}

pub async fn run(cmd: PluginsCommand) -> Result<()> {
    let config_dir = paths::config_dir()?;
    match cmd {
        PluginsCommand::List => list(&config_dir),
        PluginsCommand::Install(args) => install(&config_dir, &args.path).await,
    }
}

fn list(config_dir: &Path) -> Result<()> {
    let registry = GlobalRegistry::load(config_dir)?;
    if registry.plugins.is_empty() {
        println!("no plugins registered");
        return Ok(());
    }
    for plugin in registry.plugins.values() {
        println!(
            "{}\t{}\t{}",
            plugin.name,
            plugin.executable.display(),
            if plugin.is_active { "active" } else { "disabled" }
        );
    }
    Ok(())
}

async fn install(config_dir: &Path, plugin_dir: &Path) -> Result<()> {
    let manifest_path = plugin_dir.join("plugin.json");
    let manifest_body = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("can't read {}", manifest_path.display()))?;
    let manifest: PluginManifest = serde_json::from_str(&manifest_body)
        .with_context(|| format!("can't parse {}", manifest_path.display()))?;
    log::debug!(
        "manifest for `{}` declares plugin_types {:?}, settings_schema {}",
        manifest.name,
        manifest.plugin_types,
        manifest.settings_schema
    );

    let executable = plugin_dir.join(&manifest.executable);
    let process = PluginProcess::spawn(&manifest.name, &executable, &[])
        .await
        .with_context(|| format!("failed to start plugin `{}` for installation", manifest.name))?;
    let (installed_name, capabilities) = process
        .install()
        .await
        .with_context(|| format!("install handshake failed for `{}`", manifest.name))?;
    process.kill().await.ok();

    let mut registry = GlobalRegistry::load(config_dir)?;
    registry.register(installed_name.clone(), executable);
    registry.save()?;

    log::info!("installed `{installed_name}` with capabilities {capabilities:?}");
    println!("installed {installed_name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(subcommand)]
        command: PluginsCommand,
    }

    #[test]
    fn install_takes_a_directory_path() {
        let wrapper = Wrapper::try_parse_from(["drydock", "install", "./plugins/fake-runner"]).unwrap();
        let PluginsCommand::Install(args) = wrapper.command else {
            panic!("expected Install");
        };
        assert_eq!(args.path, PathBuf::from("./plugins/fake-runner"));
    }

    #[test]
    fn list_takes_no_arguments() {
        let wrapper = Wrapper::try_parse_from(["drydock", "list"]).unwrap();
        assert!(matches!(wrapper.command, PluginsCommand::List));
    }
}
