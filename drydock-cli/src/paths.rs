//! Platform config directory resolution, kept out of drydock-core so the
//! core stays free of platform assumptions (spec §9) and the CLI is the
//! one place that decides where `registry.yaml` lives.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub fn config_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        return std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("%APPDATA% is not set"));
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg));
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config"))
        .ok_or_else(|| anyhow!("neither XDG_CONFIG_HOME nor HOME is set"))
}
