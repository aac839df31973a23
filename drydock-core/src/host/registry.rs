//! Persisted global plugin registry: `{config_dir}/drydock/registry.yaml`
//! records installed plugin name -> executable path across invocations,
//! mirroring the original's `harbor.global` file (renamed, re-expressed as
//! YAML for consistency with the workspace config format).

use crate::error::DrydockError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const REGISTRY_FILENAME: &str = "registry.yaml";

/// One plugin recorded in the global registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPlugin {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// The persisted set of installed plugins, independent of any one
/// workspace.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GlobalRegistry {
    #[serde(default)]
    pub plugins: HashMap<String, RegisteredPlugin>,

    #[serde(skip)]
    location: Option<PathBuf>,
}

impl GlobalRegistry {
    /// The canonical registry file path under a config directory (e.g. the
    /// value of `dirs::config_dir()` / `$XDG_CONFIG_HOME`, injected by the
    /// caller so the core stays free of platform assumptions per spec §9).
    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join("drydock").join(REGISTRY_FILENAME)
    }

    /// Load the registry from `config_dir`, or an empty one if it doesn't
    /// exist yet.
    pub fn load(config_dir: &Path) -> Result<GlobalRegistry, DrydockError> {
        let path = Self::path_in(config_dir);
        if !path.exists() {
            return Ok(GlobalRegistry {
                plugins: HashMap::new(),
                location: Some(path),
            });
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| DrydockError::PluginHostError(format!("error reading {}: {e}", path.display())))?;
        let mut registry: GlobalRegistry = serde_yaml::from_str(&data)
            .map_err(|e| DrydockError::PluginHostError(format!("error parsing {}: {e}", path.display())))?;
        registry.location = Some(path);
        Ok(registry)
    }

    pub fn save(&self) -> Result<(), DrydockError> {
        let path = self
            .location
            .as_ref()
            .ok_or_else(|| DrydockError::PluginHostError("registry has no location to save to".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DrydockError::PluginHostError(format!("error creating {}: {e}", parent.display())))?;
        }
        let data = serde_yaml::to_string(self)
            .map_err(|e| DrydockError::PluginHostError(format!("error marshalling registry: {e}")))?;
        std::fs::write(path, data)
            .map_err(|e| DrydockError::PluginHostError(format!("error writing {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn register(&mut self, name: impl Into<String>, executable: PathBuf) {
        let name = name.into();
        self.plugins.insert(
            name.clone(),
            RegisteredPlugin {
                name,
                executable,
                is_active: true,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = GlobalRegistry::load(tmp.path()).unwrap();
        registry.register("fake-runner", PathBuf::from("/usr/local/bin/fake-runner"));
        registry.save().unwrap();

        let reloaded = GlobalRegistry::load(tmp.path()).unwrap();
        assert_eq!(
            reloaded.get("fake-runner").unwrap().executable,
            PathBuf::from("/usr/local/bin/fake-runner")
        );
    }

    #[test]
    fn loading_missing_registry_is_empty_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = GlobalRegistry::load(tmp.path()).unwrap();
        assert!(registry.plugins.is_empty());
    }
}
