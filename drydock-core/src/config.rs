//! Workspace configuration: the YAML file format, sub-package discovery and
//! the ancestor walk-up search that locates a workspace root from anywhere
//! beneath it.

use crate::condition::Condition;
use crate::error::DrydockError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const WORKSPACE_CONFIG_NAME: &str = "workspace.conf";
pub const SUB_PACKAGE_CONFIG_NAME: &str = "drydock.conf";
const MAX_ANCESTOR_DISTANCE: u32 = 1000;

/// A sub-package location, expanded against the filesystem with a glob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
}

/// A reference to another package's command, used in `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "pkg")]
    pub package_name: String,
    #[serde(rename = "command")]
    pub command_name: String,
}

fn deserialize_conditions<'de, D>(deserializer: D) -> Result<Vec<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Condition::parse).collect())
}

fn serialize_conditions<S>(conditions: &[Condition], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(conditions.len()))?;
    for condition in conditions {
        seq.serialize_element(condition.source())?;
    }
    seq.end()
}

/// One runnable command in a package: how to run it, what it depends on,
/// and when it should be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub runner_type: String,
    pub command: String,
    #[serde(
        rename = "conditions",
        default,
        deserialize_with = "deserialize_conditions",
        serialize_with = "serialize_conditions"
    )]
    pub conditions: Vec<Condition>,
    #[serde(rename = "depends_on", default)]
    pub depends_on: Vec<Dependency>,
    #[serde(rename = "options", default)]
    pub settings: serde_json::Value,
}

/// Which plugin provides caching for a workspace, and its provider-specific
/// settings (e.g. `local_cache_dir`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub provider: String,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            provider: "local_cache".to_string(),
            settings: HashMap::new(),
        }
    }
}

/// A workspace or sub-package's configuration, loaded from
/// `workspace.conf`/`drydock.conf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(rename = "workspace_name")]
    pub name: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(rename = "cache", default)]
    pub cache_settings: Option<CacheSettings>,
    #[serde(default)]
    pub commands: HashMap<String, Command>,

    #[serde(skip)]
    location: Option<PathBuf>,
    #[serde(skip)]
    sub_packages: HashMap<String, WorkspaceConfig>,
}

impl WorkspaceConfig {
    /// The local cache directory: `cache.settings.local_cache_dir` if set,
    /// else `{workspace_root}/.drydock`.
    pub fn local_cache_dir(&self) -> PathBuf {
        if let Some(cache) = &self.cache_settings {
            if let Some(dir) = cache.settings.get("local_cache_dir").and_then(|v| v.as_str()) {
                return PathBuf::from(dir);
            }
        }
        self.workspace_root().join(".drydock")
    }

    /// The cache provider plugin name this workspace uses.
    pub fn cache_provider(&self) -> String {
        self.cache_settings
            .as_ref()
            .map(|c| c.provider.clone())
            .unwrap_or_else(|| CacheSettings::default().provider)
    }

    /// Directory containing this config's file.
    pub fn workspace_root(&self) -> PathBuf {
        self.location
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn add_sub_package(&mut self, name: impl Into<String>, mut conf: WorkspaceConfig) {
        let name = name.into();
        conf.name = name.clone();
        self.sub_packages.insert(name, conf);
    }

    pub fn get_package_config(&self, package_name: &str) -> Result<&WorkspaceConfig, DrydockError> {
        self.sub_packages.get(package_name).ok_or_else(|| {
            DrydockError::CommandNotFound {
                pkg: package_name.to_string(),
                cmd: String::new(),
            }
        })
    }

    pub fn all_sub_packages(&self) -> &HashMap<String, WorkspaceConfig> {
        &self.sub_packages
    }

    /// All packages reachable from this one (itself plus every descendant
    /// sub-package, however deeply nested), keyed by name. Used to resolve
    /// a dependency's `package` field against the whole workspace rather
    /// than just this node's direct children.
    pub fn flatten_packages(&self) -> HashMap<String, &WorkspaceConfig> {
        let mut out = HashMap::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut HashMap<String, &'a WorkspaceConfig>) {
        out.insert(self.name.clone(), self);
        for sub in self.sub_packages.values() {
            sub.flatten_into(out);
        }
    }

    /// Write this config back to its `location`.
    pub fn save(&self) -> Result<(), DrydockError> {
        let location = self
            .location
            .as_ref()
            .ok_or_else(|| DrydockError::ConfigError("config has no location to save to".into()))?;
        let data = serde_yaml::to_string(self)
            .map_err(|e| DrydockError::ConfigError(format!("error marshalling config: {e}")))?;
        std::fs::write(location, data)
            .map_err(|e| DrydockError::ConfigError(format!("error writing config: {e}")))?;
        Ok(())
    }

    /// Scaffold a brand new workspace config file at `dir/workspace.conf`.
    pub fn scaffold(name: impl Into<String>, dir: &Path) -> Result<WorkspaceConfig, DrydockError> {
        let conf = WorkspaceConfig {
            name: name.into(),
            packages: Vec::new(),
            cache_settings: None,
            commands: HashMap::new(),
            location: Some(dir.join(WORKSPACE_CONFIG_NAME)),
            sub_packages: HashMap::new(),
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| DrydockError::ConfigError(format!("error creating directory: {e}")))?;
        conf.save()?;
        Ok(conf)
    }

    /// Load a single config file from `path`, without discovering sub-packages.
    pub fn load(path: &Path) -> Result<WorkspaceConfig, DrydockError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| DrydockError::ConfigError(format!("error reading {}: {e}", path.display())))?;
        let mut conf: WorkspaceConfig = serde_yaml::from_str(&data)
            .map_err(|e| DrydockError::ConfigError(format!("error parsing {}: {e}", path.display())))?;
        conf.location = Some(path.to_path_buf());
        Ok(conf)
    }

    /// Expand this config's `packages` glob patterns and load any
    /// `drydock.conf` found in the matched directories as sub-packages.
    pub fn load_sub_packages(&mut self) -> Result<(), DrydockError> {
        let root = self.workspace_root();
        let mut matches = Vec::new();
        for package in &self.packages {
            let pattern = root.join(&package.path);
            let pattern = pattern.to_string_lossy().into_owned();
            let entries = glob::glob(&pattern)
                .map_err(|e| DrydockError::ConfigError(format!("bad glob `{pattern}`: {e}")))?;
            for entry in entries {
                let path = entry
                    .map_err(|e| DrydockError::ConfigError(format!("error reading glob match: {e}")))?;
                if path.is_dir() {
                    matches.push(path);
                }
            }
        }
        for dir in matches {
            let sub_path = dir.join(SUB_PACKAGE_CONFIG_NAME);
            if !sub_path.exists() {
                log::trace!("{} is not a drydock package, ignoring", dir.display());
                continue;
            }
            let conf = WorkspaceConfig::load(&sub_path)?;
            self.sub_packages.insert(conf.name.clone(), conf);
        }
        Ok(())
    }

    /// Load the full workspace: discover the nearest ancestor
    /// `workspace.conf` from `start_dir`, then recursively load its
    /// sub-packages.
    pub fn discover(start_dir: &Path) -> Result<WorkspaceConfig, DrydockError> {
        let config_path = find_ancestor_config(start_dir, WORKSPACE_CONFIG_NAME)?;
        let mut conf = WorkspaceConfig::load(&config_path)?;
        conf.load_sub_packages()?;
        Ok(conf)
    }
}

fn find_ancestor_config(start_dir: &Path, name: &str) -> Result<PathBuf, DrydockError> {
    let mut dir = std::fs::canonicalize(start_dir)
        .map_err(|e| DrydockError::ConfigError(format!("error resolving {}: {e}", start_dir.display())))?;
    for _ in 0..MAX_ANCESTOR_DISTANCE {
        let candidate = dir.join(name);
        log::trace!("checking to see if config is {}", candidate.display());
        if candidate.exists() {
            return Ok(candidate);
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    Err(DrydockError::ConfigError("not in a drydock workspace".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scaffold_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("myworkspace");
        let conf = WorkspaceConfig::scaffold("myworkspace", &dir).unwrap();
        assert_eq!(conf.name, "myworkspace");

        let loaded = WorkspaceConfig::load(&dir.join(WORKSPACE_CONFIG_NAME)).unwrap();
        assert_eq!(loaded.name, "myworkspace");
    }

    #[test]
    fn discover_walks_up_to_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        WorkspaceConfig::scaffold("root-ws", &root).unwrap();

        let found = WorkspaceConfig::discover(&nested).unwrap();
        assert_eq!(found.name, "root-ws");
    }

    #[test]
    fn discover_fails_outside_any_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let err = WorkspaceConfig::discover(tmp.path());
        assert!(err.is_err());
    }

    #[test]
    fn sub_packages_are_discovered_via_glob() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut conf = WorkspaceConfig::scaffold("root-ws", root).unwrap();
        conf.packages.push(Package {
            name: None,
            path: "services/*".to_string(),
        });
        conf.save().unwrap();

        let svc_dir = root.join("services").join("api");
        fs::create_dir_all(&svc_dir).unwrap();
        let sub = WorkspaceConfig {
            name: "api".to_string(),
            packages: Vec::new(),
            cache_settings: None,
            commands: HashMap::new(),
            location: Some(svc_dir.join(SUB_PACKAGE_CONFIG_NAME)),
            sub_packages: HashMap::new(),
        };
        sub.save().unwrap();

        let mut conf = WorkspaceConfig::load(&root.join(WORKSPACE_CONFIG_NAME)).unwrap();
        conf.load_sub_packages().unwrap();
        assert!(conf.get_package_config("api").is_ok());
    }
}
