//! Recipe graph construction: resolving a requested command into a
//! deduplicated DAG of `(package, command)` nodes.

use crate::condition::VariableLookup;
use crate::config::{Command, WorkspaceConfig};
use crate::error::DrydockError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// The enclosing-package sentinel used in `depends_on: [{pkg: ".", ...}]`.
const SELF_PACKAGE: &str = ".";

/// Runtime state tracked on a node across the lifetime of one executor run.
#[derive(Debug, Default)]
pub struct RecipeState {
    pub done: bool,
    pub error: Option<Arc<DrydockError>>,
}

/// A graph node: one `(package, command)` unit of work, deduplicated by
/// `hash_key` within a single graph.
pub struct Recipe {
    pub package_name: String,
    pub command_name: String,
    pub needs: Vec<Arc<Recipe>>,
    /// `None` for the synthetic empty join node of an aggregating root.
    pub config: Option<Command>,
    pub workspace_root: std::path::PathBuf,
    pub variables: VariableLookup,
    pub cache_provider: String,
    pub local_cache_dir: std::path::PathBuf,
    pub(crate) state: Mutex<RecipeState>,
    /// Held for a node's entire run, so a dedup-shared node only ever
    /// executes once even when several parents reach it concurrently
    /// (spec §4.E step 1). A `tokio` mutex since it's held across awaits,
    /// unlike `state`, which is only ever touched for a quick synchronous
    /// read or write.
    pub(crate) run_lock: AsyncMutex<()>,
}

impl Recipe {
    pub fn hash_key(&self) -> String {
        format!("{}:{}", self.package_name, self.command_name)
    }
}

impl std::fmt::Debug for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recipe")
            .field("hash_key", &self.hash_key())
            .field("needs", &self.needs.iter().map(|n| n.hash_key()).collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a single recipe graph for one `run_command` invocation. Owns the
/// dedup map (`hash_key -> node`) for the graph's lifetime; the "on stack"
/// set used for cycle detection is separate and unwinds with recursion.
struct GraphBuilder<'a> {
    packages: HashMap<String, &'a WorkspaceConfig>,
    nodes: HashMap<String, Arc<Recipe>>,
}

/// Build the recipe graph for `command` rooted at `workspace`, per the
/// construction algorithm: explicit if the root itself declares `command`
/// with dependencies, otherwise aggregating across direct sub-packages.
pub fn build_root(workspace: &WorkspaceConfig, command: &str) -> Result<Arc<Recipe>, DrydockError> {
    let mut builder = GraphBuilder {
        packages: workspace.flatten_packages(),
        nodes: HashMap::new(),
    };

    let is_explicit = workspace
        .commands
        .get(command)
        .map(|c| !c.depends_on.is_empty())
        .unwrap_or(false);

    if is_explicit {
        let mut on_stack = HashSet::new();
        return builder.materialize(workspace, command, &mut on_stack);
    }

    let mut needs = Vec::new();
    for sub in workspace.all_sub_packages().values() {
        if sub.commands.contains_key(command) {
            let mut on_stack = HashSet::new();
            needs.push(builder.materialize(sub, command, &mut on_stack)?);
        }
    }
    if needs.is_empty() {
        return Err(DrydockError::CommandNotFound {
            pkg: workspace.name.clone(),
            cmd: command.to_string(),
        });
    }

    Ok(Arc::new(Recipe {
        package_name: workspace.name.clone(),
        command_name: command.to_string(),
        needs,
        config: None,
        workspace_root: workspace.workspace_root(),
        variables: default_variable_lookup(),
        cache_provider: workspace.cache_provider(),
        local_cache_dir: workspace.local_cache_dir(),
        state: Mutex::new(RecipeState::default()),
        run_lock: AsyncMutex::new(()),
    }))
}

/// The one concrete `VariableLookup` this workspace ships: `env`.
pub fn default_variable_lookup() -> VariableLookup {
    let mut lookup = VariableLookup::new();
    lookup.register("env", Arc::new(crate::condition::EnvProvider));
    lookup
}

impl<'a> GraphBuilder<'a> {
    fn materialize(
        &mut self,
        pkg: &'a WorkspaceConfig,
        cmd: &str,
        on_stack: &mut HashSet<String>,
    ) -> Result<Arc<Recipe>, DrydockError> {
        let hash_key = format!("{}:{}", pkg.name, cmd);

        if let Some(existing) = self.nodes.get(&hash_key) {
            return Ok(Arc::clone(existing));
        }

        let command = pkg.commands.get(cmd).ok_or_else(|| DrydockError::CommandNotFound {
            pkg: pkg.name.clone(),
            cmd: cmd.to_string(),
        })?;

        if !on_stack.insert(hash_key.clone()) {
            return Err(DrydockError::CycleDetected {
                path: vec![hash_key],
            });
        }

        let mut needs = Vec::with_capacity(command.depends_on.len());
        for dep in &command.depends_on {
            let dep_pkg_name = if dep.package_name == SELF_PACKAGE {
                pkg.name.clone()
            } else {
                dep.package_name.clone()
            };
            let dep_pkg = *self.packages.get(&dep_pkg_name).ok_or_else(|| {
                DrydockError::CommandNotFound {
                    pkg: dep_pkg_name.clone(),
                    cmd: dep.command_name.clone(),
                }
            })?;
            match self.materialize(dep_pkg, &dep.command_name, on_stack) {
                Ok(node) => needs.push(node),
                Err(DrydockError::CycleDetected { mut path }) => {
                    path.push(hash_key.clone());
                    return Err(DrydockError::CycleDetected { path });
                }
                Err(other) => return Err(other),
            }
        }

        on_stack.remove(&hash_key);

        let node = Arc::new(Recipe {
            package_name: pkg.name.clone(),
            command_name: cmd.to_string(),
            needs,
            config: Some(command.clone()),
            workspace_root: pkg.workspace_root(),
            variables: default_variable_lookup(),
            cache_provider: pkg.cache_provider(),
            local_cache_dir: pkg.local_cache_dir(),
            state: Mutex::new(RecipeState::default()),
            run_lock: AsyncMutex::new(()),
        });
        self.nodes.insert(hash_key, Arc::clone(&node));
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dependency;
    use std::collections::HashMap as StdHashMap;

    fn workspace(name: &str, commands: Vec<(&str, Vec<(&str, &str)>)>) -> WorkspaceConfig {
        let mut cmds = StdHashMap::new();
        for (cmd_name, deps) in commands {
            cmds.insert(
                cmd_name.to_string(),
                Command {
                    runner_type: "shell".to_string(),
                    command: "echo hi".to_string(),
                    conditions: Vec::new(),
                    depends_on: deps
                        .into_iter()
                        .map(|(p, c)| Dependency {
                            package_name: p.to_string(),
                            command_name: c.to_string(),
                        })
                        .collect(),
                    settings: serde_json::Value::Null,
                },
            );
        }
        let tmp_dir = std::env::temp_dir().join(format!("drydock-graph-test-{name}"));
        let mut conf = WorkspaceConfig::scaffold(name, &tmp_dir).unwrap();
        conf.commands = cmds;
        conf
    }

    #[test]
    fn diamond_dedups_to_one_node_per_hash_key() {
        let d = workspace("D", vec![("cmd", vec![])]);
        let mut b = workspace("B", vec![("cmd", vec![(".", "cmd")])]);
        b.add_sub_package("D", d.clone());
        let mut c = workspace("C", vec![("cmd", vec![(".", "cmd")])]);
        c.add_sub_package("D", d);
        let mut root = workspace("root", vec![("cmd", vec![("B", "cmd"), ("C", "cmd")])]);
        root.add_sub_package("B", b);
        root.add_sub_package("C", c);

        let graph = build_root(&root, "cmd").unwrap();
        assert_eq!(graph.hash_key(), "root:cmd");
        assert_eq!(graph.needs.len(), 2);
        let d_via_b = graph.needs.iter().find(|n| n.package_name == "B").unwrap().needs[0].clone();
        let d_via_c = graph.needs.iter().find(|n| n.package_name == "C").unwrap().needs[0].clone();
        assert!(Arc::ptr_eq(&d_via_b, &d_via_c), "D:cmd must be the same node via both parents");
    }

    #[test]
    fn cycle_is_detected() {
        let b = workspace("B", vec![("cmd", vec![("C", "cmd")])]);
        let c = workspace("C", vec![("cmd", vec![("A", "cmd")])]);
        let mut a = workspace("A", vec![("cmd", vec![("B", "cmd")])]);
        a.add_sub_package("B", b);
        a.add_sub_package("C", c);

        let err = build_root(&a, "cmd").unwrap_err();
        assert!(matches!(err, DrydockError::CycleDetected { .. }));
    }

    #[test]
    fn aggregating_root_fans_out_to_subpackages() {
        let a = workspace("A", vec![("cmd1", vec![])]);
        let b = workspace("B", vec![("cmd1", vec![])]);
        let mut root = workspace("root", vec![]);
        root.add_sub_package("A", a);
        root.add_sub_package("B", b);

        let graph = build_root(&root, "cmd1").unwrap();
        assert_eq!(graph.package_name, "root");
        assert!(graph.config.is_none());
        assert_eq!(graph.needs.len(), 2);
    }

    #[test]
    fn missing_command_anywhere_is_command_not_found() {
        let root = workspace("root", vec![]);
        let err = build_root(&root, "nope").unwrap_err();
        assert!(matches!(err, DrydockError::CommandNotFound { .. }));
    }
}
