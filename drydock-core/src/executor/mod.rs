//! Walks a recipe graph concurrently, running each node at most once,
//! honoring run-conditions and cancellation, and consulting the cache
//! before delegating to a runner plugin (spec §4.E).

mod cancel;

pub use cancel::{CancelState, GlobalCancellation};

use crate::cache::{Cacher, ReplayResult};
use crate::config::WorkspaceConfig;
use crate::error::DrydockError;
use crate::graph::{build_root, Recipe};
use crate::host::log_demux::BufferingCapturer;
use crate::host::PluginRegistry;
use drydock_plugin_sdk::protocol::{RunRequest, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

/// Owns the dependencies an executor invocation needs: the plugin
/// registry, one [`Cacher`] per cache-provider plugin in use, and the
/// single [`GlobalCancellation`] token for the run. Cheaply cloneable —
/// every field is already reference-counted — so each recipe's concurrent
/// task can hold its own copy (spec §5 "no global singletons in the core":
/// these are passed in, not reached for as statics).
#[derive(Clone)]
pub struct Executor {
    plugins: Arc<PluginRegistry>,
    cachers: Arc<AsyncMutex<HashMap<String, Arc<Cacher>>>>,
    cancellation: GlobalCancellation,
}

impl Executor {
    pub fn new(plugins: Arc<PluginRegistry>) -> Self {
        Executor {
            plugins,
            cachers: Arc::new(AsyncMutex::new(HashMap::new())),
            cancellation: GlobalCancellation::new(),
        }
    }

    pub fn cancellation(&self) -> &GlobalCancellation {
        &self.cancellation
    }

    /// Public entry: build the graph for `command` against `workspace`,
    /// then run it. Returns the root's terminal error, if any.
    pub async fn run_command(
        &self,
        workspace: &WorkspaceConfig,
        command: &str,
        _args: &[String],
    ) -> Result<(), Arc<DrydockError>> {
        let root = build_root(workspace, command).map_err(Arc::new)?;
        match self.run_recipe(&root).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn cacher_for(&self, recipe: &Recipe) -> Result<Arc<Cacher>, DrydockError> {
        let mut cachers = self.cachers.lock().await;
        if let Some(existing) = cachers.get(&recipe.cache_provider) {
            return Ok(Arc::clone(existing));
        }
        let provider = self.plugins.get_cache_provider(&recipe.cache_provider)?;
        let cacher = Arc::new(Cacher::new(provider));
        cachers.insert(recipe.cache_provider.clone(), Arc::clone(&cacher));
        Ok(cacher)
    }

    /// Run one recipe and everything it transitively depends on, per the
    /// per-node algorithm in spec §4.E. Returns `None` on success.
    pub async fn run_recipe(&self, recipe: &Arc<Recipe>) -> Option<Arc<DrydockError>> {
        // Step 1: single-flight per node. Held across the whole run so a
        // racing parent observes either "not started" or "fully done",
        // never a half-finished node (spec §4.E step 1, §9 "at-most-once").
        let _run_guard = recipe.run_lock.lock().await;
        if let Some(result) = already_done(recipe) {
            return result;
        }

        // Step 2: run-conditions gate the node; an eval error is permissive.
        if let Some(config) = &recipe.config {
            if !evaluate_conditions(recipe, config) {
                mark_done(recipe, None);
                return None;
            }
        }

        // Step 3: run dependencies concurrently, join all, collect errors.
        let mut joins = JoinSet::new();
        for dep in recipe.needs.clone() {
            let executor = self.clone();
            joins.spawn(async move { executor.run_recipe(&dep).await });
        }
        let mut dep_errors = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(Some(err)) => dep_errors.push(err),
                Ok(None) => {}
                Err(join_err) => dep_errors.push(Arc::new(DrydockError::PluginHostError(format!(
                    "dependency task panicked: {join_err}"
                )))),
            }
        }

        // Step 5: a dependency failure prevents this node from running. Checked
        // before the cancellation short-circuit below: a fatal dependency
        // failure triggers global cancellation synchronously (see
        // `finish_fatal`), so by the time we get here `cancellation.is_triggered()`
        // is already true for every direct parent of that failure. Checking
        // cancellation first would discard the real cause and report a bare
        // `Canceled` instead of the `DependencyFailure` chain spec step 3 requires.
        if !dep_errors.is_empty() {
            let err = DrydockError::dependency_failure(dep_errors);
            mark_done(recipe, Some(Arc::clone(&err)));
            return Some(err);
        }

        // Step 4: global cancellation short-circuits before anything runs.
        if self.cancellation.is_triggered() {
            let err = Arc::new(DrydockError::Canceled {
                reason: "global cancellation".to_string(),
            });
            return Some(finish_with_error_if_unset(recipe, err));
        }

        // The synthetic empty join node of an aggregating root has no
        // command body: it exists only to fan out to sub-packages.
        let Some(config) = recipe.config.clone() else {
            mark_done(recipe, None);
            return None;
        };

        let cacher = match self.cacher_for(recipe).await {
            Ok(cacher) => cacher,
            Err(err) => return Some(finish_fatal(self, recipe, err)),
        };
        let local_cache_dir = recipe.local_cache_dir.to_string_lossy().into_owned();

        // Step 6: fingerprint, then attempt a replay before running anything.
        let fingerprint = match cacher.calculate_cache_key(recipe, &[]).await {
            Ok(fp) => fp,
            Err(err) => return Some(finish_fatal(self, recipe, err)),
        };
        match cacher.replay(&fingerprint, &local_cache_dir).await {
            Ok(ReplayResult::Hit(lines)) => {
                for line in lines {
                    log::info!("[{}] {line}", recipe.hash_key());
                }
                mark_done(recipe, None);
                return None;
            }
            Ok(ReplayResult::Miss) => {}
            Err(err) => return Some(finish_fatal(self, recipe, err)),
        }

        // Step 7: fetch the runner plugin for this recipe's command.
        let runner = match self.plugins.get_runner(&config.runner_type) {
            Ok(runner) => runner,
            Err(err) => return Some(finish_fatal(self, recipe, err)),
        };

        // Step 8: open the task, with a capturer filtering by step_identifier.
        let step_identifier = recipe.hash_key();
        let capturer = Arc::new(BufferingCapturer::new(step_identifier.clone()));
        let capturer_id = runner.capturers().register(capturer.clone());

        let request = RunRequest {
            run_command: config.command.clone(),
            args: Vec::new(),
            path: recipe.workspace_root.to_string_lossy().into_owned(),
            package_name: recipe.package_name.clone(),
            command_name: recipe.command_name.clone(),
            settings: config.settings.clone(),
            step_identifier: step_identifier.clone(),
        };
        let mut handle = match runner.run(request).await {
            Ok(handle) => handle,
            Err(err) => {
                runner.capturers().remove(capturer_id);
                return Some(finish_fatal(
                    self,
                    recipe,
                    DrydockError::PluginHostError(err.to_string()),
                ));
            }
        };

        // Step 9: race task completion against global cancellation.
        let status = tokio::select! {
            status = handle.wait() => status,
            _ = self.cancellation.cancelled() => {
                let state = self.cancellation.state();
                let _ = handle.cancel(state.signal, state.timeout_ms).await;
                handle.wait().await
            }
        };
        runner.capturers().remove(capturer_id);

        match status.state {
            TaskState::Finished => {
                // Step 10: stream the captured buffer into the cache.
                let lines: Vec<String> = capturer
                    .drain()
                    .into_iter()
                    .map(|record| record.message)
                    .collect();
                if let Err(store_err) = cacher.store(&fingerprint, &local_cache_dir, lines).await {
                    let store_err = Arc::new(store_err);
                    mark_done(recipe, Some(Arc::clone(&store_err)));
                    return Some(store_err);
                }
                mark_done(recipe, None);
                None
            }
            TaskState::Crashed => Some(finish_fatal(
                self,
                recipe,
                DrydockError::TaskCrashed {
                    exit_code: status.exit_code,
                },
            )),
            TaskState::Canceled => {
                let err = Arc::new(DrydockError::Canceled {
                    reason: "global cancellation".to_string(),
                });
                Some(finish_with_error_if_unset(recipe, err))
            }
            TaskState::Starting | TaskState::Running => Some(finish_fatal(
                self,
                recipe,
                DrydockError::ProtocolViolation(
                    "Wait() returned a non-terminal status".to_string(),
                ),
            )),
        }
    }
}

fn already_done(recipe: &Recipe) -> Option<Option<Arc<DrydockError>>> {
    let state = recipe.state.lock();
    if state.done {
        Some(state.error.clone())
    } else {
        None
    }
}

fn mark_done(recipe: &Recipe, error: Option<Arc<DrydockError>>) {
    let mut state = recipe.state.lock();
    state.error = error;
    state.done = true;
}

/// Set `R.error` to `error` only if not already set (spec §4.E step 4,
/// "set R.error to canceled if not already set").
fn finish_with_error_if_unset(recipe: &Recipe, error: Arc<DrydockError>) -> Arc<DrydockError> {
    let mut state = recipe.state.lock();
    if state.error.is_none() {
        state.error = Some(error);
    }
    state.done = true;
    state.error.clone().unwrap()
}

/// Record a fatal node error and, if it's one that should fail the whole
/// graph fast, trigger global cancellation with signal 9 (spec §4.E step 9,
/// §7 `is_fatal_to_graph`).
fn finish_fatal(executor: &Executor, recipe: &Recipe, error: DrydockError) -> Arc<DrydockError> {
    let fatal_to_graph = error.is_fatal_to_graph();
    let error = Arc::new(error);
    mark_done(recipe, Some(Arc::clone(&error)));
    if fatal_to_graph {
        executor.cancellation.trigger(9, 0);
    }
    error
}

/// Evaluate a command's run-conditions; the net result is their
/// conjunction. A condition that errors is logged and treated as true
/// (permissive) — a deliberate, surprising choice preserved from the
/// source (spec §7, §9).
fn evaluate_conditions(recipe: &Recipe, config: &crate::config::Command) -> bool {
    for condition in &config.conditions {
        match condition.evaluate(&recipe.variables) {
            Ok(true) => continue,
            Ok(false) => return false,
            Err(err) => {
                log::warn!(
                    "{}: run-condition `{}` failed to evaluate, assuming true: {err}",
                    recipe.hash_key(),
                    condition.source()
                );
                continue;
            }
        }
    }
    true
}
