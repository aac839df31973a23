//! End-to-end executor scenarios that need more than one module wired
//! together: a real plugin subprocess (`tests/fixtures/fixture_plugin.rs`),
//! a workspace config, and the executor driving them through the real
//! protocol.

use drydock_core::error::DrydockError;
use drydock_core::executor::Executor;
use drydock_core::host::registry::GlobalRegistry;
use drydock_core::host::PluginRegistry;
use drydock_core::config::{CacheSettings, Command, WorkspaceConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const FIXTURE_NAME: &str = "drydock-test-fixture";

async fn registry_with_fixture() -> Arc<PluginRegistry> {
    let tmp = tempfile::tempdir().unwrap();
    let mut registry = GlobalRegistry::load(tmp.path()).unwrap();
    registry.register(FIXTURE_NAME, PathBuf::from(env!("CARGO_BIN_EXE_drydock-test-fixture")));
    Arc::new(PluginRegistry::bootstrap(&registry).await.unwrap())
}

async fn empty_registry() -> Arc<PluginRegistry> {
    let tmp = tempfile::tempdir().unwrap();
    let registry = GlobalRegistry::load(tmp.path()).unwrap();
    Arc::new(PluginRegistry::bootstrap(&registry).await.unwrap())
}

/// A root workspace with one sub-package, `svc`, whose `build` command
/// runs `run_command` through the fixture plugin for both the task runner
/// and cache provider roles.
fn workspace_with_command(run_command: &str) -> (WorkspaceConfig, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let root_dir = tmp.path().join("root");
    let mut root = WorkspaceConfig::scaffold("root", &root_dir).unwrap();

    let svc_dir = root_dir.join("svc");
    let mut svc = WorkspaceConfig::scaffold("svc", &svc_dir).unwrap();
    svc.cache_settings = Some(CacheSettings {
        provider: FIXTURE_NAME.to_string(),
        settings: HashMap::new(),
    });
    svc.commands.insert(
        "build".to_string(),
        Command {
            runner_type: FIXTURE_NAME.to_string(),
            command: run_command.to_string(),
            conditions: Vec::new(),
            depends_on: Vec::new(),
            settings: serde_json::Value::Null,
        },
    );

    root.add_sub_package("svc", svc);
    (root, tmp)
}

#[tokio::test]
async fn crash_fails_fast() {
    let plugins = registry_with_fixture().await;
    let (workspace, _tmp) = workspace_with_command("fail");

    let executor = Executor::new(Arc::clone(&plugins));
    let result = executor.run_command(&workspace, "build", &[]).await;
    plugins.shutdown_all().await;

    let err = result.expect_err("a crashing task must fail the run");
    // The root is a synthetic aggregating node over `svc`, so the crash
    // surfaces wrapped in a DependencyFailure naming `svc:build` as the cause.
    match &*err {
        DrydockError::DependencyFailure { first, .. } => {
            assert!(matches!(&**first, DrydockError::TaskCrashed { exit_code: 1 }));
        }
        other => panic!("expected a dependency failure wrapping a crash, got {other:?}"),
    }
}

#[tokio::test]
async fn run_condition_skip_needs_no_plugin() {
    // No fixture registered at all: if the skip didn't short-circuit
    // before the runner lookup, this would fail with RunnerLookupError
    // instead of succeeding.
    let plugins = empty_registry().await;
    let (mut workspace, _tmp) = workspace_with_command("unused");

    std::env::set_var("DRYDOCK_EXECUTOR_TEST_SKIP_COND", "false");
    let mut svc = workspace.all_sub_packages().get("svc").unwrap().clone();
    let cmd = svc.commands.get_mut("build").unwrap();
    cmd.conditions = vec![drydock_core::condition::Condition::parse(
        "${{env.DRYDOCK_EXECUTOR_TEST_SKIP_COND}} == true",
    )];
    workspace.add_sub_package("svc", svc);

    let executor = Executor::new(Arc::clone(&plugins));
    let result = executor.run_command(&workspace, "build", &[]).await;
    plugins.shutdown_all().await;

    assert!(result.is_ok(), "a false run-condition must skip, not fail: {result:?}");
}

#[tokio::test]
async fn cache_round_trip_replays_on_second_run() {
    let plugins = registry_with_fixture().await;
    let (workspace, _tmp) = workspace_with_command("ok");

    let first = Executor::new(Arc::clone(&plugins));
    let first_result = first.run_command(&workspace, "build", &[]).await;
    assert!(first_result.is_ok(), "first run should succeed and populate the cache");

    let second = Executor::new(Arc::clone(&plugins));
    let second_result = second.run_command(&workspace, "build", &[]).await;
    plugins.shutdown_all().await;

    assert!(second_result.is_ok(), "second run should replay from cache: {second_result:?}");
}
