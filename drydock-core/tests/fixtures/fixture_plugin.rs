//! Test-only plugin double for `tests/executor.rs`. Not a reference
//! implementation — `plugins/fake-runner` and `plugins/fake-cache` are
//! that; this one just gives the executor's integration tests a real
//! subprocess to talk to without depending on those crates.
//!
//! Behavior is driven entirely by the request, so a single binary can
//! stand in for both a `TaskRunner` and a `CacheProvider`:
//! - `run_command == "fail"` crashes with exit code 1.
//! - anything else finishes immediately, logging one line.
//! - cache entries are stored as `{dir}/{key}.log`, one line per line.

use anyhow::Result;
use drydock_plugin_sdk::protocol::{Capability, CacheLine, LogLevel, RunRequest, TaskState};
use drydock_plugin_sdk::{serve, PluginHandler, ReplaySink, TaskUpdates};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::Receiver;

struct FixturePlugin;

impl PluginHandler for FixturePlugin {
    fn name(&self) -> &'static str {
        "drydock-test-fixture"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::TaskRunner, Capability::CacheProvider]
    }

    fn run_task(&self, req: RunRequest, updates: TaskUpdates) {
        updates.status(TaskState::Running, 0, 0.0);
        if req.run_command == "fail" {
            updates.log(&req.step_identifier, LogLevel::Error, "fixture: failing on request");
            updates.status(TaskState::Crashed, 1, 0.0);
            return;
        }
        updates.log(&req.step_identifier, LogLevel::Info, "fixture: ok");
        updates.status(TaskState::Finished, 0, 0.0);
    }

    fn create_cache_key(&self, dir: &str, dep_keys: &[String], extras: &[String]) -> Result<String> {
        Ok(format!("{dir}:{dep_keys:?}:{extras:?}"))
    }

    fn cache(&self, key: &str, dir: &str, lines: Receiver<CacheLine>) -> Result<()> {
        fs::create_dir_all(dir)?;
        let contents: String = lines
            .into_iter()
            .filter_map(|item| item.log_line)
            .map(|line| line + "\n")
            .collect();
        fs::write(Path::new(dir).join(sanitize(key)), contents)?;
        Ok(())
    }

    fn replay_cache(&self, key: &str, dir: &str, sink: ReplaySink<'_>) -> Result<bool> {
        let path = Path::new(dir).join(sanitize(key));
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        for line in BufReader::new(file).lines() {
            sink.push(CacheLine {
                log_line: Some(line?),
                artifact: None,
            });
        }
        Ok(true)
    }
}

fn sanitize(key: &str) -> String {
    key.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

fn main() -> Result<()> {
    serve(FixturePlugin)
}
