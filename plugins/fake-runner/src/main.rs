//! Reference task-runner plugin. Runs a recipe's `command` through
//! `/bin/sh -c` in `path`, streaming stdout/stderr to the host's logger and
//! pushing `Status` transitions, with cooperative cancellation (grounded in
//! the shell-runner's chdir-then-exec shape, extended for the streaming
//! status/cancel contract this runtime adds on top of it).

use anyhow::Result;
use drydock_plugin_sdk::protocol::{Capability, LogLevel, RunRequest, TaskState};
use drydock_plugin_sdk::{serve, PluginHandler, TaskUpdates};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

struct ShellRunner;

impl PluginHandler for ShellRunner {
    fn name(&self) -> &'static str {
        "fake-runner"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::TaskRunner]
    }

    fn run_task(&self, req: RunRequest, updates: TaskUpdates) {
        let start = Instant::now();
        let mut child = match Command::new("/bin/sh")
            .arg("-c")
            .arg(&req.run_command)
            .current_dir(&req.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                updates.log(
                    &req.step_identifier,
                    LogLevel::Error,
                    format!("failed to spawn `{}`: {err}", req.run_command),
                );
                updates.status(TaskState::Crashed, -1, start.elapsed().as_secs_f64());
                return;
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let (tx, rx) = mpsc::channel::<(LogLevel, String)>();

        let out_tx = tx.clone();
        let out_handle = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                let _ = out_tx.send((LogLevel::Info, line));
            }
        });
        let err_handle = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                let _ = tx.send((LogLevel::Error, line));
            }
        });

        updates.status(TaskState::Running, 0, start.elapsed().as_secs_f64());

        let mut canceled = false;
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok((level, line)) => {
                    updates.log(&req.step_identifier, level, line);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Ok(Some(_)) = child.try_wait() {
                break;
            }
            // The runtime only hands us a kill signal, not an arbitrary
            // POSIX one; `timeout_ms` is accepted but not honored here.
            if updates.cancel_requested().is_some() {
                let _ = child.kill();
                canceled = true;
                break;
            }
        }
        while let Ok((level, line)) = rx.try_recv() {
            updates.log(&req.step_identifier, level, line);
        }
        let _ = out_handle.join();
        let _ = err_handle.join();

        let elapsed = start.elapsed().as_secs_f64();
        match child.wait() {
            Ok(status) if canceled => {
                updates.status(TaskState::Canceled, status.code().unwrap_or(-1), elapsed);
            }
            Ok(status) if status.success() => {
                updates.status(TaskState::Finished, status.code().unwrap_or(0), elapsed);
            }
            Ok(status) => {
                updates.status(TaskState::Crashed, status.code().unwrap_or(-1), elapsed);
            }
            Err(err) => {
                updates.log(&req.step_identifier, LogLevel::Error, format!("wait failed: {err}"));
                updates.status(TaskState::Crashed, -1, elapsed);
            }
        }
    }
}

fn main() -> Result<()> {
    serve(ShellRunner)
}
