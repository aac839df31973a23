//! Minimal runtime for authoring `drydock` plugin binaries.
//!
//! A plugin implements [`PluginHandler`] and hands itself to [`serve`],
//! which owns stdin/stdout framing, handshake emission, and dispatch of
//! concurrent calls (a `Run` call's `Status` pushes happen on a background
//! thread while the stdin reader keeps accepting new calls, including a
//! `Cancel` for that same call).

use crate::protocol::{
    CacheLine, Handshake, HostMessage, HostPayload, LogLevel, LogRecord, PluginMessage,
    PluginPayload, RunRequest, TaskState,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

/// Cooperative cancellation handle handed to a running task.
#[derive(Clone)]
pub struct CancelSignal {
    requested: Arc<AtomicBool>,
    signal: Arc<AtomicI64>,
    timeout_ms: Arc<AtomicI64>,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(AtomicI64::new(0)),
            timeout_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    fn trigger(&self, signal: i64, timeout_ms: i64) {
        self.signal.store(signal, Ordering::SeqCst);
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `Some((signal, timeout_ms))` once a `Cancel` has arrived.
    pub fn poll(&self) -> Option<(i64, i64)> {
        if self.requested.load(Ordering::SeqCst) {
            Some((
                self.signal.load(Ordering::SeqCst),
                self.timeout_ms.load(Ordering::SeqCst),
            ))
        } else {
            None
        }
    }
}

/// Connection handle shared by every running call to emit messages and logs.
#[derive(Clone)]
pub struct HostConnection {
    writer: Arc<Mutex<io::Stdout>>,
    stderr: Arc<Mutex<io::Stderr>>,
    plugin_name: &'static str,
}

impl HostConnection {
    fn send(&self, message: &PluginMessage) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        serde_json::to_writer(&mut *writer, message).context("failed to serialize message")?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Emit a structured log line on stderr, tagged with `identifier`.
    pub fn log(&self, identifier: &str, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            level,
            message: message.into(),
            module: None,
            timestamp: None,
            identifier: Some(identifier.to_string()),
            plugin_name: self.plugin_name.to_string(),
            schema_version: Some(1),
        };
        if let Ok(mut stderr) = self.stderr.lock() {
            if let Ok(line) = serde_json::to_string(&record) {
                let _ = writeln!(stderr, "{line}");
            }
        }
    }
}

/// Handle passed to [`PluginHandler::run_task`] for pushing status updates
/// and observing cancellation.
pub struct TaskUpdates {
    call_id: u64,
    connection: HostConnection,
    cancel: CancelSignal,
}

impl TaskUpdates {
    /// Push a `Status` message to the host.
    pub fn status(&self, state: TaskState, exit_code: i32, elapsed_seconds: f64) {
        let _ = self.connection.send(&PluginMessage {
            call_id: self.call_id,
            payload: PluginPayload::Status {
                state,
                exit_code,
                elapsed_seconds,
            },
        });
    }

    /// Non-blocking check for a `Cancel` the host may have sent.
    pub fn cancel_requested(&self) -> Option<(i64, i64)> {
        self.cancel.poll()
    }

    /// Emit a log line tagged with this task's `step_identifier`.
    pub fn log(&self, identifier: &str, level: LogLevel, message: impl Into<String>) {
        self.connection.log(identifier, level, message);
    }
}

/// Sink passed to [`PluginHandler::replay_cache`] for streaming replayed lines.
pub struct ReplaySink<'a> {
    call_id: u64,
    connection: &'a HostConnection,
}

impl ReplaySink<'_> {
    /// Stream one replayed line. Call only after signalling a hit via the
    /// return value of `replay_cache`; the runtime sends the terminal
    /// `ReplayDone` automatically once the handler returns.
    pub fn push(&self, item: CacheLine) {
        let _ = self.connection.send(&PluginMessage {
            call_id: self.call_id,
            payload: PluginPayload::Replay { hit: true, item },
        });
    }
}

/// Implemented by a plugin binary to participate in the runtime.
///
/// Default methods return a `NotSupported`-shaped error for capabilities
/// the plugin doesn't advertise; override only the ones that apply.
pub trait PluginHandler: Send + Sync + 'static {
    /// Name reported during `Install`.
    fn name(&self) -> &'static str;

    /// Capabilities reported during `Install`.
    fn capabilities(&self) -> Vec<crate::protocol::Capability>;

    /// Execute `req`. Runs on its own thread; push `Status` updates via
    /// `updates` and poll `updates.cancel_requested()` cooperatively.
    fn run_task(&self, req: RunRequest, updates: TaskUpdates) {
        let _ = req;
        updates.status(TaskState::Crashed, -1, 0.0);
    }

    /// Compute a fingerprint from a directory plus dependency/extra hashes.
    fn create_cache_key(
        &self,
        dir: &str,
        dep_keys: &[String],
        extras: &[String],
    ) -> Result<String> {
        let _ = (dir, dep_keys, extras);
        anyhow::bail!("{} does not implement cache_provider", self.name())
    }

    /// Persist `lines` under `key` in `dir`.
    fn cache(&self, key: &str, dir: &str, lines: mpsc::Receiver<CacheLine>) -> Result<()> {
        let _ = (key, dir, lines);
        anyhow::bail!("{} does not implement cache_provider", self.name())
    }

    /// Replay a previously cached entry, if present. Returns whether it was
    /// a hit; on a hit, push every line through `sink` before returning.
    fn replay_cache(&self, key: &str, dir: &str, sink: ReplaySink<'_>) -> Result<bool> {
        let _ = (key, dir, sink);
        Ok(false)
    }
}

enum OpenCall {
    Run(CancelSignal),
    CacheStream(Sender<CacheLine>),
}

/// Drive the plugin event loop until the host sends `Shutdown` or stdin closes.
pub fn serve<P: PluginHandler>(plugin: P) -> Result<()> {
    let plugin = Arc::new(plugin);
    let connection = HostConnection {
        writer: Arc::new(Mutex::new(io::stdout())),
        stderr: Arc::new(Mutex::new(io::stderr())),
        plugin_name: plugin.name(),
    };

    // Handshake: one line, before any protocol traffic.
    {
        let mut writer = connection.writer.lock().unwrap();
        serde_json::to_writer(&mut *writer, &Handshake::current())
            .context("failed to write handshake")?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    let open_calls: Arc<Mutex<HashMap<u64, OpenCall>>> = Arc::new(Mutex::new(HashMap::new()));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read from host")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: HostMessage =
            serde_json::from_str(&line).context("failed to parse host message")?;
        let call_id = message.call_id;

        match message.payload {
            HostPayload::Install => {
                let _ = connection.send(&PluginMessage {
                    call_id,
                    payload: PluginPayload::Installed {
                        name: plugin.name().to_string(),
                        capabilities: plugin.capabilities(),
                    },
                });
            }
            HostPayload::Run(req) => {
                let cancel = CancelSignal::new();
                open_calls
                    .lock()
                    .unwrap()
                    .insert(call_id, OpenCall::Run(cancel.clone()));
                let plugin = Arc::clone(&plugin);
                let connection = connection.clone();
                thread::spawn(move || {
                    let updates = TaskUpdates {
                        call_id,
                        connection,
                        cancel,
                    };
                    plugin.run_task(req, updates);
                });
            }
            HostPayload::Cancel { signal, timeout_ms } => {
                if let Some(OpenCall::Run(cancel)) = open_calls.lock().unwrap().get(&call_id) {
                    cancel.trigger(signal, timeout_ms);
                }
            }
            HostPayload::GetCacheKey {
                dir,
                dep_keys,
                extras,
            } => {
                let result = plugin.create_cache_key(&dir, &dep_keys, &extras);
                let payload = match result {
                    Ok(key) => PluginPayload::CacheKey { key },
                    Err(err) => PluginPayload::CallError {
                        message: err.to_string(),
                        not_supported: false,
                    },
                };
                let _ = connection.send(&PluginMessage { call_id, payload });
            }
            HostPayload::Cache { key, dir } => {
                let (tx, rx) = mpsc::channel();
                open_calls
                    .lock()
                    .unwrap()
                    .insert(call_id, OpenCall::CacheStream(tx));
                let plugin = Arc::clone(&plugin);
                let connection = connection.clone();
                thread::spawn(move || {
                    let payload = match plugin.cache(&key, &dir, rx) {
                        Ok(()) => PluginPayload::CacheAck,
                        Err(err) => PluginPayload::CallError {
                            message: err.to_string(),
                            not_supported: false,
                        },
                    };
                    let _ = connection.send(&PluginMessage { call_id, payload });
                });
            }
            HostPayload::CacheItem(item) => {
                if let Some(OpenCall::CacheStream(tx)) = open_calls.lock().unwrap().get(&call_id) {
                    let _ = tx.send(item);
                }
            }
            HostPayload::CacheDone => {
                open_calls.lock().unwrap().remove(&call_id);
            }
            HostPayload::ReplayCache { key, dir } => {
                let plugin = Arc::clone(&plugin);
                let connection = connection.clone();
                thread::spawn(move || {
                    let sink = ReplaySink {
                        call_id,
                        connection: &connection,
                    };
                    let result = plugin.replay_cache(&key, &dir, sink);
                    let payload = match result {
                        Ok(hit) if !hit => PluginPayload::Replay {
                            hit: false,
                            item: CacheLine::default(),
                        },
                        Ok(_) => PluginPayload::ReplayDone,
                        Err(err) => PluginPayload::CallError {
                            message: err.to_string(),
                            not_supported: false,
                        },
                    };
                    let _ = connection.send(&PluginMessage { call_id, payload });
                });
            }
            HostPayload::Shutdown => {
                let _ = connection.send(&PluginMessage {
                    call_id,
                    payload: PluginPayload::ShutdownAck,
                });
                break;
            }
        }
    }

    Ok(())
}
