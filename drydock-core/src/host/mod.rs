//! The plugin host: spawns plugin binaries as subprocesses, performs the
//! handshake, and multiplexes the streaming call protocol over their
//! stdio. Killing a host kills its child.

mod handshake;
pub mod log_demux;
pub mod registry;

use crate::error::DrydockError;
use anyhow::{anyhow, Context, Result};
use drydock_plugin_sdk::protocol::{
    CacheLine, Capability, HostMessage, HostPayload, PluginMessage, PluginPayload, RunRequest,
    TaskState,
};
use log_demux::CapturerRegistry;
use registry::GlobalRegistry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// The most recently observed state of a `Run` call, as returned by
/// `RunHandle::status`.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub state: TaskState,
    pub exit_code: i32,
    pub elapsed_seconds: f64,
}

impl Default for StatusUpdate {
    fn default() -> Self {
        StatusUpdate {
            state: TaskState::Starting,
            exit_code: 0,
            elapsed_seconds: 0.0,
        }
    }
}

enum PendingCall {
    Oneshot(oneshot::Sender<PluginPayload>),
    RunStatus(watch::Sender<StatusUpdate>),
    ReplayStream(mpsc::UnboundedSender<PluginPayload>),
}

struct ProcessInner {
    name: String,
    writer: Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_call_id: AtomicU64,
    child: Mutex<Option<Child>>,
    capturers: CapturerRegistry,
}

/// A live handle to a spawned plugin's `Run` call. Mirrors the "`Status()`
/// returns the most recently observed status; `Wait()` blocks for a
/// terminal one" design noted in spec §9.
pub struct RunHandle {
    call_id: u64,
    process: Arc<ProcessInner>,
    status: watch::Receiver<StatusUpdate>,
}

impl RunHandle {
    pub fn status(&self) -> StatusUpdate {
        *self.status.borrow()
    }

    /// Block until a terminal status has been observed.
    pub async fn wait(&mut self) -> StatusUpdate {
        loop {
            let current = *self.status.borrow();
            if current.state.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                // Plugin disconnected without a terminal status; treat as crashed.
                return StatusUpdate {
                    state: TaskState::Crashed,
                    exit_code: -1,
                    elapsed_seconds: current.elapsed_seconds,
                };
            }
        }
    }

    /// Send `Cancel` on this call's `call_id`.
    pub async fn cancel(&self, signal: i64, timeout_ms: i64) -> Result<()> {
        self.process
            .send(&HostMessage {
                call_id: self.call_id,
                payload: HostPayload::Cancel { signal, timeout_ms },
            })
            .await
    }
}

/// A stream of replayed cache lines, or a miss.
pub enum ReplayOutcome {
    Miss,
    Hit(mpsc::UnboundedReceiver<CacheLine>),
}

/// A spawned plugin process, speaking the drydock plugin protocol over its
/// stdin/stdout.
#[derive(Clone)]
pub struct PluginProcess {
    inner: Arc<ProcessInner>,
}

impl PluginProcess {
    /// Spawn `executable`, perform the handshake, and start the background
    /// dispatch loop. Does not call `Install` — do that explicitly.
    pub async fn spawn(name: &str, executable: &Path, args: &[String]) -> Result<PluginProcess> {
        let mut command = Command::new(executable);
        command.args(args);
        command.kill_on_drop(true);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.env(
            drydock_plugin_sdk::protocol::MAGIC_COOKIE_KEY_ENV,
            "DRYDOCK_PLUGIN_MAGIC_COOKIE_VALUE",
        );
        command.env(
            drydock_plugin_sdk::protocol::MAGIC_COOKIE_VALUE_ENV,
            drydock_plugin_sdk::protocol::MAGIC_COOKIE_VALUE,
        );
        command.env(
            drydock_plugin_sdk::protocol::PROTOCOL_VERSION_ENV,
            drydock_plugin_sdk::protocol::PROTOCOL_VERSION.to_string(),
        );

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn plugin `{name}` ({})", executable.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("plugin `{name}` stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("plugin `{name}` stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("plugin `{name}` stderr unavailable"))?;

        let mut stdout = BufReader::new(stdout);
        handshake::read_handshake(&mut stdout, name).await?;

        let inner = Arc::new(ProcessInner {
            name: name.to_string(),
            writer: Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            child: Mutex::new(Some(child)),
            capturers: CapturerRegistry::new(),
        });

        spawn_stdout_dispatch(Arc::clone(&inner), stdout);
        spawn_stderr_dispatch(Arc::clone(&inner), stderr);

        Ok(PluginProcess { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capturers(&self) -> &CapturerRegistry {
        &self.inner.capturers
    }

    /// Perform the `Install` call: the plugin's declared name plus capabilities.
    pub async fn install(&self) -> Result<(String, Vec<Capability>)> {
        let call_id = self.inner.next_id();
        let rx = self.inner.register_oneshot(call_id).await;
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::Install,
            })
            .await?;
        match rx.await.context("plugin disconnected during Install")? {
            PluginPayload::Installed { name, capabilities } => Ok((name, capabilities)),
            PluginPayload::CallError { message, .. } => Err(anyhow!("install failed: {message}")),
            other => Err(anyhow!("unexpected response to Install: {other:?}")),
        }
    }

    /// Open a `Run` call. The returned handle is polled/awaited by the
    /// caller; `Status` pushes update it concurrently via the dispatch loop.
    pub async fn run(&self, req: RunRequest) -> Result<RunHandle> {
        let call_id = self.inner.next_id();
        let (tx, rx) = watch::channel(StatusUpdate::default());
        self.inner
            .pending
            .lock()
            .await
            .insert(call_id, PendingCall::RunStatus(tx));
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::Run(req),
            })
            .await?;
        Ok(RunHandle {
            call_id,
            process: Arc::clone(&self.inner),
            status: rx,
        })
    }

    /// `GetCacheKey`: compute a fingerprint from a directory and dependency
    /// fingerprints, delegating the actual digest algorithm to the plugin.
    pub async fn get_cache_key(
        &self,
        dir: &str,
        dep_keys: &[String],
        extras: &[String],
    ) -> Result<String> {
        let call_id = self.inner.next_id();
        let rx = self.inner.register_oneshot(call_id).await;
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::GetCacheKey {
                    dir: dir.to_string(),
                    dep_keys: dep_keys.to_vec(),
                    extras: extras.to_vec(),
                },
            })
            .await?;
        match rx.await.context("plugin disconnected during GetCacheKey")? {
            PluginPayload::CacheKey { key } => Ok(key),
            PluginPayload::CallError { message, .. } => Err(anyhow!("get_cache_key failed: {message}")),
            other => Err(anyhow!("unexpected response to GetCacheKey: {other:?}")),
        }
    }

    /// `Cache`: stream `lines` to the plugin under `key`, then await the ack.
    pub async fn cache(&self, key: &str, dir: &str, lines: Vec<CacheLine>) -> Result<()> {
        let call_id = self.inner.next_id();
        let rx = self.inner.register_oneshot(call_id).await;
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::Cache {
                    key: key.to_string(),
                    dir: dir.to_string(),
                },
            })
            .await?;
        for line in lines {
            self.inner
                .send(&HostMessage {
                    call_id,
                    payload: HostPayload::CacheItem(line),
                })
                .await?;
        }
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::CacheDone,
            })
            .await?;
        match rx.await.context("plugin disconnected during Cache")? {
            PluginPayload::CacheAck => Ok(()),
            PluginPayload::CallError { message, .. } => Err(anyhow!("cache store failed: {message}")),
            other => Err(anyhow!("unexpected response to Cache: {other:?}")),
        }
    }

    /// `ReplayCache`: stream back a previously cached entry, if present.
    pub async fn replay_cache(&self, key: &str, dir: &str) -> Result<ReplayOutcome> {
        let call_id = self.inner.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(call_id, PendingCall::ReplayStream(tx));
        self.inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::ReplayCache {
                    key: key.to_string(),
                    dir: dir.to_string(),
                },
            })
            .await?;

        match rx.recv().await {
            None => Ok(ReplayOutcome::Miss),
            Some(PluginPayload::Replay { hit: false, .. }) => Ok(ReplayOutcome::Miss),
            Some(PluginPayload::CallError { message, .. }) => {
                Err(anyhow!("replay_cache failed: {message}"))
            }
            Some(PluginPayload::Replay { hit: true, item }) => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let _ = out_tx.send(item);
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        match message {
                            PluginPayload::Replay { item, .. } => {
                                if out_tx.send(item).is_err() {
                                    break;
                                }
                            }
                            PluginPayload::ReplayDone | PluginPayload::CallError { .. } => break,
                            _ => break,
                        }
                    }
                });
                Ok(ReplayOutcome::Hit(out_rx))
            }
            Some(other) => Err(anyhow!("unexpected response to ReplayCache: {other:?}")),
        }
    }

    /// Send `Shutdown` and reap the child, with a bounded wait. Idempotent.
    pub async fn kill(&self) -> Result<()> {
        let call_id = self.inner.next_id();
        let _ = self
            .inner
            .send(&HostMessage {
                call_id,
                payload: HostPayload::Shutdown,
            })
            .await;
        let mut child = self.inner.child.lock().await;
        if let Some(mut child) = child.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
            let _ = child.start_kill();
        }
        Ok(())
    }
}

impl ProcessInner {
    fn next_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_oneshot(&self, call_id: u64) -> oneshot::Receiver<PluginPayload> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id, PendingCall::Oneshot(tx));
        rx
    }

    async fn send(&self, message: &HostMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut bytes = serde_json::to_vec(message).context("failed to serialize host message")?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await.context("failed to write host message")?;
        writer.flush().await.context("failed to flush host message")?;
        Ok(())
    }
}

fn spawn_stdout_dispatch<R>(inner: Arc<ProcessInner>, stdout: R)
where
    R: AsyncBufReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = stdout.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PluginMessage>(&line) {
                        Ok(message) => dispatch_message(&inner, message).await,
                        Err(err) => {
                            log::error!("plugin `{}` sent an unparseable message ({err}): {line}", inner.name);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("plugin `{}` stdout error: {err}", inner.name);
                    break;
                }
            }
        }
        drain_pending(&inner).await;
    });
}

fn spawn_stderr_dispatch<R>(inner: Arc<ProcessInner>, stderr: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            inner.capturers.dispatch(&inner.name, &line);
        }
    });
}

async fn dispatch_message(inner: &Arc<ProcessInner>, message: PluginMessage) {
    let call_id = message.call_id;
    let payload = message.payload;
    match payload {
        PluginPayload::Status { state, exit_code, elapsed_seconds } => {
            let terminal = state.is_terminal();
            let mut pending = inner.pending.lock().await;
            if let Some(PendingCall::RunStatus(tx)) = pending.get(&call_id) {
                let _ = tx.send(StatusUpdate { state, exit_code, elapsed_seconds });
            }
            if terminal {
                pending.remove(&call_id);
            }
        }
        PluginPayload::Replay { hit, item } => {
            let pending = inner.pending.lock().await;
            if let Some(PendingCall::ReplayStream(tx)) = pending.get(&call_id) {
                let _ = tx.send(PluginPayload::Replay { hit, item });
            }
        }
        PluginPayload::ReplayDone => {
            let mut pending = inner.pending.lock().await;
            if let Some(PendingCall::ReplayStream(tx)) = pending.get(&call_id) {
                let _ = tx.send(PluginPayload::ReplayDone);
            }
            pending.remove(&call_id);
        }
        PluginPayload::CallError { message: err_message, not_supported } => {
            let mut pending = inner.pending.lock().await;
            match pending.remove(&call_id) {
                Some(PendingCall::Oneshot(tx)) => {
                    let _ = tx.send(PluginPayload::CallError { message: err_message, not_supported });
                }
                Some(PendingCall::ReplayStream(tx)) => {
                    let _ = tx.send(PluginPayload::CallError { message: err_message, not_supported });
                }
                Some(PendingCall::RunStatus(tx)) => {
                    let _ = tx.send(StatusUpdate {
                        state: TaskState::Crashed,
                        exit_code: -1,
                        elapsed_seconds: 0.0,
                    });
                }
                None => {}
            }
        }
        other => {
            let mut pending = inner.pending.lock().await;
            if let Some(PendingCall::Oneshot(tx)) = pending.remove(&call_id) {
                let _ = tx.send(other);
            }
        }
    }
}

async fn drain_pending(inner: &Arc<ProcessInner>) {
    let mut pending = inner.pending.lock().await;
    for (_, call) in pending.drain() {
        match call {
            PendingCall::Oneshot(tx) => {
                let _ = tx.send(PluginPayload::CallError {
                    message: format!("plugin `{}` disconnected", inner.name),
                    not_supported: false,
                });
            }
            PendingCall::RunStatus(tx) => {
                let _ = tx.send(StatusUpdate {
                    state: TaskState::Crashed,
                    exit_code: -1,
                    elapsed_seconds: 0.0,
                });
            }
            PendingCall::ReplayStream(_) => {}
        }
    }
}

/// Runtime, capability-indexed view over the plugins installed for one
/// invocation. Built by spawning and `Install`-ing every plugin named in
/// the [`GlobalRegistry`].
pub struct PluginRegistry {
    processes: HashMap<String, Arc<PluginProcess>>,
    capabilities: HashMap<String, Vec<Capability>>,
}

impl PluginRegistry {
    /// Spawn and install every plugin recorded in `registry`.
    pub async fn bootstrap(registry: &GlobalRegistry) -> Result<PluginRegistry> {
        let mut processes = HashMap::new();
        let mut capabilities = HashMap::new();
        for plugin in registry.plugins.values() {
            if !plugin.is_active {
                continue;
            }
            let process = PluginProcess::spawn(&plugin.name, &plugin.executable, &[]).await?;
            let (_, caps) = process.install().await?;
            capabilities.insert(plugin.name.clone(), caps);
            processes.insert(plugin.name.clone(), Arc::new(process));
        }
        Ok(PluginRegistry { processes, capabilities })
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginProcess>> {
        self.processes.get(name).cloned()
    }

    /// Resolve a runner plugin by `runner_type`, verifying it advertises
    /// `task_runner` (spec §4.E step 7, §7 `RunnerLookupError`/`NotSupported`).
    pub fn get_runner(&self, runner_type: &str) -> Result<Arc<PluginProcess>, DrydockError> {
        self.require_capability(runner_type, Capability::TaskRunner)
    }

    /// Resolve a cache provider plugin by name, verifying it advertises
    /// `cache_provider`.
    pub fn get_cache_provider(&self, name: &str) -> Result<Arc<PluginProcess>, DrydockError> {
        self.require_capability(name, Capability::CacheProvider)
    }

    fn require_capability(&self, name: &str, capability: Capability) -> Result<Arc<PluginProcess>, DrydockError> {
        let process = self.processes.get(name).ok_or_else(|| DrydockError::RunnerLookupError {
            runner_type: name.to_string(),
        })?;
        let caps = self.capabilities.get(name).cloned().unwrap_or_default();
        if !caps.contains(&capability) {
            return Err(DrydockError::NotSupported {
                plugin: name.to_string(),
                capability: format!("{capability:?}"),
            });
        }
        Ok(Arc::clone(process))
    }

    /// Kill every live plugin process. Idempotent.
    pub async fn shutdown_all(&self) {
        for process in self.processes.values() {
            let _ = process.kill().await;
        }
    }
}
