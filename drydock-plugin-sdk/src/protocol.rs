//! Wire protocol spoken between the plugin host and a plugin process.
//!
//! Messages are newline-delimited JSON over the plugin's stdin/stdout.
//! Every message carries a `call_id` that scopes it to one logical call
//! (`Install`, `Run`, `GetCacheKey`, `Cache`, `ReplayCache`); a call may
//! involve several messages in either direction before it terminates, so
//! `call_id` is the multiplexing key rather than a simple request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capabilities a plugin can declare at `Install` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Resolves and clones external dependencies (out of core scope; reserved).
    DependencyProvider,
    /// Executes a recipe's command and streams back its status.
    TaskRunner,
    /// Computes fingerprints and stores/replays cached log lines.
    CacheProvider,
}

/// Severity levels carried on the structured log stream (stderr) and in
/// `PluginEvent::Log`. Matches the level set named in spec §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log line emitted by a plugin on stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Opaque tag set by the host on a per-call basis (a recipe's `hash_key`);
    /// used by the host to fan this line out to the right capturer.
    #[serde(default)]
    pub identifier: Option<String>,
    pub plugin_name: String,
    #[serde(default)]
    pub schema_version: Option<u32>,
}

/// Observed status of a task, pushed by the child on every meaningful
/// transition (and opportunistically while `Running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Running,
    Finished,
    Crashed,
    Canceled,
}

impl TaskState {
    /// Whether this state is terminal (no further `Status` messages follow).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Crashed | TaskState::Canceled
        )
    }
}

/// Parameters for starting a recipe's command on a task-runner plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub path: String,
    pub package_name: String,
    pub command_name: String,
    #[serde(default)]
    pub settings: Value,
    pub step_identifier: String,
}

/// One line (and/or artifact pointer) exchanged during `Cache`/`ReplayCache`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheLine {
    #[serde(default)]
    pub log_line: Option<String>,
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Host -> plugin message, tagged by the call it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMessage {
    pub call_id: u64,
    pub payload: HostPayload,
}

/// Host -> plugin payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostPayload {
    /// Opens an `Install` call; exactly one per plugin lifetime.
    Install,
    /// Opens a `Run` call with the initial (and only) `Start`.
    Run(RunRequest),
    /// Sent on an open `Run` call; discarded by the child if sent before `Start`.
    Cancel { signal: i64, timeout_ms: i64 },
    /// Opens a `GetCacheKey` call.
    GetCacheKey {
        dir: String,
        dep_keys: Vec<String>,
        extras: Vec<String>,
    },
    /// Opens a `Cache` call; `Store` messages stream client-to-server on the
    /// same `call_id`.
    Cache { key: String, dir: String },
    /// One line of a `Cache` call's client stream.
    CacheItem(CacheLine),
    /// Closes a `Cache` call's client stream.
    CacheDone,
    /// Opens a `ReplayCache` call.
    ReplayCache { key: String, dir: String },
    /// Terminates the plugin process gracefully.
    Shutdown,
}

/// Plugin -> host message, tagged by the call it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMessage {
    pub call_id: u64,
    pub payload: PluginPayload,
}

/// Plugin -> host payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginPayload {
    /// Response to `Install`.
    Installed {
        name: String,
        capabilities: Vec<Capability>,
    },
    /// Pushed on a `Run` call for every meaningful transition.
    Status {
        state: TaskState,
        exit_code: i32,
        elapsed_seconds: f64,
    },
    /// Response to `GetCacheKey`.
    CacheKey { key: String },
    /// Final response to a `Cache` call, once the client stream closes.
    CacheAck,
    /// Pushed on a `ReplayCache` call; `hit = false` on the first (and only)
    /// message means the key was not found.
    Replay { hit: bool, item: CacheLine },
    /// Closes a `ReplayCache` call's server stream.
    ReplayDone,
    /// Terminal error for the call identified by `call_id`.
    CallError { message: String, not_supported: bool },
    /// Acknowledges `Shutdown`.
    ShutdownAck,
}

/// Environment variable carrying the negotiated magic cookie key name.
pub const MAGIC_COOKIE_KEY_ENV: &str = "DRYDOCK_PLUGIN_MAGIC_COOKIE_KEY";
/// Environment variable carrying the magic cookie value the child must echo.
pub const MAGIC_COOKIE_VALUE_ENV: &str = "DRYDOCK_PLUGIN_MAGIC_COOKIE_VALUE";
/// Environment variable carrying the protocol version the child must echo.
pub const PROTOCOL_VERSION_ENV: &str = "DRYDOCK_PLUGIN_PROTOCOL_VERSION";

/// Magic cookie value plugins must echo back during the handshake.
pub const MAGIC_COOKIE_VALUE: &str = "drydock-plugin-v1";
/// Protocol version plugins must echo back during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The single line a plugin writes to stdout before any protocol traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_cookie_value: String,
    pub protocol_version: u32,
}

impl Handshake {
    /// The handshake this SDK's plugins always produce.
    pub fn current() -> Self {
        Self {
            magic_cookie_value: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Whether this handshake matches what the host expects.
    pub fn is_valid(&self) -> bool {
        self.magic_cookie_value == MAGIC_COOKIE_VALUE && self.protocol_version == PROTOCOL_VERSION
    }
}
