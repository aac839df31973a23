//! Demultiplexes a plugin's stderr JSON log stream to the parent logger and
//! to per-call capturers that filter by `identifier` (spec §4.A, §9).

use drydock_plugin_sdk::protocol::{LogLevel, LogRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Something that wants a copy of every log record matching its filter.
pub trait Capturer: Send + Sync {
    /// The `identifier` this capturer restricts itself to, or `None` to see
    /// every record regardless of identifier.
    fn identifier_filter(&self) -> Option<&str>;
    fn capture(&self, record: &LogRecord);
}

/// Thread-safe set of capturers, keyed by `Uuid` so they can be registered
/// and removed mid-call.
#[derive(Clone, Default)]
pub struct CapturerRegistry {
    capturers: Arc<Mutex<HashMap<Uuid, Arc<dyn Capturer>>>>,
}

impl CapturerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capturer: Arc<dyn Capturer>) -> Uuid {
        let id = Uuid::new_v4();
        self.capturers.lock().insert(id, capturer);
        id
    }

    pub fn remove(&self, id: Uuid) {
        self.capturers.lock().remove(&id);
    }

    /// Parse one stderr line and fan it out. Malformed lines are logged
    /// verbatim at error level and do not abort the stream.
    pub fn dispatch(&self, plugin_name: &str, line: &str) {
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                emit_on_parent_logger(plugin_name, &record);
                for capturer in self.capturers.lock().values() {
                    match (capturer.identifier_filter(), record.identifier.as_deref()) {
                        (None, _) => capturer.capture(&record),
                        (Some(want), Some(got)) if want == got => capturer.capture(&record),
                        _ => {}
                    }
                }
            }
            Err(err) => {
                log::error!("plugin `{plugin_name}` emitted an unparseable log line ({err}): {line}");
            }
        }
    }
}

fn emit_on_parent_logger(plugin_name: &str, record: &LogRecord) {
    let prefix = record.identifier.as_deref().unwrap_or(plugin_name);
    match record.level {
        LogLevel::Trace => log::trace!("[{prefix}] {}", record.message),
        LogLevel::Debug => log::debug!("[{prefix}] {}", record.message),
        LogLevel::Info => log::info!("[{prefix}] {}", record.message),
        LogLevel::Warn => log::warn!("[{prefix}] {}", record.message),
        LogLevel::Error => log::error!("[{prefix}] {}", record.message),
    }
}

/// A capturer that buffers records in memory, in arrival order, for a
/// single `step_identifier`. Used by the executor to collect a recipe's
/// task output before streaming it into the cache (spec §4.E step 8, 10).
#[derive(Default)]
pub struct BufferingCapturer {
    identifier: String,
    buffer: Mutex<Vec<LogRecord>>,
}

impl BufferingCapturer {
    pub fn new(identifier: impl Into<String>) -> Self {
        BufferingCapturer {
            identifier: identifier.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut self.buffer.lock())
    }
}

impl Capturer for BufferingCapturer {
    fn identifier_filter(&self) -> Option<&str> {
        Some(&self.identifier)
    }

    fn capture(&self, record: &LogRecord) {
        self.buffer.lock().push(record.clone());
    }
}
