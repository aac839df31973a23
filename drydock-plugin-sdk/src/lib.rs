#![deny(rust_2018_idioms)]

//! Protocol definitions and plugin-authoring runtime shared between the
//! `drydock` plugin host and plugin implementations.

pub mod protocol;
pub mod runtime;

pub use protocol::{Capability, LogLevel, RunRequest, TaskState};
pub use runtime::{serve, CancelSignal, HostConnection, PluginHandler, ReplaySink, TaskUpdates};
