#![deny(rust_2018_idioms)]

//! Recipe graph construction, concurrent execution, content-addressed
//! caching, and the plugin host contract for drydock — a monorepo
//! build-and-task orchestrator.

pub mod cache;
pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod host;

pub use cache::{Cacher, Fingerprint, ReplayResult};
pub use condition::{Condition, VariableLookup};
pub use config::WorkspaceConfig;
pub use error::{DrydockError, Result};
pub use executor::{GlobalCancellation, Executor};
pub use graph::{build_root, Recipe};
