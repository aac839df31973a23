//! Bridges `Arc<DrydockError>` (not itself a `std::error::Error`, since
//! `Arc<T>` doesn't blanket-impl it) into `anyhow::Error` so the top-level
//! handler in `main` can print the full cause chain with `{:#}`.

use drydock_core::DrydockError;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct SharedError(Arc<DrydockError>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(self.0.as_ref())
    }
}

pub fn into_anyhow(err: Arc<DrydockError>) -> anyhow::Error {
    anyhow::Error::new(SharedError(err))
}
