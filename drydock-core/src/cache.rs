//! Content-addressed cache layer. Memoizes and orders fingerprint inputs;
//! the actual digest algorithm and storage format live behind whichever
//! plugin carries the `cache_provider` capability (spec §4.C), mirroring
//! the original's split between `runners.Cacher` (this module) and
//! `localCache.LocalCacher` (`plugins/fake-cache`).

use crate::error::DrydockError;
use crate::graph::Recipe;
use crate::host::PluginProcess;
use drydock_plugin_sdk::protocol::CacheLine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// An opaque fingerprint, as returned by a cache provider plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a replay found an entry, and if so its lines in original order.
pub enum ReplayResult {
    Miss,
    Hit(Vec<String>),
}

/// Computes and memoizes fingerprints for one executor run, delegating the
/// digest algorithm to a cache-provider plugin.
pub struct Cacher {
    provider: Arc<PluginProcess>,
    /// package name -> memoized fingerprint, per spec §4.C "idempotent,
    /// memoized per package-name".
    memo: Mutex<HashMap<String, Fingerprint>>,
}

impl Cacher {
    pub fn new(provider: Arc<PluginProcess>) -> Self {
        Cacher {
            provider,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Compute `recipe`'s fingerprint: the provider's digest of the
    /// package's workspace root, combined with the sorted-descending
    /// fingerprints of every dependency plus any extras.
    ///
    /// Recurses on dependencies before asking the provider to combine them,
    /// since a dependency's own fingerprint must be computed (and memoized)
    /// first; the descending sort makes the result independent of edge
    /// order (spec §4.C step 2). Memoized per `package_name`, so a diamond
    /// dependency shared by several parents is only hashed once.
    pub fn calculate_cache_key<'a>(
        &'a self,
        recipe: &'a Recipe,
        extras: &'a [String],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Fingerprint, DrydockError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(cached) = self.memo.lock().get(&recipe.package_name).cloned() {
                return Ok(cached);
            }

            let mut dep_keys = Vec::with_capacity(recipe.needs.len());
            for dep in &recipe.needs {
                let key = self.calculate_cache_key(dep, extras).await?;
                dep_keys.push(key.0);
            }
            dep_keys.sort_unstable_by(|a, b| b.cmp(a));

            let workspace_root = recipe.workspace_root.to_string_lossy().into_owned();
            let key = self
                .provider
                .get_cache_key(&workspace_root, &dep_keys, extras)
                .await
                .map_err(|e| DrydockError::CacheError(e.to_string()))?;

            let fingerprint = Fingerprint(key);
            self.memo
                .lock()
                .insert(recipe.package_name.clone(), fingerprint.clone());
            Ok(fingerprint)
        })
    }

    /// Attempt to replay a cached entry. A miss is not an error.
    pub async fn replay(&self, fingerprint: &Fingerprint, local_cache_dir: &str) -> Result<ReplayResult, DrydockError> {
        use crate::host::ReplayOutcome;
        let outcome = self
            .provider
            .replay_cache(&fingerprint.0, local_cache_dir)
            .await
            .map_err(|e| DrydockError::CacheError(e.to_string()))?;
        match outcome {
            ReplayOutcome::Miss => Ok(ReplayResult::Miss),
            ReplayOutcome::Hit(mut rx) => {
                let mut lines = Vec::new();
                while let Some(item) = rx.recv().await {
                    if let Some(line) = item.log_line {
                        lines.push(line);
                    }
                }
                Ok(ReplayResult::Hit(lines))
            }
        }
    }

    /// Store `lines` under `fingerprint`, overwriting any prior entry.
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        local_cache_dir: &str,
        lines: Vec<String>,
    ) -> Result<(), DrydockError> {
        let items = lines
            .into_iter()
            .map(|line| CacheLine {
                log_line: Some(line),
                artifact: None,
            })
            .collect();
        self.provider
            .cache(&fingerprint.0, local_cache_dir, items)
            .await
            .map_err(|e| DrydockError::CacheError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::Fingerprint;

    #[test]
    fn fingerprint_displays_its_raw_key() {
        let fp = Fingerprint("abc123".to_string());
        assert_eq!(fp.to_string(), "abc123");
    }
}
