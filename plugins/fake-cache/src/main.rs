//! Reference cache-provider plugin: MD5 fingerprints of a directory's file
//! contents, combined with dependency/extra keys, and file-based replay
//! (grounded directly on the original local-disk cacher: walk, sort, hash,
//! store/replay `cached.log` under `{dir}/{key}`).

use anyhow::{Context, Result};
use drydock_plugin_sdk::protocol::{Capability, CacheLine};
use drydock_plugin_sdk::{serve, PluginHandler, ReplaySink};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Mutex;

#[derive(Default)]
struct LocalCacher {
    /// `dir` -> its content digest, memoized so a node's multiple dependents
    /// don't re-walk the filesystem for the same directory.
    dir_digests: Mutex<HashMap<String, String>>,
}

impl LocalCacher {
    fn digest_dir(&self, dir: &str) -> Result<String> {
        if let Some(existing) = self.dir_digests.lock().unwrap().get(dir) {
            return Ok(existing.clone());
        }
        let mut files = Vec::new();
        collect_files(Path::new(dir), &mut files)?;
        files.sort();

        let mut hasher = Md5::new();
        for file in &files {
            let contents = fs::read(file)
                .with_context(|| format!("can't open file {}", file.display()))?;
            hasher.update(&contents);
        }
        let digest = format!("{:x}", hasher.finalize());
        self.dir_digests
            .lock()
            .unwrap()
            .insert(dir.to_string(), digest.clone());
        Ok(digest)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("can't walk directory {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

impl PluginHandler for LocalCacher {
    fn name(&self) -> &'static str {
        "fake-cache"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::CacheProvider]
    }

    fn create_cache_key(&self, dir: &str, dep_keys: &[String], extras: &[String]) -> Result<String> {
        let dir_digest = self.digest_dir(dir)?;
        let mut hasher = Md5::new();
        hasher.update(dir_digest.as_bytes());
        for key in dep_keys {
            hasher.update(key.as_bytes());
        }
        for extra in extras {
            hasher.update(extra.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn cache(&self, key: &str, dir: &str, lines: Receiver<CacheLine>) -> Result<()> {
        let entry_dir = Path::new(dir).join(key);
        fs::create_dir_all(&entry_dir)
            .with_context(|| format!("can't create cache dir {}", entry_dir.display()))?;
        let log_path = entry_dir.join("cached.log");
        let mut file = fs::File::create(&log_path)
            .with_context(|| format!("can't create cache file {}", log_path.display()))?;
        for item in lines {
            if let Some(line) = item.log_line {
                writeln!(file, "{line}")?;
            }
        }
        Ok(())
    }

    fn replay_cache(&self, key: &str, dir: &str, sink: ReplaySink<'_>) -> Result<bool> {
        let log_path = Path::new(dir).join(key).join("cached.log");
        let file = match fs::File::open(&log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open cache file {}", log_path.display()))
            }
        };
        for line in BufReader::new(file).lines() {
            let line = line
                .with_context(|| format!("failed to read cache file {}", log_path.display()))?;
            sink.push(CacheLine {
                log_line: Some(line),
                artifact: None,
            });
        }
        Ok(true)
    }
}

fn main() -> Result<()> {
    serve(LocalCacher::default())
}
