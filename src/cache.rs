//! Incremental compilation cache, keyed by source hash.
//!
//! Batch entry points consult the cache before compiling a file and store the
//! serialized `CompileOutput` after. Compilation is deterministic, so a hash
//! hit can return the stored artifacts without re-running any pass.

use crate::validate::CompileOutput;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

#[derive(Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub output: CompileOutput,
}

pub struct IncrementalCache {
    cache_dir: PathBuf,
}

impl IncrementalCache {
    /// Cache rooted at `.tandem/cache` in the current workspace.
    pub fn new() -> Self {
        Self::with_dir(PathBuf::from(".tandem/cache"))
    }

    pub fn with_dir(cache_dir: PathBuf) -> Self {
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).ok();
        }
        Self { cache_dir }
    }

    pub fn compute_hash(keyed_source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(keyed_source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, file_path: &str) -> PathBuf {
        // Stable file name per source path.
        let safe_name = file_path
            .replace("/", "_")
            .replace("\\", "_")
            .replace(":", "_");
        self.cache_dir.join(format!("{}.json", safe_name))
    }

    /// Returns the stored output when `keyed_source` hashes to the entry's
    /// hash. `keyed_source` is the file text plus whatever the caller folds
    /// into the key (compile options, for one).
    pub fn get(&self, file_path: &str, keyed_source: &str) -> Option<CompileOutput> {
        let entry_path = self.entry_path(file_path);
        if !entry_path.exists() {
            return None;
        }

        let data = match fs::read_to_string(&entry_path) {
            Ok(d) => d,
            Err(_) => return None,
        };

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(e) => {
                eprintln!(
                    "[TandemNative] Cache deserialization failed for {}: {}",
                    file_path, e
                );
                // Invalidate corrupt cache file
                fs::remove_file(entry_path).ok();
                return None;
            }
        };

        let current_hash = Self::compute_hash(keyed_source);
        if entry.hash == current_hash {
            Some(entry.output)
        } else {
            None
        }
    }

    pub fn set(&self, file_path: &str, keyed_source: &str, output: &CompileOutput) {
        let entry_path = self.entry_path(file_path);
        let entry = CacheEntry {
            hash: Self::compute_hash(keyed_source),
            output: output.clone(),
        };

        if let Ok(data) = serde_json::to_string(&entry) {
            fs::write(entry_path, data).ok();
        }
    }
}

impl Default for IncrementalCache {
    fn default() -> Self {
        Self::new()
    }
}
