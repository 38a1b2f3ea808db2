use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use modelmux_core::{ForwardRequest, ForwardResponse};

/// Memoizes responses for requests that opt in with `use_cache`. Keyed on
/// the entire request, so any change to the conversation, constraints, or
/// seed is a different entry.
pub trait ResponseCache: Send + Sync {
    fn get(&self, request: &ForwardRequest) -> Option<ForwardResponse>;
    fn put(&self, request: &ForwardRequest, response: &ForwardResponse);
}

fn cache_key(request: &ForwardRequest) -> Option<String> {
    let encoded = serde_json::to_vec(request).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Some(format!("{:x}", hasher.finalize()))
}

/// One JSON file per entry under the cache directory. Failures inside the
/// cache degrade to a miss (reads) or a warning (writes); they never fail
/// the request being served.
pub struct DiskResponseCache {
    dir: PathBuf,
}

impl DiskResponseCache {
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ResponseCache for DiskResponseCache {
    fn get(&self, request: &ForwardRequest) -> Option<ForwardResponse> {
        let key = cache_key(request)?;
        let raw = fs::read(self.entry_path(&key)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn put(&self, request: &ForwardRequest, response: &ForwardResponse) {
        let Some(key) = cache_key(request) else {
            return;
        };
        let encoded = match serde_json::to_vec(response) {
            Ok(encoded) => encoded,
            Err(_) => return,
        };
        if let Err(err) = fs::write(self.entry_path(&key), encoded) {
            warn!("Failed to write cache entry {key}: {err}");
        }
    }
}

/// Map-backed cache for tests.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryResponseCache {
    entries: std::sync::Mutex<std::collections::HashMap<String, ForwardResponse>>,
}

#[cfg(test)]
impl ResponseCache for InMemoryResponseCache {
    fn get(&self, request: &ForwardRequest) -> Option<ForwardResponse> {
        let key = cache_key(request)?;
        self.entries.lock().ok()?.get(&key).cloned()
    }

    fn put(&self, request: &ForwardRequest, response: &ForwardResponse) {
        let Some(key) = cache_key(request) else {
            return;
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, response.clone());
        }
    }
}
