// src/cache/mod.rs — Content-addressed memo store for oracle responses

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oracle::{OracleRequest, QueryResponse};

/// Deterministic digest over the semantic content of a request.
///
/// Covers the oracle identity, the model, the full message payload, the
/// output schema and the sampling parameters. Identical fingerprint means the
/// memoized response can be served without a new call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(oracle_id: &str, request: &OracleRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(oracle_id.as_bytes());
        hasher.update([0]);
        // Struct field order is fixed, so the JSON encoding is canonical.
        let payload = serde_json::to_vec(request).expect("request is serializable");
        hasher.update(&payload);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared memo store. An optimization only: disabling it must not change
/// exploration outcomes, just cost and latency.
///
/// Stores are idempotent (requests are deterministic by construction, so
/// last-write-wins is consistent) and lookups never observe a torn entry.
pub trait ResponseCache: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<QueryResponse>;
    fn store(&self, fingerprint: &Fingerprint, response: &QueryResponse);
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, QueryResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<QueryResponse> {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .get(fingerprint)
            .cloned()
    }

    fn store(&self, fingerprint: &Fingerprint, response: &QueryResponse) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(fingerprint.clone(), response.clone());
    }
}

/// Disk backend: one YAML file per fingerprint under `dir`.
///
/// Writes go through a temp file and an atomic rename, so a concurrent
/// reader sees either the previous entry or the complete new one.
pub struct YamlFileCache {
    dir: PathBuf,
}

impl YamlFileCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.yaml"))
    }
}

impl ResponseCache for YamlFileCache {
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<QueryResponse> {
        let path = self.entry_path(fingerprint);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_yml::from_str(&text) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(path = %path.display(), "discarding unreadable cache entry: {e}");
                None
            }
        }
    }

    fn store(&self, fingerprint: &Fingerprint, response: &QueryResponse) {
        let path = self.entry_path(fingerprint);
        if let Err(e) = write_atomically(&path, response) {
            tracing::warn!(path = %path.display(), "failed to persist cache entry: {e}");
        }
    }
}

fn write_atomically(path: &Path, response: &QueryResponse) -> Result<(), std::io::Error> {
    let text = serde_yml::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}

/// Cache disabled: every lookup misses, every store is dropped.
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn lookup(&self, _fingerprint: &Fingerprint) -> Option<QueryResponse> {
        None
    }

    fn store(&self, _fingerprint: &Fingerprint, _response: &QueryResponse) {}
}
