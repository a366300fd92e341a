//! Durable watch-job storage.
//!
//! The contract is deliberately small: replace everything, load
//! everything. The default backend is one pretty-printed JSON file,
//! rewritten whole on each change; job counts are tens, not millions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::watch::WatchJob;

#[async_trait]
pub trait WatchStore: Send + Sync {
    /// Replaces the stored set with `jobs`.
    async fn save(&self, jobs: &[WatchJob]) -> Result<()>;

    /// Every stored job; empty when nothing was ever saved.
    async fn load(&self) -> Result<Vec<WatchJob>>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WatchStore for JsonFileStore {
    async fn save(&self, jobs: &[WatchJob]) -> Result<()> {
        let body = serde_json::to_vec_pretty(jobs).context("encode watch jobs")?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "watch jobs saved");
        Ok(())
    }

    async fn load(&self) -> Result<Vec<WatchJob>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        serde_json::from_slice(&raw).with_context(|| format!("decode {}", self.path.display()))
    }
}

/// In-memory store for tests and throwaway runs.
pub struct MemoryStore {
    jobs: std::sync::Mutex<Vec<WatchJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WatchStore for MemoryStore {
    async fn save(&self, jobs: &[WatchJob]) -> Result<()> {
        *self.jobs.lock().expect("memory store lock poisoned") = jobs.to_vec();
        Ok(())
    }

    async fn load(&self) -> Result<Vec<WatchJob>> {
        Ok(self.jobs.lock().expect("memory store lock poisoned").clone())
    }
}
