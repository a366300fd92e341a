// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sources::SourceKind;
use crate::watch::MIN_INTERVAL_SECS;

const ENV_CONFIG_PATH: &str = "COVBR_CONFIG_PATH";
const ENV_STORE_PATH: &str = "COVBR_STORE_PATH";
const ENV_REFRESH_SECS: &str = "COVBR_REFRESH_SECS";

const DEFAULT_CONFIG_PATH: &str = "config/tracker.toml";

fn default_sources() -> Vec<SourceKind> {
    SourceKind::all().to_vec()
}
fn default_cache_ttl_secs() -> u64 {
    20 * 60
}
fn default_refresh_interval_secs() -> u64 {
    60 * 60
}
fn default_watch_interval_secs() -> u64 {
    60 * 60
}
fn default_store_path() -> String {
    "state/watch_jobs.json".to_string()
}
fn default_command_log_capacity() -> usize {
    512
}

/// Runtime configuration for the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Source priority order; the first entry feeds watch jobs.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceKind>,
    /// Seconds before a cached payload counts as expired; 0 keeps payloads
    /// until the next forced reload.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Period of the system-wide cache reload timer.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Watch interval applied when the user gives none.
    #[serde(default = "default_watch_interval_secs")]
    pub default_watch_interval_secs: u64,
    /// Where watch jobs are persisted between runs.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// How many chat commands the in-memory audit ring keeps.
    #[serde(default = "default_command_log_capacity")]
    pub command_log_capacity: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            cache_ttl_secs: default_cache_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            default_watch_interval_secs: default_watch_interval_secs(),
            store_path: default_store_path(),
            command_log_capacity: default_command_log_capacity(),
        }
    }
}

impl BotConfig {
    /// Load from an explicit TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: BotConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $COVBR_CONFIG_PATH (must exist when set)
    /// 2) config/tracker.toml
    /// 3) built-in defaults
    ///
    /// Individual env overrides ($COVBR_STORE_PATH, $COVBR_REFRESH_SECS)
    /// apply on top, then intervals are floored to sane minimums.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                Self::load_from(&pb)?
            } else {
                return Err(anyhow!("COVBR_CONFIG_PATH points to non-existent path"));
            }
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var(ENV_STORE_PATH) {
            if !p.trim().is_empty() {
                self.store_path = p;
            }
        }
        if let Some(secs) = parse_secs_env(std::env::var(ENV_REFRESH_SECS).ok()) {
            self.refresh_interval_secs = secs;
        }
    }

    fn sanitize(&mut self) {
        if self.sources.is_empty() {
            self.sources = default_sources();
        }
        // Keep the first occurrence of each source.
        let mut seen: Vec<SourceKind> = Vec::new();
        self.sources.retain(|s| {
            if seen.contains(s) {
                false
            } else {
                seen.push(*s);
                true
            }
        });
        self.refresh_interval_secs = self.refresh_interval_secs.max(MIN_INTERVAL_SECS);
        self.default_watch_interval_secs = self.default_watch_interval_secs.max(MIN_INTERVAL_SECS);
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

// parse optional seconds env, rejecting zero and garbage
fn parse_secs_env(raw: Option<String>) -> Option<u64> {
    raw.and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
