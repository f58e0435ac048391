// contrametrics/src/config.rs
//
// Engine configuration. Every field has a default so a JSON config file only
// needs to name what it overrides; CLI flags are applied on top in main.rs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TOP_N: usize = 10;
pub const MIN_TOP_N:     usize = 1;
pub const MAX_TOP_N:     usize = 100;

/// Ten years of hour buckets; also keeps the compaction cutoff representable.
pub const MAX_HOUR_RETENTION_DAYS: i64 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// JSONL journal backing the event store. None = in-memory only.
    pub journal_path:           Option<PathBuf>,
    /// Hour buckets older than this are rolled into their day bucket.
    pub hour_retention_days:    i64,
    pub default_top_n:          usize,
    pub min_top_n:              usize,
    pub max_top_n:              usize,
    pub compaction_interval_secs: u64,
    pub bind:                   SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_path:             None,
            hour_retention_days:      90,
            default_top_n:            DEFAULT_TOP_N,
            min_top_n:                MIN_TOP_N,
            max_top_n:                MAX_TOP_N,
            compaction_interval_secs: 3600,
            bind:                     SocketAddr::from(([127, 0, 0, 1], 50061)),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.checked()
    }

    /// Reject combinations that would make topN clamping or compaction meaningless.
    pub fn checked(mut self) -> Result<Self> {
        if self.min_top_n == 0 { self.min_top_n = MIN_TOP_N; }
        if self.max_top_n < self.min_top_n {
            anyhow::bail!("max_top_n {} below min_top_n {}", self.max_top_n, self.min_top_n);
        }
        self.default_top_n = self.default_top_n.clamp(self.min_top_n, self.max_top_n);
        if !(1..=MAX_HOUR_RETENTION_DAYS).contains(&self.hour_retention_days) {
            anyhow::bail!(
                "hour_retention_days {} outside 1..={}",
                self.hour_retention_days, MAX_HOUR_RETENTION_DAYS
            );
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{ "default_top_n": 5 }"#).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.default_top_n, 5);
        assert_eq!(cfg.hour_retention_days, 90);
        assert!(cfg.journal_path.is_none());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let cfg = EngineConfig { min_top_n: 20, max_top_n: 5, ..Default::default() };
        assert!(cfg.checked().is_err());
    }

    #[test]
    fn default_top_n_is_pulled_into_bounds() {
        let cfg = EngineConfig { default_top_n: 500, ..Default::default() }.checked().unwrap();
        assert_eq!(cfg.default_top_n, MAX_TOP_N);
    }

    #[test]
    fn retention_is_bounded() {
        let huge = EngineConfig { hour_retention_days: 10_000_000_000, ..Default::default() };
        assert!(huge.checked().is_err());
        let zero = EngineConfig { hour_retention_days: 0, ..Default::default() };
        assert!(zero.checked().is_err());
        let max = EngineConfig { hour_retention_days: MAX_HOUR_RETENTION_DAYS, ..Default::default() };
        assert!(max.checked().is_ok());
    }
}
