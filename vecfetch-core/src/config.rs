use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result, VecfetchError};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferConfig,
    pub reader: ReaderConfig,
}

impl Config {
    /// Read a JSON config; missing fields take their defaults.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let f = File::open(path).ctx(|| format!("open {}", path.display()))?;
        let cfg: Config = serde_json::from_reader(f)
            .map_err(|e| VecfetchError::InvalidConfiguration(format!("{}: {e}", path.display())))?;
        cfg.transfer.validate()?;
        Ok(cfg)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound on concurrently in-flight range requests.
    pub concurrency: usize,
    /// Extra attempts per chunk after the first one fails.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-attempt deadline handed to the range source.
    pub fetch_timeout_ms: u64,
    /// Persist the state sidecar after this many newly verified chunks.
    pub persist_every: u32,
    /// Seconds between progress log lines; 0 disables the reporter.
    pub report_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            fetch_timeout_ms: 30_000,
            persist_every: 16,
            report_interval_secs: 0,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(VecfetchError::InvalidConfiguration("concurrency must be > 0".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(VecfetchError::InvalidConfiguration(
                "backoff_max_ms must be >= backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReaderConfig {
    /// Re-hash a chunk's local bytes the first time this session reads it,
    /// even if the state sidecar says it is verified.
    pub recheck_local: bool,
    /// Chunks kept downloading ahead of a sequential reader; 0 disables
    /// read-ahead.
    pub readahead_chunks: u32,
    /// Back-to-back reads (each starting where the last one ended) needed
    /// before read-ahead starts.
    pub readahead_after: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { recheck_local: true, readahead_chunks: 4, readahead_after: 10 }
    }
}
