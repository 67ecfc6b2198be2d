use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CapstanError, Result};

/// Shuffle transport configuration shared by the store, writer, and fetcher.
///
/// Read once at first store initialization; later changes have no effect on
/// the running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Block threshold in kilobytes; compared against file length in bytes
    /// after `* 1024`. A block is closed once its length exceeds this, so any
    /// individual block may overshoot by one record.
    pub block_size_kb: u64,
    /// Admission-cycle sleep in milliseconds on the reduce side.
    pub min_knock_interval_ms: u64,
    /// Upper admission interval in milliseconds (reserved for a future
    /// backoff schedule; carried but not consulted by the admission loop).
    pub max_knock_interval_ms: u64,
    /// Maximum parallel fetches per reducer task.
    pub max_connections: usize,
    /// Root under which the per-process shuffle directory is created.
    pub local_dir: String,
    /// If `>= 0`, an externally managed static server fronts the shuffle
    /// directory on this port instead of the embedded one.
    pub external_server_port: i32,
    /// URL path prefix when the external server is used.
    pub external_server_path: String,
    /// Host component of externally visible URIs.
    pub server_host: String,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            block_size_kb: 1024,
            min_knock_interval_ms: 1000,
            max_knock_interval_ms: 5000,
            max_connections: 4,
            local_dir: "/tmp".to_string(),
            external_server_port: -1,
            external_server_path: String::new(),
            server_host: "localhost".to_string(),
        }
    }
}

impl ShuffleConfig {
    /// Block threshold in bytes.
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_kb * 1024
    }

    /// Whether an externally managed static server fronts the shuffle
    /// directory.
    pub fn uses_external_server(&self) -> bool {
        self.external_server_port >= 0
    }

    /// Loads configuration from `CAPSTAN_*` environment variables, falling
    /// back to defaults for unset keys.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = read_env("CAPSTAN_BLOCK_SIZE_KB")? {
            cfg.block_size_kb = v;
        }
        if let Some(v) = read_env("CAPSTAN_MIN_KNOCK_INTERVAL_MS")? {
            cfg.min_knock_interval_ms = v;
        }
        if let Some(v) = read_env("CAPSTAN_MAX_KNOCK_INTERVAL_MS")? {
            cfg.max_knock_interval_ms = v;
        }
        if let Some(v) = read_env("CAPSTAN_MAX_CONNECTIONS")? {
            cfg.max_connections = v;
        }
        if let Some(v) = read_env("CAPSTAN_LOCAL_DIR")? {
            cfg.local_dir = v;
        }
        if let Some(v) = read_env("CAPSTAN_EXTERNAL_SERVER_PORT")? {
            cfg.external_server_port = v;
        }
        if let Some(v) = read_env("CAPSTAN_EXTERNAL_SERVER_PATH")? {
            cfg.external_server_path = v;
        }
        if let Some(v) = read_env("CAPSTAN_SERVER_HOST")? {
            cfg.server_host = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.block_size_kb == 0 {
            return Err(CapstanError::InvalidConfig(
                "block size must be > 0 KB".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(CapstanError::InvalidConfig(
                "max connections must be > 0".to_string(),
            ));
        }
        if self.max_knock_interval_ms < self.min_knock_interval_ms {
            return Err(CapstanError::InvalidConfig(format!(
                "max knock interval {}ms is below min knock interval {}ms",
                self.max_knock_interval_ms, self.min_knock_interval_ms
            )));
        }
        Ok(())
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CapstanError::InvalidConfig(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(None),
    }
}
