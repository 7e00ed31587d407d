use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tly_core::{Result, SHARD_DIR_ENV, TallyError};

/// Default first mapping size of a new shard (1 MiB).
pub const DEFAULT_INITIAL_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory shared by every worker process.
    pub shard_dir: PathBuf,
    /// Bytes allocated when a shard file is first created.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

fn default_initial_capacity() -> usize {
    DEFAULT_INITIAL_CAPACITY
}

impl StoreConfig {
    pub fn new(shard_dir: impl Into<PathBuf>) -> Self {
        Self {
            shard_dir: shard_dir.into(),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }

    /// Read the shard directory from `TALLY_SHARD_DIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(SHARD_DIR_ENV)
    }

    pub fn from_env_var(var: &str) -> Result<Self> {
        match std::env::var_os(var) {
            Some(dir) if !dir.is_empty() => Ok(Self::new(PathBuf::from(dir))),
            _ => Err(TallyError::Config(format!("{var} is not set"))),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| TallyError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| TallyError::Config(format!("JSON parse error: {}", e))),
            _ => Err(TallyError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    pub fn with_initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_capacity = bytes;
        self
    }
}
