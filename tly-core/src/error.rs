use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metric {name} already declared as {existing}, cannot redeclare as {requested}")]
    KindConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Invalid shard header: {0}")]
    InvalidHeader(String),

    #[error("Corrupt slot at offset {offset}: {reason}")]
    CorruptSlot { offset: usize, reason: String },

    #[error("Buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("Slot handle does not belong to this store: {0}")]
    InvalidHandle(String),

    #[error("Not a shard file name: {0}")]
    InvalidFileName(PathBuf),

    #[error("Key field too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// True for errors that mean the on-disk bytes cannot be trusted, as
    /// opposed to the environment failing us.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeader(_) | Self::CorruptSlot { .. } | Self::BufferTooSmall { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;
