use crate::types::{BlobHandle, CodeHeapKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeCacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not enough space in {heap} to start: {size} bytes < {required} bytes")]
    HeapBelowMinimum {
        heap: &'static str,
        size: usize,
        required: usize,
    },

    #[error("Invalid code heap sizes: {message}")]
    InvalidHeapSizes {
        message: String,
        total: usize,
        reserved: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{} is full; increase `{}`", .kind.heap_name(), .kind.size_knob())]
    CodeCacheFull { kind: CodeHeapKind, requested: usize },

    #[error("Invalid allocation size: {0} bytes")]
    InvalidAllocationSize(usize),

    #[error("Unknown blob: {0}")]
    UnknownBlob(BlobHandle),

    #[error("Blob {handle} holds {capacity} bytes, {requested} requested")]
    BlobTooSmall {
        handle: BlobHandle,
        capacity: usize,
        requested: usize,
    },

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl CodeCacheError {
    /// Startup errors the runtime cannot continue from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HeapBelowMinimum { .. }
                | Self::InvalidHeapSizes { .. }
                | Self::InvalidConfig(_)
                | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CodeCacheError>;
