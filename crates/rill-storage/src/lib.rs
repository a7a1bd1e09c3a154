//! # Rill Storage
//!
//! Durability layer for Rill: a per-batch write-ahead log, versioned
//! checkpoint files, and a state store combining the two.
//!
//! ## Disk layout
//!
//! ```text
//! {dir}/
//!   wal.log                     # [len][crc32c][rkyv BatchRecord] ...
//!   checkpoints/
//!     checkpoint_000000000012   # RILLCKPT | version | crc32c | rkyv body
//!     checkpoint_000000000024
//!     latest                    # "checkpoint_000000000024"
//! ```

#![deny(missing_docs)]

pub mod checkpoint;
pub mod durable_store;
pub mod wal;

pub use checkpoint::{Checkpoint, CheckpointStore, FileSystemCheckpointStore};
pub use durable_store::{DurableStateStore, DurableStoreConfig, RecoveryInfo};
pub use wal::{BatchLog, BatchRecord, LogContents};

use rill_core::state::StateError;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O failure
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding state failed
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// A checksum, magic number or structure check failed
    #[error("corruption in {path}: {reason}")]
    Corruption {
        /// File that failed validation.
        path: String,
        /// What was wrong.
        reason: String,
    },

    /// Checkpoint written by an incompatible format version
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
}

impl From<StorageError> for StateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => StateError::Io(e),
            StorageError::State(e) => e,
            other @ (StorageError::Corruption { .. } | StorageError::UnsupportedVersion(_)) => {
                StateError::Corruption(other.to_string())
            }
        }
    }
}
