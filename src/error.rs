use crate::structures::LE64;
use thiserror::Error;

/// Closed error taxonomy for the core engine (§7). The CLI and tests still consume
/// these through `anyhow::Result`, exactly as `wtfrank-dump_btrfs`'s `main.rs` does,
/// but callers embedding the library get a matchable enum at the API boundary.
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("no space: allocator exhausted after a full wrap over the block-group index")]
    NoSpace,

    #[error("key not found")]
    NotFound,

    #[error("bad block at bytenr {bytenr}: {reason}")]
    BadBlock { bytenr: LE64, reason: String },

    #[error("device i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("operation incomplete, call again: {progress}")]
    Retry { progress: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key already exists")]
    KeyExists,

    #[error("transaction poisoned by a previous aborted operation")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, BtrfsError>;

impl BtrfsError {
    pub fn bad_block(bytenr: LE64, reason: impl Into<String>) -> BtrfsError {
        BtrfsError::BadBlock {
            bytenr,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> BtrfsError {
        BtrfsError::InvalidArgument(reason.into())
    }

    /// `BadBlock` and `IoError` are treated identically by callers per §7: both are
    /// fatal for the affected operation and flip the filesystem read-only.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BtrfsError::BadBlock { .. } | BtrfsError::IoError(_))
    }
}
