//! Error types for the attach core.
//!
//! Everything that can stop an attach bubbles up as an [`AttachError`];
//! recoverable conditions (bit-flips, zero sequence numbers, read-only
//! compatible internal volumes) are logged and degrade the attach instead.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttachError>;

/// Why an attach was aborted (or, for [`AttachError::NoSpace`], why the
/// early allocator came up empty).
#[derive(Debug, Error)]
pub enum AttachError {
    /// Hard fault from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-flash data is self-inconsistent: wrong format version, erase
    /// counter overflow, mismatched image sequence numbers, VID headers that
    /// disagree within one volume, or duplicated non-zero sequence numbers.
    #[error("bad on-flash format: {0}")]
    Format(String),

    /// More unexpectedly-corrupted PEBs than the attach budget allows.
    #[error("{corrupt} corrupted PEBs, over the limit of {max}")]
    CorruptionBudget { corrupt: usize, max: usize },

    /// The medium looks like it holds foreign (non-UBI) data; refusing to
    /// treat it as empty would risk destroying it.
    #[error("medium is not UBI-formatted and may contain foreign data")]
    NotUbi,

    /// The early allocator found no free and no erasable PEB.
    #[error("no free eraseblocks")]
    NoSpace,

    /// Post-scan invariant verification failed.
    #[error("attach self-check failed: {0}")]
    SelfCheck(String),
}
