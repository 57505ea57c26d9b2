//! Error types.
//!
//! Device-level failures are [NandError]s; everything the bad-block layer reports upward is a
//! [BmlError]. Write and erase failures never reach the caller directly: they are absorbed by
//! replacing the failing block, and only surface as [BmlError::PoolExhausted] once the
//! reservoir runs dry.

use thiserror::Error;

use crate::refresh::RefreshReport;

/// The kind of operation a deferred ("previous operation") error belongs to
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpKind {
    Write,
    Erase,
}

/// Failures reported by a [crate::nand::Nand] implementation
#[derive(Debug, Error)]
pub enum NandError {
    #[error("program failed on block {pbn}, page {page}")]
    Write { pbn: u32, page: u32 },

    #[error("erase failed on block {pbn}")]
    Erase { pbn: u32 },

    #[error("uncorrectable read on block {pbn}, page {page}")]
    UncorrectableRead { pbn: u32, page: u32 },

    /// An error from an operation that was accepted earlier and only completed now
    #[error("deferred {kind:?} failure on block {pbn}, page {page}")]
    PreviousOp { kind: OpKind, pbn: u32, page: u32 },

    #[error("block {pbn} is write-protected")]
    Locked { pbn: u32 },

    #[error("block {0} out of range")]
    OutOfRange(u32),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

impl NandError {
    /// Is this a program failure, either immediate or deferred?
    pub fn is_write_error(&self) -> bool {
        matches!(
            self,
            Self::Write { .. }
                | Self::PreviousOp {
                    kind: OpKind::Write,
                    ..
                }
        )
    }

    /// Is this an erase failure, either immediate or deferred?
    pub fn is_erase_error(&self) -> bool {
        matches!(
            self,
            Self::Erase { .. }
                | Self::PreviousOp {
                    kind: OpKind::Erase,
                    ..
                }
        )
    }

    /// Does this error mean the block itself is failing, and should be replaced?
    pub fn is_block_failure(&self) -> bool {
        self.is_write_error() || self.is_erase_error()
    }
}

/// Errors reported by the bad-block management layer
#[derive(Debug, Error)]
pub enum BmlError {
    /// No free block (or candidate) is left in the reservoir of the die
    #[error("reservoir of die {die} is exhausted")]
    PoolExhausted { die: u32 },

    #[error("could not change lock state of block {pbn}: {source}")]
    LockFailed {
        pbn: u32,
        #[source]
        source: NandError,
    },

    /// A repartition tried to move or change a partition with a lock attribute
    #[error("lock attributes of partition {id} differ from the current layout")]
    PartitionMismatch { id: u32 },

    /// Refresh hit uncorrectable reads on these blocks; they were dropped from the list
    ///
    /// The rest of the batch still ran, and `report` counts it.
    #[error("uncorrectable read while refreshing blocks {blocks:?}")]
    RefreshReadError {
        blocks: Vec<u32>,
        report: RefreshReport,
    },

    #[error("indirection table of die {die} is full ({capacity} entries)")]
    TableOverflow { die: u32, capacity: usize },

    #[error("no committed metadata found on die {die}")]
    Unformatted { die: u32 },

    #[error("metadata is incompatible with this device: {0}")]
    Incompatible(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("critical: {0}")]
    Critical(String),

    #[error(transparent)]
    Nand(#[from] NandError),
}

impl BmlError {
    /// Errors after which the die cannot be trusted to keep track of its blocks
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TableOverflow { .. } | Self::Critical(_) | Self::PoolExhausted { .. }
        )
    }
}

pub type Result<T, E = BmlError> = std::result::Result<T, E>;

#[test]
fn test_error_classes() {
    assert!(NandError::Write { pbn: 1, page: 2 }.is_write_error());
    assert!(NandError::PreviousOp {
        kind: OpKind::Erase,
        pbn: 1,
        page: 0
    }
    .is_erase_error());
    assert!(!NandError::UncorrectableRead { pbn: 1, page: 2 }.is_block_failure());

    assert!(BmlError::TableOverflow {
        die: 0,
        capacity: 3
    }
    .is_fatal());
    assert!(!BmlError::PartitionMismatch { id: 1 }.is_fatal());
}
