//! The controller's error taxonomy.

use thiserror::Error;
use veldt_fork_db::ForkDbError;
use veldt_store::{SnapshotError, StoreError};
use veldt_types::{BlockId, DiffError, TransactionId};

/// Controller-level errors.
///
/// The variants map onto distinct handling policies:
///
/// - `BlockValidate`, `ProtocolFeatureBadBlock` and `ForkDatabase` reject
///   the block being processed; pending state is aborted and its undo
///   session discarded.
/// - `TransactionObjective` and `TransactionSubjective` attach to the
///   transaction trace; the block restore point reverses the transaction's
///   partial mutations and the pending block continues. During validation
///   a subjective failure is escalated to objective.
/// - `UnlinkableBlock` and `UnknownTransaction` are reported to the caller
///   with no state change.
/// - `Fatal` aborts the pipeline step and propagates; nothing catches it
///   below the caller.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block validation failed: {0}")]
    BlockValidate(String),

    #[error("fork database: {0}")]
    ForkDatabase(#[from] ForkDbError),

    #[error("protocol feature rejects this block: {0}")]
    ProtocolFeatureBadBlock(String),

    #[error("protocol feature failure (subjective): {0}")]
    ProtocolFeatureSubjective(String),

    #[error("transaction failed: {0}")]
    TransactionObjective(String),

    #[error("transaction failed subjectively: {0}")]
    TransactionSubjective(String),

    #[error("unlinkable block {id}: parent {previous} unknown")]
    UnlinkableBlock { id: BlockId, previous: BlockId },

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("policy diff: {0}")]
    PolicyDiff(#[from] DiffError),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChainError {
    /// Numeric code surfaced in transaction traces.
    pub fn error_code(&self) -> u64 {
        match self {
            ChainError::BlockValidate(_) => 3_030_000,
            ChainError::ForkDatabase(_) => 3_020_000,
            ChainError::ProtocolFeatureBadBlock(_) => 3_250_000,
            ChainError::ProtocolFeatureSubjective(_) => 3_250_001,
            ChainError::TransactionObjective(_) => 3_040_000,
            ChainError::TransactionSubjective(_) => 3_080_000,
            ChainError::UnlinkableBlock { .. } => 3_030_001,
            ChainError::UnknownTransaction(_) => 3_040_010,
            ChainError::Store(_) => 3_060_000,
            ChainError::Snapshot(_) => 3_120_000,
            ChainError::PolicyDiff(_) => 3_250_002,
            ChainError::Fatal(_) => 3_990_000,
        }
    }

    /// True for failures a speculative block may drop without rejecting the
    /// block, and that validation must escalate.
    pub fn is_subjective(&self) -> bool {
        matches!(
            self,
            ChainError::TransactionSubjective(_) | ChainError::ProtocolFeatureSubjective(_)
        )
    }

    /// True for failures that must abort the whole pipeline step.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Fatal(_))
    }
}

/// Shorthand result type for controller operations.
pub type Result<T, E = ChainError> = std::result::Result<T, E>;
