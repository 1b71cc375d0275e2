//! Core types for the veldt block-processing pipeline.
//!
//! This crate provides the foundational types used throughout the
//! controller implementation:
//!
//! - **Primitives**: digests, block ids, timestamps, account names
//! - **Cryptography**: BLS key/signature wrappers and aggregate verification
//! - **Consensus types**: block headers, signed blocks, quorum certificates,
//!   finalizer policies and their ordered diffs, producer schedules
//! - **Merkle trees**: the legacy canonical algorithm and the symmetric
//!   algorithm used once instant finality is active
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. Every
//! consensus-visible structure derives `BasicSbor` so that digests and wire
//! bytes are stable across nodes.

mod bitfield;
mod crypto;
mod hash;
mod ids;
mod time;

// Consensus types
mod block;
pub mod merkle;
pub mod ordered_diff;
mod policy;
mod qc;
mod schedule;
mod transaction;

pub use bitfield::SignerBitfield;
pub use crypto::{BlsKeyPair, BlsPublicKey, BlsSignature, CryptoError};
pub use hash::{sha256, Digest};
pub use ids::{AccountName, BlockId, TransactionId};
pub use time::BlockTimestamp;

pub use block::{
    BlockExtension, BlockHeader, FinalityExtension, HeaderExtension, SignedBlock,
};
pub use ordered_diff::{DiffError, OrderedDiff};
pub use policy::{FinalizerAuthority, FinalizerPolicy, FinalizerPolicyDiff};
pub use qc::{weak_vote_digest, BlockRef, QcClaim, QcLink, QuorumCertificate, VoteMessage};
pub use schedule::{BlockSigningAuthority, ProducerAuthority, ProducerSchedule, PRODUCER_REPETITIONS};
pub use transaction::{
    ActionData, ActionTrace, PackedTransaction, PermissionLevel, Transaction,
    TransactionMetadata, TransactionReceipt, TransactionReceiptStatus, TransactionTrace,
    TransactionVariant,
};

/// Block height / block number. Recoverable from the leading bytes of a
/// [`BlockId`].
pub type BlockNum = u32;

/// Hard cap on the element count of consensus-carried arrays (policy
/// finalizer lists, diff index lists, producer schedules).
pub const MAX_NUM_ARRAY_ELEMENTS: usize = 1024;
