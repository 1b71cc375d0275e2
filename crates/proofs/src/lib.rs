//! Proof-of-finality verification.
//!
//! A counterpart chain (or bridge contract) proves that a block, a
//! finalizer-policy transition or an action belongs to a finalized chain:
//!
//! - A **heavy proof** carries a quorum certificate over a *QC block*
//!   whose finality merkle root covers the target block. Verification
//!   reconstructs the QC block's finality digest, checks the aggregate BLS
//!   signature against the known policy of that generation at strong
//!   quorum, then checks the target's merkle inclusion. Success caches the
//!   proven root.
//! - A **light proof** carries only the inclusion path and relies on a
//!   previously cached, still-fresh root.
//!
//! Action inclusion rides inside a proven block: a second merkle path from
//! the action-trace leaf up to the block's action merkle root, which the
//! block's finality digest commits to.

mod types;
mod verifier;

pub use types::{
    ActionProof, BlockData, BlockFinalityData, BlockProofOfInclusion, DynamicBlockData,
    ExtendedBlockData, FinalityProof, Proof, SignedQc, SimpleBlockData,
};
pub use verifier::{ProofError, ProofVerifier, VerifiedBlock, DEFAULT_CACHE_TTL_SLOTS};
