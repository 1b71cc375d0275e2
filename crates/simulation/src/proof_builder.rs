//! Build finality proofs out of recorded cluster history.
//!
//! Mirrors what a bridge's proof server would do: read the chain's
//! finality leaves and policies, aggregate finalizer signatures, and
//! assemble heavy or light proofs for the verifier.

use std::sync::Arc;
use veldt_chain::SavannaBlockState;
use veldt_proofs::{
    BlockData, BlockFinalityData, BlockProofOfInclusion, DynamicBlockData, ExtendedBlockData,
    FinalityProof, Proof, SignedQc,
};
use veldt_types::{merkle, BlsKeyPair, BlsSignature, Digest, SignerBitfield};

/// The extended target presentation of a recorded block.
pub fn extended_block_data(state: &SavannaBlockState) -> ExtendedBlockData {
    let hs = &state.header_state;
    ExtendedBlockData {
        major_version: 1,
        minor_version: 0,
        finalizer_policy_generation: hs.policy_tracker.active().generation,
        final_on_strong_qc_block_num: hs.core.final_on_strong_qc_block_num(),
        pending_finalizer_policy: hs.policy_tracker.latest_pending().cloned(),
        action_mroot: hs.action_mroot,
        parent_block_id: hs.header.previous,
        finality_mroot: hs.finality_mroot,
        timestamp: hs.timestamp(),
        parent_timestamp: hs.parent_timestamp,
        dynamic_data: DynamicBlockData { block_num: hs.block_num(), action_proofs: Vec::new() },
    }
}

/// Aggregate signatures of `signer_indexes` (into `keys`) over the
/// finality digest of `qc_block`.
pub fn signed_qc_over(
    qc_block: &SavannaBlockState,
    keys: &[Arc<BlsKeyPair>],
    signer_indexes: &[usize],
) -> SignedQc {
    let digest = qc_block.header_state.finality_digest;
    let policy = qc_block.header_state.policy_tracker.active();
    let mut finalizers = SignerBitfield::new(policy.finalizers.len());
    let mut signatures = Vec::new();
    for &index in signer_indexes {
        let key = &keys[index];
        let position = policy
            .index_of(&key.public_key())
            .expect("signer key must be in the qc block's active policy");
        finalizers.set(position);
        signatures.push(key.sign(digest.as_bytes()));
    }
    SignedQc {
        signature: BlsSignature::aggregate(signatures.iter())
            .expect("at least one signer required"),
        finalizers,
    }
}

fn commitment_of(state: &SavannaBlockState) -> BlockFinalityData {
    let hs = &state.header_state;
    BlockFinalityData {
        major_version: 1,
        minor_version: 0,
        finalizer_policy_generation: hs.policy_tracker.active().generation,
        final_on_strong_qc_block_num: hs.core.final_on_strong_qc_block_num(),
        pending_finalizer_policy: hs.policy_tracker.latest_pending().cloned(),
        witness_hash: Digest::hash_of(&(hs.action_mroot, hs.header.previous)),
        finality_mroot: hs.finality_mroot,
    }
}

fn inclusion_under(
    qc_block: &SavannaBlockState,
    target: &SavannaBlockState,
) -> BlockProofOfInclusion {
    let leaves = &qc_block.header_state.finality_leaves;
    // A block's finality root covers its ancestors' leaves, not its own.
    let covered = &leaves[..leaves.len() - 1];
    let distance = (qc_block.header_state.block_num() - target.header_state.block_num()) as usize;
    let target_index = covered.len() - distance;
    BlockProofOfInclusion {
        target_block_index: target_index as u64,
        final_block_index: (covered.len() - 1) as u64,
        target: BlockData::Extended(extended_block_data(target)),
        merkle_branches: merkle::generate_inclusion_proof(covered, target_index),
    }
}

/// A heavy proof: `qc` certifies `qc_block`, whose finality root covers
/// `target`.
pub fn heavy_proof(
    qc_block: &SavannaBlockState,
    qc: SignedQc,
    target: &SavannaBlockState,
) -> Proof {
    Proof {
        finality_proof: Some(FinalityProof { qc_block: commitment_of(qc_block), qc }),
        target_block_proof_of_inclusion: inclusion_under(qc_block, target),
    }
}

/// A light proof of `target` under `qc_block`'s (previously proven) root.
pub fn light_proof(qc_block: &SavannaBlockState, target: &SavannaBlockState) -> Proof {
    Proof {
        finality_proof: None,
        target_block_proof_of_inclusion: inclusion_under(qc_block, target),
    }
}
