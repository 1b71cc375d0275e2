//! Wire structures for finality proofs.

use sbor::prelude::*;
use veldt_types::{
    ActionTrace, BlockId, BlockNum, BlockTimestamp, BlsSignature, Digest, FinalizerPolicy,
    SignerBitfield,
};

/// Commitment data of the block a quorum certificate was formed over.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockFinalityData {
    pub major_version: u16,
    pub minor_version: u16,
    /// Generation of the policy whose finalizers signed this block.
    pub finalizer_policy_generation: u32,
    pub final_on_strong_qc_block_num: BlockNum,
    /// The policy pending activation as of this block, when one is in
    /// flight. Proving a block that carries one commits the policy to the
    /// verifier's store at its generation.
    pub pending_finalizer_policy: Option<FinalizerPolicy>,
    /// Digest over the block data not individually committed here.
    pub witness_hash: Digest,
    /// Root over the finality leaves of the block's ancestors.
    pub finality_mroot: Digest,
}

/// An aggregate signature with the bitset naming its signers within the
/// policy of the claimed generation.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SignedQc {
    pub signature: BlsSignature,
    pub finalizers: SignerBitfield,
}

/// The "heavy" part of a proof: a QC over a block whose finality root
/// covers the target.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalityProof {
    pub qc_block: BlockFinalityData,
    pub qc: SignedQc,
}

/// Execution-level data of a target block, plus any action proofs rooted
/// in it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct DynamicBlockData {
    pub block_num: BlockNum,
    pub action_proofs: Vec<ActionProof>,
}

/// A target block presented with its full finality data, allowing digest
/// reconstruction and action proofs.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ExtendedBlockData {
    pub major_version: u16,
    pub minor_version: u16,
    pub finalizer_policy_generation: u32,
    pub final_on_strong_qc_block_num: BlockNum,
    pub pending_finalizer_policy: Option<FinalizerPolicy>,
    /// This block's action merkle root; bound into the witness hash.
    pub action_mroot: Digest,
    /// Parent block id; the witness hash's other preimage half.
    pub parent_block_id: BlockId,
    pub finality_mroot: Digest,
    pub timestamp: BlockTimestamp,
    pub parent_timestamp: BlockTimestamp,
    pub dynamic_data: DynamicBlockData,
}

/// A target block presented with its finality digest precomputed. Smaller,
/// but cannot anchor action proofs.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SimpleBlockData {
    pub major_version: u16,
    pub minor_version: u16,
    pub finality_digest: Digest,
    pub timestamp: BlockTimestamp,
    pub parent_timestamp: BlockTimestamp,
    pub dynamic_data: DynamicBlockData,
}

/// The two target presentations.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum BlockData {
    Extended(ExtendedBlockData),
    Simple(SimpleBlockData),
}

impl BlockData {
    pub fn block_num(&self) -> BlockNum {
        match self {
            BlockData::Extended(data) => data.dynamic_data.block_num,
            BlockData::Simple(data) => data.dynamic_data.block_num,
        }
    }

    pub fn dynamic_data(&self) -> &DynamicBlockData {
        match self {
            BlockData::Extended(data) => &data.dynamic_data,
            BlockData::Simple(data) => &data.dynamic_data,
        }
    }
}

/// Merkle path from a target block's finality leaf to a finality root.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockProofOfInclusion {
    /// Leaf index of the target within the finality tree.
    pub target_block_index: u64,
    /// Leaf index of the last block the root covers.
    pub final_block_index: u64,
    pub target: BlockData,
    pub merkle_branches: Vec<Digest>,
}

/// Merkle path from an action-trace leaf to a block's action root.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ActionProof {
    /// Leaf index of the action within the block's action tree.
    pub target_action_index: u64,
    pub target: ActionTrace,
    pub merkle_branches: Vec<Digest>,
}

/// A complete proof submission: heavy when `finality_proof` is present,
/// light otherwise.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Proof {
    pub finality_proof: Option<FinalityProof>,
    pub target_block_proof_of_inclusion: BlockProofOfInclusion,
}
