//! The proof verifier: policies by generation, root cache, verification.

use crate::types::{BlockData, BlockFinalityData, Proof};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};
use veldt_finality::FinalityDigestInputs;
use veldt_types::{merkle, BlockNum, BlockTimestamp, Digest, FinalizerPolicy};

/// Default freshness window for cached roots, in half-second slots.
pub const DEFAULT_CACHE_TTL_SLOTS: u32 = 600;

/// Verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("finalizer policy generation {0} is not known to the verifier")]
    UnknownGeneration(u32),

    #[error("signing weight {weight} does not reach the policy threshold {threshold}")]
    InsufficientQuorum { weight: u64, threshold: u64 },

    #[error("aggregate signature does not verify against the finality digest")]
    InvalidSignature,

    #[error("merkle inclusion of the target block failed")]
    InvalidBlockInclusion,

    #[error("merkle inclusion of action {index} failed")]
    InvalidActionInclusion { index: u64 },

    #[error("no cached finality root matches this light proof")]
    MissingCachedRoot,

    #[error("malformed proof: {0}")]
    Malformed(String),
}

/// Successful verification outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedBlock {
    pub block_num: BlockNum,
    pub finality_digest: Digest,
    /// The root the target was proven under.
    pub finality_mroot: Digest,
    /// Actions whose inclusion was proven alongside the block.
    pub proven_actions: usize,
}

struct CachedRoot {
    final_block_num: BlockNum,
    cached_at: BlockTimestamp,
}

/// Verifies heavy and light finality proofs against a store of known
/// finalizer policies and a TTL-bounded cache of proven roots.
pub struct ProofVerifier {
    policies: BTreeMap<u32, FinalizerPolicy>,
    cached_roots: BTreeMap<Digest, CachedRoot>,
    cache_ttl_slots: u32,
}

impl ProofVerifier {
    pub fn new(cache_ttl_slots: u32) -> Self {
        ProofVerifier {
            policies: BTreeMap::new(),
            cached_roots: BTreeMap::new(),
            cache_ttl_slots,
        }
    }

    /// Seed a finalizer policy (the trusted starting point; later
    /// generations arrive through proven policy transitions).
    pub fn set_policy(&mut self, policy: FinalizerPolicy) {
        info!(generation = policy.generation, "finalizer policy installed");
        self.policies.insert(policy.generation, policy);
    }

    pub fn knows_generation(&self, generation: u32) -> bool {
        self.policies.contains_key(&generation)
    }

    pub fn cached_root_count(&self) -> usize {
        self.cached_roots.len()
    }

    /// Verify a proof at logical time `now`. Heavy proofs cache their
    /// proven root; light proofs require a fresh cached root. Expired
    /// cache entries are garbage-collected on every call.
    pub fn verify(&mut self, proof: &Proof, now: BlockTimestamp) -> Result<VerifiedBlock, ProofError> {
        self.collect_expired_roots(now);

        let inclusion = &proof.target_block_proof_of_inclusion;
        if inclusion.target_block_index > inclusion.final_block_index {
            return Err(ProofError::Malformed(
                "target index exceeds the final block index".into(),
            ));
        }

        // Resolve the target's finality digest (and maybe learn a policy).
        let (finality_digest, leaf) = self.target_leaf(&inclusion.target)?;

        let root = merkle::root_from_branches(
            leaf,
            inclusion.target_block_index as usize,
            &inclusion.merkle_branches,
        );

        match &proof.finality_proof {
            Some(finality_proof) => {
                self.verify_finality_proof(&finality_proof.qc_block, &finality_proof.qc)?;
                if root != finality_proof.qc_block.finality_mroot {
                    return Err(ProofError::InvalidBlockInclusion);
                }
                self.cached_roots.insert(
                    root,
                    CachedRoot {
                        final_block_num: inclusion.final_block_index as BlockNum,
                        cached_at: now,
                    },
                );
                debug!(%root, "finality root proven and cached");
            }
            None => {
                if !self.cached_roots.contains_key(&root) {
                    return Err(ProofError::MissingCachedRoot);
                }
            }
        }

        // Action inclusion within the proven block.
        let mut proven_actions = 0;
        if let BlockData::Extended(extended) = &inclusion.target {
            for action_proof in &extended.dynamic_data.action_proofs {
                let action_root = merkle::root_from_branches(
                    action_proof.target.digest(),
                    action_proof.target_action_index as usize,
                    &action_proof.merkle_branches,
                );
                if action_root != extended.action_mroot {
                    return Err(ProofError::InvalidActionInclusion {
                        index: action_proof.target_action_index,
                    });
                }
                proven_actions += 1;
            }
        } else if !inclusion.target.dynamic_data().action_proofs.is_empty() {
            return Err(ProofError::Malformed(
                "action proofs require the extended target form".into(),
            ));
        }

        // A proven pending policy becomes known at its generation.
        if let BlockData::Extended(extended) = &inclusion.target {
            if let Some(policy) = &extended.pending_finalizer_policy {
                if !self.policies.contains_key(&policy.generation) {
                    info!(
                        generation = policy.generation,
                        "finalizer policy learned from a proven block"
                    );
                    self.policies.insert(policy.generation, policy.clone());
                }
            }
        }

        Ok(VerifiedBlock {
            block_num: inclusion.target.block_num(),
            finality_digest,
            finality_mroot: root,
            proven_actions,
        })
    }

    /// Check the aggregate signature and quorum of a heavy proof's QC.
    fn verify_finality_proof(
        &self,
        qc_block: &BlockFinalityData,
        qc: &crate::types::SignedQc,
    ) -> Result<(), ProofError> {
        let policy = self
            .policies
            .get(&qc_block.finalizer_policy_generation)
            .ok_or(ProofError::UnknownGeneration(qc_block.finalizer_policy_generation))?;

        let weight = policy.weight_of(&qc.finalizers);
        if weight < policy.threshold {
            return Err(ProofError::InsufficientQuorum { weight, threshold: policy.threshold });
        }

        let digest = FinalityDigestInputs {
            active_policy_generation: qc_block.finalizer_policy_generation,
            final_on_strong_qc_block_num: qc_block.final_on_strong_qc_block_num,
            finality_mroot: qc_block.finality_mroot,
            active_policy_digest: policy.digest(),
            pending_policy_digest: qc_block
                .pending_finalizer_policy
                .as_ref()
                .map(|p| p.digest()),
            witness_hash: qc_block.witness_hash,
        }
        .compute();

        let keys = policy.keys_for(&qc.finalizers);
        if !qc.signature.verify_aggregate(&keys, digest.as_bytes()) {
            return Err(ProofError::InvalidSignature);
        }
        Ok(())
    }

    /// The finality digest and merkle leaf of the target block.
    fn target_leaf(&self, target: &BlockData) -> Result<(Digest, Digest), ProofError> {
        match target {
            BlockData::Simple(simple) => {
                let leaf = merkle::finality_leaf(
                    simple.dynamic_data.block_num,
                    simple.finality_digest,
                    simple.timestamp,
                    simple.parent_timestamp,
                );
                Ok((simple.finality_digest, leaf))
            }
            BlockData::Extended(extended) => {
                let policy = self
                    .policies
                    .get(&extended.finalizer_policy_generation)
                    .ok_or(ProofError::UnknownGeneration(extended.finalizer_policy_generation))?;
                let witness_hash =
                    Digest::hash_of(&(extended.action_mroot, extended.parent_block_id));
                let digest = FinalityDigestInputs {
                    active_policy_generation: extended.finalizer_policy_generation,
                    final_on_strong_qc_block_num: extended.final_on_strong_qc_block_num,
                    finality_mroot: extended.finality_mroot,
                    active_policy_digest: policy.digest(),
                    pending_policy_digest: extended
                        .pending_finalizer_policy
                        .as_ref()
                        .map(|p| p.digest()),
                    witness_hash,
                }
                .compute();
                let leaf = merkle::finality_leaf(
                    extended.dynamic_data.block_num,
                    digest,
                    extended.timestamp,
                    extended.parent_timestamp,
                );
                Ok((digest, leaf))
            }
        }
    }

    /// Drop cache entries older than the TTL.
    fn collect_expired_roots(&mut self, now: BlockTimestamp) {
        let ttl = self.cache_ttl_slots;
        let before = self.cached_roots.len();
        self.cached_roots
            .retain(|_, cached| now.0.saturating_sub(cached.cached_at.0) <= ttl);
        let dropped = before - self.cached_roots.len();
        if dropped > 0 {
            debug!(dropped, "expired finality roots collected");
        }
    }
}

impl Default for ProofVerifier {
    fn default() -> Self {
        ProofVerifier::new(DEFAULT_CACHE_TTL_SLOTS)
    }
}
