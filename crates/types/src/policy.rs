//! Finalizer policies: the weighted BLS key sets authorized to sign quorum
//! certificates, plus the compact ordered diffs they propagate through
//! block headers.

use crate::bitfield::SignerBitfield;
use crate::crypto::BlsPublicKey;
use crate::hash::Digest;
use crate::ordered_diff::{DiffError, OrderedDiff};
use sbor::prelude::*;

/// One finalizer: a BLS key with a voting weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, BasicSbor)]
pub struct FinalizerAuthority {
    /// Operator-chosen label, not consensus-relevant beyond being hashed.
    pub description: String,
    /// Voting weight.
    pub weight: u64,
    /// BLS public key votes are verified against.
    pub public_key: BlsPublicKey,
}

/// An ordered finalizer set with a generation number and an explicit strong
/// quorum threshold (by weight).
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerPolicy {
    /// Strictly increasing across policy changes.
    pub generation: u32,
    /// Weight a strong quorum must reach. Verifiers must use this value,
    /// not recompute their own.
    pub threshold: u64,
    /// Finalizers in policy order; bitfield positions index into this list.
    pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
    /// Build a policy with the conventional threshold of
    /// `2/3 of total weight, rounded up past half: (total*2)/3 + 1`.
    pub fn new(generation: u32, finalizers: Vec<FinalizerAuthority>) -> Self {
        let total: u64 = finalizers.iter().map(|f| f.weight).sum();
        FinalizerPolicy {
            generation,
            threshold: total * 2 / 3 + 1,
            finalizers,
        }
    }

    /// Sum of all finalizer weights.
    pub fn total_weight(&self) -> u64 {
        self.finalizers.iter().map(|f| f.weight).sum()
    }

    /// Stable digest of the policy.
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }

    /// Position of a key in the policy, if present.
    pub fn index_of(&self, key: &BlsPublicKey) -> Option<usize> {
        self.finalizers.iter().position(|f| f.public_key == *key)
    }

    /// Public keys selected by a signer bitfield, in policy order.
    pub fn keys_for(&self, signers: &SignerBitfield) -> Vec<BlsPublicKey> {
        signers
            .iter_ones()
            .filter_map(|i| self.finalizers.get(i).map(|f| f.public_key))
            .collect()
    }

    /// Total weight selected by a signer bitfield.
    pub fn weight_of(&self, signers: &SignerBitfield) -> u64 {
        signers
            .iter_ones()
            .filter_map(|i| self.finalizers.get(i).map(|f| f.weight))
            .sum()
    }

    /// Diff from this policy to `target`, carrying target's generation and
    /// threshold. The finalizer-list diff is consensus critical.
    pub fn create_diff(&self, target: &FinalizerPolicy) -> Result<FinalizerPolicyDiff, DiffError> {
        Ok(FinalizerPolicyDiff {
            generation: target.generation,
            threshold: target.threshold,
            finalizers_diff: OrderedDiff::diff(&self.finalizers, &target.finalizers)?,
        })
    }

    /// Apply a diff, producing the target policy.
    pub fn apply_diff(&self, diff: &FinalizerPolicyDiff) -> Result<FinalizerPolicy, DiffError> {
        Ok(FinalizerPolicy {
            generation: diff.generation,
            threshold: diff.threshold,
            finalizers: OrderedDiff::apply(self.finalizers.clone(), &diff.finalizers_diff)?,
        })
    }
}

/// A finalizer policy change as it travels in a block header: the new
/// generation and threshold, plus the ordered diff of the finalizer list.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerPolicyDiff {
    pub generation: u32,
    pub threshold: u64,
    pub finalizers_diff: OrderedDiff<FinalizerAuthority>,
}
