//! Quorum certificates, QC claims and the vote messages they aggregate.

use crate::bitfield::SignerBitfield;
use crate::crypto::{BlsPublicKey, BlsSignature};
use crate::hash::Digest;
use crate::ids::BlockId;
use crate::policy::FinalizerPolicy;
use crate::time::BlockTimestamp;
use crate::BlockNum;
use sbor::prelude::*;
use sha2::{Digest as _, Sha256};

/// A lightweight reference to a block: its id (which embeds the height) and
/// its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct BlockRef {
    pub block_id: BlockId,
    pub timestamp: BlockTimestamp,
}

impl BlockRef {
    pub fn block_num(&self) -> BlockNum {
        self.block_id.block_num()
    }
}

/// A QC link: block `source_block_num` claimed a QC over block
/// `target_block_num`. Target never exceeds source; they are equal only for
/// the genesis self-link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct QcLink {
    pub source_block_num: BlockNum,
    pub target_block_num: BlockNum,
    pub is_link_strong: bool,
}

/// A QC claim advertised in a block header: "a QC of this strength exists
/// over this ancestor".
///
/// Claims are totally ordered by `(block_num, is_strong_qc)` — at equal
/// height a strong claim beats a weak one. The derive relies on field
/// order, so keep `block_num` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BasicSbor)]
pub struct QcClaim {
    pub block_num: BlockNum,
    pub is_strong_qc: bool,
}

/// The digest weak votes sign: a domain-separated derivative of the strong
/// digest, so a weak vote can never be replayed as a strong one.
pub fn weak_vote_digest(strong_digest: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(b"WEAK");
    hasher.update(strong_digest.as_bytes());
    Digest(hasher.finalize().into())
}

/// A single finalizer vote on a block's finality digest.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct VoteMessage {
    pub block_id: BlockId,
    /// Strong votes sign the finality digest itself; weak votes sign
    /// [`weak_vote_digest`] of it.
    pub strong: bool,
    pub finalizer_key: BlsPublicKey,
    pub signature: BlsSignature,
}

/// An aggregate quorum certificate over one block.
///
/// Carries the union of strong and weak voter sets; whether the certificate
/// is *strong* depends on the weights those sets select out of the active
/// finalizer policy.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QuorumCertificate {
    /// The block the certificate covers.
    pub block_num: BlockNum,
    /// Aggregate of all vote signatures (strong and weak).
    pub signature: BlsSignature,
    /// Finalizers that voted strong.
    pub strong_votes: SignerBitfield,
    /// Finalizers that voted weak, if any.
    pub weak_votes: Option<SignerBitfield>,
}

impl QuorumCertificate {
    /// Weight of the strong voters under `policy`.
    pub fn strong_weight(&self, policy: &FinalizerPolicy) -> u64 {
        policy.weight_of(&self.strong_votes)
    }

    /// Combined strong + weak weight under `policy`.
    pub fn total_weight(&self, policy: &FinalizerPolicy) -> u64 {
        let weak = self
            .weak_votes
            .as_ref()
            .map(|w| policy.weight_of(w))
            .unwrap_or(0);
        self.strong_weight(policy) + weak
    }

    /// Strong certificate: strong votes alone reach the policy threshold.
    pub fn is_strong(&self, policy: &FinalizerPolicy) -> bool {
        self.strong_weight(policy) >= policy.threshold
    }

    /// Valid certificate of either strength: the combined voter weight
    /// reaches the policy threshold.
    pub fn reaches_quorum(&self, policy: &FinalizerPolicy) -> bool {
        self.total_weight(policy) >= policy.threshold
    }

    /// The claim this certificate substantiates.
    pub fn to_claim(&self, policy: &FinalizerPolicy) -> QcClaim {
        QcClaim {
            block_num: self.block_num,
            is_strong_qc: self.is_strong(policy),
        }
    }

    /// Cryptographically verify the aggregate signature against the policy
    /// and the block's finality digest, and check that the voter sets reach
    /// quorum. A finalizer appearing in both sets is rejected.
    pub fn verify(&self, policy: &FinalizerPolicy, strong_digest: &Digest) -> bool {
        if let Some(weak) = &self.weak_votes {
            if weak.intersects(&self.strong_votes) {
                return false;
            }
        }
        if !self.reaches_quorum(policy) {
            return false;
        }

        let weak_digest = weak_vote_digest(strong_digest);
        let mut pairs: Vec<(BlsPublicKey, &[u8])> = Vec::new();
        for key in policy.keys_for(&self.strong_votes) {
            pairs.push((key, strong_digest.as_bytes()));
        }
        if let Some(weak) = &self.weak_votes {
            for key in policy.keys_for(weak) {
                pairs.push((key, weak_digest.as_bytes()));
            }
        }
        self.signature.verify_messages(&pairs)
    }
}
