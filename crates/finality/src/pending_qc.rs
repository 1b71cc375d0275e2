//! Vote accumulation toward a quorum certificate.

use std::sync::Arc;
use tracing::{debug, trace};
use veldt_types::{
    weak_vote_digest, BlockNum, BlsSignature, Digest, FinalizerPolicy, QuorumCertificate,
    SignerBitfield, VoteMessage,
};

/// Outcome of processing one vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    /// Vote accepted and accumulated.
    Success,
    /// The voting key is not in the finalizer policy.
    UnknownPublicKey,
    /// The voted block is not known to this node.
    UnknownBlock,
    /// The signature does not verify against the claimed key.
    InvalidSignature,
    /// This finalizer already voted on this block.
    Duplicate,
}

/// Accumulates votes on one block's finality digest until quorum.
///
/// Mutated only from the controller thread; once quorum is met,
/// [`PendingQc::extract_qc`] aggregates the collected signatures into a
/// certificate. Further votes keep accumulating — a weak quorum can still
/// upgrade to a strong one.
#[derive(Debug, Clone)]
pub struct PendingQc {
    block_num: BlockNum,
    /// The digest strong votes sign.
    finality_digest: Digest,
    policy: Arc<FinalizerPolicy>,
    strong_votes: SignerBitfield,
    weak_votes: SignerBitfield,
    strong_weight: u64,
    weak_weight: u64,
    /// One signature slot per policy position.
    signatures: Vec<Option<BlsSignature>>,
}

impl PendingQc {
    pub fn new(block_num: BlockNum, finality_digest: Digest, policy: Arc<FinalizerPolicy>) -> Self {
        let width = policy.finalizers.len();
        PendingQc {
            block_num,
            finality_digest,
            policy,
            strong_votes: SignerBitfield::new(width),
            weak_votes: SignerBitfield::new(width),
            strong_weight: 0,
            weak_weight: 0,
            signatures: vec![None; width],
        }
    }

    pub fn block_num(&self) -> BlockNum {
        self.block_num
    }

    pub fn finality_digest(&self) -> &Digest {
        &self.finality_digest
    }

    /// Process one vote: resolve the key against the policy, verify the
    /// signature over the strong or weak digest, and accumulate weight.
    pub fn add_vote(&mut self, vote: &VoteMessage) -> VoteStatus {
        let Some(index) = self.policy.index_of(&vote.finalizer_key) else {
            debug!(block_num = self.block_num, key = ?vote.finalizer_key, "vote from unknown key");
            return VoteStatus::UnknownPublicKey;
        };
        if self.strong_votes.test(index) || self.weak_votes.test(index) {
            return VoteStatus::Duplicate;
        }

        let digest = if vote.strong {
            self.finality_digest
        } else {
            weak_vote_digest(&self.finality_digest)
        };
        if !vote.finalizer_key.verify(digest.as_bytes(), &vote.signature) {
            debug!(block_num = self.block_num, index, "vote signature failed verification");
            return VoteStatus::InvalidSignature;
        }

        let weight = self.policy.finalizers[index].weight;
        if vote.strong {
            self.strong_votes.set(index);
            self.strong_weight += weight;
        } else {
            self.weak_votes.set(index);
            self.weak_weight += weight;
        }
        self.signatures[index] = Some(vote.signature);
        trace!(
            block_num = self.block_num,
            index,
            strong = vote.strong,
            strong_weight = self.strong_weight,
            weak_weight = self.weak_weight,
            "vote accumulated"
        );
        VoteStatus::Success
    }

    /// True once strong votes alone reach the policy threshold.
    pub fn is_strong_quorum_met(&self) -> bool {
        self.strong_weight >= self.policy.threshold
    }

    /// True once strong plus weak votes reach the policy threshold.
    pub fn is_quorum_met(&self) -> bool {
        self.strong_weight + self.weak_weight >= self.policy.threshold
    }

    /// Aggregate the collected votes into a certificate, if quorum was met.
    pub fn extract_qc(&self) -> Option<QuorumCertificate> {
        if !self.is_quorum_met() {
            return None;
        }
        let sigs = self.signatures.iter().flatten();
        let signature = BlsSignature::aggregate(sigs).ok()?;
        let weak_votes =
            if self.weak_votes.count_ones() > 0 { Some(self.weak_votes.clone()) } else { None };
        Some(QuorumCertificate {
            block_num: self.block_num,
            signature,
            strong_votes: self.strong_votes.clone(),
            weak_votes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veldt_types::{sha256, BlsKeyPair, FinalizerAuthority};

    fn fixture(n: u8) -> (Arc<FinalizerPolicy>, Vec<BlsKeyPair>, Digest) {
        let keys: Vec<_> = (0..n).map(|i| BlsKeyPair::from_seed(&[i + 1; 32]).unwrap()).collect();
        let policy = FinalizerPolicy::new(
            1,
            keys.iter()
                .enumerate()
                .map(|(i, kp)| FinalizerAuthority {
                    description: format!("node{i}"),
                    weight: 1,
                    public_key: kp.public_key(),
                })
                .collect(),
        );
        (Arc::new(policy), keys, sha256(b"finality digest"))
    }

    fn vote(keys: &[BlsKeyPair], digest: &Digest, index: usize, strong: bool) -> VoteMessage {
        let signed = if strong { *digest } else { weak_vote_digest(digest) };
        VoteMessage {
            block_id: veldt_types::BlockId::from_digest(4, *digest),
            strong,
            finalizer_key: keys[index].public_key(),
            signature: keys[index].sign(signed.as_bytes()),
        }
    }

    #[test]
    fn quorum_of_strong_votes_yields_strong_qc() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy.clone());
        for i in 0..3 {
            assert_eq!(pending.add_vote(&vote(&keys, &digest, i, true)), VoteStatus::Success);
        }
        assert!(pending.is_strong_quorum_met());
        let qc = pending.extract_qc().unwrap();
        assert!(qc.is_strong(&policy));
        assert!(qc.verify(&policy, &digest));
    }

    #[test]
    fn quorum_minus_one_yields_nothing() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy);
        for i in 0..2 {
            pending.add_vote(&vote(&keys, &digest, i, true));
        }
        assert!(!pending.is_quorum_met());
        assert!(pending.extract_qc().is_none());
    }

    #[test]
    fn weak_votes_complete_only_a_weak_quorum() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy.clone());
        pending.add_vote(&vote(&keys, &digest, 0, true));
        pending.add_vote(&vote(&keys, &digest, 1, true));
        pending.add_vote(&vote(&keys, &digest, 2, false));
        assert!(pending.is_quorum_met());
        assert!(!pending.is_strong_quorum_met());
        let qc = pending.extract_qc().unwrap();
        assert!(!qc.is_strong(&policy));
        assert!(qc.verify(&policy, &digest));
    }

    #[test]
    fn weak_quorum_upgrades_to_strong_with_more_votes() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy.clone());
        pending.add_vote(&vote(&keys, &digest, 0, true));
        pending.add_vote(&vote(&keys, &digest, 1, true));
        pending.add_vote(&vote(&keys, &digest, 2, false));
        assert!(!pending.is_strong_quorum_met());
        pending.add_vote(&vote(&keys, &digest, 3, true));
        assert!(pending.is_strong_quorum_met());
        let qc = pending.extract_qc().unwrap();
        assert!(qc.is_strong(&policy));
        assert!(qc.verify(&policy, &digest));
    }

    #[test]
    fn duplicates_and_unknown_keys_are_rejected() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy);
        assert_eq!(pending.add_vote(&vote(&keys, &digest, 0, true)), VoteStatus::Success);
        assert_eq!(pending.add_vote(&vote(&keys, &digest, 0, true)), VoteStatus::Duplicate);
        // Same finalizer voting weak after strong is also a duplicate.
        assert_eq!(pending.add_vote(&vote(&keys, &digest, 0, false)), VoteStatus::Duplicate);

        let outsider = BlsKeyPair::from_seed(&[99; 32]).unwrap();
        let mut rogue = vote(&keys, &digest, 1, true);
        rogue.finalizer_key = outsider.public_key();
        rogue.signature = outsider.sign(digest.as_bytes());
        assert_eq!(pending.add_vote(&rogue), VoteStatus::UnknownPublicKey);
    }

    #[test]
    fn corrupted_signature_is_rejected_and_not_counted() {
        let (policy, keys, digest) = fixture(4);
        let mut pending = PendingQc::new(4, digest, policy);
        let mut bad = vote(&keys, &digest, 0, true);
        bad.signature = BlsSignature::NULL;
        assert_eq!(pending.add_vote(&bad), VoteStatus::InvalidSignature);
        assert!(!pending.strong_votes.test(0));
        // The finalizer can still vote correctly afterwards.
        assert_eq!(pending.add_vote(&vote(&keys, &digest, 0, true)), VoteStatus::Success);
    }
}
