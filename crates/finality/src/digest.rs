//! The finality digest: what finalizers sign.
//!
//! Both the chain (when producing blocks and collecting votes) and the
//! proof-of-finality verifier (when reconstructing a proven block's
//! commitment) compute this digest, so the layout lives here, in one place.

use veldt_types::{BlockNum, Digest};

/// Protocol version folded into every finality digest.
pub const FINALITY_PROTOCOL_VERSION: u32 = 1;

/// Inputs to the finality digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityDigestInputs {
    pub active_policy_generation: u32,
    pub final_on_strong_qc_block_num: BlockNum,
    /// Root over the finality leaves of all ancestors since the
    /// instant-finality genesis block.
    pub finality_mroot: Digest,
    pub active_policy_digest: Digest,
    /// Digest of the latest pending policy, when one is in flight. Folding
    /// it in commits finalizers to the upcoming policy as part of the
    /// canonical history.
    pub pending_policy_digest: Option<Digest>,
    /// Digest over the block data not individually committed above
    /// (execution results and parent binding).
    pub witness_hash: Digest,
}

impl FinalityDigestInputs {
    /// Compute the digest:
    /// `H(version ‖ generation ‖ final_num ‖ finality_mroot ‖
    ///    H(H(active_policy ‖ pending_policy?) ‖ witness_hash))`.
    pub fn compute(&self) -> Digest {
        let policy_commitment =
            Digest::hash_of(&(self.active_policy_digest, self.pending_policy_digest));
        let static_digest = Digest::hash_pair(&policy_commitment, &self.witness_hash);
        Digest::hash_of(&(
            FINALITY_PROTOCOL_VERSION,
            self.active_policy_generation,
            self.final_on_strong_qc_block_num,
            self.finality_mroot,
            static_digest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veldt_types::sha256;

    fn inputs() -> FinalityDigestInputs {
        FinalityDigestInputs {
            active_policy_generation: 1,
            final_on_strong_qc_block_num: 7,
            finality_mroot: sha256(b"mroot"),
            active_policy_digest: sha256(b"policy"),
            pending_policy_digest: None,
            witness_hash: sha256(b"witness"),
        }
    }

    #[test]
    fn digest_commits_to_every_field() {
        let base = inputs().compute();
        let mut changed = inputs();
        changed.active_policy_generation = 2;
        assert_ne!(changed.compute(), base);

        let mut changed = inputs();
        changed.final_on_strong_qc_block_num = 8;
        assert_ne!(changed.compute(), base);

        let mut changed = inputs();
        changed.pending_policy_digest = Some(sha256(b"pending"));
        assert_ne!(changed.compute(), base);

        let mut changed = inputs();
        changed.witness_hash = sha256(b"other witness");
        assert_ne!(changed.compute(), base);

        assert_eq!(inputs().compute(), base);
    }
}
