//! Block headers, signed blocks and their typed extensions.

use crate::crypto::BlsSignature;
use crate::hash::Digest;
use crate::ids::{AccountName, BlockId};
use crate::policy::FinalizerPolicyDiff;
use crate::qc::{QcClaim, QuorumCertificate};
use crate::schedule::ProducerSchedule;
use crate::time::BlockTimestamp;
use crate::transaction::TransactionReceipt;
use crate::BlockNum;
use sbor::prelude::*;

/// Typed header extensions.
///
/// The legacy regime uses `ProtocolFeatures` and the header-level
/// `new_producers` field; instant finality carries everything else in the
/// `Finality` extension.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum HeaderExtension {
    /// Protocol feature digests activated by this block.
    ProtocolFeatures(Vec<Digest>),
    /// Instant-finality header data.
    Finality(FinalityExtension),
}

/// The instant-finality header extension: the block's QC claim plus any
/// policy changes proposed in this block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalityExtension {
    /// Most recent ancestor with a known QC, as claimed by the producer.
    pub qc_claim: QcClaim,
    /// Proposed finalizer policy change, diffed against the prior proposal
    /// base.
    pub new_finalizer_policy_diff: Option<FinalizerPolicyDiff>,
    /// Proposed proposer schedule change.
    pub new_proposer_schedule: Option<ProducerSchedule>,
}

/// Typed block-level extensions (data that travels with the block body, not
/// the header).
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum BlockExtension {
    /// The aggregate certificate substantiating the header's QC claim.
    Qc(QuorumCertificate),
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeader {
    pub previous: BlockId,
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    /// Legacy confirmation count; always zero under instant finality.
    pub confirmed: u16,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    pub schedule_version: u32,
    /// Legacy promoted-schedule announcement (DPoS only).
    pub new_producers: Option<ProducerSchedule>,
    pub header_extensions: Vec<HeaderExtension>,
}

impl BlockHeader {
    /// Height of this block.
    pub fn block_num(&self) -> BlockNum {
        self.previous.block_num() + 1
    }

    /// The digest producers sign.
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }

    /// Block id: the header digest with the height stamped into the prefix.
    pub fn calculate_id(&self) -> BlockId {
        BlockId::from_digest(self.block_num(), self.digest())
    }

    /// The finality extension, if this is an instant-finality block.
    pub fn finality_extension(&self) -> Option<&FinalityExtension> {
        self.header_extensions.iter().find_map(|ext| match ext {
            HeaderExtension::Finality(f) => Some(f),
            _ => None,
        })
    }

    /// Protocol feature digests activated by this block.
    pub fn new_protocol_features(&self) -> &[Digest] {
        self.header_extensions
            .iter()
            .find_map(|ext| match ext {
                HeaderExtension::ProtocolFeatures(digests) => Some(digests.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// A signed block: header, producer signature, transaction receipts and
/// block extensions.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: BlsSignature,
    pub transactions: Vec<TransactionReceipt>,
    pub block_extensions: Vec<BlockExtension>,
}

impl SignedBlock {
    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    pub fn calculate_id(&self) -> BlockId {
        self.header.calculate_id()
    }

    /// The QC carried by this block, if any.
    pub fn qc_extension(&self) -> Option<&QuorumCertificate> {
        self.block_extensions.iter().find_map(|ext| match ext {
            BlockExtension::Qc(qc) => Some(qc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256;

    fn header() -> BlockHeader {
        BlockHeader {
            previous: BlockId::from_digest(41, sha256(b"parent")),
            timestamp: BlockTimestamp(100),
            producer: AccountName::new("prod.a"),
            confirmed: 0,
            transaction_mroot: Digest::ZERO,
            action_mroot: sha256(b"actions"),
            schedule_version: 1,
            new_producers: None,
            header_extensions: vec![HeaderExtension::Finality(FinalityExtension {
                qc_claim: QcClaim { block_num: 41, is_strong_qc: true },
                new_finalizer_policy_diff: None,
                new_proposer_schedule: None,
            })],
        }
    }

    #[test]
    fn id_embeds_height() {
        let h = header();
        assert_eq!(h.block_num(), 42);
        assert_eq!(h.calculate_id().block_num(), 42);
    }

    #[test]
    fn id_commits_to_header_contents() {
        let a = header();
        let mut b = header();
        b.action_mroot = sha256(b"other actions");
        assert_ne!(a.calculate_id(), b.calculate_id());
    }

    #[test]
    fn finality_extension_lookup() {
        let h = header();
        assert_eq!(
            h.finality_extension().unwrap().qc_claim,
            QcClaim { block_num: 41, is_strong_qc: true }
        );
        assert!(h.new_protocol_features().is_empty());
    }
}
