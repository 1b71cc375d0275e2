//! The block stage machine: `building → assembled → completed`.
//!
//! Each stage is a sum type over the two regime flavors. Transitions are
//! linear and one-way inside one pending state; `abort_block` destroys the
//! whole pending state at any stage.

use crate::error::{ChainError, Result};
use crate::header_state::{LegacyBlockHeaderState, SavannaBlockHeaderState};
use crate::block_state::BlockStateVariant;
use std::sync::Arc;
use veldt_store::UndoSession;
use veldt_types::{
    AccountName, BlockId, BlockTimestamp, Digest, FinalizerPolicy, ProducerSchedule,
    QuorumCertificate, SignedBlock, TransactionMetadata, TransactionReceipt,
};

/// Provenance of the block being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Replayed from the block log; known irreversible.
    Irreversible,
    /// Pushed block that this node validated before (fork switches).
    Validated,
    /// Pushed block seen complete for the first time.
    Complete,
    /// A block this node is producing.
    Incomplete,
    /// A throwaway speculative block (read-only execution window).
    Ephemeral,
}

impl BlockStatus {
    /// True when the block's content is dictated by a producer and this
    /// node merely validates; subjective failures escalate to objective.
    pub fn is_validation(self) -> bool {
        matches!(self, BlockStatus::Irreversible | BlockStatus::Validated | BlockStatus::Complete)
    }
}

/// Where the transaction merkle comes from: accumulated receipt digests
/// (producing) or the value dictated by the received block (validating).
#[derive(Debug, Clone)]
pub enum TrxMrootSource {
    Digests(Vec<Digest>),
    Provided(Digest),
}

/// Sizes of the building block's four accumulation containers, captured
/// before a transaction applies so a failure can truncate back.
#[derive(Debug, Clone, Copy)]
pub struct BlockRestorePoint {
    receipts: usize,
    trx_metas: usize,
    trx_receipt_digests: usize,
    action_receipt_digests: usize,
}

/// State shared by both building flavors.
#[derive(Debug)]
pub struct BuildingBlockCommon {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    pub new_protocol_features: Vec<Digest>,
    pub pending_trx_metas: Vec<Arc<TransactionMetadata>>,
    pub pending_trx_receipts: Vec<TransactionReceipt>,
    pub trx_mroot_source: TrxMrootSource,
    pub action_receipt_digests: Vec<Digest>,
}

impl BuildingBlockCommon {
    pub fn new(timestamp: BlockTimestamp, producer: AccountName, new_features: Vec<Digest>) -> Self {
        BuildingBlockCommon {
            timestamp,
            producer,
            new_protocol_features: new_features,
            pending_trx_metas: Vec::new(),
            pending_trx_receipts: Vec::new(),
            trx_mroot_source: TrxMrootSource::Digests(Vec::new()),
            action_receipt_digests: Vec::new(),
        }
    }

    /// Capture the current container sizes.
    pub fn make_restore_point(&self) -> BlockRestorePoint {
        BlockRestorePoint {
            receipts: self.pending_trx_receipts.len(),
            trx_metas: self.pending_trx_metas.len(),
            trx_receipt_digests: match &self.trx_mroot_source {
                TrxMrootSource::Digests(digests) => digests.len(),
                TrxMrootSource::Provided(_) => 0,
            },
            action_receipt_digests: self.action_receipt_digests.len(),
        }
    }

    /// Truncate every container back to a restore point, reversing a
    /// partially applied transaction's contributions.
    pub fn restore(&mut self, point: BlockRestorePoint) {
        self.pending_trx_receipts.truncate(point.receipts);
        self.pending_trx_metas.truncate(point.trx_metas);
        if let TrxMrootSource::Digests(digests) = &mut self.trx_mroot_source {
            digests.truncate(point.trx_receipt_digests);
        }
        self.action_receipt_digests.truncate(point.action_receipt_digests);
    }

    /// Record a receipt and its merkle contribution.
    pub fn push_receipt(&mut self, receipt: TransactionReceipt) {
        if let TrxMrootSource::Digests(digests) = &mut self.trx_mroot_source {
            digests.push(receipt.digest());
        }
        self.pending_trx_receipts.push(receipt);
    }
}

/// Building block under delegated production.
#[derive(Debug)]
pub struct BuildingBlockDpos {
    pub common: BuildingBlockCommon,
    pub parent: LegacyBlockHeaderState,
    pub confirmed: u16,
    /// Proposed schedule promoted to pending at block start, if any.
    pub new_pending_producer_schedule: Option<ProducerSchedule>,
    /// First finalizer policy, set through `set_proposed_finalizers`.
    /// Turns this block into the instant-finality genesis at assembly.
    pub proposed_finalizer_policy: Option<FinalizerPolicy>,
}

/// Building block under instant finality.
#[derive(Debug)]
pub struct BuildingBlockIf {
    pub common: BuildingBlockCommon,
    pub parent: SavannaBlockHeaderState,
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    pub new_proposer_schedule: Option<ProducerSchedule>,
}

/// The building stage.
#[derive(Debug)]
pub enum BuildingBlock {
    Dpos(BuildingBlockDpos),
    If(BuildingBlockIf),
}

impl BuildingBlock {
    pub fn common(&self) -> &BuildingBlockCommon {
        match self {
            BuildingBlock::Dpos(bb) => &bb.common,
            BuildingBlock::If(bb) => &bb.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut BuildingBlockCommon {
        match self {
            BuildingBlock::Dpos(bb) => &mut bb.common,
            BuildingBlock::If(bb) => &mut bb.common,
        }
    }

    pub fn block_num(&self) -> u32 {
        match self {
            BuildingBlock::Dpos(bb) => bb.parent.block_num() + 1,
            BuildingBlock::If(bb) => bb.parent.block_num() + 1,
        }
    }

    pub fn is_protocol_feature_activated(&self, digest: &Digest) -> bool {
        let previously = match self {
            BuildingBlock::Dpos(bb) => &bb.parent.activated_protocol_features,
            BuildingBlock::If(bb) => &bb.parent.activated_protocol_features,
        };
        previously.contains(digest) || self.common().new_protocol_features.contains(digest)
    }
}

/// Assembled block under delegated production.
#[derive(Debug)]
pub struct AssembledBlockDpos {
    pub header_state: LegacyBlockHeaderState,
    pub unsigned_block: SignedBlock,
    pub trx_metas: Vec<Arc<TransactionMetadata>>,
}

/// Assembled block under instant finality. Carries the fully computed next
/// header state; signing completes it without further derivation.
#[derive(Debug)]
pub struct AssembledBlockIf {
    pub header_state: SavannaBlockHeaderState,
    pub unsigned_block: SignedBlock,
    pub trx_metas: Vec<Arc<TransactionMetadata>>,
    /// The certificate embedded in the block's extensions, if one was
    /// available at assembly.
    pub qc: Option<QuorumCertificate>,
}

/// The assembled stage.
#[derive(Debug)]
pub enum AssembledBlock {
    Dpos(AssembledBlockDpos),
    If(AssembledBlockIf),
}

impl AssembledBlock {
    pub fn id(&self) -> BlockId {
        match self {
            AssembledBlock::Dpos(ab) => ab.header_state.id,
            AssembledBlock::If(ab) => ab.header_state.id,
        }
    }

    pub fn block_num(&self) -> u32 {
        match self {
            AssembledBlock::Dpos(ab) => ab.header_state.block_num(),
            AssembledBlock::If(ab) => ab.header_state.block_num(),
        }
    }

    pub fn producer(&self) -> AccountName {
        match self {
            AssembledBlock::Dpos(ab) => ab.header_state.header.producer,
            AssembledBlock::If(ab) => ab.header_state.header.producer,
        }
    }

    /// Feature activation cannot be queried mid-assembly; callers must ask
    /// the building block before or the completed block after.
    pub fn is_protocol_feature_activated(&self, _digest: &Digest) -> Result<bool> {
        Err(ChainError::BlockValidate(
            "protocol feature activation is not queryable in the assembled stage".into(),
        ))
    }
}

/// The completed stage: a signed block with its state, ready for commit.
#[derive(Debug)]
pub struct CompletedBlock {
    pub state: BlockStateVariant,
}

/// The stage machine.
#[derive(Debug)]
pub enum BlockStage {
    Building(BuildingBlock),
    Assembled(AssembledBlock),
    Completed(CompletedBlock),
}

/// The one-at-a-time pending state: the undo session plus the stage.
pub struct PendingState {
    pub session: UndoSession,
    pub stage: BlockStage,
    pub status: BlockStatus,
    /// Id dictated by the producer when validating a received block.
    pub producer_block_id: Option<BlockId>,
    pub report: BlockReport,
}

/// Accumulated per-block statistics surfaced to callers.
#[derive(Debug, Clone, Default)]
pub struct BlockReport {
    pub total_net_usage: u64,
    pub total_cpu_usage_us: u64,
    pub transaction_count: usize,
}

impl PendingState {
    /// Applied transaction metas, handed back to callers on abort so they
    /// may retry.
    pub fn extract_trx_metas(&mut self) -> Vec<Arc<TransactionMetadata>> {
        match &mut self.stage {
            BlockStage::Building(bb) => std::mem::take(&mut bb.common_mut().pending_trx_metas),
            BlockStage::Assembled(AssembledBlock::Dpos(ab)) => std::mem::take(&mut ab.trx_metas),
            BlockStage::Assembled(AssembledBlock::If(ab)) => std::mem::take(&mut ab.trx_metas),
            BlockStage::Completed(_) => Vec::new(),
        }
    }

    pub fn block_num(&self) -> u32 {
        match &self.stage {
            BlockStage::Building(bb) => bb.block_num(),
            BlockStage::Assembled(ab) => ab.block_num(),
            BlockStage::Completed(cb) => cb.state.block_num(),
        }
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        match &self.stage {
            BlockStage::Building(bb) => bb.common().timestamp,
            BlockStage::Assembled(AssembledBlock::Dpos(ab)) => ab.header_state.timestamp(),
            BlockStage::Assembled(AssembledBlock::If(ab)) => ab.header_state.timestamp(),
            BlockStage::Completed(cb) => cb.state.timestamp(),
        }
    }

    pub fn producer(&self) -> AccountName {
        match &self.stage {
            BlockStage::Building(bb) => bb.common().producer,
            BlockStage::Assembled(ab) => ab.producer(),
            BlockStage::Completed(cb) => cb.state.producer(),
        }
    }
}
