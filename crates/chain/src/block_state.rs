//! Block states: a signed block paired with its header state.

use crate::header_state::{LegacyBlockHeaderState, SavannaBlockHeaderState};
use std::sync::Arc;
use veldt_fork_db::ForkNode;
use veldt_types::{
    AccountName, BlockId, BlockNum, BlockTimestamp, Digest, ProducerSchedule, SignedBlock,
};

/// A block under delegated production.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyBlockState {
    pub header_state: LegacyBlockHeaderState,
    pub block: Arc<SignedBlock>,
}

/// A block under instant finality.
#[derive(Debug, Clone, PartialEq)]
pub struct SavannaBlockState {
    pub header_state: SavannaBlockHeaderState,
    pub block: Arc<SignedBlock>,
}

/// A block state of either regime. The fork database holds these; the
/// transition block (the first savanna block) links to a legacy parent
/// within the same DAG.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStateVariant {
    Legacy(Arc<LegacyBlockState>),
    Savanna(Arc<SavannaBlockState>),
}

impl BlockStateVariant {
    pub fn id(&self) -> BlockId {
        match self {
            BlockStateVariant::Legacy(state) => state.header_state.id,
            BlockStateVariant::Savanna(state) => state.header_state.id,
        }
    }

    pub fn previous(&self) -> BlockId {
        match self {
            BlockStateVariant::Legacy(state) => state.header_state.header.previous,
            BlockStateVariant::Savanna(state) => state.header_state.header.previous,
        }
    }

    pub fn block_num(&self) -> BlockNum {
        self.id().block_num()
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        match self {
            BlockStateVariant::Legacy(state) => state.header_state.timestamp(),
            BlockStateVariant::Savanna(state) => state.header_state.timestamp(),
        }
    }

    pub fn producer(&self) -> AccountName {
        match self {
            BlockStateVariant::Legacy(state) => state.header_state.header.producer,
            BlockStateVariant::Savanna(state) => state.header_state.header.producer,
        }
    }

    pub fn block(&self) -> &Arc<SignedBlock> {
        match self {
            BlockStateVariant::Legacy(state) => &state.block,
            BlockStateVariant::Savanna(state) => &state.block,
        }
    }

    pub fn is_savanna(&self) -> bool {
        matches!(self, BlockStateVariant::Savanna(_))
    }

    /// Irreversibility from delegated-production counting. Frozen at its
    /// last legacy value once instant finality takes over.
    pub fn dpos_irreversible_blocknum(&self) -> BlockNum {
        match self {
            BlockStateVariant::Legacy(state) => state.header_state.dpos_irreversible_blocknum,
            BlockStateVariant::Savanna(state) => state.header_state.legacy_irreversible_blocknum,
        }
    }

    /// Irreversibility from the two-chain commit rule; zero before the
    /// transition.
    pub fn instant_finality_irreversible_blocknum(&self) -> BlockNum {
        match self {
            BlockStateVariant::Legacy(_) => 0,
            BlockStateVariant::Savanna(state) => state.header_state.core.last_final_block_num(),
        }
    }

    /// The producer schedule blocks are currently validated against.
    pub fn active_schedule(&self) -> &ProducerSchedule {
        match self {
            BlockStateVariant::Legacy(state) => &state.header_state.active_schedule,
            BlockStateVariant::Savanna(state) => &state.header_state.active_proposer_schedule,
        }
    }

    /// The schedule promoted but not yet active, if any.
    pub fn pending_schedule(&self) -> Option<&ProducerSchedule> {
        match self {
            BlockStateVariant::Legacy(state) => {
                state.header_state.pending_schedule.as_ref().map(|p| &p.schedule)
            }
            BlockStateVariant::Savanna(state) => {
                state.header_state.pending_proposer_schedule.as_ref().map(|(_, s)| s)
            }
        }
    }

    pub fn activated_protocol_features(&self) -> &[Digest] {
        match self {
            BlockStateVariant::Legacy(state) => &state.header_state.activated_protocol_features,
            BlockStateVariant::Savanna(state) => &state.header_state.activated_protocol_features,
        }
    }

    /// The finality digest finalizers vote on; savanna blocks only.
    pub fn finality_digest(&self) -> Option<Digest> {
        match self {
            BlockStateVariant::Legacy(_) => None,
            BlockStateVariant::Savanna(state) => Some(state.header_state.finality_digest),
        }
    }

    pub fn as_savanna(&self) -> Option<&Arc<SavannaBlockState>> {
        match self {
            BlockStateVariant::Savanna(state) => Some(state),
            BlockStateVariant::Legacy(_) => None,
        }
    }

    pub fn as_legacy(&self) -> Option<&Arc<LegacyBlockState>> {
        match self {
            BlockStateVariant::Legacy(state) => Some(state),
            BlockStateVariant::Savanna(_) => None,
        }
    }
}

impl ForkNode for BlockStateVariant {
    fn id(&self) -> BlockId {
        BlockStateVariant::id(self)
    }

    fn previous(&self) -> BlockId {
        BlockStateVariant::previous(self)
    }

    fn timestamp(&self) -> BlockTimestamp {
        BlockStateVariant::timestamp(self)
    }
}
