//! Row types held by the controller's state store.

use sbor::prelude::*;
use serde::Deserialize;
use veldt_types::{
    AccountName, BlockNum, BlockTimestamp, Digest, PackedTransaction, ProducerSchedule,
    TransactionId,
};

use crate::undo::UndoMap;

/// Per-account metadata the controller itself maintains.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct AccountMetadata {
    pub name: AccountName,
    pub privileged: bool,
    pub creation_time: BlockTimestamp,
}

/// Consensus resource limits, stored in the global property row and
/// adjustable by privileged contracts.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor, Deserialize)]
pub struct ChainLimits {
    pub max_block_net_usage: u64,
    pub max_block_cpu_usage_us: u32,
    pub max_transaction_net_usage: u32,
    pub max_transaction_cpu_usage_us: u32,
    pub min_transaction_cpu_usage_us: u32,
    /// Maximum seconds a transaction's expiration may sit in the future.
    pub max_transaction_lifetime_sec: u32,
    pub max_transaction_delay_sec: u32,
}

impl Default for ChainLimits {
    fn default() -> Self {
        ChainLimits {
            max_block_net_usage: 1024 * 1024,
            max_block_cpu_usage_us: 200_000,
            max_transaction_net_usage: 512 * 1024,
            max_transaction_cpu_usage_us: 150_000,
            min_transaction_cpu_usage_us: 100,
            max_transaction_lifetime_sec: 3600,
            max_transaction_delay_sec: 45 * 24 * 3600,
        }
    }
}

/// The singleton global property row.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct GlobalPropertyState {
    pub chain_id: Digest,
    pub configuration: ChainLimits,
    /// Block in which the currently proposed producer schedule was proposed,
    /// if one is in flight.
    pub proposed_schedule_block_num: Option<BlockNum>,
    pub proposed_schedule: ProducerSchedule,
}

impl Default for GlobalPropertyState {
    fn default() -> Self {
        GlobalPropertyState {
            chain_id: Digest::ZERO,
            configuration: ChainLimits::default(),
            proposed_schedule_block_num: None,
            proposed_schedule: ProducerSchedule::default(),
        }
    }
}

/// The singleton protocol state row: feature preactivation and activation.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ProtocolState {
    /// Digests preactivated but not yet consumed by a block start.
    pub preactivated_features: Vec<Digest>,
    /// Digest and activating block number, in activation order.
    pub activated_features: Vec<(Digest, BlockNum)>,
}

impl ProtocolState {
    pub fn is_activated(&self, digest: &Digest) -> bool {
        self.activated_features.iter().any(|(d, _)| d == digest)
    }

    pub fn is_preactivated(&self, digest: &Digest) -> bool {
        self.preactivated_features.contains(digest)
    }
}

/// The singleton dynamic global property row.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct DynamicGlobalProperties {
    /// Monotonic sequence over all executed actions.
    pub global_action_sequence: u64,
    /// Per-chain receive sequence for the system account.
    pub system_recv_sequence: u64,
}

/// A deferred transaction awaiting its delay window.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct GeneratedTransaction {
    pub trx_id: TransactionId,
    pub sender: AccountName,
    pub sender_id: u128,
    pub payer: AccountName,
    pub delay_until: BlockTimestamp,
    pub expiration: BlockTimestamp,
    pub published: BlockTimestamp,
    pub packed: PackedTransaction,
}

/// Identifier of a contract table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
#[sbor(transparent)]
pub struct TableId(pub u64);

/// Contract table metadata.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct TableMeta {
    pub code: AccountName,
    pub scope: AccountName,
    pub table: AccountName,
    pub payer: AccountName,
    pub count: u32,
}

/// Contract table storage: primary rows plus the six secondary index
/// flavors, all undo-tracked. Contract *execution* lives behind the VM
/// seam; the store only persists what executed contracts wrote.
#[derive(Debug, Clone, Default)]
pub struct ContractTables {
    pub tables: UndoMap<TableId, TableMeta>,
    pub rows: UndoMap<(TableId, u64), Vec<u8>>,
    pub idx64: UndoMap<(TableId, u64), u64>,
    pub idx128: UndoMap<(TableId, u64), u128>,
    pub idx256: UndoMap<(TableId, u64), [u8; 32]>,
    /// IEEE-754 doubles, stored by bit pattern so ordering is byte-stable.
    pub idx_double: UndoMap<(TableId, u64), u64>,
    /// Extended-precision floats, stored as raw bytes.
    pub idx_long_double: UndoMap<(TableId, u64), [u8; 16]>,
}
