//! Contracts the controller imposes on its collaborators.
//!
//! Contract execution, resource accounting and the permission graph are
//! external to the block-processing core; these traits are the seams the
//! core consumes them through. The null implementations keep a controller
//! runnable (and testable) without any of them attached.

use std::sync::Arc;
use veldt_store::{Database, SnapshotSection};
use veldt_types::{
    AccountName, ActionData, BlockId, BlockNum, BlockTimestamp, BlsPublicKey, PermissionLevel,
    SignedBlock,
};

/// Execution context handed to the VM seam for each action.
#[derive(Debug)]
pub struct ApplyContext {
    pub receiver: AccountName,
    pub block_num: BlockNum,
    pub block_time: BlockTimestamp,
    /// Monotonic sequence assigned to this action.
    pub global_sequence: u64,
    /// Receiver's receive-sequence counter.
    pub recv_sequence: u64,
}

/// The virtual-machine seam: executes one action against the store.
///
/// An `Err` is an objective transaction failure; the controller reverses
/// the transaction's partial effects through the restore point.
pub trait ActionExecutor {
    fn apply(
        &self,
        db: &mut Database,
        action: &ActionData,
        context: &ApplyContext,
    ) -> std::result::Result<Vec<u8>, String>;
}

/// Executor that accepts every action and returns nothing; stands in for
/// the VM when only the pipeline itself is under test.
#[derive(Debug, Default)]
pub struct NullExecutor;

impl ActionExecutor for NullExecutor {
    fn apply(
        &self,
        _db: &mut Database,
        _action: &ActionData,
        _context: &ApplyContext,
    ) -> std::result::Result<Vec<u8>, String> {
        Ok(Vec::new())
    }
}

/// The resource/CPU/NET bookkeeping seam.
pub trait ResourceLedger {
    fn add_transaction_usage(
        &mut self,
        accounts: &[AccountName],
        cpu_us: u64,
        net_bytes: u64,
        slot: u32,
    ) -> std::result::Result<(), String>;

    fn add_pending_ram_usage(&mut self, account: AccountName, delta: i64);

    fn verify_account_ram_usage(&self, account: AccountName) -> std::result::Result<(), String>;

    fn process_block_usage(&mut self, block_num: BlockNum);

    fn set_block_parameters(&mut self, max_block_cpu_us: u32, max_block_net: u64);

    fn update_account_usage(&mut self, accounts: &[AccountName], slot: u32);

    /// Rows for the resource-limits snapshot section.
    fn snapshot_section(&self) -> SnapshotSection {
        SnapshotSection { name: "resource_limits".to_string(), rows: Vec::new() }
    }
}

/// Ledger that accepts all usage without accounting.
#[derive(Debug, Default)]
pub struct NullResourceLedger;

impl ResourceLedger for NullResourceLedger {
    fn add_transaction_usage(
        &mut self,
        _accounts: &[AccountName],
        _cpu_us: u64,
        _net_bytes: u64,
        _slot: u32,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn add_pending_ram_usage(&mut self, _account: AccountName, _delta: i64) {}

    fn verify_account_ram_usage(&self, _account: AccountName) -> std::result::Result<(), String> {
        Ok(())
    }

    fn process_block_usage(&mut self, _block_num: BlockNum) {}

    fn set_block_parameters(&mut self, _max_block_cpu_us: u32, _max_block_net: u64) {}

    fn update_account_usage(&mut self, _accounts: &[AccountName], _slot: u32) {}
}

/// The authority/permission graph seam.
pub trait AuthorizationProvider {
    /// Check that `provided_keys` satisfy every authorization declared by
    /// `actions`. An `Err` is an objective transaction failure.
    fn check_authorization(
        &self,
        actions: &[ActionData],
        provided_keys: &[BlsPublicKey],
        provided_permissions: &[PermissionLevel],
        allow_unused_keys: bool,
        is_dry_run: bool,
    ) -> std::result::Result<(), String>;

    /// Install or replace a named producer-controlled permission with an
    /// account-list authority at the given threshold.
    fn set_producers_authority(
        &mut self,
        permission: AccountName,
        threshold: u32,
        accounts: &[AccountName],
    );

    /// Rows for the authorization snapshot section.
    fn snapshot_section(&self) -> SnapshotSection {
        SnapshotSection { name: "authorization".to_string(), rows: Vec::new() }
    }
}

/// Authorization provider that approves everything.
#[derive(Debug, Default)]
pub struct PermissiveAuthorization;

impl AuthorizationProvider for PermissiveAuthorization {
    fn check_authorization(
        &self,
        _actions: &[ActionData],
        _provided_keys: &[BlsPublicKey],
        _provided_permissions: &[PermissionLevel],
        _allow_unused_keys: bool,
        _is_dry_run: bool,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn set_producers_authority(
        &mut self,
        _permission: AccountName,
        _threshold: u32,
        _accounts: &[AccountName],
    ) {
    }
}

/// The append-only block log. The head of the log is the fork-database
/// root: everything in the log is irreversible.
pub trait BlockLog {
    fn head(&self) -> Option<Arc<SignedBlock>>;
    fn head_id(&self) -> Option<BlockId>;
    /// First block number the log holds (one past a pruned prefix).
    fn first_block_num(&self) -> BlockNum;
    fn read_block_by_num(&self, block_num: BlockNum) -> Option<Arc<SignedBlock>>;
    /// Append an irreversible block with its pre-serialized bytes.
    fn append(
        &mut self,
        block: Arc<SignedBlock>,
        id: BlockId,
        packed: Vec<u8>,
    ) -> std::result::Result<(), String>;
    /// Reinitialize to start at `first_block_num` with nothing stored.
    fn reset(&mut self, first_block_num: BlockNum);
}

/// In-memory block log.
#[derive(Debug, Default)]
pub struct InMemoryBlockLog {
    first_block_num: BlockNum,
    blocks: Vec<(BlockId, Arc<SignedBlock>, Vec<u8>)>,
}

impl InMemoryBlockLog {
    pub fn new(first_block_num: BlockNum) -> Self {
        InMemoryBlockLog { first_block_num, blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockLog for InMemoryBlockLog {
    fn head(&self) -> Option<Arc<SignedBlock>> {
        self.blocks.last().map(|(_, block, _)| block.clone())
    }

    fn head_id(&self) -> Option<BlockId> {
        self.blocks.last().map(|(id, _, _)| *id)
    }

    fn first_block_num(&self) -> BlockNum {
        self.first_block_num
    }

    fn read_block_by_num(&self, block_num: BlockNum) -> Option<Arc<SignedBlock>> {
        if block_num < self.first_block_num {
            return None;
        }
        let index = (block_num - self.first_block_num) as usize;
        self.blocks.get(index).map(|(_, block, _)| block.clone())
    }

    fn append(
        &mut self,
        block: Arc<SignedBlock>,
        id: BlockId,
        packed: Vec<u8>,
    ) -> std::result::Result<(), String> {
        let expected = self.first_block_num + self.blocks.len() as BlockNum;
        if block.block_num() != expected {
            return Err(format!(
                "block log append out of order: got {}, expected {}",
                block.block_num(),
                expected
            ));
        }
        self.blocks.push((id, block, packed));
        Ok(())
    }

    fn reset(&mut self, first_block_num: BlockNum) {
        self.first_block_num = first_block_num;
        self.blocks.clear();
    }
}

/// Convenience bundle of boxed collaborator implementations.
pub struct Collaborators {
    pub executor: Box<dyn ActionExecutor>,
    pub resources: Box<dyn ResourceLedger>,
    pub authorization: Box<dyn AuthorizationProvider>,
    pub block_log: Box<dyn BlockLog>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            executor: Box::new(NullExecutor),
            resources: Box::new(NullResourceLedger),
            authorization: Box::new(PermissiveAuthorization),
            block_log: Box::new(InMemoryBlockLog::default()),
        }
    }
}
