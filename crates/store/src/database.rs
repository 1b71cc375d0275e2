//! The controller's state database: typed indexes plus session management.

use crate::objects::{
    AccountMetadata, ContractTables, DynamicGlobalProperties, GeneratedTransaction,
    GlobalPropertyState, ProtocolState,
};
use crate::undo::{UndoCell, UndoLayer, UndoMap};
use thiserror::Error;
use tracing::trace;
use veldt_types::{AccountName, BlockId, BlockTimestamp, TransactionId};

/// Errors from database session management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("revision {requested} may only be set on a database with no undo stack")]
    RevisionWithUndoStack { requested: i64 },

    #[error("session revision {session} does not match database head revision {head}")]
    SessionMismatch { session: i64, head: i64 },
}

/// The in-memory state database.
///
/// All state the controller mutates per block lives in these indexes, so a
/// single session spans every index at once and whole-block atomicity falls
/// out of the undo stack.
#[derive(Debug, Default)]
pub struct Database {
    pub accounts: UndoMap<AccountName, AccountMetadata>,
    pub global: UndoCell<GlobalPropertyState>,
    pub protocol: UndoCell<ProtocolState>,
    pub dynamic: UndoCell<DynamicGlobalProperties>,
    /// TAPOS summaries: `block_num & 0xffff` -> block id.
    pub block_summaries: UndoMap<u16, BlockId>,
    /// Input transaction dedup table: id -> expiration.
    pub transaction_dedup: UndoMap<TransactionId, BlockTimestamp>,
    /// Deferred transactions by id.
    pub generated_transactions: UndoMap<TransactionId, GeneratedTransaction>,
    pub tables: ContractTables,

    revision: i64,
    /// Revision of each open undo layer, oldest first.
    layer_revisions: Vec<i64>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }

    fn for_each_index(&mut self, mut f: impl FnMut(&mut dyn UndoLayer)) {
        f(&mut self.accounts);
        f(&mut self.global);
        f(&mut self.protocol);
        f(&mut self.dynamic);
        f(&mut self.block_summaries);
        f(&mut self.transaction_dedup);
        f(&mut self.generated_transactions);
        f(&mut self.tables.tables);
        f(&mut self.tables.rows);
        f(&mut self.tables.idx64);
        f(&mut self.tables.idx128);
        f(&mut self.tables.idx256);
        f(&mut self.tables.idx_double);
        f(&mut self.tables.idx_long_double);
    }

    /// Current revision: the block number the state reflects, counting open
    /// sessions.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Set the revision of a database with no open sessions (used when
    /// seeding from genesis or a snapshot).
    pub fn set_revision(&mut self, revision: i64) -> Result<(), StoreError> {
        if !self.layer_revisions.is_empty() {
            return Err(StoreError::RevisionWithUndoStack { requested: revision });
        }
        self.revision = revision;
        Ok(())
    }

    /// Open an undo session. A disabled session is inert: every operation
    /// on it is a no-op (used when replaying irreversible blocks).
    pub fn start_undo_session(&mut self, enabled: bool) -> UndoSession {
        if !enabled {
            return UndoSession { enabled: false, revision: self.revision };
        }
        self.revision += 1;
        self.layer_revisions.push(self.revision);
        self.for_each_index(|index| index.begin_undo());
        trace!(revision = self.revision, "undo session opened");
        UndoSession { enabled: true, revision: self.revision }
    }

    fn check_head(&self, session: &UndoSession) -> Result<(), StoreError> {
        match self.layer_revisions.last() {
            Some(&head) if head == session.revision => Ok(()),
            other => Err(StoreError::SessionMismatch {
                session: session.revision,
                head: other.copied().unwrap_or(self.revision),
            }),
        }
    }

    pub(crate) fn squash_session(&mut self, session: &UndoSession) -> Result<(), StoreError> {
        self.check_head(session)?;
        self.layer_revisions.pop();
        self.for_each_index(|index| index.squash_undo());
        self.revision -= 1;
        Ok(())
    }

    pub(crate) fn undo_session(&mut self, session: &UndoSession) -> Result<(), StoreError> {
        self.check_head(session)?;
        self.layer_revisions.pop();
        self.for_each_index(|index| index.undo());
        self.revision -= 1;
        trace!(revision = self.revision, "undo session reverted");
        Ok(())
    }

    /// Revert the newest session layer (popping one block during a fork
    /// switch). Returns false if no layer is open.
    pub fn undo(&mut self) -> bool {
        if self.layer_revisions.pop().is_none() {
            return false;
        }
        self.for_each_index(|index| index.undo());
        self.revision -= 1;
        trace!(revision = self.revision, "top session reverted");
        true
    }

    /// Revert every open session.
    pub fn undo_all(&mut self) {
        while !self.layer_revisions.is_empty() {
            self.layer_revisions.pop();
            self.for_each_index(|index| index.undo());
            self.revision -= 1;
        }
    }

    /// Make every session at or below `revision` permanent.
    pub fn commit(&mut self, revision: i64) {
        while let Some(&oldest) = self.layer_revisions.first() {
            if oldest > revision {
                break;
            }
            self.layer_revisions.remove(0);
            self.for_each_index(|index| index.commit_oldest());
        }
    }

    /// Depth of the open session stack.
    pub fn undo_stack_depth(&self) -> usize {
        self.layer_revisions.len()
    }

    /// The store decides internally when to flush; the in-memory store
    /// never does. Returns the number of flushed pages.
    pub fn check_memory_and_flush_if_needed(&mut self) -> usize {
        0
    }
}

/// Handle to one open undo session.
///
/// Sessions are plain values (not borrows) so a pending block can own one
/// while the controller keeps mutating the database; each operation is
/// handed the database explicitly and validates that this session is still
/// the head of the stack.
#[derive(Debug)]
#[must_use = "an abandoned session leaves its undo layer open"]
pub struct UndoSession {
    enabled: bool,
    revision: i64,
}

impl UndoSession {
    /// Revision this session created.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Merge this session into its parent.
    pub fn squash(self, db: &mut Database) -> Result<(), StoreError> {
        if self.enabled {
            db.squash_session(&self)?;
        }
        Ok(())
    }

    /// Revert this session.
    pub fn undo(self, db: &mut Database) -> Result<(), StoreError> {
        if self.enabled {
            db.undo_session(&self)?;
        }
        Ok(())
    }

    /// Keep this session on the undo stack; it becomes permanent when the
    /// database commits past its revision.
    pub fn push(self) {
        // Ownership transfer is the whole operation: the layer stays open.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veldt_types::Digest;

    fn account(name: &str) -> AccountMetadata {
        AccountMetadata {
            name: AccountName::new(name),
            privileged: false,
            creation_time: BlockTimestamp(0),
        }
    }

    #[test]
    fn undo_restores_bit_identical_state() {
        let mut db = Database::new();
        db.accounts.insert(AccountName::new("alice"), account("alice"));
        db.global.modify(|g| g.chain_id = Digest::hash(b"chain"));
        let before_accounts: Vec<_> = db.accounts.iter().map(|(k, v)| (*k, v.clone())).collect();
        let before_global = db.global.get().clone();

        let session = db.start_undo_session(true);
        db.accounts.insert(AccountName::new("bob"), account("bob"));
        db.accounts.remove(&AccountName::new("alice"));
        db.global.modify(|g| g.proposed_schedule_block_num = Some(9));
        session.undo(&mut db).unwrap();

        let after: Vec<_> = db.accounts.iter().map(|(k, v)| (*k, v.clone())).collect();
        assert_eq!(after, before_accounts);
        assert_eq!(db.global.get(), &before_global);
        assert_eq!(db.revision(), 0);
    }

    #[test]
    fn nested_squash_folds_into_parent() {
        let mut db = Database::new();
        let block = db.start_undo_session(true);
        db.accounts.insert(AccountName::new("alice"), account("alice"));

        let trx = db.start_undo_session(true);
        db.accounts.insert(AccountName::new("bob"), account("bob"));
        trx.squash(&mut db).unwrap();

        // The block session now covers both writes.
        block.undo(&mut db).unwrap();
        assert!(db.accounts.is_empty());
    }

    #[test]
    fn commit_makes_sessions_irreversible() {
        let mut db = Database::new();
        for i in 0..3u32 {
            let session = db.start_undo_session(true);
            db.block_summaries
                .insert(i as u16, BlockId::from_digest(i, Digest::hash(&i.to_be_bytes())));
            session.push();
        }
        assert_eq!(db.revision(), 3);
        db.commit(2);
        assert_eq!(db.undo_stack_depth(), 1);
        db.undo_all();
        // Blocks 1 and 2 survive, block 3 was undone.
        assert!(db.block_summaries.contains_key(&0));
        assert!(db.block_summaries.contains_key(&1));
        assert!(!db.block_summaries.contains_key(&2));
        assert_eq!(db.revision(), 2);
    }

    #[test]
    fn disabled_session_is_inert() {
        let mut db = Database::new();
        let session = db.start_undo_session(false);
        db.accounts.insert(AccountName::new("alice"), account("alice"));
        session.undo(&mut db).unwrap();
        assert!(db.accounts.contains_key(&AccountName::new("alice")));
        assert_eq!(db.revision(), 0);
    }

    #[test]
    fn out_of_order_session_ops_are_rejected() {
        let mut db = Database::new();
        let outer = db.start_undo_session(true);
        let _inner = db.start_undo_session(true);
        assert!(matches!(
            outer.undo(&mut db),
            Err(StoreError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn set_revision_requires_empty_stack() {
        let mut db = Database::new();
        db.set_revision(10).unwrap();
        assert_eq!(db.revision(), 10);
        let _session = db.start_undo_session(true);
        assert!(db.set_revision(20).is_err());
    }
}
