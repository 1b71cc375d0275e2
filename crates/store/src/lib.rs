//! Undo-capable in-memory state store.
//!
//! The controller drives this store in lock-step with block progression:
//! every block opens an undo session; aborting a block reverses it, and
//! committing pushes it onto the undo stack where it stays revertible until
//! the block becomes irreversible and [`Database::commit`] folds it into the
//! permanent state.
//!
//! Sessions nest: a per-transaction session opened inside a block session
//! `squash`es into its parent on success, or `undo`es on failure, leaving
//! the enclosing block session intact either way.

mod database;
mod objects;
pub mod snapshot;
mod undo;

pub use database::{Database, StoreError, UndoSession};
pub use objects::{
    AccountMetadata, ChainLimits, ContractTables, DynamicGlobalProperties, GeneratedTransaction,
    GlobalPropertyState, ProtocolState, TableId, TableMeta,
};
pub use snapshot::{Snapshot, SnapshotError, SnapshotSection, CURRENT_SNAPSHOT_VERSION};
pub use undo::{UndoCell, UndoLayer, UndoMap};
