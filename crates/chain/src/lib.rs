//! The veldt block-processing controller.
//!
//! # Architecture
//!
//! The controller owns the whole block pipeline:
//!
//! ```text
//! start_block → push_transaction* → finalize_block → sign_block → commit_block
//!                                                      ↑
//! push_block ──── create_block_state ── apply_block ───┘
//! ```
//!
//! - The **stage machine** (`building → assembled → completed`) accumulates
//!   receipts and action digests, with per-transaction restore points.
//! - The **fork database** holds every candidate branch; `commit_block`
//!   advances the head and the irreversibility loop advances the root.
//! - The **finality engine** (votes, quorum certificates, the per-block
//!   core) drives irreversibility once instant finality activates;
//!   delegated-production counting drives it before.
//!
//! The controller is single-threaded: every state mutation happens on the
//! caller's thread, in call order. A bounded worker pool computes merkle
//! roots, serializes blocks and verifies signatures — nothing else.

mod block_state;
mod config;
mod controller;
mod error;
mod features;
mod header_state;
mod signals;
mod stage;
mod traits;
mod worker;

pub use block_state::{BlockStateVariant, LegacyBlockState, SavannaBlockState};
pub use config::{ChainConfig, ReadMode, ValidationMode};
pub use controller::{far_deadline, Controller, GenesisState, SYSTEM_ACCOUNT};
pub use error::{ChainError, Result};
pub use features::{BuiltinFeature, ProtocolFeature, ProtocolFeatureManager};
pub use header_state::{
    LegacyBlockHeaderState, LegacyHeaderInput, PendingSchedule, SavannaBlockHeaderState,
    SavannaHeaderInput,
};
pub use signals::{ControllerSignals, Signal};
pub use stage::{
    AssembledBlock, BlockReport, BlockRestorePoint, BlockStage, BlockStatus, BuildingBlock,
    CompletedBlock, PendingState,
};
pub use traits::{
    ActionExecutor, ApplyContext, AuthorizationProvider, BlockLog, Collaborators,
    InMemoryBlockLog, NullExecutor, NullResourceLedger, PermissiveAuthorization, ResourceLedger,
};
pub use worker::{TaskHandle, WorkerPool};
