//! The finality engine: per-block finality state, vote aggregation and
//! finalizer-policy rotation.
//!
//! # Architecture
//!
//! Three pieces cooperate, all pure data structures driven by the
//! controller on its main thread:
//!
//! - [`FinalityCore`]: the immutable per-block value tracking the QC link
//!   chain and the sliding window of ancestor references, from which the
//!   two irreversibility pointers (`final_on_strong_qc_block_num` and
//!   `last_final_block_num`) are derived. A block's core plus the QC claim
//!   of its child deterministically produces the child's core.
//! - [`PendingQc`]: accumulates strong and weak votes on one block's
//!   finality digest until quorum, then extracts an aggregate
//!   [`QuorumCertificate`](veldt_types::QuorumCertificate).
//! - [`PolicyTracker`]: carries proposed and pending finalizer policies
//!   through their two-3-chain activation delay.

mod core;
mod digest;
mod pending_qc;
mod policy_tracker;

pub use crate::core::FinalityCore;
pub use digest::{FinalityDigestInputs, FINALITY_PROTOCOL_VERSION};
pub use pending_qc::{PendingQc, VoteStatus};
pub use policy_tracker::{PolicyState, PolicyTracker, TrackedPolicy};
