//! Deterministic multi-node cluster harness.
//!
//! Wires several controllers into a virtual network: one set of genesis
//! parameters, explicit block and vote delivery, partition control, and
//! helpers for building finality proofs out of recorded chain history.
//!
//! Everything is synchronous and deterministic: tests drive production and
//! vote delivery step by step and observe irreversibility per node.

mod cluster;
mod proof_builder;

pub use cluster::{Cluster, ClusterConfig, ClusterNode, VoteMode};
pub use proof_builder::{extended_block_data, heavy_proof, light_proof, signed_qc_over};
