//! Controller configuration.

use serde::Deserialize;
use std::collections::BTreeSet;
use veldt_types::{AccountName, BlsPublicKey};

/// How thoroughly pushed blocks are re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ValidationMode {
    /// Re-execute every transaction of every block.
    #[default]
    Full,
    /// Trust producer signatures for blocks from trusted producers and skip
    /// transaction re-execution for them.
    Light,
}

/// Which state the controller exposes between blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum ReadMode {
    /// Speculative state including the in-progress block.
    #[default]
    Speculative,
    /// State as of the chain head.
    Head,
    /// State as of the last irreversible block; blocks are applied only
    /// once irreversible.
    Irreversible,
}

/// Static controller configuration. Immutable after construction except
/// through the dedicated setters the controller exposes; readable from
/// worker threads only where explicitly documented.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub validation_mode: ValidationMode,
    pub read_mode: ReadMode,

    /// If non-empty, only these actors may authorize transactions.
    pub actor_whitelist: BTreeSet<AccountName>,
    pub actor_blacklist: BTreeSet<AccountName>,
    /// If non-empty, only these contracts may be called.
    pub contract_whitelist: BTreeSet<AccountName>,
    pub contract_blacklist: BTreeSet<AccountName>,
    /// `(contract, action)` pairs that may not be called.
    pub action_blacklist: BTreeSet<(AccountName, AccountName)>,
    /// Keys that may not appear in transaction signatures. Set through the
    /// controller API, not config files.
    #[serde(skip)]
    pub key_blacklist: BTreeSet<BlsPublicKey>,
    /// Accounts billed at a reduced CPU multiplier.
    pub resource_greylist: BTreeSet<AccountName>,

    /// Producers whose blocks skip full validation in light mode.
    pub trusted_producers: BTreeSet<AccountName>,

    /// Extra CPU slack subtracted before a speculative deadline fires.
    pub subjective_cpu_leeway_us: Option<u64>,
    /// Percentage of signature-recovery CPU billed to the transaction.
    pub sig_cpu_bill_pct: u32,
    /// Re-run all checks during replay.
    pub force_all_checks: bool,

    /// Worker pool width for signature recovery, merkle computation and
    /// block serialization.
    pub worker_threads: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            validation_mode: ValidationMode::default(),
            read_mode: ReadMode::default(),
            actor_whitelist: BTreeSet::new(),
            actor_blacklist: BTreeSet::new(),
            contract_whitelist: BTreeSet::new(),
            contract_blacklist: BTreeSet::new(),
            action_blacklist: BTreeSet::new(),
            key_blacklist: BTreeSet::new(),
            resource_greylist: BTreeSet::new(),
            trusted_producers: BTreeSet::new(),
            subjective_cpu_leeway_us: None,
            sig_cpu_bill_pct: 50,
            force_all_checks: false,
            worker_threads: 2,
        }
    }
}
