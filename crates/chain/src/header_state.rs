//! Per-block header states for the two consensus regimes.
//!
//! A header state is everything needed to validate and extend a block
//! without its transactions: schedules, finality state, activated protocol
//! features. Each block's header state is a deterministic function of its
//! parent's plus the block header, which is what lets pushed blocks be
//! validated by rebuilding the state and comparing headers.

use crate::error::{ChainError, Result};
use sbor::prelude::*;
use std::collections::BTreeMap;
use veldt_finality::{FinalityCore, FinalityDigestInputs, PolicyTracker};
use veldt_types::{
    merkle, AccountName, BlockHeader, BlockId, BlockNum, BlockRef, BlockTimestamp, Digest,
    FinalityExtension, FinalizerPolicy, HeaderExtension, ProducerAuthority, ProducerSchedule,
    QcClaim,
};

/// A producer schedule promoted to pending, waiting for the block that
/// promoted it to become irreversible.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PendingSchedule {
    /// Block in which the schedule became pending.
    pub schedule_lib_num: BlockNum,
    pub schedule: ProducerSchedule,
}

/// Header state under delegated production.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct LegacyBlockHeaderState {
    pub id: BlockId,
    pub header: BlockHeader,
    pub active_schedule: ProducerSchedule,
    pub pending_schedule: Option<PendingSchedule>,
    /// Last block each producer of the active schedule produced.
    pub producer_to_last_produced: BTreeMap<AccountName, BlockNum>,
    pub dpos_irreversible_blocknum: BlockNum,
    pub activated_protocol_features: Vec<Digest>,
}

/// Inputs for extending a legacy header state by one block.
#[derive(Debug, Clone)]
pub struct LegacyHeaderInput {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    pub confirmed: u16,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    /// Proposed schedule promoted to pending in this block, if any.
    pub new_pending_schedule: Option<ProducerSchedule>,
    pub new_protocol_features: Vec<Digest>,
}

impl LegacyBlockHeaderState {
    /// The state of a genesis block with a single-producer schedule.
    pub fn genesis(timestamp: BlockTimestamp, schedule: ProducerSchedule) -> Self {
        let producer = schedule.producers[0].producer_name;
        let header = BlockHeader {
            previous: BlockId::default(),
            timestamp,
            producer,
            confirmed: 1,
            transaction_mroot: Digest::ZERO,
            action_mroot: Digest::ZERO,
            schedule_version: schedule.version,
            new_producers: None,
            header_extensions: Vec::new(),
        };
        LegacyBlockHeaderState {
            id: header.calculate_id(),
            header,
            active_schedule: schedule,
            pending_schedule: None,
            producer_to_last_produced: BTreeMap::new(),
            dpos_irreversible_blocknum: 0,
            activated_protocol_features: Vec::new(),
        }
    }

    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// Producer scheduled for `when` under the active schedule.
    pub fn scheduled_producer(&self, when: BlockTimestamp) -> &ProducerAuthority {
        self.active_schedule.scheduled_producer(when)
    }

    /// The schedule the next block will be validated against: the pending
    /// schedule once its promotion block is irreversible, the active one
    /// otherwise.
    pub fn effective_schedule(&self) -> &ProducerSchedule {
        if let Some(pending) = &self.pending_schedule {
            if pending.schedule_lib_num <= self.dpos_irreversible_blocknum {
                return &pending.schedule;
            }
        }
        &self.active_schedule
    }

    /// Irreversibility under delegated production: the highest block that
    /// more than two thirds of producers have built on.
    fn compute_dpos_irreversible(
        schedule: &ProducerSchedule,
        watermarks: &BTreeMap<AccountName, BlockNum>,
    ) -> BlockNum {
        let mut produced: Vec<BlockNum> = schedule
            .producers
            .iter()
            .map(|p| watermarks.get(&p.producer_name).copied().unwrap_or(0))
            .collect();
        produced.sort_unstable_by(|a, b| b.cmp(a));
        let index = produced.len() * 2 / 3;
        produced[index]
    }

    /// Extend by one block.
    pub fn next(&self, input: LegacyHeaderInput) -> Result<LegacyBlockHeaderState> {
        if input.timestamp <= self.timestamp() {
            return Err(ChainError::BlockValidate(format!(
                "block timestamp {} does not advance past {}",
                input.timestamp,
                self.timestamp()
            )));
        }
        let block_num = self.block_num() + 1;

        // Promote pending to active once its promotion block is
        // irreversible.
        let mut active_schedule = self.active_schedule.clone();
        let mut pending_schedule = self.pending_schedule.clone();
        if let Some(pending) = &self.pending_schedule {
            if pending.schedule_lib_num <= self.dpos_irreversible_blocknum {
                active_schedule = pending.schedule.clone();
                pending_schedule = None;
            }
        }

        let scheduled = active_schedule.scheduled_producer(input.timestamp).producer_name;
        if input.producer != scheduled {
            return Err(ChainError::BlockValidate(format!(
                "block produced by {} but {} is scheduled for {}",
                input.producer, scheduled, input.timestamp
            )));
        }

        // Announce a newly pending schedule in the header.
        let mut new_producers = None;
        if let Some(schedule) = input.new_pending_schedule {
            if pending_schedule.is_some() {
                return Err(ChainError::BlockValidate(
                    "a pending producer schedule already exists".into(),
                ));
            }
            if schedule.version != active_schedule.version + 1 {
                return Err(ChainError::BlockValidate(format!(
                    "wrong producer schedule version {} (active is {})",
                    schedule.version, active_schedule.version
                )));
            }
            new_producers = Some(schedule.clone());
            pending_schedule =
                Some(PendingSchedule { schedule_lib_num: block_num, schedule });
        }

        let mut producer_to_last_produced = self.producer_to_last_produced.clone();
        producer_to_last_produced.insert(input.producer, block_num);
        let dpos_irreversible_blocknum =
            Self::compute_dpos_irreversible(&active_schedule, &producer_to_last_produced)
                .max(self.dpos_irreversible_blocknum);

        let mut activated_protocol_features = self.activated_protocol_features.clone();
        activated_protocol_features.extend(input.new_protocol_features.iter().copied());

        let mut header_extensions = Vec::new();
        if !input.new_protocol_features.is_empty() {
            header_extensions
                .push(HeaderExtension::ProtocolFeatures(input.new_protocol_features));
        }

        let header = BlockHeader {
            previous: self.id,
            timestamp: input.timestamp,
            producer: input.producer,
            confirmed: input.confirmed,
            transaction_mroot: input.transaction_mroot,
            action_mroot: input.action_mroot,
            schedule_version: active_schedule.version,
            new_producers,
            header_extensions,
        };

        Ok(LegacyBlockHeaderState {
            id: header.calculate_id(),
            header,
            active_schedule,
            pending_schedule,
            producer_to_last_produced,
            dpos_irreversible_blocknum,
            activated_protocol_features,
        })
    }
}

/// Header state under instant finality.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SavannaBlockHeaderState {
    pub id: BlockId,
    pub header: BlockHeader,
    pub core: FinalityCore,
    pub policy_tracker: PolicyTracker,
    pub active_proposer_schedule: ProducerSchedule,
    /// Proposed proposer schedule waiting for its proposal block to become
    /// final. Serves the pending-producers query.
    pub pending_proposer_schedule: Option<(BlockNum, ProducerSchedule)>,
    pub activated_protocol_features: Vec<Digest>,
    /// Merkle root over the action-receipt digests of this block.
    pub action_mroot: Digest,
    /// Root over ancestor finality leaves; carried in the header's
    /// `action_mroot` field under instant finality.
    pub finality_mroot: Digest,
    /// What finalizers sign when voting on this block.
    pub finality_digest: Digest,
    /// Finality leaves of every block since the instant-finality genesis,
    /// this block's included (last).
    pub finality_leaves: Vec<Digest>,
    /// Parent timestamp (folded into this block's finality leaf).
    pub parent_timestamp: BlockTimestamp,
    /// Delegated-production irreversibility frozen at the transition.
    pub legacy_irreversible_blocknum: BlockNum,
}

/// Inputs for extending a savanna header state by one block.
#[derive(Debug, Clone)]
pub struct SavannaHeaderInput {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    pub transaction_mroot: Digest,
    /// Merkle root over this block's action-receipt digests.
    pub action_mroot: Digest,
    pub qc_claim: QcClaim,
    /// Fully materialized newly proposed finalizer policy, if any.
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    pub new_proposer_schedule: Option<ProducerSchedule>,
    pub new_protocol_features: Vec<Digest>,
}

impl SavannaBlockHeaderState {
    /// The instant-finality genesis state: the block whose header first
    /// carries a finalizer policy. Its core is the unique genesis core and
    /// the proposed policy is active immediately at generation 1.
    pub fn genesis(
        parent: &LegacyBlockHeaderState,
        input: SavannaHeaderInput,
        policy: FinalizerPolicy,
    ) -> Result<Self> {
        if input.timestamp <= parent.timestamp() {
            return Err(ChainError::BlockValidate(
                "genesis block timestamp does not advance".into(),
            ));
        }
        let block_num = parent.block_num() + 1;
        let core = FinalityCore::genesis(block_num);
        let policy_tracker = PolicyTracker::new(policy.clone());
        let finality_mroot = Digest::ZERO;
        let witness_hash = Digest::hash_of(&(input.action_mroot, parent.id));
        let finality_digest = FinalityDigestInputs {
            active_policy_generation: policy.generation,
            final_on_strong_qc_block_num: core.final_on_strong_qc_block_num(),
            finality_mroot,
            active_policy_digest: policy.digest(),
            pending_policy_digest: None,
            witness_hash,
        }
        .compute();

        let active_proposer_schedule = parent.active_schedule.clone();
        let diff = FinalizerPolicy { generation: 0, threshold: 0, finalizers: Vec::new() }
            .create_diff(&policy)?;
        let mut header_extensions = Vec::new();
        if !input.new_protocol_features.is_empty() {
            header_extensions
                .push(HeaderExtension::ProtocolFeatures(input.new_protocol_features.clone()));
        }
        header_extensions.push(HeaderExtension::Finality(FinalityExtension {
            qc_claim: core.latest_qc_claim(),
            new_finalizer_policy_diff: Some(diff),
            new_proposer_schedule: None,
        }));
        let header = BlockHeader {
            previous: parent.id,
            timestamp: input.timestamp,
            producer: input.producer,
            confirmed: 0,
            transaction_mroot: input.transaction_mroot,
            action_mroot: finality_mroot,
            schedule_version: active_proposer_schedule.version,
            new_producers: None,
            header_extensions,
        };
        let id = header.calculate_id();
        let leaf = merkle::finality_leaf(block_num, finality_digest, input.timestamp, parent.timestamp());

        Ok(SavannaBlockHeaderState {
            id,
            header,
            core,
            policy_tracker,
            active_proposer_schedule,
            pending_proposer_schedule: None,
            activated_protocol_features: {
                let mut features = parent.activated_protocol_features.clone();
                features.extend(input.new_protocol_features.iter().copied());
                features
            },
            action_mroot: input.action_mroot,
            finality_mroot,
            finality_digest,
            finality_leaves: vec![leaf],
            parent_timestamp: parent.timestamp(),
            legacy_irreversible_blocknum: parent.dpos_irreversible_blocknum,
        })
    }

    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// This block as a reference for its children's cores.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef { block_id: self.id, timestamp: self.timestamp() }
    }

    pub fn scheduled_producer(&self, when: BlockTimestamp) -> &ProducerAuthority {
        self.active_proposer_schedule.scheduled_producer(when)
    }

    /// The proposer schedule the next block will be validated against,
    /// given that block's `last_final_block_num`.
    pub fn effective_proposer_schedule(&self, last_final: BlockNum) -> &ProducerSchedule {
        if let Some((proposed_in, schedule)) = &self.pending_proposer_schedule {
            if *proposed_in <= last_final {
                return schedule;
            }
        }
        &self.active_proposer_schedule
    }

    /// The policy diff a block proposing `policy` carries, computed against
    /// the newest policy already committed to (in flight or active).
    pub fn diff_base_policy(&self) -> &FinalizerPolicy {
        self.policy_tracker
            .in_flight()
            .last()
            .map(|t| &t.policy)
            .unwrap_or_else(|| self.policy_tracker.active())
    }

    /// Extend by one block.
    pub fn next(&self, input: SavannaHeaderInput) -> Result<SavannaBlockHeaderState> {
        if input.timestamp <= self.timestamp() {
            return Err(ChainError::BlockValidate(format!(
                "block timestamp {} does not advance past {}",
                input.timestamp,
                self.timestamp()
            )));
        }
        let block_num = self.block_num() + 1;

        let claim = input.qc_claim;
        let latest = self.core.latest_qc_claim();
        if claim < latest || claim.block_num > self.core.current_block_num() {
            return Err(ChainError::BlockValidate(format!(
                "invalid qc claim {claim:?} (latest {latest:?}, current {})",
                self.core.current_block_num()
            )));
        }
        let core = self.core.next(&self.block_ref(), claim);

        let mut policy_tracker = self.policy_tracker.clone();
        policy_tracker.evaluate_promotions(block_num, core.last_final_block_num());

        // Proposer schedule promotion follows finality, not DPoS counting.
        let mut active_proposer_schedule = self.active_proposer_schedule.clone();
        let mut pending_proposer_schedule = self.pending_proposer_schedule.clone();
        if let Some((proposed_in, schedule)) = &self.pending_proposer_schedule {
            if *proposed_in <= core.last_final_block_num() {
                active_proposer_schedule = schedule.clone();
                pending_proposer_schedule = None;
            }
        }

        let scheduled =
            active_proposer_schedule.scheduled_producer(input.timestamp).producer_name;
        if input.producer != scheduled {
            return Err(ChainError::BlockValidate(format!(
                "block produced by {} but {} is scheduled for {}",
                input.producer, scheduled, input.timestamp
            )));
        }

        let diff = match &input.new_finalizer_policy {
            Some(policy) => {
                let base = policy_tracker
                    .in_flight()
                    .last()
                    .map(|t| t.policy.clone())
                    .unwrap_or_else(|| policy_tracker.active().clone());
                if policy.generation != policy_tracker.next_generation() {
                    return Err(ChainError::BlockValidate(format!(
                        "proposed finalizer policy generation {} must be {}",
                        policy.generation,
                        policy_tracker.next_generation()
                    )));
                }
                let diff = base.create_diff(policy)?;
                policy_tracker.propose(block_num, policy.clone());
                Some(diff)
            }
            None => None,
        };

        if let Some(schedule) = &input.new_proposer_schedule {
            if schedule.version != active_proposer_schedule.version + 1 {
                return Err(ChainError::BlockValidate(format!(
                    "wrong proposer schedule version {} (active is {})",
                    schedule.version, active_proposer_schedule.version
                )));
            }
            pending_proposer_schedule = Some((block_num, schedule.clone()));
        }

        let finality_mroot = merkle::symmetric_merkle(self.finality_leaves.clone());
        let witness_hash = Digest::hash_of(&(input.action_mroot, self.id));
        let finality_digest = FinalityDigestInputs {
            active_policy_generation: policy_tracker.active().generation,
            final_on_strong_qc_block_num: core.final_on_strong_qc_block_num(),
            finality_mroot,
            active_policy_digest: policy_tracker.active().digest(),
            pending_policy_digest: policy_tracker.latest_pending().map(|p| p.digest()),
            witness_hash,
        }
        .compute();

        let mut header_extensions = Vec::new();
        if !input.new_protocol_features.is_empty() {
            header_extensions
                .push(HeaderExtension::ProtocolFeatures(input.new_protocol_features.clone()));
        }
        header_extensions.push(HeaderExtension::Finality(FinalityExtension {
            qc_claim: claim,
            new_finalizer_policy_diff: diff,
            new_proposer_schedule: input.new_proposer_schedule.clone(),
        }));

        let header = BlockHeader {
            previous: self.id,
            timestamp: input.timestamp,
            producer: input.producer,
            confirmed: 0,
            transaction_mroot: input.transaction_mroot,
            action_mroot: finality_mroot,
            schedule_version: active_proposer_schedule.version,
            new_producers: None,
            header_extensions,
        };
        let id = header.calculate_id();

        let mut finality_leaves = self.finality_leaves.clone();
        finality_leaves.push(merkle::finality_leaf(
            block_num,
            finality_digest,
            input.timestamp,
            self.timestamp(),
        ));

        let mut activated_protocol_features = self.activated_protocol_features.clone();
        activated_protocol_features.extend(input.new_protocol_features.iter().copied());

        Ok(SavannaBlockHeaderState {
            id,
            header,
            core,
            policy_tracker,
            active_proposer_schedule,
            pending_proposer_schedule,
            activated_protocol_features,
            action_mroot: input.action_mroot,
            finality_mroot,
            finality_digest,
            finality_leaves,
            parent_timestamp: self.timestamp(),
            legacy_irreversible_blocknum: self.legacy_irreversible_blocknum,
        })
    }
}
