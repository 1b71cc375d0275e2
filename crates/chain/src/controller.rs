//! The controller: builds, validates, commits and replays blocks, drives
//! the fork database and the irreversibility loop, and feeds the finality
//! engine.
//!
//! All state-mutating operations run on the caller's (single) thread; the
//! worker pool only computes merkles, serializes blocks and verifies
//! signatures. Observable mutations are totally ordered by call order.

use crate::block_state::{BlockStateVariant, LegacyBlockState, SavannaBlockState};
use crate::config::{ChainConfig, ReadMode};
use crate::error::{ChainError, Result};
use crate::features::{BuiltinFeature, ProtocolFeatureManager};
use crate::header_state::{
    LegacyBlockHeaderState, LegacyHeaderInput, SavannaBlockHeaderState, SavannaHeaderInput,
};
use crate::signals::ControllerSignals;
use crate::stage::{
    AssembledBlock, AssembledBlockDpos, AssembledBlockIf, BlockStage, BlockStatus, BuildingBlock,
    BuildingBlockCommon, BuildingBlockDpos, BuildingBlockIf, CompletedBlock, PendingState,
    TrxMrootSource,
};
use crate::traits::{ApplyContext, Collaborators};
use crate::worker::WorkerPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use veldt_finality::{PendingQc, VoteStatus};
use veldt_store::{ChainLimits, Database, GeneratedTransaction, Snapshot};
use veldt_types::{
    merkle, AccountName, BlockId, BlockNum, BlockTimestamp, BlsKeyPair, BlsSignature,
    Digest, FinalizerPolicy, ProducerSchedule, QcClaim, QuorumCertificate, SignedBlock,
    Transaction, TransactionId, TransactionMetadata, TransactionReceipt,
    TransactionReceiptStatus, TransactionTrace, TransactionVariant, VoteMessage,
};

/// The account owning the implicit on-block system transaction.
pub const SYSTEM_ACCOUNT: &str = "veldt";

/// Chain genesis parameters.
#[derive(Debug, Clone)]
pub struct GenesisState {
    pub initial_timestamp: BlockTimestamp,
    pub initial_schedule: ProducerSchedule,
    pub initial_limits: ChainLimits,
}

impl GenesisState {
    /// The chain id is a digest of the genesis parameters.
    pub fn compute_chain_id(&self) -> Digest {
        Digest::hash_of(&(
            self.initial_timestamp,
            self.initial_schedule.digest(),
            self.initial_limits.clone(),
        ))
    }
}

/// Snapshot encoding of the head block state.
#[derive(Debug, Clone, sbor::prelude::BasicSbor)]
enum SnapshotHeadState {
    Legacy { header_state: LegacyBlockHeaderState, block: SignedBlock },
    Savanna { header_state: SavannaBlockHeaderState, block: SignedBlock },
}

/// The block-processing controller.
pub struct Controller {
    config: ChainConfig,
    chain_id: Digest,
    db: Database,
    fork_db: veldt_fork_db::ForkDatabase<BlockStateVariant>,
    head: BlockStateVariant,
    pending: Option<PendingState>,
    features: ProtocolFeatureManager,
    pub signals: ControllerSignals,
    worker: WorkerPool,
    collaborators: Collaborators,
    /// Vote accumulation per (applied) block id.
    vote_collector: BTreeMap<BlockId, PendingQc>,
    /// Best verified certificate observed per block id.
    received_qcs: BTreeMap<BlockId, QuorumCertificate>,
    /// Finalizer keys this node signs votes with.
    node_finalizers: Vec<Arc<BlsKeyPair>>,
    /// External irreversibility override (testing and transition plumbing).
    if_irreversible_override: BlockNum,
    replaying: bool,
}

impl Controller {
    /// Construct a controller from genesis.
    pub fn new(config: ChainConfig, genesis: GenesisState, collaborators: Collaborators) -> Self {
        let chain_id = genesis.compute_chain_id();
        let mut db = Database::new();
        db.global.modify(|g| {
            g.chain_id = chain_id;
            g.configuration = genesis.initial_limits.clone();
        });
        db.accounts.insert(
            AccountName::new(SYSTEM_ACCOUNT),
            veldt_store::AccountMetadata {
                name: AccountName::new(SYSTEM_ACCOUNT),
                privileged: true,
                creation_time: genesis.initial_timestamp,
            },
        );

        let header_state =
            LegacyBlockHeaderState::genesis(genesis.initial_timestamp, genesis.initial_schedule);
        let block = Arc::new(SignedBlock {
            header: header_state.header.clone(),
            producer_signature: BlsSignature::NULL,
            transactions: Vec::new(),
            block_extensions: Vec::new(),
        });
        db.block_summaries
            .insert((header_state.block_num() & 0xffff) as u16, header_state.id);
        db.set_revision(header_state.block_num() as i64)
            .expect("fresh database has no undo stack");

        let root = BlockStateVariant::Legacy(Arc::new(LegacyBlockState { header_state, block }));
        let mut collaborators = collaborators;
        collaborators.block_log.reset(root.block_num() + 1);

        info!(%chain_id, genesis_block = root.block_num(), "controller initialized from genesis");
        Controller {
            worker: WorkerPool::new(config.worker_threads),
            config,
            chain_id,
            db,
            fork_db: veldt_fork_db::ForkDatabase::new(root.clone()),
            head: root,
            pending: None,
            features: ProtocolFeatureManager::with_all_builtins(),
            signals: ControllerSignals::new(),
            collaborators,
            vote_collector: BTreeMap::new(),
            received_qcs: BTreeMap::new(),
            node_finalizers: Vec::new(),
            if_irreversible_override: 0,
            replaying: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    pub fn chain_id(&self) -> Digest {
        self.chain_id
    }

    pub fn head_block_num(&self) -> BlockNum {
        self.head.block_num()
    }

    pub fn head_block_id(&self) -> BlockId {
        self.head.id()
    }

    pub fn head_block_time(&self) -> BlockTimestamp {
        self.head.timestamp()
    }

    pub fn head_block_producer(&self) -> AccountName {
        self.head.producer()
    }

    pub fn head_block_state(&self) -> &BlockStateVariant {
        &self.head
    }

    pub fn fork_db_head_block_num(&self) -> BlockNum {
        self.fork_db.head().block_num()
    }

    pub fn fork_db_head_block_id(&self) -> BlockId {
        self.fork_db.head().id()
    }

    pub fn last_irreversible_block_num(&self) -> BlockNum {
        self.fork_db.root().block_num()
    }

    pub fn last_irreversible_block_id(&self) -> BlockId {
        self.fork_db.root().id()
    }

    pub fn last_irreversible_block_time(&self) -> BlockTimestamp {
        self.fork_db.root().timestamp()
    }

    pub fn is_building_block(&self) -> bool {
        matches!(
            self.pending.as_ref().map(|p| &p.stage),
            Some(BlockStage::Building(_))
        )
    }

    pub fn pending_block_num(&self) -> Option<BlockNum> {
        self.pending.as_ref().map(|p| p.block_num())
    }

    pub fn pending_block_time(&self) -> Option<BlockTimestamp> {
        self.pending.as_ref().map(|p| p.timestamp())
    }

    pub fn pending_block_producer(&self) -> Option<AccountName> {
        self.pending.as_ref().map(|p| p.producer())
    }

    /// The producer schedule in force at the head.
    pub fn active_producers(&self) -> &ProducerSchedule {
        self.head.active_schedule()
    }

    /// The promoted-but-not-yet-active schedule, if any.
    pub fn pending_producers(&self) -> Option<&ProducerSchedule> {
        self.head.pending_schedule()
    }

    /// The proposed (not yet promoted) schedule, if any.
    pub fn proposed_producers(&self) -> Option<ProducerSchedule> {
        let global = self.db.global.get();
        global.proposed_schedule_block_num.map(|_| global.proposed_schedule.clone())
    }

    pub fn is_protocol_feature_activated(&self, digest: &Digest) -> bool {
        if let Some(pending) = &self.pending {
            if let BlockStage::Building(bb) = &pending.stage {
                return bb.is_protocol_feature_activated(digest);
            }
        }
        self.head.activated_protocol_features().contains(digest)
    }

    pub fn is_builtin_activated(&self, builtin: BuiltinFeature) -> bool {
        self.is_protocol_feature_activated(&builtin.digest())
    }

    pub fn get_preactivated_protocol_features(&self) -> Vec<Digest> {
        self.db.protocol.get().preactivated_features.clone()
    }

    /// The active finalizer policy at the head, once instant finality is
    /// live.
    pub fn active_finalizer_policy(&self) -> Option<&FinalizerPolicy> {
        self.head
            .as_savanna()
            .map(|state| state.header_state.policy_tracker.active())
    }

    /// Active finalizer policy as of an arbitrary fork-database block.
    pub fn active_finalizer_policy_at(&self, id: &BlockId) -> Option<FinalizerPolicy> {
        self.fork_db
            .get(id)?
            .as_savanna()
            .map(|state| state.header_state.policy_tracker.active().clone())
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ChainConfig {
        &mut self.config
    }

    /// TAPOS reference for a transaction built on the current head.
    pub fn tapos_for_head(&self) -> (u16, u32) {
        let id = self.head.id();
        ((self.head.block_num() & 0xffff) as u16, block_id_prefix(&id))
    }

    /// Keys this node votes with.
    pub fn set_node_finalizers(&mut self, keys: Vec<Arc<BlsKeyPair>>) {
        self.node_finalizers = keys;
    }

    /// A block by number on the best branch, falling back to the log for
    /// irreversible history.
    pub fn fetch_block_by_number(&self, block_num: BlockNum) -> Option<Arc<SignedBlock>> {
        if let Some(state) = self
            .fork_db
            .search_on_branch(self.fork_db.head().id(), block_num)
        {
            return Some(state.block().clone());
        }
        self.collaborators.block_log.read_block_by_num(block_num)
    }

    /// The block state at `block_num` on the branch ending at `tip`.
    pub fn block_state_on_branch(
        &self,
        tip: &BlockId,
        block_num: BlockNum,
    ) -> Option<BlockStateVariant> {
        self.fork_db.search_on_branch(*tip, block_num).cloned()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Protocol feature preactivation
    // ═══════════════════════════════════════════════════════════════════

    /// Validate and record a feature digest in the preactivated list. The
    /// next block start consumes it.
    pub fn preactivate_feature(&mut self, digest: Digest, is_trx_transient: bool) -> Result<()> {
        let now = self
            .pending_block_time()
            .unwrap_or_else(|| self.head_block_time());
        let speculative = self
            .pending
            .as_ref()
            .map(|p| !p.status.is_validation())
            .unwrap_or(true);
        let protocol = self.db.protocol.get();
        self.features.validate_preactivation(
            &digest,
            now,
            &protocol.activated_features,
            &protocol.preactivated_features,
            speculative && !is_trx_transient,
        )?;
        self.db.protocol.modify(|p| p.preactivated_features.push(digest));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Block production pipeline
    // ═══════════════════════════════════════════════════════════════════

    /// Open a new building block.
    pub fn start_block(
        &mut self,
        when: BlockTimestamp,
        confirm_count: u16,
        new_protocol_features: &[Digest],
        status: BlockStatus,
        producer_block_id: Option<BlockId>,
        deadline: Instant,
    ) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::BlockValidate("pending block already exists".into()));
        }
        self.signals.block_start.emit(&(self.head.block_num() + 1));

        let session_enabled = status != BlockStatus::Irreversible;
        if session_enabled && self.db.revision() != self.head.block_num() as i64 {
            return Err(ChainError::Fatal(format!(
                "database revision {} is not on par with head block {}",
                self.db.revision(),
                self.head.block_num()
            )));
        }
        let session = self.db.start_undo_session(session_enabled);

        let result = self.start_block_impl(when, confirm_count, new_protocol_features, status);
        let building = match result {
            Ok(building) => building,
            Err(err) => {
                session.undo(&mut self.db)?;
                self.features.popped_blocks_to(self.head.block_num());
                return Err(err);
            }
        };

        self.pending = Some(PendingState {
            session,
            stage: BlockStage::Building(building),
            status,
            producer_block_id,
            report: Default::default(),
        });

        if status != BlockStatus::Ephemeral {
            self.run_on_block_transaction();
            self.clear_expired_input_transactions(deadline);
            self.update_producers_authority();
        }
        Ok(())
    }

    /// Everything inside start_block that can fail before pending exists.
    fn start_block_impl(
        &mut self,
        when: BlockTimestamp,
        confirm_count: u16,
        new_protocol_features: &[Digest],
        status: BlockStatus,
    ) -> Result<BuildingBlock> {
        let block_num = self.head.block_num() + 1;

        // Consume preactivations and activate requested features.
        if status != BlockStatus::Ephemeral {
            let protocol = self.db.protocol.get().clone();
            self.features.check_block_activations(
                when,
                &protocol.activated_features,
                new_protocol_features,
            )?;
            // Preactivation is proven by the producer's own state; a
            // validator's copy of the preactivated list is maintained by the
            // execution layer, so only production enforces it here.
            if !status.is_validation() {
                for digest in new_protocol_features {
                    let feature = self
                        .features
                        .get(digest)
                        .expect("existence checked by check_block_activations");
                    let preactivated = protocol.preactivated_features.contains(digest);
                    if feature.preactivation_required && !preactivated {
                        return Err(ChainError::ProtocolFeatureBadBlock(format!(
                            "feature {digest} requires preactivation"
                        )));
                    }
                }
            }
            let unconsumed = protocol
                .preactivated_features
                .iter()
                .any(|digest| !new_protocol_features.contains(digest));
            if unconsumed && !status.is_validation() {
                return Err(ChainError::BlockValidate(
                    "preactivated protocol features were not activated at block start".into(),
                ));
            }
            if !new_protocol_features.is_empty() {
                self.db.protocol.modify(|p| {
                    p.preactivated_features.clear();
                    for digest in new_protocol_features {
                        p.activated_features.push((*digest, block_num));
                    }
                });
                for digest in new_protocol_features {
                    self.features.activate(*digest, block_num);
                }
            }
        }

        // TAPOS summary for the parent block.
        self.db
            .block_summaries
            .insert((self.head.block_num() & 0xffff) as u16, self.head.id());

        let building = match &self.head {
            BlockStateVariant::Legacy(parent) => {
                let parent_hs = parent.header_state.clone();
                let producer = parent_hs.effective_schedule().scheduled_producer(when).producer_name;

                // Promote a proposed schedule once its proposal block is
                // irreversible and no pending schedule occupies the slot.
                let mut new_pending_schedule = None;
                let global = self.db.global.get();
                if let Some(proposed_in) = global.proposed_schedule_block_num {
                    if proposed_in <= parent_hs.dpos_irreversible_blocknum
                        && parent_hs.pending_schedule.is_none()
                    {
                        new_pending_schedule = Some(global.proposed_schedule.clone());
                        if !self.replaying {
                            info!(
                                proposed_in,
                                block_num,
                                version = global.proposed_schedule.version,
                                "promoting proposed producer schedule to pending"
                            );
                        }
                        self.db.global.modify(|g| {
                            g.proposed_schedule_block_num = None;
                            g.proposed_schedule = ProducerSchedule::default();
                        });
                    }
                }

                BuildingBlock::Dpos(BuildingBlockDpos {
                    common: BuildingBlockCommon::new(when, producer, new_protocol_features.to_vec()),
                    parent: parent_hs,
                    confirmed: confirm_count,
                    new_pending_producer_schedule: new_pending_schedule,
                    proposed_finalizer_policy: None,
                })
            }
            BlockStateVariant::Savanna(parent) => {
                let parent_hs = parent.header_state.clone();
                let producer =
                    parent_hs.scheduled_producer(when).producer_name;
                BuildingBlock::If(BuildingBlockIf {
                    common: BuildingBlockCommon::new(when, producer, new_protocol_features.to_vec()),
                    parent: parent_hs,
                    new_finalizer_policy: None,
                    new_proposer_schedule: None,
                })
            }
        };
        Ok(building)
    }

    /// The implicit system transaction at block start. Failures are logged
    /// and isolated; they never prevent block production.
    fn run_on_block_transaction(&mut self) {
        let system = AccountName::new(SYSTEM_ACCOUNT);
        let pending_time = self.pending.as_ref().map(|p| p.timestamp()).unwrap_or_default();
        let trx = Transaction {
            expiration: BlockTimestamp(pending_time.0 + 1),
            ref_block_num: 0,
            ref_block_prefix: 0,
            max_net_usage_words: 0,
            max_cpu_usage_ms: 0,
            delay_sec: 0,
            actions: vec![veldt_types::ActionData {
                account: system,
                name: AccountName::new("onblock"),
                authorization: vec![veldt_types::PermissionLevel {
                    actor: system,
                    permission: AccountName::new("active"),
                }],
                data: Vec::new(),
            }],
        };
        let meta = Arc::new(TransactionMetadata::implicit(veldt_types::PackedTransaction {
            transaction: trx,
            signatures: Vec::new(),
        }));
        let billed = self.db.global.get().configuration.min_transaction_cpu_usage_us;
        match self.push_transaction(meta, far_deadline(), u64::MAX, billed, true, 0) {
            Ok(trace) if !trace.is_success() => {
                warn!(error = ?trace.error, "on-block transaction failed; block production continues");
            }
            Ok(_) => {}
            Err(err) => {
                error!(%err, "on-block transaction hit a fatal error");
            }
        }
    }

    /// Drop expired entries from the input-transaction dedup table, bounded
    /// by the deadline.
    fn clear_expired_input_transactions(&mut self, deadline: Instant) {
        let now = self.pending.as_ref().map(|p| p.timestamp()).unwrap_or_default();
        let expired: Vec<TransactionId> = self
            .db
            .transaction_dedup
            .iter()
            .take_while(|_| Instant::now() < deadline)
            .filter(|(_, expiration)| **expiration <= now)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        for id in expired {
            self.db.transaction_dedup.remove(&id);
        }
        if count > 0 {
            debug!(count, "expired input transactions cleared from dedup table");
        }
    }

    /// Refresh the producer-controlled permissions with the standard
    /// thresholds over the active schedule.
    fn update_producers_authority(&mut self) {
        let producers: Vec<AccountName> = self
            .head
            .active_schedule()
            .producers
            .iter()
            .map(|p| p.producer_name)
            .collect();
        let n = producers.len() as u32;
        let threshold = |numerator: u32, denominator: u32| (n * numerator / denominator) + 1;
        let auth = &mut self.collaborators.authorization;
        auth.set_producers_authority(AccountName::new("prod.active"), threshold(2, 3), &producers);
        auth.set_producers_authority(AccountName::new("prod.major"), threshold(1, 2), &producers);
        auth.set_producers_authority(AccountName::new("prod.minor"), threshold(1, 3), &producers);
    }

    /// Apply one transaction to the building block.
    ///
    /// Recoverable failures are reported through the returned trace; only
    /// fatal errors propagate as `Err`.
    pub fn push_transaction(
        &mut self,
        trx: Arc<TransactionMetadata>,
        deadline: Instant,
        max_transaction_time_us: u64,
        billed_cpu_us: u32,
        explicit_billed_cpu: bool,
        subjective_cpu_bill_us: i64,
    ) -> Result<TransactionTrace> {
        let _ = subjective_cpu_bill_us;
        let Some(pending) = self.pending.as_ref() else {
            return Err(ChainError::BlockValidate("no pending block to push into".into()));
        };
        let validating = pending.status.is_validation();
        let block_num = pending.block_num();
        let block_time = pending.timestamp();
        let session_enabled = pending.session.is_enabled();

        let mut trace = TransactionTrace {
            id: Some(trx.id),
            block_num,
            block_time,
            scheduled: false,
            ..Default::default()
        };
        let start = Instant::now();

        let result = self.apply_input_transaction(
            &trx,
            deadline,
            max_transaction_time_us,
            billed_cpu_us,
            explicit_billed_cpu,
            session_enabled,
            start,
            &mut trace,
        );
        self.finish_trace(result, validating, start, &mut trace)?;
        Ok(trace)
    }

    /// Shared failure handling: escalate subjective failures when
    /// validating, record the error in the trace, re-raise fatals.
    fn finish_trace(
        &mut self,
        result: Result<()>,
        validating: bool,
        start: Instant,
        trace: &mut TransactionTrace,
    ) -> Result<()> {
        trace.elapsed_us = start.elapsed().as_micros() as u64;
        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                let err = if validating && err.is_subjective() {
                    ChainError::TransactionObjective(format!("{err} (during validation)"))
                } else {
                    err
                };
                trace.error_code = Some(err.error_code());
                trace.error = Some(err.to_string());
            }
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.report.transaction_count += 1;
            pending.report.total_cpu_usage_us += trace.cpu_usage_us as u64;
            pending.report.total_net_usage += trace.net_usage;
        }
        self.signals.applied_transaction.emit(&Arc::new(trace.clone()));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_input_transaction(
        &mut self,
        trx: &Arc<TransactionMetadata>,
        deadline: Instant,
        max_transaction_time_us: u64,
        billed_cpu_us: u32,
        explicit_billed_cpu: bool,
        session_enabled: bool,
        start: Instant,
        trace: &mut TransactionTrace,
    ) -> Result<()> {
        let transaction = &trx.packed.transaction;
        let block_time = self.pending.as_ref().expect("pending checked by caller").timestamp();

        if !trx.implicit {
            self.check_transaction_preconditions(trx, block_time)?;
        }

        // Deferred input: schedule instead of executing.
        if transaction.delay_sec > 0 && !trx.implicit {
            return self.schedule_deferred(trx, block_time, trace);
        }

        let session = self.db.start_undo_session(session_enabled);
        let restore_point = {
            let pending = self.pending.as_mut().expect("pending checked by caller");
            let BlockStage::Building(building) = &mut pending.stage else {
                let _ = session.undo(&mut self.db);
                return Err(ChainError::BlockValidate("pending block is not building".into()));
            };
            building.common().make_restore_point()
        };

        let execution = self.execute_transaction_actions(
            trx,
            deadline,
            max_transaction_time_us,
            start,
            trace,
        );
        match execution {
            Ok(()) => {
                // Billing and receipt.
                let measured = start.elapsed().as_micros() as u64;
                let limits = self.db.global.get().configuration.clone();
                let cpu = if explicit_billed_cpu {
                    billed_cpu_us
                } else {
                    (measured.max(limits.min_transaction_cpu_usage_us as u64)) as u32
                };
                let net_bytes = sbor::basic_encode(&trx.packed)
                    .map(|bytes| bytes.len() as u64)
                    .unwrap_or(0);
                let result: Result<()> = (|| {
                    if cpu > limits.max_transaction_cpu_usage_us {
                        return Err(ChainError::TransactionObjective(format!(
                            "billed cpu {cpu}us exceeds the transaction limit"
                        )));
                    }
                    if !trx.implicit {
                        self.db.transaction_dedup.insert(trx.id, transaction.expiration);
                    }
                    let actors: Vec<AccountName> = transaction
                        .declared_authorizations()
                        .iter()
                        .map(|level| level.actor)
                        .collect();
                    self.collaborators
                        .resources
                        .add_transaction_usage(&actors, cpu as u64, net_bytes, block_time.slot())
                        .map_err(ChainError::TransactionObjective)?;
                    Ok(())
                })();
                if let Err(err) = result {
                    self.rollback_transaction(restore_point, session, trace);
                    return Err(err);
                }

                trace.cpu_usage_us = cpu;
                trace.net_usage = net_bytes;
                let receipt = TransactionReceipt {
                    status: TransactionReceiptStatus::Executed,
                    cpu_usage_us: cpu,
                    net_usage_words: (net_bytes / 8) as u32,
                    trx: if trx.implicit {
                        TransactionVariant::Id(trx.id)
                    } else {
                        TransactionVariant::Packed(trx.packed.clone())
                    },
                };
                trace.receipt = Some(receipt.clone());
                let pending = self.pending.as_mut().expect("pending checked by caller");
                if let BlockStage::Building(building) = &mut pending.stage {
                    let common = building.common_mut();
                    common.push_receipt(receipt);
                    common.pending_trx_metas.push(trx.clone());
                }
                session
                    .squash(&mut self.db)
                    .map_err(|e| ChainError::Fatal(e.to_string()))?;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.rollback_transaction(restore_point, session, trace);
                Err(err)
            }
        }
    }

    /// Reverse a partially applied transaction: truncate the building
    /// block's containers and discard the transaction's undo session.
    fn rollback_transaction(
        &mut self,
        restore_point: crate::stage::BlockRestorePoint,
        session: veldt_store::UndoSession,
        trace: &mut TransactionTrace,
    ) {
        if let Some(pending) = self.pending.as_mut() {
            if let BlockStage::Building(building) = &mut pending.stage {
                building.common_mut().restore(restore_point);
            }
        }
        trace.action_traces.clear();
        if let Err(err) = session.undo(&mut self.db) {
            // A session mismatch here means the undo stack was corrupted.
            error!(%err, "transaction session undo failed");
        }
    }

    /// Objective and subjective preconditions for input transactions.
    fn check_transaction_preconditions(
        &self,
        trx: &Arc<TransactionMetadata>,
        block_time: BlockTimestamp,
    ) -> Result<()> {
        let transaction = &trx.packed.transaction;
        let limits = &self.db.global.get().configuration;

        if transaction.expiration <= block_time {
            return Err(ChainError::TransactionObjective(format!(
                "transaction expired at {} (block time {})",
                transaction.expiration, block_time
            )));
        }
        let lifetime_slots = limits.max_transaction_lifetime_sec * 2;
        if transaction.expiration.0 > block_time.0 + lifetime_slots {
            return Err(ChainError::TransactionObjective(
                "transaction expiration is too far in the future".into(),
            ));
        }
        if self.db.transaction_dedup.contains_key(&trx.id) {
            return Err(ChainError::TransactionObjective(format!(
                "duplicate transaction {}",
                trx.id
            )));
        }

        // TAPOS: the referenced block must be recent and match.
        let summary = self.db.block_summaries.get(&transaction.ref_block_num);
        match summary {
            Some(id) if block_id_prefix(id) == transaction.ref_block_prefix => {}
            _ => {
                return Err(ChainError::TransactionObjective(
                    "transaction reference block prefix does not match".into(),
                ));
            }
        }

        // Subjective list checks.
        for level in transaction.declared_authorizations() {
            let actor = level.actor;
            if !self.config.actor_whitelist.is_empty()
                && !self.config.actor_whitelist.contains(&actor)
            {
                return Err(ChainError::TransactionSubjective(format!(
                    "actor {actor} is not on the whitelist"
                )));
            }
            if self.config.actor_blacklist.contains(&actor) {
                return Err(ChainError::TransactionSubjective(format!(
                    "actor {actor} is on the blacklist"
                )));
            }
        }
        for action in &transaction.actions {
            if !self.config.contract_whitelist.is_empty()
                && !self.config.contract_whitelist.contains(&action.account)
            {
                return Err(ChainError::TransactionSubjective(format!(
                    "contract {} is not on the whitelist",
                    action.account
                )));
            }
            if self.config.contract_blacklist.contains(&action.account) {
                return Err(ChainError::TransactionSubjective(format!(
                    "contract {} is on the blacklist",
                    action.account
                )));
            }
            if self.config.action_blacklist.contains(&(action.account, action.name)) {
                return Err(ChainError::TransactionSubjective(format!(
                    "action {}::{} is blacklisted",
                    action.account, action.name
                )));
            }
        }
        for key in &trx.recovered_keys {
            if self.config.key_blacklist.contains(key) {
                return Err(ChainError::TransactionSubjective(
                    "transaction signed with a blacklisted key".into(),
                ));
            }
        }

        // Authorization via the permission-graph seam.
        self.collaborators
            .authorization
            .check_authorization(
                &transaction.actions,
                &trx.recovered_keys,
                &[],
                false,
                false,
            )
            .map_err(ChainError::TransactionObjective)?;
        Ok(())
    }

    /// Execute every action of a transaction, appending action traces and
    /// receipt digests.
    fn execute_transaction_actions(
        &mut self,
        trx: &Arc<TransactionMetadata>,
        deadline: Instant,
        max_transaction_time_us: u64,
        start: Instant,
        trace: &mut TransactionTrace,
    ) -> Result<()> {
        for action in &trx.packed.transaction.actions {
            let now = Instant::now();
            if now > deadline {
                return Err(ChainError::TransactionSubjective(
                    "block deadline exceeded during execution".into(),
                ));
            }
            if start.elapsed().as_micros() as u64 > max_transaction_time_us {
                return Err(ChainError::TransactionSubjective(
                    "transaction max execution time exceeded".into(),
                ));
            }

            let (global_sequence, recv_sequence) = {
                let mut sequences = (0, 0);
                self.db.dynamic.modify(|d| {
                    d.global_action_sequence += 1;
                    d.system_recv_sequence += 1;
                    sequences = (d.global_action_sequence, d.system_recv_sequence);
                });
                sequences
            };
            let context = ApplyContext {
                receiver: action.account,
                block_num: trace.block_num,
                block_time: trace.block_time,
                global_sequence,
                recv_sequence,
            };
            let return_value = self
                .collaborators
                .executor
                .apply(&mut self.db, action, &context)
                .map_err(ChainError::TransactionObjective)?;

            let action_trace = veldt_types::ActionTrace {
                action: action.clone(),
                receiver: context.receiver,
                recv_sequence: context.recv_sequence,
                return_value,
                witness_hash: Digest::hash_of(&(context.global_sequence, context.recv_sequence)),
            };
            let digest = action_trace.digest();
            trace.action_traces.push(action_trace);
            if let Some(pending) = self.pending.as_mut() {
                if let BlockStage::Building(building) = &mut pending.stage {
                    building.common_mut().action_receipt_digests.push(digest);
                }
            }
        }
        Ok(())
    }

    /// Schedule a delayed input transaction into the generated table.
    fn schedule_deferred(
        &mut self,
        trx: &Arc<TransactionMetadata>,
        block_time: BlockTimestamp,
        trace: &mut TransactionTrace,
    ) -> Result<()> {
        if self.features.is_builtin_activated(BuiltinFeature::DisableDeferredTrxsStage1) {
            return Err(ChainError::TransactionObjective(
                "deferred transactions are disabled".into(),
            ));
        }
        let transaction = &trx.packed.transaction;
        let limits = self.db.global.get().configuration.clone();
        if transaction.delay_sec > limits.max_transaction_delay_sec {
            return Err(ChainError::TransactionObjective(
                "transaction delay exceeds the maximum".into(),
            ));
        }
        let delay_until = BlockTimestamp(block_time.0 + transaction.delay_sec * 2);
        let expiration = BlockTimestamp(delay_until.0 + limits.max_transaction_lifetime_sec * 2);
        let payer = transaction
            .declared_authorizations()
            .first()
            .map(|level| level.actor)
            .unwrap_or_else(|| AccountName::new(SYSTEM_ACCOUNT));
        self.db.generated_transactions.insert(
            trx.id,
            GeneratedTransaction {
                trx_id: trx.id,
                sender: payer,
                sender_id: 0,
                payer,
                delay_until,
                expiration,
                published: block_time,
                packed: trx.packed.clone(),
            },
        );
        self.collaborators.resources.add_pending_ram_usage(payer, 1);
        self.db.transaction_dedup.insert(trx.id, transaction.expiration);

        let receipt = TransactionReceipt {
            status: TransactionReceiptStatus::Delayed,
            cpu_usage_us: self.db.global.get().configuration.min_transaction_cpu_usage_us,
            net_usage_words: 0,
            trx: TransactionVariant::Packed(trx.packed.clone()),
        };
        trace.receipt = Some(receipt.clone());
        trace.cpu_usage_us = receipt.cpu_usage_us;
        if let Some(pending) = self.pending.as_mut() {
            if let BlockStage::Building(building) = &mut pending.stage {
                let common = building.common_mut();
                common.push_receipt(receipt);
                common.pending_trx_metas.push(trx.clone());
            }
        }
        Ok(())
    }

    /// Execute (or retire) a deferred transaction by id.
    pub fn push_scheduled_transaction(
        &mut self,
        trx_id: TransactionId,
        deadline: Instant,
        max_transaction_time_us: u64,
        billed_cpu_us: u32,
        explicit_billed_cpu: bool,
    ) -> Result<TransactionTrace> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(ChainError::BlockValidate("no pending block to push into".into()));
        };
        let validating = pending.status.is_validation();
        let block_time = pending.timestamp();
        let block_num = pending.block_num();
        let session_enabled = pending.session.is_enabled();

        let Some(generated) = self.db.generated_transactions.get(&trx_id).cloned() else {
            return Err(ChainError::UnknownTransaction(trx_id));
        };

        let mut trace = TransactionTrace {
            id: Some(trx_id),
            block_num,
            block_time,
            scheduled: true,
            ..Default::default()
        };
        let start = Instant::now();

        // Expired deferred transactions are retired with an Expired receipt
        // and no execution. Once the disable feature is active this is the
        // only allowed path.
        if generated.expiration <= block_time {
            self.db.generated_transactions.remove(&trx_id);
            self.collaborators.resources.add_pending_ram_usage(generated.payer, -1);
            let receipt = TransactionReceipt {
                status: TransactionReceiptStatus::Expired,
                cpu_usage_us: 0,
                net_usage_words: 0,
                trx: TransactionVariant::Id(trx_id),
            };
            trace.receipt = Some(receipt.clone());
            if let Some(pending) = self.pending.as_mut() {
                if let BlockStage::Building(building) = &mut pending.stage {
                    let common = building.common_mut();
                    common.push_receipt(receipt);
                }
            }
            self.signals.applied_transaction.emit(&Arc::new(trace.clone()));
            return Ok(trace);
        }
        if self.features.is_builtin_activated(BuiltinFeature::DisableDeferredTrxsStage1) {
            return Err(ChainError::TransactionObjective(
                "deferred transactions may only be retired as expired".into(),
            ));
        }
        if generated.delay_until > block_time {
            return Err(ChainError::TransactionObjective(format!(
                "deferred transaction is not ready until {}",
                generated.delay_until
            )));
        }

        let meta = Arc::new(TransactionMetadata::scheduled(generated.packed.clone()));
        let session = self.db.start_undo_session(session_enabled);
        let restore_point = {
            let pending = self.pending.as_mut().expect("pending checked above");
            let BlockStage::Building(building) = &mut pending.stage else {
                let _ = session.undo(&mut self.db);
                return Err(ChainError::BlockValidate("pending block is not building".into()));
            };
            building.common().make_restore_point()
        };

        self.db.generated_transactions.remove(&trx_id);
        self.collaborators.resources.add_pending_ram_usage(generated.payer, -1);

        let execution = self.execute_transaction_actions(
            &meta,
            deadline,
            max_transaction_time_us,
            start,
            &mut trace,
        );
        let result = match execution {
            Ok(()) => {
                let cpu = if explicit_billed_cpu {
                    billed_cpu_us
                } else {
                    (start.elapsed().as_micros() as u64)
                        .max(self.db.global.get().configuration.min_transaction_cpu_usage_us as u64)
                        as u32
                };
                trace.cpu_usage_us = cpu;
                let receipt = TransactionReceipt {
                    status: TransactionReceiptStatus::Executed,
                    cpu_usage_us: cpu,
                    net_usage_words: 0,
                    trx: TransactionVariant::Id(trx_id),
                };
                trace.receipt = Some(receipt.clone());
                let pending = self.pending.as_mut().expect("pending checked above");
                if let BlockStage::Building(building) = &mut pending.stage {
                    let common = building.common_mut();
                    common.push_receipt(receipt);
                    common.pending_trx_metas.push(meta.clone());
                }
                session.squash(&mut self.db)?;
                Ok(())
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                // Soft/hard-fail bookkeeping: the failed deferred transaction
                // still consumes its slot with a hard-fail receipt.
                self.rollback_transaction(restore_point, session, &mut trace);
                let session = self.db.start_undo_session(session_enabled);
                self.db.generated_transactions.remove(&trx_id);
                let receipt = TransactionReceipt {
                    status: TransactionReceiptStatus::HardFail,
                    cpu_usage_us: billed_cpu_us
                        .max(self.db.global.get().configuration.min_transaction_cpu_usage_us),
                    net_usage_words: 0,
                    trx: TransactionVariant::Id(trx_id),
                };
                trace.cpu_usage_us = receipt.cpu_usage_us;
                trace.receipt = Some(receipt.clone());
                let pending = self.pending.as_mut().expect("pending checked above");
                if let BlockStage::Building(building) = &mut pending.stage {
                    building.common_mut().push_receipt(receipt);
                }
                session.squash(&mut self.db)?;
                Err(err)
            }
        };
        self.finish_trace(result, validating, start, &mut trace)?;
        Ok(trace)
    }

    /// Propose a new finalizer policy from within the building block. The
    /// first proposal on a legacy chain turns the block into the
    /// instant-finality genesis.
    pub fn set_proposed_finalizers(&mut self, finalizers: Vec<veldt_types::FinalizerAuthority>) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::BlockValidate("no pending block".into()));
        };
        let BlockStage::Building(building) = &mut pending.stage else {
            return Err(ChainError::BlockValidate("pending block is not building".into()));
        };
        match building {
            BuildingBlock::Dpos(bb) => {
                bb.proposed_finalizer_policy = Some(FinalizerPolicy::new(1, finalizers));
            }
            BuildingBlock::If(bb) => {
                // Same-block reproposal keeps the same generation; the
                // promotions this block will perform do not change the next
                // generation either.
                let generation = match &bb.new_finalizer_policy {
                    Some(existing) => existing.generation,
                    None => bb.parent.policy_tracker.next_generation(),
                };
                bb.new_finalizer_policy = Some(FinalizerPolicy::new(generation, finalizers));
            }
        }
        Ok(())
    }

    /// Externally force the instant-finality irreversibility floor.
    pub fn set_if_irreversible_block_num(&mut self, block_num: BlockNum) {
        self.if_irreversible_override = self.if_irreversible_override.max(block_num);
    }

    /// Convert the building block into an assembled block: compute merkles
    /// on the worker pool and build the header.
    pub fn finalize_block(&mut self) -> Result<()> {
        self.finalize_block_impl(None)
    }

    /// `overrides` carries the header data dictated by a received block.
    fn finalize_block_impl(&mut self, overrides: Option<ValidationOverrides>) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::BlockValidate("no pending block to finalize".into()));
        };
        let BlockStage::Building(_) = &pending.stage else {
            return Err(ChainError::BlockValidate("pending block is not building".into()));
        };
        // Take the building block out so merkle inputs can move to workers.
        // A finalize failure leaves the placeholder behind; callers abort
        // the pending block on error.
        let placeholder = BlockStage::Completed(CompletedBlock { state: self.head.clone() });
        let stage = std::mem::replace(&mut pending.stage, placeholder);
        let BlockStage::Building(building) = stage else { unreachable!() };

        let savanna = matches!(&building, BuildingBlock::If(_))
            || matches!(&building, BuildingBlock::Dpos(bb) if bb.proposed_finalizer_policy.is_some());

        let common = building.common();
        // Merkle computation is pure; hand it to the pool and await at the
        // integration barrier below.
        let action_digests = common.action_receipt_digests.clone();
        let action_fut = self.worker.submit(move || {
            if savanna {
                merkle::symmetric_merkle(action_digests)
            } else {
                merkle::canonical_merkle(action_digests)
            }
        });
        let trx_fut = match &common.trx_mroot_source {
            TrxMrootSource::Provided(digest) => {
                let digest = *digest;
                self.worker.submit(move || digest)
            }
            TrxMrootSource::Digests(digests) => {
                let digests = digests.clone();
                self.worker.submit(move || {
                    if savanna {
                        merkle::symmetric_merkle(digests)
                    } else {
                        merkle::canonical_merkle(digests)
                    }
                })
            }
        };
        let action_mroot = action_fut.wait();
        let transaction_mroot = trx_fut.wait();

        let receipts = building.common().pending_trx_receipts.clone();
        let assembled = match building {
            BuildingBlock::Dpos(bb) => {
                if let Some(policy) = bb.proposed_finalizer_policy {
                    // Instant-finality genesis block.
                    let input = SavannaHeaderInput {
                        timestamp: bb.common.timestamp,
                        producer: bb.common.producer,
                        transaction_mroot,
                        action_mroot,
                        qc_claim: QcClaim {
                            block_num: bb.parent.block_num() + 1,
                            is_strong_qc: false,
                        },
                        new_finalizer_policy: None,
                        new_proposer_schedule: None,
                        new_protocol_features: bb.common.new_protocol_features.clone(),
                    };
                    let header_state =
                        SavannaBlockHeaderState::genesis(&bb.parent, input, policy)?;
                    let unsigned_block = SignedBlock {
                        header: header_state.header.clone(),
                        producer_signature: BlsSignature::NULL,
                        transactions: receipts,
                        block_extensions: Vec::new(),
                    };
                    AssembledBlock::If(AssembledBlockIf {
                        header_state,
                        unsigned_block,
                        trx_metas: bb.common.pending_trx_metas,
                        qc: None,
                    })
                } else {
                    let producer = match &overrides {
                        Some(ov) => ov.producer,
                        None => bb
                            .parent
                            .effective_schedule()
                            .scheduled_producer(bb.common.timestamp)
                            .producer_name,
                    };
                    let input = LegacyHeaderInput {
                        timestamp: bb.common.timestamp,
                        producer,
                        confirmed: bb.confirmed,
                        transaction_mroot,
                        action_mroot,
                        new_pending_schedule: bb.new_pending_producer_schedule,
                        new_protocol_features: bb.common.new_protocol_features.clone(),
                    };
                    let header_state = bb.parent.next(input)?;
                    let unsigned_block = SignedBlock {
                        header: header_state.header.clone(),
                        producer_signature: BlsSignature::NULL,
                        transactions: receipts,
                        block_extensions: Vec::new(),
                    };
                    AssembledBlock::Dpos(AssembledBlockDpos {
                        header_state,
                        unsigned_block,
                        trx_metas: bb.common.pending_trx_metas,
                    })
                }
            }
            BuildingBlock::If(bb) => {
                let (qc_claim, qc, new_policy, new_proposer, producer) = match overrides {
                    Some(ov) => (
                        ov.qc_claim,
                        ov.qc,
                        ov.new_finalizer_policy,
                        ov.new_proposer_schedule,
                        ov.producer,
                    ),
                    None => {
                        let (claim, qc) = self.best_qc_for_building(&bb.parent);
                        let core_preview = bb.parent.core.next(&bb.parent.block_ref(), claim);
                        let producer = bb
                            .parent
                            .effective_proposer_schedule(core_preview.last_final_block_num())
                            .scheduled_producer(bb.common.timestamp)
                            .producer_name;
                        (claim, qc, bb.new_finalizer_policy.clone(), bb.new_proposer_schedule.clone(), producer)
                    }
                };
                let input = SavannaHeaderInput {
                    timestamp: bb.common.timestamp,
                    producer,
                    transaction_mroot,
                    action_mroot,
                    qc_claim,
                    new_finalizer_policy: new_policy,
                    new_proposer_schedule: new_proposer,
                    new_protocol_features: bb.common.new_protocol_features.clone(),
                };
                let header_state = bb.parent.next(input)?;
                let mut block_extensions = Vec::new();
                if let Some(qc) = &qc {
                    block_extensions.push(veldt_types::BlockExtension::Qc(qc.clone()));
                }
                let unsigned_block = SignedBlock {
                    header: header_state.header.clone(),
                    producer_signature: BlsSignature::NULL,
                    transactions: receipts,
                    block_extensions,
                };
                AssembledBlock::If(AssembledBlockIf {
                    header_state,
                    unsigned_block,
                    trx_metas: bb.common.pending_trx_metas,
                    qc,
                })
            }
        };

        let pending = self.pending.as_mut().expect("pending survived assembly");
        pending.stage = BlockStage::Assembled(assembled);
        Ok(())
    }

    /// The best QC claim available for a block building on `parent`:
    /// the highest ancestor with a verified certificate, never below the
    /// parent's own claim.
    fn best_qc_for_building(
        &self,
        parent: &SavannaBlockHeaderState,
    ) -> (QcClaim, Option<QuorumCertificate>) {
        let parent_claim = parent.core.latest_qc_claim();
        let mut candidates: Vec<BlockId> = vec![parent.id];
        for reference in parent.core.refs().iter().rev() {
            // The claimed block itself stays a candidate: a certificate
            // stronger than the claimed strength may have formed since.
            if reference.block_num() < parent_claim.block_num {
                break;
            }
            candidates.push(reference.block_id);
        }
        // Highest block first; include the claimed block itself in case a
        // stronger certificate showed up for it.
        for id in candidates {
            let from_votes = self
                .vote_collector
                .get(&id)
                .and_then(|pending_qc| pending_qc.extract_qc());
            let qc = match (self.received_qcs.get(&id), from_votes) {
                (Some(received), Some(aggregated)) => {
                    let policy = self.active_policy_for_qc(&id);
                    if let Some(policy) = policy {
                        if aggregated.is_strong(&policy) && !received.is_strong(&policy) {
                            Some(aggregated)
                        } else {
                            Some(received.clone())
                        }
                    } else {
                        Some(received.clone())
                    }
                }
                (Some(received), None) => Some(received.clone()),
                (None, aggregated) => aggregated,
            };
            if let Some(qc) = qc {
                let Some(policy) = self.active_policy_for_qc(&id) else { continue };
                let claim = qc.to_claim(&policy);
                if claim > parent_claim {
                    return (claim, Some(qc));
                }
            }
        }
        (parent_claim, None)
    }

    fn active_policy_for_qc(&self, id: &BlockId) -> Option<FinalizerPolicy> {
        self.fork_db
            .get(id)?
            .as_savanna()
            .map(|s| s.header_state.policy_tracker.active().clone())
    }

    /// Sign the assembled block, producing the completed stage.
    pub fn sign_block(&mut self, signer: &dyn Fn(&Digest) -> BlsSignature) -> Result<()> {
        let digest = {
            let Some(pending) = self.pending.as_ref() else {
                return Err(ChainError::BlockValidate("no pending block to sign".into()));
            };
            let BlockStage::Assembled(assembled) = &pending.stage else {
                return Err(ChainError::BlockValidate("pending block is not assembled".into()));
            };
            match assembled {
                AssembledBlock::Dpos(ab) => ab.header_state.header.digest(),
                AssembledBlock::If(ab) => ab.header_state.header.digest(),
            }
        };
        let signature = signer(&digest);
        self.complete_block(signature)
    }

    /// Attach the producer signature and build the block state.
    fn complete_block(&mut self, signature: BlsSignature) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::BlockValidate("no pending block".into()));
        };
        let BlockStage::Assembled(_) = &pending.stage else {
            return Err(ChainError::BlockValidate("pending block is not assembled".into()));
        };
        let stage = std::mem::replace(&mut pending.stage, BlockStage::Completed(CompletedBlock {
            state: self.head.clone(),
        }));
        let BlockStage::Assembled(assembled) = stage else { unreachable!() };

        let state = match assembled {
            AssembledBlock::Dpos(ab) => {
                let mut block = ab.unsigned_block;
                block.producer_signature = signature;
                BlockStateVariant::Legacy(Arc::new(LegacyBlockState {
                    header_state: ab.header_state,
                    block: Arc::new(block),
                }))
            }
            AssembledBlock::If(ab) => {
                let mut block = ab.unsigned_block;
                block.producer_signature = signature;
                BlockStateVariant::Savanna(Arc::new(SavannaBlockState {
                    header_state: ab.header_state,
                    block: Arc::new(block),
                }))
            }
        };
        pending.stage = BlockStage::Completed(CompletedBlock { state });
        Ok(())
    }

    /// Install the completed block: fork database, head pointer, signals,
    /// then the irreversibility loop.
    pub fn commit_block(&mut self) -> Result<()> {
        self.commit_block_impl()?;
        self.log_irreversible()
    }

    fn commit_block_impl(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Err(ChainError::BlockValidate("no pending block to commit".into()));
        };
        let BlockStage::Completed(completed) = pending.stage else {
            self.pending = None;
            return Err(ChainError::BlockValidate("pending block is not completed".into()));
        };
        let state = completed.state;
        let id = state.id();

        if self.fork_db.get(&id).is_some() {
            // Validation path: the state was added at push; refine it with
            // the fully applied version.
            self.fork_db.update(&id, state.clone())?;
            self.fork_db.mark_valid(&id)?;
        } else {
            self.fork_db.add(state.clone(), true)?;
        }

        pending.session.push();
        self.head = state.clone();

        // A strong claim means a strong QC exists over the claimed block,
        // which makes that block's `final_on_strong_qc_block_num` final.
        if let Some(savanna) = state.as_savanna() {
            let claim = savanna.header_state.core.latest_qc_claim();
            if claim.is_strong_qc {
                let finalized = self
                    .fork_db
                    .search_on_branch(state.id(), claim.block_num)
                    .and_then(|target| target.as_savanna())
                    .map(|target| target.header_state.core.final_on_strong_qc_block_num());
                if let Some(finalized) = finalized {
                    self.if_irreversible_override = self.if_irreversible_override.max(finalized);
                }
            }
        }

        let block = state.block().clone();
        self.signals.accepted_block_header.emit(&(block.clone(), id));
        self.signals.accepted_block.emit(&(block, id));
        debug!(block_num = state.block_num(), id = %id, "block committed");
        Ok(())
    }

    /// Destroy the pending state, reversing its undo session. Returns the
    /// applied transaction metas so callers may retry them.
    pub fn abort_block(&mut self) -> Vec<Arc<TransactionMetadata>> {
        let Some(mut pending) = self.pending.take() else {
            return Vec::new();
        };
        let metas = pending.extract_trx_metas();
        if let Err(err) = pending.session.undo(&mut self.db) {
            error!(%err, "aborting pending block failed to undo its session");
        }
        self.features.popped_blocks_to(self.head.block_num());
        metas
    }

    // ═══════════════════════════════════════════════════════════════════
    // Irreversibility
    // ═══════════════════════════════════════════════════════════════════

    /// Advance the last-irreversible pointer: append newly final blocks to
    /// the log, commit their database sessions, advance the fork-database
    /// root.
    pub fn log_irreversible(&mut self) -> Result<()> {
        let fork_head = self.fork_db.head().clone();
        let new_lib = fork_head
            .dpos_irreversible_blocknum()
            .max(fork_head.instant_finality_irreversible_blocknum())
            .max(self.if_irreversible_override);
        let lib_num = self.fork_db.root().block_num();
        if new_lib <= lib_num {
            return Ok(());
        }

        let branch = self.fork_db.fetch_branch(fork_head.id(), new_lib);
        // Serialization is pure work; overlap it with the commit loop.
        let mut packed: Vec<_> = branch
            .iter()
            .rev()
            .map(|state| {
                let block = state.block().clone();
                self.worker.submit(move || {
                    sbor::basic_encode(block.as_ref()).expect("blocks always encode")
                })
            })
            .collect();

        let mut new_root = None;
        for (state, handle) in branch.iter().rev().zip(packed.drain(..)) {
            let id = state.id();
            let block = state.block().clone();
            if self.config.read_mode == ReadMode::Irreversible && !self.fork_db.is_valid(&id) {
                self.apply_block(state.clone(), BlockStatus::Complete)?;
            }
            self.signals.irreversible_block.emit(&(block.clone(), id));
            self.collaborators
                .block_log
                .append(block, id, handle.wait())
                .map_err(ChainError::Fatal)?;
            self.db.commit(state.block_num() as i64);
            new_root = Some(id);
        }

        if let Some(root_id) = new_root {
            let pruned = self.fork_db.advance_root(root_id)?;
            // Drop pruned branches off the critical path.
            self.worker.submit(move || drop(pruned));
            let lib = self.fork_db.root().block_num();
            self.vote_collector.retain(|id, _| id.block_num() > lib);
            self.received_qcs.retain(|id, _| id.block_num() > lib);
            info!(lib, "irreversible block advanced");
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Receiving blocks
    // ═══════════════════════════════════════════════════════════════════

    /// Header-level validation of a received block, producing its (not yet
    /// applied) state. The state's execution-dependent fields are refined
    /// when the block is applied.
    pub fn create_block_state(&self, block: Arc<SignedBlock>) -> Result<BlockStateVariant> {
        let id = block.calculate_id();
        let previous = block.header.previous;
        let Some(parent) = self.fork_db.get(&previous) else {
            return Err(ChainError::UnlinkableBlock { id, previous });
        };

        let state = match parent {
            BlockStateVariant::Legacy(parent_state) => {
                match block.header.finality_extension() {
                    Some(ext) => {
                        // Transition block: the instant-finality genesis.
                        let diff = ext.new_finalizer_policy_diff.as_ref().ok_or_else(|| {
                            ChainError::BlockValidate(
                                "transition block must carry a finalizer policy".into(),
                            )
                        })?;
                        let empty =
                            FinalizerPolicy { generation: 0, threshold: 0, finalizers: Vec::new() };
                        let policy = empty.apply_diff(diff)?;
                        let input = SavannaHeaderInput {
                            timestamp: block.header.timestamp,
                            producer: block.header.producer,
                            transaction_mroot: block.header.transaction_mroot,
                            action_mroot: Digest::ZERO,
                            qc_claim: ext.qc_claim,
                            new_finalizer_policy: None,
                            new_proposer_schedule: None,
                            new_protocol_features: block.header.new_protocol_features().to_vec(),
                        };
                        let header_state = SavannaBlockHeaderState::genesis(
                            &parent_state.header_state,
                            input,
                            policy,
                        )?;
                        BlockStateVariant::Savanna(Arc::new(SavannaBlockState {
                            header_state,
                            block: block.clone(),
                        }))
                    }
                    None => {
                        let input = LegacyHeaderInput {
                            timestamp: block.header.timestamp,
                            producer: block.header.producer,
                            confirmed: block.header.confirmed,
                            transaction_mroot: block.header.transaction_mroot,
                            action_mroot: block.header.action_mroot,
                            new_pending_schedule: block.header.new_producers.clone(),
                            new_protocol_features: block.header.new_protocol_features().to_vec(),
                        };
                        let header_state = parent_state.header_state.next(input)?;
                        BlockStateVariant::Legacy(Arc::new(LegacyBlockState {
                            header_state,
                            block: block.clone(),
                        }))
                    }
                }
            }
            BlockStateVariant::Savanna(parent_state) => {
                let ext = block.header.finality_extension().ok_or_else(|| {
                    ChainError::BlockValidate(
                        "instant-finality block is missing its finality extension".into(),
                    )
                })?;
                let new_policy = match &ext.new_finalizer_policy_diff {
                    Some(diff) => {
                        Some(parent_state.header_state.diff_base_policy().apply_diff(diff)?)
                    }
                    None => None,
                };

                // A claim above the parent's must be substantiated by a
                // certificate in the block extensions. Signature checks need
                // the certified block's exact finality digest, so they run
                // here for applied parents and during apply otherwise.
                let parent_claim = parent_state.header_state.core.latest_qc_claim();
                if ext.qc_claim > parent_claim {
                    let qc = block.qc_extension().ok_or_else(|| {
                        ChainError::BlockValidate(
                            "qc claim advanced without a certificate".into(),
                        )
                    })?;
                    if self.fork_db.is_valid(&previous) {
                        self.verify_qc_against_claim(qc, ext.qc_claim, parent_state)?;
                    }
                } else if ext.qc_claim < parent_claim {
                    return Err(ChainError::BlockValidate("qc claim regressed".into()));
                }

                let input = SavannaHeaderInput {
                    timestamp: block.header.timestamp,
                    producer: block.header.producer,
                    transaction_mroot: block.header.transaction_mroot,
                    action_mroot: Digest::ZERO,
                    qc_claim: ext.qc_claim,
                    new_finalizer_policy: new_policy,
                    new_proposer_schedule: ext.new_proposer_schedule.clone(),
                    new_protocol_features: block.header.new_protocol_features().to_vec(),
                };
                let header_state = parent_state.header_state.next(input)?;
                BlockStateVariant::Savanna(Arc::new(SavannaBlockState {
                    header_state,
                    block: block.clone(),
                }))
            }
        };

        // With a fully applied parent the reconstructed header must match
        // the received one. With a provisional parent (an unapplied branch
        // candidate) full agreement waits for the apply pass.
        if self.fork_db.is_valid(&previous) {
            self.check_header_agreement(&state, &block)?;
        }

        // Producer signature over the header digest.
        let authority = &governing_schedule(&state)
            .scheduled_producer(block.header.timestamp)
            .authority;
        let digest = block.header.digest();
        let verified = authority
            .keys
            .iter()
            .any(|(key, _)| key.verify(digest.as_bytes(), &block.producer_signature));
        if !verified {
            return Err(ChainError::BlockValidate("invalid producer signature".into()));
        }

        Ok(state)
    }

    fn check_header_agreement(
        &self,
        state: &BlockStateVariant,
        block: &Arc<SignedBlock>,
    ) -> Result<()> {
        let rebuilt = match state {
            BlockStateVariant::Legacy(s) => &s.header_state.header,
            BlockStateVariant::Savanna(s) => &s.header_state.header,
        };
        if *rebuilt != block.header {
            return Err(ChainError::BlockValidate(format!(
                "received header does not match the reconstructed one for block {}",
                block.block_num()
            )));
        }
        Ok(())
    }

    /// Verify that a block-carried certificate substantiates its claim.
    fn verify_qc_against_claim(
        &self,
        qc: &QuorumCertificate,
        claim: QcClaim,
        parent: &Arc<SavannaBlockState>,
    ) -> Result<()> {
        if qc.block_num != claim.block_num {
            return Err(ChainError::BlockValidate(format!(
                "certificate covers block {} but the claim names {}",
                qc.block_num, claim.block_num
            )));
        }
        // Locate the certified block on the parent's branch.
        let target = if claim.block_num == parent.header_state.block_num() {
            BlockStateVariant::Savanna(parent.clone())
        } else {
            self.fork_db
                .search_on_branch(parent.header_state.id, claim.block_num)
                .cloned()
                .ok_or_else(|| {
                    ChainError::BlockValidate("certified block not found on branch".into())
                })?
        };
        let Some(target) = target.as_savanna() else {
            return Err(ChainError::BlockValidate(
                "certificate targets a pre-transition block".into(),
            ));
        };
        let policy = target.header_state.policy_tracker.active();
        if !qc.verify(policy, &target.header_state.finality_digest) {
            return Err(ChainError::BlockValidate("certificate signature is invalid".into()));
        }
        if claim.is_strong_qc && !qc.is_strong(policy) {
            return Err(ChainError::BlockValidate(
                "claim says strong but the certificate is weak".into(),
            ));
        }
        Ok(())
    }

    /// Route an externally received block through validation, the fork
    /// database and (possibly) a fork switch.
    pub fn push_block(&mut self, block: Arc<SignedBlock>) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::BlockValidate(
                "cannot push a block while one is pending; abort first".into(),
            ));
        }
        let id = block.calculate_id();
        if self.fork_db.get(&id).is_some() {
            return Ok(());
        }

        let state = self.create_block_state(block.clone())?;
        self.fork_db.add(state.clone(), false)?;
        self.signals.accepted_block_header.emit(&(block.clone(), id));
        if let Some(qc) = block.qc_extension() {
            self.note_received_qc(id, qc);
        }

        self.maybe_switch_forks()
    }

    /// Remember the strongest certificate seen for each block. Only
    /// applied targets are considered; their finality digests are exact.
    fn note_received_qc(&mut self, carrier_id: BlockId, qc: &QuorumCertificate) {
        let Some(target_id) = self
            .fork_db
            .search_on_branch(carrier_id, qc.block_num)
            .map(|state| state.id())
        else {
            return;
        };
        if !self.fork_db.is_valid(&target_id) {
            return;
        }
        match self.received_qcs.get(&target_id) {
            Some(existing) => {
                let Some(policy) = self.active_policy_for_qc(&target_id) else { return };
                if qc.is_strong(&policy) && !existing.is_strong(&policy) {
                    self.received_qcs.insert(target_id, qc.clone());
                }
            }
            None => {
                self.received_qcs.insert(target_id, qc.clone());
            }
        }
    }

    /// Apply pending fork-database work: extend the head in place, or
    /// switch branches atomically.
    fn maybe_switch_forks(&mut self) -> Result<()> {
        let best = self.fork_db.pending_head().clone();
        if best.id() == self.head.id() {
            return Ok(());
        }

        if best.previous() == self.head.id() {
            if let Err(err) = self.apply_block(best.clone(), BlockStatus::Complete) {
                let _ = self.fork_db.remove(&best.id());
                return Err(err);
            }
            return self.log_irreversible();
        }

        let old_head = self.head.clone();
        info!(
            from = %old_head.id(),
            from_num = old_head.block_num(),
            to = %best.id(),
            to_num = best.block_num(),
            "switching forks"
        );
        let (new_branch, old_branch) = self.fork_db.fetch_branch_from(best.id(), old_head.id())?;

        // Pop the abandoned branch.
        for _ in &old_branch {
            self.pop_block()?;
        }

        // Apply the new branch oldest first.
        let mut applied = 0usize;
        let mut failure = None;
        for state in new_branch.iter().rev() {
            let status = if self.fork_db.is_valid(&state.id()) {
                BlockStatus::Validated
            } else {
                BlockStatus::Complete
            };
            match self.apply_block(state.clone(), status) {
                Ok(()) => applied += 1,
                Err(err) if matches!(err, ChainError::Fatal(_)) => return Err(err),
                Err(err) => {
                    failure = Some((state.id(), err));
                    break;
                }
            }
        }

        if let Some((bad_id, err)) = failure {
            error!(%err, block = %bad_id, "fork switch failed; restoring the previous branch");
            // Remove the offending block and everything built on it.
            let _ = self.fork_db.remove(&bad_id);
            // Pop the blocks we managed to apply.
            for _ in 0..applied {
                self.pop_block()?;
            }
            // Re-apply the original branch (validated before).
            for state in old_branch.iter().rev() {
                self.apply_block(state.clone(), BlockStatus::Validated)?;
            }
            debug_assert_eq!(self.head.id(), old_head.id());
            return Err(err);
        }

        info!(new_head = %self.head.id(), "fork switch complete");
        self.log_irreversible()
    }

    /// Undo the head block: revert its database session and step the head
    /// pointer back to its parent.
    fn pop_block(&mut self) -> Result<()> {
        let previous = self.head.previous();
        let Some(parent) = self.fork_db.get(&previous).cloned() else {
            return Err(ChainError::Fatal("cannot pop below the fork database root".into()));
        };
        if !self.db.undo() {
            return Err(ChainError::Fatal(
                "state database has no session to pop during fork switch".into(),
            ));
        }
        self.features.popped_blocks_to(parent.block_num());
        self.head = parent;
        Ok(())
    }

    /// Replay a received block's transactions through the standard
    /// pipeline, verify the outcome matches its header, and commit it.
    fn apply_block(&mut self, state: BlockStateVariant, status: BlockStatus) -> Result<()> {
        let block = state.block().clone();
        let id = state.id();
        let header = &block.header;

        // Deferred certificate verification: by apply time the parent and
        // the certified ancestor are exact.
        let parent_savanna = self
            .fork_db
            .get(&header.previous)
            .and_then(|p| p.as_savanna().cloned());
        if let (Some(parent), Some(ext)) = (&parent_savanna, header.finality_extension()) {
            let parent_claim = parent.header_state.core.latest_qc_claim();
            if ext.qc_claim > parent_claim {
                let qc = block.qc_extension().ok_or_else(|| {
                    ChainError::BlockValidate("qc claim advanced without a certificate".into())
                })?;
                self.verify_qc_against_claim(qc, ext.qc_claim, parent)?;
            }
        }
        // The policy a transition or policy-changing block materializes.
        let diffed_policy = match header.finality_extension().and_then(|ext| {
            ext.new_finalizer_policy_diff.as_ref()
        }) {
            Some(diff) => match &parent_savanna {
                Some(parent) => {
                    Some(parent.header_state.diff_base_policy().apply_diff(diff)?)
                }
                None => {
                    let empty = FinalizerPolicy {
                        generation: 0,
                        threshold: 0,
                        finalizers: Vec::new(),
                    };
                    Some(empty.apply_diff(diff)?)
                }
            },
            None => None,
        };

        self.start_block(
            header.timestamp,
            header.confirmed,
            header.new_protocol_features(),
            status,
            Some(id),
            far_deadline(),
        )?;

        let applied = (|| -> Result<()> {
            // The merkle is dictated by the received block, and a
            // transition block re-proposes its finalizer policy.
            {
                let pending = self.pending.as_mut().expect("start_block installed pending");
                if let BlockStage::Building(building) = &mut pending.stage {
                    building.common_mut().trx_mroot_source =
                        TrxMrootSource::Provided(header.transaction_mroot);
                    building.common_mut().producer = header.producer;
                    if let BuildingBlock::Dpos(bb) = building {
                        if parent_savanna.is_none() && diffed_policy.is_some() {
                            bb.proposed_finalizer_policy = diffed_policy.clone();
                        }
                    }
                }
            }

            for receipt in &block.transactions {
                let trace = match &receipt.trx {
                    TransactionVariant::Packed(packed) => {
                        let keys = if self.config.force_all_checks
                            || status != BlockStatus::Irreversible
                        {
                            packed.recover_keys().map_err(|_| {
                                ChainError::BlockValidate(
                                    "transaction signature recovery failed".into(),
                                )
                            })?
                        } else {
                            Vec::new()
                        };
                        let meta = Arc::new(TransactionMetadata::recovered(
                            packed.clone(),
                            keys,
                            0,
                        ));
                        self.push_transaction(
                            meta,
                            far_deadline(),
                            u64::MAX,
                            receipt.cpu_usage_us,
                            true,
                            0,
                        )?
                    }
                    TransactionVariant::Id(trx_id) => {
                        if receipt.status == TransactionReceiptStatus::Executed
                            && self.db.generated_transactions.get(trx_id).is_none()
                        {
                            // Implicit receipts (the on-block transaction) were
                            // already produced by start_block.
                            continue;
                        }
                        match self.push_scheduled_transaction(
                            *trx_id,
                            far_deadline(),
                            u64::MAX,
                            receipt.cpu_usage_us,
                            true,
                        ) {
                            Ok(trace) => trace,
                            Err(err) if err.is_fatal() => return Err(err),
                            Err(_)
                                if receipt.status == TransactionReceiptStatus::HardFail =>
                            {
                                // Hard failures are allowed to fail again.
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                };
                let produced = {
                    let pending = self.pending.as_ref().expect("pending during apply");
                    match &pending.stage {
                        BlockStage::Building(bb) => {
                            bb.common().pending_trx_receipts.last().cloned()
                        }
                        _ => None,
                    }
                };
                if receipt.status == TransactionReceiptStatus::Executed && !trace.is_success() {
                    return Err(ChainError::BlockValidate(format!(
                        "transaction {:?} failed during validation: {:?}",
                        trace.id, trace.error
                    )));
                }
                if let Some(produced) = produced {
                    if produced.status != receipt.status
                        || produced.cpu_usage_us != receipt.cpu_usage_us
                        || produced.net_usage_words != receipt.net_usage_words
                    {
                        return Err(ChainError::BlockValidate(
                            "transaction receipt does not match the block".into(),
                        ));
                    }
                }
            }

            // The dictated transaction merkle must match the receipts the
            // block actually carries.
            let savanna_block = parent_savanna.is_some() || state.is_savanna();
            let receipt_digests: Vec<Digest> =
                block.transactions.iter().map(|receipt| receipt.digest()).collect();
            let computed_trx_mroot = if savanna_block {
                merkle::symmetric_merkle(receipt_digests)
            } else {
                merkle::canonical_merkle(receipt_digests)
            };
            if computed_trx_mroot != header.transaction_mroot {
                return Err(ChainError::BlockValidate(
                    "transaction merkle root does not match the block's receipts".into(),
                ));
            }

            // Rebuild the header with the dictated consensus inputs.
            let overrides = match (&parent_savanna, header.finality_extension()) {
                (Some(_), Some(ext)) => ValidationOverrides {
                    qc_claim: ext.qc_claim,
                    qc: block.qc_extension().cloned(),
                    new_finalizer_policy: diffed_policy.clone(),
                    new_proposer_schedule: ext.new_proposer_schedule.clone(),
                    producer: header.producer,
                },
                _ => ValidationOverrides {
                    qc_claim: QcClaim { block_num: 0, is_strong_qc: false },
                    qc: None,
                    new_finalizer_policy: None,
                    new_proposer_schedule: None,
                    producer: header.producer,
                },
            };
            self.finalize_block_impl(Some(overrides))?;

            // Adopt the producer's signature and compare outcomes.
            self.complete_block(block.producer_signature)?;
            let pending = self.pending.as_ref().expect("pending during apply");
            let BlockStage::Completed(completed) = &pending.stage else { unreachable!() };
            if completed.state.id() != id {
                return Err(ChainError::BlockValidate(format!(
                    "applied block {} does not reproduce the received id {}",
                    completed.state.id(),
                    id
                )));
            }
            Ok(())
        })();

        match applied {
            Ok(()) => self.commit_block_impl(),
            Err(err) => {
                self.abort_block();
                Err(err)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Finality plumbing
    // ═══════════════════════════════════════════════════════════════════

    /// Process a finality vote received from a peer.
    pub fn process_vote_message(&mut self, connection_id: u32, vote: &VoteMessage) -> VoteStatus {
        let Some(state) = self.fork_db.get(&vote.block_id) else {
            debug!(connection_id, block = %vote.block_id, "vote for unknown block");
            return VoteStatus::UnknownBlock;
        };
        let Some(savanna) = state.as_savanna().cloned() else {
            return VoteStatus::UnknownBlock;
        };
        let pending_qc = self.vote_collector.entry(vote.block_id).or_insert_with(|| {
            PendingQc::new(
                savanna.header_state.block_num(),
                savanna.header_state.finality_digest,
                Arc::new(savanna.header_state.policy_tracker.active().clone()),
            )
        });
        let status = pending_qc.add_vote(vote);
        if status == VoteStatus::Success && pending_qc.is_strong_quorum_met() {
            debug!(block = %vote.block_id, "strong quorum reached");
        }
        status
    }

    /// Produce this node's votes on an applied block, emitting the
    /// vote signal for each.
    pub fn create_votes_for(&mut self, block_id: &BlockId, strong: bool) -> Vec<VoteMessage> {
        let Some(state) = self.fork_db.get(block_id) else {
            return Vec::new();
        };
        let Some(savanna) = state.as_savanna() else {
            return Vec::new();
        };
        let policy = savanna.header_state.policy_tracker.active().clone();
        let digest = savanna.header_state.finality_digest;
        let signed_digest =
            if strong { digest } else { veldt_types::weak_vote_digest(&digest) };

        let mut votes = Vec::new();
        for key in &self.node_finalizers {
            if policy.index_of(&key.public_key()).is_none() {
                continue;
            }
            let vote = VoteMessage {
                block_id: *block_id,
                strong,
                finalizer_key: key.public_key(),
                signature: key.sign(signed_digest.as_bytes()),
            };
            self.signals.voted_block.emit(&vote);
            votes.push(vote);
        }
        votes
    }

    /// Finalizer-state introspection: the active policy, latest pending
    /// policy and the head's finality core.
    pub fn get_finalizer_state(
        &self,
    ) -> Option<(FinalizerPolicy, Option<FinalizerPolicy>, veldt_finality::FinalityCore)> {
        let savanna = self.head.as_savanna()?;
        Some((
            savanna.header_state.policy_tracker.active().clone(),
            savanna.header_state.policy_tracker.latest_pending().cloned(),
            savanna.header_state.core.clone(),
        ))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Snapshots and replay
    // ═══════════════════════════════════════════════════════════════════

    /// Write the full controller state as a snapshot.
    pub fn write_snapshot(&self) -> Result<Snapshot> {
        if self.pending.is_some() {
            return Err(ChainError::BlockValidate(
                "cannot snapshot while a block is pending".into(),
            ));
        }
        let mut snapshot = Snapshot::new();
        snapshot.add_section("chain_header", &[(self.chain_id, self.head.block_num())]);
        let head_state = match &self.head {
            BlockStateVariant::Legacy(s) => SnapshotHeadState::Legacy {
                header_state: s.header_state.clone(),
                block: s.block.as_ref().clone(),
            },
            BlockStateVariant::Savanna(s) => SnapshotHeadState::Savanna {
                header_state: s.header_state.clone(),
                block: s.block.as_ref().clone(),
            },
        };
        snapshot.add_section("block_header_state", &[head_state]);
        self.db.add_to_snapshot(&mut snapshot);
        let auth = self.collaborators.authorization.snapshot_section();
        snapshot.sections.push(auth);
        let resources = self.collaborators.resources.snapshot_section();
        snapshot.sections.push(resources);
        Ok(snapshot)
    }

    /// SHA-256 integrity hash over the logical state.
    pub fn calculate_integrity_hash(&self) -> Result<Digest> {
        Ok(self.write_snapshot()?.integrity_hash())
    }

    /// The chain id recorded in a snapshot, without loading it.
    pub fn extract_chain_id(snapshot: &Snapshot) -> Result<Digest> {
        let rows: Vec<(Digest, BlockNum)> = snapshot.decode_section("chain_header")?;
        rows.first()
            .map(|(chain_id, _)| *chain_id)
            .ok_or_else(|| ChainError::BlockValidate("snapshot has no chain header".into()))
    }

    /// The chain id recorded in a state database.
    pub fn extract_chain_id_from_db(db: &Database) -> Digest {
        db.global.get().chain_id
    }

    /// Reconstruct a controller from a snapshot.
    pub fn from_snapshot(
        config: ChainConfig,
        snapshot: &Snapshot,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let chain_id = Self::extract_chain_id(snapshot)?;
        let mut db = Database::new();
        db.read_from_snapshot(snapshot, None)?;

        let head_rows: Vec<SnapshotHeadState> = snapshot.decode_section("block_header_state")?;
        let head_state = head_rows
            .into_iter()
            .next()
            .ok_or_else(|| ChainError::BlockValidate("snapshot has no head state".into()))?;
        let head = match head_state {
            SnapshotHeadState::Legacy { header_state, block } => BlockStateVariant::Legacy(
                Arc::new(LegacyBlockState { header_state, block: Arc::new(block) }),
            ),
            SnapshotHeadState::Savanna { header_state, block } => BlockStateVariant::Savanna(
                Arc::new(SavannaBlockState { header_state, block: Arc::new(block) }),
            ),
        };
        db.set_revision(head.block_num() as i64)?;

        let mut features = ProtocolFeatureManager::with_all_builtins();
        features.restore_activations(&db.protocol.get().activated_features);

        let mut collaborators = collaborators;
        collaborators.block_log.reset(head.block_num() + 1);

        info!(%chain_id, head = head.block_num(), "controller restored from snapshot");
        Ok(Controller {
            worker: WorkerPool::new(config.worker_threads),
            config,
            chain_id,
            db,
            fork_db: veldt_fork_db::ForkDatabase::new(head.clone()),
            head,
            pending: None,
            features,
            signals: ControllerSignals::new(),
            collaborators,
            vote_collector: BTreeMap::new(),
            received_qcs: BTreeMap::new(),
            node_finalizers: Vec::new(),
            if_irreversible_override: 0,
            replaying: false,
        })
    }

    /// Replay blocks from the block log on top of the current head, up to
    /// the log head or until `check_shutdown` returns true.
    pub fn replay(&mut self, check_shutdown: &dyn Fn() -> bool) -> Result<()> {
        let Some(log_head) = self.collaborators.block_log.head() else {
            return Ok(());
        };
        let log_head_num = log_head.block_num();
        let start = self.head.block_num() + 1;
        if start > log_head_num {
            return Ok(());
        }
        info!(start, end = log_head_num, "replaying blocks from the block log");
        self.replaying = true;
        let result = (|| {
            for block_num in start..=log_head_num {
                if check_shutdown() {
                    break;
                }
                let block = self
                    .collaborators
                    .block_log
                    .read_block_by_num(block_num)
                    .ok_or_else(|| {
                        ChainError::Fatal(format!("block {block_num} missing from the log"))
                    })?;
                let state = self.create_block_state(block)?;
                self.fork_db.add(state.clone(), false)?;
                self.apply_block(state, BlockStatus::Irreversible)?;
                // Replayed blocks are irreversible: keep the root with us.
                let head_id = self.head.id();
                self.db.set_revision(self.head.block_num() as i64)?;
                self.fork_db.advance_root(head_id)?;
            }
            Ok(())
        })();
        self.replaying = false;
        result
    }
}

/// Header inputs dictated by a received block during validation.
struct ValidationOverrides {
    qc_claim: QcClaim,
    qc: Option<QuorumCertificate>,
    new_finalizer_policy: Option<FinalizerPolicy>,
    new_proposer_schedule: Option<ProducerSchedule>,
    producer: AccountName,
}

/// The schedule governing a block, for producer-signature checks.
fn governing_schedule(state: &BlockStateVariant) -> &ProducerSchedule {
    match state {
        BlockStateVariant::Legacy(s) => &s.header_state.active_schedule,
        BlockStateVariant::Savanna(s) => &s.header_state.active_proposer_schedule,
    }
}

/// Low 32 bits of a block id used as the TAPOS prefix.
fn block_id_prefix(id: &BlockId) -> u32 {
    let bytes = id.0.as_bytes();
    u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])
}

/// A deadline far enough away to never fire.
pub fn far_deadline() -> Instant {
    Instant::now() + std::time::Duration::from_secs(3600)
}
