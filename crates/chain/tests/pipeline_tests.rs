//! End-to-end tests of the controller pipeline on one or two nodes:
//! block production, transaction application, the DPoS→IF transition,
//! fork-database behavior and snapshot round trips.

use std::sync::Arc;
use veldt_chain::{
    far_deadline, BlockStatus, ChainConfig, Collaborators, Controller, GenesisState,
};
use veldt_store::ChainLimits;
use veldt_types::{
    AccountName, ActionData, BlockSigningAuthority, BlockTimestamp, BlsKeyPair,
    FinalizerAuthority, PackedTransaction, PermissionLevel, ProducerAuthority, ProducerSchedule,
    Transaction, TransactionMetadata, TransactionReceiptStatus,
};

struct Node {
    controller: Controller,
    producer_key: Arc<BlsKeyPair>,
    finalizer_key: Arc<BlsKeyPair>,
}

fn genesis_with_producer(key: &BlsKeyPair) -> GenesisState {
    GenesisState {
        initial_timestamp: BlockTimestamp(100),
        initial_schedule: ProducerSchedule {
            version: 0,
            producers: vec![ProducerAuthority {
                producer_name: AccountName::new("prod.a"),
                authority: BlockSigningAuthority::single(key.public_key()),
            }],
        },
        initial_limits: ChainLimits::default(),
    }
}

fn make_node(seed: u8) -> Node {
    let producer_key = Arc::new(BlsKeyPair::from_seed(&[seed; 32]).unwrap());
    let finalizer_key = Arc::new(BlsKeyPair::from_seed(&[seed + 100; 32]).unwrap());
    let mut controller = Controller::new(
        ChainConfig::default(),
        genesis_with_producer(&producer_key),
        Collaborators::default(),
    );
    controller.set_node_finalizers(vec![finalizer_key.clone()]);
    Node { controller, producer_key, finalizer_key }
}

impl Node {
    fn produce_block(&mut self) -> Arc<veldt_types::SignedBlock> {
        let when = self.controller.head_block_time().next();
        let features = self.controller.get_preactivated_protocol_features();
        self.controller
            .start_block(when, 0, &features, BlockStatus::Incomplete, None, far_deadline())
            .unwrap();
        self.finish_block()
    }

    fn finish_block(&mut self) -> Arc<veldt_types::SignedBlock> {
        self.controller.finalize_block().unwrap();
        let key = self.producer_key.clone();
        self.controller.sign_block(&move |digest| key.sign(digest.as_bytes())).unwrap();
        self.controller.commit_block().unwrap();
        self.controller.head_block_state().block().clone()
    }
}

fn transfer_transaction(controller: &Controller, tag: u8) -> Arc<TransactionMetadata> {
    let (ref_block_num, ref_block_prefix) = controller.tapos_for_head();
    let trx = Transaction {
        expiration: BlockTimestamp(controller.head_block_time().0 + 100),
        ref_block_num,
        ref_block_prefix,
        max_net_usage_words: 0,
        max_cpu_usage_ms: 0,
        delay_sec: 0,
        actions: vec![ActionData {
            account: AccountName::new("token"),
            name: AccountName::new("transfer"),
            authorization: vec![PermissionLevel {
                actor: AccountName::new("alice"),
                permission: AccountName::new("active"),
            }],
            data: vec![tag],
        }],
    };
    let signer = BlsKeyPair::from_seed(&[42; 32]).unwrap();
    let id = trx.id();
    let packed = PackedTransaction {
        transaction: trx,
        signatures: vec![(signer.public_key(), signer.sign(id.0.as_bytes()))],
    };
    let keys = packed.recover_keys().unwrap();
    Arc::new(TransactionMetadata::recovered(packed, keys, 10))
}

#[test]
fn single_producer_advances_dpos_irreversibility() {
    let mut node = make_node(1);
    for _ in 0..5 {
        node.produce_block();
    }
    assert_eq!(node.controller.head_block_num(), 6);
    // A lone producer confirms its own blocks immediately; the root trails
    // the head only by the not-yet-logged block.
    assert_eq!(node.controller.last_irreversible_block_num(), 6);
    assert_eq!(node.controller.fork_db_head_block_num(), 6);
}

#[test]
fn pushed_transactions_get_receipts_and_dedup() {
    let mut node = make_node(1);
    node.produce_block();

    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();

    let trx = transfer_transaction(&node.controller, 7);
    let trace = node
        .controller
        .push_transaction(trx.clone(), far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(trace.is_success(), "{:?}", trace.error);
    assert_eq!(
        trace.receipt.as_ref().unwrap().status,
        TransactionReceiptStatus::Executed
    );
    assert_eq!(trace.action_traces.len(), 1);

    // The same transaction again is an objective duplicate.
    let duplicate = node
        .controller
        .push_transaction(trx, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(!duplicate.is_success());
    assert!(duplicate.error.unwrap().contains("duplicate"));

    let block = node.finish_block();
    // On-block receipt plus the transfer.
    assert_eq!(block.transactions.len(), 2);
}

#[test]
fn expired_and_bad_tapos_transactions_are_rejected() {
    let mut node = make_node(1);
    node.produce_block();
    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();

    let mut meta = transfer_transaction(&node.controller, 1);
    {
        let inner = Arc::make_mut(&mut meta);
        inner.packed.transaction.expiration = BlockTimestamp(0);
    }
    let trace = node
        .controller
        .push_transaction(meta, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(trace.error.unwrap().contains("expired"));

    let mut meta = transfer_transaction(&node.controller, 2);
    {
        let inner = Arc::make_mut(&mut meta);
        inner.packed.transaction.ref_block_prefix ^= 1;
    }
    let trace = node
        .controller
        .push_transaction(meta, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(trace.error.unwrap().contains("reference block"));
}

#[test]
fn abort_block_reverses_state_and_returns_metas() {
    let mut node = make_node(1);
    node.produce_block();
    let hash_before = node.controller.calculate_integrity_hash().unwrap();

    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let trx = transfer_transaction(&node.controller, 9);
    node.controller
        .push_transaction(trx, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();

    let metas = node.controller.abort_block();
    // The on-block transaction and the transfer were applied.
    assert_eq!(metas.len(), 2);
    assert_eq!(node.controller.calculate_integrity_hash().unwrap(), hash_before);
}

#[test]
fn push_block_replicates_state_across_nodes() {
    let mut a = make_node(1);
    let mut b = make_node(1);
    assert_eq!(a.controller.chain_id(), b.controller.chain_id());

    for _ in 0..4 {
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
    }
    assert_eq!(a.controller.head_block_id(), b.controller.head_block_id());
    assert_eq!(
        a.controller.calculate_integrity_hash().unwrap(),
        b.controller.calculate_integrity_hash().unwrap()
    );
}

#[test]
fn pushing_a_garbled_block_is_rejected_without_state_change() {
    let mut a = make_node(1);
    let mut b = make_node(1);
    let block = a.produce_block();

    let mut garbled = (*block).clone();
    garbled.producer_signature = veldt_types::BlsSignature::NULL;
    let head_before = b.controller.head_block_id();
    assert!(b.controller.push_block(Arc::new(garbled)).is_err());
    assert_eq!(b.controller.head_block_id(), head_before);

    // The genuine block still applies.
    b.controller.push_block(block).unwrap();
    assert_eq!(b.controller.head_block_id(), a.controller.head_block_id());
}

/// Drive a node (and a follower) through the transition into instant
/// finality, with both nodes voting.
fn transition_pair() -> (Node, Node) {
    let mut a = make_node(1);
    let mut b = make_node(1);
    let fin_keys = vec![
        a.finalizer_key.clone(),
        b.finalizer_key.clone(),
        Arc::new(BlsKeyPair::from_seed(&[201; 32]).unwrap()),
    ];
    // Node a operates two finalizers, so a+b reach the 3-of-3 threshold.
    a.controller
        .set_node_finalizers(vec![fin_keys[0].clone(), fin_keys[2].clone()]);
    b.controller.set_node_finalizers(vec![fin_keys[1].clone()]);

    let block = a.produce_block();
    b.controller.push_block(block).unwrap();

    // Propose the first finalizer policy; this block is the IF genesis.
    let when = a.controller.head_block_time().next();
    a.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    a.controller
        .set_proposed_finalizers(
            fin_keys
                .iter()
                .enumerate()
                .map(|(i, key)| FinalizerAuthority {
                    description: format!("fin{i}"),
                    weight: 1,
                    public_key: key.public_key(),
                })
                .collect(),
        )
        .unwrap();
    let block = a.finish_block();
    b.controller.push_block(block).unwrap();
    assert!(a.controller.head_block_state().is_savanna());
    assert!(b.controller.head_block_state().is_savanna());
    (a, b)
}

/// Both nodes vote on the head block and deliver to the producer node.
fn exchange_votes(a: &mut Node, b: &mut Node, strong: bool) {
    let head = a.controller.head_block_id();
    let mut votes = a.controller.create_votes_for(&head, strong);
    votes.extend(b.controller.create_votes_for(&head, strong));
    for vote in votes {
        a.controller.process_vote_message(0, &vote);
    }
}

#[test]
fn instant_finality_takes_over_irreversibility() {
    let (mut a, mut b) = transition_pair();
    let genesis_num = a.controller.head_block_num();

    // With a 2-of-3 quorum voting every block, the two-chain rule finalizes
    // each block three blocks later.
    for _ in 0..6 {
        exchange_votes(&mut a, &mut b, true);
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
        assert_eq!(a.controller.head_block_id(), b.controller.head_block_id());
    }
    let lib = a.controller.last_irreversible_block_num();
    assert!(lib >= genesis_num + 2, "lib {lib} never caught up past genesis {genesis_num}");
    assert_eq!(
        lib,
        b.controller.last_irreversible_block_num(),
        "follower disagrees on irreversibility"
    );

    // Without votes, production continues but irreversibility stalls.
    let stalled = a.controller.last_irreversible_block_num();
    for _ in 0..3 {
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
    }
    assert_eq!(a.controller.last_irreversible_block_num(), stalled);
}

#[test]
fn weak_votes_do_not_advance_irreversibility() {
    let (mut a, mut b) = transition_pair();

    // Two rounds of strong votes get the chain going.
    for _ in 0..2 {
        exchange_votes(&mut a, &mut b, true);
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
    }
    let lib_before = a.controller.last_irreversible_block_num();

    // Weak quorum only: claims advance but nothing becomes final.
    for _ in 0..3 {
        exchange_votes(&mut a, &mut b, false);
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
    }
    assert_eq!(a.controller.last_irreversible_block_num(), lib_before);

    // Strong votes resume; finality catches up.
    for _ in 0..3 {
        exchange_votes(&mut a, &mut b, true);
        let block = a.produce_block();
        b.controller.push_block(block).unwrap();
    }
    assert!(a.controller.last_irreversible_block_num() > lib_before);
}

#[test]
fn protocol_features_preactivate_then_activate() {
    use veldt_chain::BuiltinFeature;

    let mut node = make_node(1);
    node.produce_block();

    let gate = BuiltinFeature::PreactivateFeature.digest();
    node.controller.preactivate_feature(gate, false).unwrap();
    // Double preactivation fails.
    assert!(node.controller.preactivate_feature(gate, false).is_err());

    node.produce_block();
    assert!(node.controller.is_builtin_activated(BuiltinFeature::PreactivateFeature));
    // Re-preactivating an activated feature fails.
    assert!(node.controller.preactivate_feature(gate, false).is_err());

    // A dependent feature becomes preactivatable once the gate is active.
    let return_value = BuiltinFeature::ActionReturnValue.digest();
    node.controller.preactivate_feature(return_value, false).unwrap();
    node.produce_block();
    assert!(node.controller.is_builtin_activated(BuiltinFeature::ActionReturnValue));

    // Activations replicate through block push.
    let mut follower = make_node(1);
    for num in 2..=node.controller.head_block_num() {
        let block = node.controller.fetch_block_by_number(num).unwrap();
        follower.controller.push_block(block).unwrap();
    }
    assert!(follower.controller.is_builtin_activated(BuiltinFeature::ActionReturnValue));
}

fn delayed_transaction(controller: &Controller, tag: u8, delay_sec: u32) -> Arc<TransactionMetadata> {
    let mut meta = transfer_transaction(controller, tag);
    {
        let inner = Arc::make_mut(&mut meta);
        inner.packed.transaction.delay_sec = delay_sec;
        inner.id = inner.packed.id();
    }
    meta
}

#[test]
fn deferred_transactions_schedule_and_execute() {
    let mut node = make_node(1);
    node.produce_block();

    // Schedule a one-second-delayed transaction.
    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let deferred = delayed_transaction(&node.controller, 3, 1);
    let trx_id = deferred.id;
    let trace = node
        .controller
        .push_transaction(deferred, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(trace.is_success(), "{:?}", trace.error);
    assert_eq!(
        trace.receipt.unwrap().status,
        TransactionReceiptStatus::Delayed
    );
    node.finish_block();

    // Not ready one slot later.
    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let early = node.controller.push_scheduled_transaction(
        trx_id,
        far_deadline(),
        1_000_000,
        0,
        false,
    );
    match early {
        Err(err) => assert!(err.to_string().contains("not ready")),
        Ok(trace) => panic!("deferred transaction ran early: {trace:?}"),
    }
    node.finish_block();

    // Ready two slots after scheduling.
    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let trace = node
        .controller
        .push_scheduled_transaction(trx_id, far_deadline(), 1_000_000, 0, false)
        .unwrap();
    assert!(trace.is_success(), "{:?}", trace.error);
    assert_eq!(
        trace.receipt.unwrap().status,
        TransactionReceiptStatus::Executed
    );
    node.finish_block();

    // Unknown afterwards.
    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    assert!(matches!(
        node.controller
            .push_scheduled_transaction(trx_id, far_deadline(), 1_000_000, 0, false),
        Err(veldt_chain::ChainError::UnknownTransaction(_))
    ));
    node.controller.abort_block();
}

#[test]
fn expired_deferred_transactions_are_retired() {
    let producer_key = Arc::new(BlsKeyPair::from_seed(&[1; 32]).unwrap());
    let mut genesis = genesis_with_producer(&producer_key);
    // A one-second lifetime makes expiry reachable within a few slots.
    genesis.initial_limits.max_transaction_lifetime_sec = 1;
    let controller = Controller::new(ChainConfig::default(), genesis, Collaborators::default());
    let mut node = Node { controller, producer_key, finalizer_key: Arc::new(BlsKeyPair::from_seed(&[99; 32]).unwrap()) };
    node.produce_block();

    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let mut deferred = delayed_transaction(&node.controller, 5, 1);
    {
        // The short lifetime also bounds how far the expiration may sit in
        // the future.
        let inner = Arc::make_mut(&mut deferred);
        inner.packed.transaction.expiration = BlockTimestamp(when.0 + 2);
        inner.id = inner.packed.id();
    }
    let trx_id = deferred.id;
    let trace = node
        .controller
        .push_transaction(deferred, far_deadline(), 1_000_000, 0, false, 0)
        .unwrap();
    assert!(trace.is_success(), "{:?}", trace.error);
    node.finish_block();

    // Let the expiration window (delay + lifetime = four slots) pass.
    for _ in 0..5 {
        node.produce_block();
    }

    let when = node.controller.head_block_time().next();
    node.controller
        .start_block(when, 0, &[], BlockStatus::Incomplete, None, far_deadline())
        .unwrap();
    let trace = node
        .controller
        .push_scheduled_transaction(trx_id, far_deadline(), 1_000_000, 0, false)
        .unwrap();
    assert_eq!(
        trace.receipt.unwrap().status,
        TransactionReceiptStatus::Expired
    );
    node.finish_block();
}

#[test]
fn snapshot_round_trip_preserves_integrity_hash() {
    let mut node = make_node(1);
    for _ in 0..3 {
        node.produce_block();
    }
    let snapshot = node.controller.write_snapshot().unwrap();
    let restored = Controller::from_snapshot(
        ChainConfig::default(),
        &snapshot,
        Collaborators::default(),
    )
    .unwrap();
    assert_eq!(restored.head_block_id(), node.controller.head_block_id());
    assert_eq!(
        restored.calculate_integrity_hash().unwrap(),
        node.controller.calculate_integrity_hash().unwrap()
    );
    assert_eq!(
        Controller::extract_chain_id(&snapshot).unwrap(),
        node.controller.chain_id()
    );
}

#[test]
fn finalizer_state_reports_active_policy_and_core() {
    let (mut a, mut b) = transition_pair();
    exchange_votes(&mut a, &mut b, true);
    let _ = a.produce_block();

    let (active, pending, core) = a.controller.get_finalizer_state().unwrap();
    assert_eq!(active.generation, 1);
    assert!(pending.is_none());
    assert_eq!(core.current_block_num(), a.controller.head_block_num());
    core.check_invariants().unwrap();
}
