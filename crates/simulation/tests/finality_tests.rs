//! LIB-advancement scenarios on a four-node cluster (quorum 3): quorum
//! voting, missing votes, weak/strong alternation, delayed, out-of-order,
//! lost and duplicate votes.

use tracing_test::traced_test;
use veldt_simulation::{Cluster, VoteMode};

/// Quorum votes advance irreversibility by exactly one block per round.
#[traced_test]
#[test]
fn quorum_advances_lib() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;
    let start_lib = cluster.nodes[0].lib_num();

    for round in 1..=3 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
        assert_eq!(
            cluster.num_lib_advancing(),
            num_nodes,
            "round {round}: every node should advance"
        );
        assert_eq!(cluster.nodes[0].lib_num(), start_lib + round);
    }
}

/// Without any votes, irreversibility never moves.
#[traced_test]
#[test]
fn no_votes_never_advances() {
    let mut cluster = Cluster::default_cluster();
    for _ in 0..3 {
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), 0);
    }
}

/// One less than the quorum never advances irreversibility.
#[traced_test]
#[test]
fn quorum_minus_one_never_advances() {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;
    let start_lib = cluster.nodes[0].lib_num();

    for _ in 0..10 {
        cluster.produce_and_push_block();
        cluster.process_votes(1, quorum - 1);
        assert_eq!(cluster.num_lib_advancing(), 0);
    }
    assert_eq!(cluster.nodes[0].lib_num(), start_lib);
}

/// All nodes voting advances irreversibility just like a bare quorum.
#[traced_test]
#[test]
fn all_votes_advance_lib() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();

    for _ in 0..3 {
        cluster.process_votes(0, num_nodes);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), num_nodes);
    }
}

/// A weak quorum produces only a weak certificate; irreversibility waits
/// for the strong one.
#[traced_test]
#[test]
fn weak_then_strong_alternation() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    cluster.process_votes_mode(1, quorum, None, VoteMode::Weak);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0, "weak certificate must not finalize");

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes, "strong certificate finalizes");

    cluster.process_votes_mode(1, quorum, None, VoteMode::Weak);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0);

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// Two weak rounds then two strong rounds.
#[traced_test]
#[test]
fn weak_weak_strong_strong() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    for _ in 0..2 {
        cluster.process_votes_mode(1, quorum, None, VoteMode::Weak);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), 0);
    }
    for _ in 0..2 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), num_nodes);
    }
    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// A quorum-minus-one of strong votes plus one weak vote is only a weak
/// certificate.
#[traced_test]
#[test]
fn one_weak_vote_short_of_strong_quorum() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    let next = cluster.process_votes(1, quorum - 1);
    cluster.process_vote(next, None, VoteMode::Weak);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0);

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// A strong quorum with an extra conflicting weak vote still advances.
#[traced_test]
#[test]
fn extra_weak_vote_does_not_block_strong_quorum() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    for _ in 0..3 {
        let next = cluster.process_votes(1, quorum);
        cluster.process_vote(next % num_nodes, None, VoteMode::Weak);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), num_nodes);
    }
}

/// A delayed vote on an old block cannot advance irreversibility; only a
/// fresh quorum can.
#[traced_test]
#[test]
fn delayed_votes() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    // Two blocks without votes.
    cluster.produce_and_push_block();
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0);

    // Vote the older of the two held blocks.
    let held = cluster.nodes[1].vote_targets.len() - 2;
    cluster.process_votes_mode(1, quorum, Some(held), VoteMode::Strong);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    // The newer held block carries the same claim; voting it moves nothing.
    cluster.process_votes_mode(1, quorum, Some(held + 1), VoteMode::Strong);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0);

    // Fresh votes resume progress.
    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// Votes arriving newest-to-oldest behave like the delayed case.
#[traced_test]
#[test]
fn out_of_order_votes() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    for _ in 0..3 {
        cluster.produce_and_push_block();
    }
    let newest = cluster.nodes[1].vote_targets.len() - 1;

    cluster.process_votes_mode(1, quorum, Some(newest), VoteMode::Strong);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    for older in [newest - 1, newest - 2] {
        cluster.process_votes_mode(1, quorum, Some(older), VoteMode::Strong);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), 0);
    }

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// Votes that never arrive stall one round; progress resumes with the next
/// voted block.
#[traced_test]
#[test]
fn lost_votes() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    // Votes for this block are lost.
    cluster.clear_votes_and_reset_lib();
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), 0);

    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();
    assert_eq!(cluster.num_lib_advancing(), num_nodes);

    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

/// Duplicate votes are rejected and do not distort quorum accounting.
#[traced_test]
#[test]
fn duplicate_votes() {
    let mut cluster = Cluster::default_cluster();
    let num_nodes = cluster.num_nodes();
    let quorum = cluster.quorum as usize;

    for _ in 0..5 {
        cluster.process_votes(1, quorum);
        // Same voters, same block, again.
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
        assert_eq!(cluster.num_lib_advancing(), num_nodes);
    }
    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}
