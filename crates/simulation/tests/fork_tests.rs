//! Fork-database behavior under network partitions: divergent branches,
//! deterministic head selection after healing, and atomic rollback when a
//! branch fails to apply mid-switch.

use std::sync::Arc;
use tracing_test::traced_test;
use veldt_simulation::{Cluster, ClusterConfig};

fn partitioned_cluster() -> Cluster {
    let config = ClusterConfig { num_nodes: 4, num_producers: 4, seed: 7, settle: false };
    let mut cluster = Cluster::new(config);
    cluster.split(&[&[0, 1], &[2, 3]]);
    cluster
}

/// Equal-height branches: the deterministic tiebreak (earlier timestamps)
/// wins on every node after the partition heals.
#[traced_test]
#[test]
fn equal_height_fork_resolves_by_tiebreak() {
    let mut cluster = partitioned_cluster();

    // Five blocks on each side. Node 0 produces in earlier slots than
    // node 2, so the first group's branch wins ties.
    for _ in 0..5 {
        cluster.produce_and_push_block_on(0);
    }
    for _ in 0..5 {
        cluster.produce_and_push_block_on(2);
    }

    assert_eq!(cluster.nodes[0].forkdb_head_id(), cluster.nodes[1].forkdb_head_id());
    assert_eq!(cluster.nodes[2].forkdb_head_id(), cluster.nodes[3].forkdb_head_id());
    assert_eq!(cluster.nodes[0].forkdb_head_num(), cluster.nodes[2].forkdb_head_num());
    assert_ne!(cluster.nodes[0].forkdb_head_id(), cluster.nodes[2].forkdb_head_id());

    cluster.heal();
    let winner = cluster.nodes[0].forkdb_head_id();
    for receiver in [2, 3] {
        cluster.push_branch(0, receiver);
    }
    for receiver in [0, 1] {
        cluster.push_branch(2, receiver);
    }

    for (index, node) in cluster.nodes.iter().enumerate() {
        assert_eq!(
            node.forkdb_head_id(),
            winner,
            "node {index} did not converge on the winning branch"
        );
    }
}

/// A strictly longer challenger branch wins regardless of timestamps.
#[traced_test]
#[test]
fn longer_branch_wins_the_switch() {
    let mut cluster = partitioned_cluster();

    for _ in 0..5 {
        cluster.produce_and_push_block_on(0);
    }
    for _ in 0..6 {
        cluster.produce_and_push_block_on(2);
    }
    assert_eq!(
        cluster.nodes[2].forkdb_head_num(),
        cluster.nodes[0].forkdb_head_num() + 1
    );

    cluster.heal();
    let winner = cluster.nodes[2].forkdb_head_id();
    for receiver in [0, 1] {
        cluster.push_branch(2, receiver);
    }
    for receiver in [2, 3] {
        cluster.push_branch(0, receiver);
    }

    for (index, node) in cluster.nodes.iter().enumerate() {
        assert_eq!(
            node.forkdb_head_id(),
            winner,
            "node {index} did not converge on the longer branch"
        );
    }
}

/// A shorter challenger branch never displaces the head.
#[traced_test]
#[test]
fn shorter_branch_does_not_displace_the_head() {
    let mut cluster = partitioned_cluster();

    for _ in 0..6 {
        cluster.produce_and_push_block_on(0);
    }
    for _ in 0..3 {
        cluster.produce_and_push_block_on(2);
    }

    cluster.heal();
    let head_before = cluster.nodes[0].forkdb_head_id();
    cluster.push_branch(2, 0);
    assert_eq!(cluster.nodes[0].forkdb_head_id(), head_before);

    // The challenger blocks still live in the fork database, linkable for
    // later reorganizations.
    let challenger_tip = cluster.nodes[2].forkdb_head_id();
    assert!(cluster.nodes[0]
        .controller
        .block_state_on_branch(&challenger_tip, challenger_tip.block_num())
        .is_some());
}

/// If a block mid-branch fails to apply during a switch, the controller
/// restores the previous head and stays functional.
#[traced_test]
#[test]
fn failed_switch_restores_the_previous_head() {
    let mut cluster = partitioned_cluster();

    for _ in 0..5 {
        cluster.produce_and_push_block_on(0);
    }
    for _ in 0..5 {
        cluster.produce_and_push_block_on(2);
    }

    cluster.heal();

    // Forge a taller tip on the challenger branch whose transaction merkle
    // does not match its receipts.
    let challenger_tip = cluster.nodes[2].controller.head_block_state().block().clone();
    let key = cluster.nodes[2].producer_key().clone();
    let mut forged_header = challenger_tip.header.clone();
    forged_header.previous = challenger_tip.calculate_id();
    forged_header.timestamp = veldt_types::BlockTimestamp(challenger_tip.header.timestamp.0 + 1);
    forged_header.transaction_mroot = veldt_types::Digest::hash(b"not the real merkle");
    let forged = Arc::new(veldt_types::SignedBlock {
        producer_signature: key.sign(forged_header.digest().as_bytes()),
        header: forged_header,
        transactions: Vec::new(),
        block_extensions: challenger_tip.block_extensions.clone(),
    });

    // Feed node 0 the honest challenger branch first, then the forged tip
    // that would make the challenger branch the best chain.
    cluster.push_branch(2, 0);
    let head_before = cluster.nodes[0].forkdb_head_id();
    let root_before = cluster.nodes[0].controller.last_irreversible_block_id();

    let result = cluster.nodes[0].controller.push_block(forged);
    assert!(result.is_err(), "forged block must be rejected");
    assert_eq!(cluster.nodes[0].forkdb_head_id(), head_before);
    assert_eq!(cluster.nodes[0].controller.last_irreversible_block_id(), root_before);

    // The node keeps producing on its branch afterwards.
    cluster.produce_and_push_block_on(0);
    assert!(cluster.nodes[0].forkdb_head_num() > head_before.block_num());
}
