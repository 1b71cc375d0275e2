//! Finalizer-policy rotation timing: a policy proposed in block B becomes
//! pending once B is final and active once the pending block is final —
//! six blocks end to end under continuous strong quorums.

use tracing_test::traced_test;
use veldt_simulation::Cluster;
use veldt_types::{BlockNum, HeaderExtension};

fn active_generation_at(cluster: &Cluster, block_num: BlockNum) -> u32 {
    cluster
        .recorded
        .iter()
        .find(|state| state.header_state.block_num() == block_num)
        .expect("block must be recorded")
        .header_state
        .policy_tracker
        .active()
        .generation
}

#[traced_test]
#[test]
fn single_key_rotation_activates_after_two_three_chains() {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;

    // Replace node 0's key with a spare; everything else stays.
    cluster.propose_policy(&[4, 1, 2, 3]);
    cluster.process_votes(1, quorum);
    let proposal_block = cluster.produce_and_push_block();
    let b = proposal_block.block_num();

    // The header carries a compact one-remove one-insert diff.
    let diff = proposal_block
        .header
        .header_extensions
        .iter()
        .find_map(|ext| match ext {
            HeaderExtension::Finality(f) => f.new_finalizer_policy_diff.as_ref(),
            _ => None,
        })
        .expect("proposal block must carry a policy diff");
    assert_eq!(diff.finalizers_diff.remove_indexes.len(), 1);
    assert_eq!(diff.finalizers_diff.insert_indexes.len(), 1);
    assert_eq!(diff.generation, 2);

    // Produce through the activation window with full quorums.
    for _ in 0..7 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
    }

    // Old policy up to and including B+5, new policy from B+6.
    assert_eq!(active_generation_at(&cluster, b + 5), 1);
    assert_eq!(active_generation_at(&cluster, b + 6), 2);

    // The rotated set keeps finalizing blocks.
    assert!(cluster.produce_blocks_and_verify_lib_advancing());
}

#[traced_test]
#[test]
fn followers_agree_on_the_rotation_block() {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;

    cluster.propose_policy(&[4, 1, 2, 3]);
    cluster.process_votes(1, quorum);
    cluster.produce_and_push_block();

    for _ in 0..7 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
    }

    let expected = cluster.nodes[0]
        .controller
        .active_finalizer_policy()
        .expect("instant finality is live")
        .clone();
    for node in &cluster.nodes {
        let policy = node
            .controller
            .active_finalizer_policy()
            .expect("instant finality is live");
        assert_eq!(policy.generation, 2);
        assert_eq!(*policy, expected);
    }
}

#[traced_test]
#[test]
fn in_flight_rotations_activate_in_proposal_order() {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;

    cluster.propose_policy(&[4, 1, 2, 3]);
    cluster.process_votes(1, quorum);
    let first = cluster.produce_and_push_block().block_num();

    cluster.propose_policy(&[4, 5, 2, 3]);
    cluster.process_votes(1, quorum);
    let second = cluster.produce_and_push_block().block_num();
    assert_eq!(second, first + 1);

    for _ in 0..9 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
    }

    assert_eq!(active_generation_at(&cluster, first + 5), 1);
    assert_eq!(active_generation_at(&cluster, first + 6), 2);
    assert_eq!(active_generation_at(&cluster, second + 6), 3);
}
