//! Inter-chain finality proofs built from recorded cluster history: heavy
//! proof, light proof against the cached root, and cache expiry.

use tracing_test::traced_test;
use veldt_proofs::{ProofError, ProofVerifier};
use veldt_simulation::{heavy_proof, light_proof, signed_qc_over, Cluster};
use veldt_types::BlockTimestamp;

/// A cluster with some voted history plus a verifier seeded with the
/// genesis finalizer policy.
fn cluster_and_verifier(ttl: u32) -> (Cluster, ProofVerifier) {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;
    for _ in 0..4 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
    }
    let mut verifier = ProofVerifier::new(ttl);
    verifier.set_policy(
        cluster.nodes[0]
            .controller
            .active_finalizer_policy()
            .expect("instant finality is live")
            .clone(),
    );
    (cluster, verifier)
}

#[traced_test]
#[test]
fn heavy_then_light_proof() {
    let (cluster, mut verifier) = cluster_and_verifier(600);
    let n = cluster.recorded.len();
    let target = cluster.recorded[n - 4].as_ref();
    let sibling = cluster.recorded[n - 3].as_ref();
    let qc_block = cluster.recorded[n - 1].as_ref();
    let now = BlockTimestamp(qc_block.header_state.timestamp().0 + 2);

    // Heavy proof: a quorum signs the qc block; its root covers the target.
    let qc = signed_qc_over(qc_block, &cluster.finalizer_keys, &[0, 1, 2]);
    let verified = verifier
        .verify(&heavy_proof(qc_block, qc, target), now)
        .expect("heavy proof must verify");
    assert_eq!(verified.block_num, target.header_state.block_num());

    // The cached root now serves a light proof for a sibling block.
    verifier
        .verify(&light_proof(qc_block, sibling), now)
        .expect("light proof must verify against the cached root");
}

#[traced_test]
#[test]
fn light_proof_fails_after_cache_expiry() {
    let (cluster, mut verifier) = cluster_and_verifier(40);
    let n = cluster.recorded.len();
    let target = cluster.recorded[n - 4].as_ref();
    let qc_block = cluster.recorded[n - 1].as_ref();
    let now = BlockTimestamp(qc_block.header_state.timestamp().0 + 2);

    let qc = signed_qc_over(qc_block, &cluster.finalizer_keys, &[1, 2, 3]);
    verifier.verify(&heavy_proof(qc_block, qc, target), now).unwrap();

    // Fresh enough: the light proof still works.
    let light = light_proof(qc_block, target);
    verifier.verify(&light, BlockTimestamp(now.0 + 30)).unwrap();

    // Past the TTL the root is garbage-collected.
    assert_eq!(
        verifier.verify(&light, BlockTimestamp(now.0 + 60)).unwrap_err(),
        ProofError::MissingCachedRoot
    );
}

#[traced_test]
#[test]
fn below_quorum_signatures_cannot_prove_finality() {
    let (cluster, mut verifier) = cluster_and_verifier(600);
    let n = cluster.recorded.len();
    let target = cluster.recorded[n - 4].as_ref();
    let qc_block = cluster.recorded[n - 1].as_ref();
    let now = BlockTimestamp(qc_block.header_state.timestamp().0 + 2);

    let qc = signed_qc_over(qc_block, &cluster.finalizer_keys, &[0, 1]);
    assert!(matches!(
        verifier.verify(&heavy_proof(qc_block, qc, target), now),
        Err(ProofError::InsufficientQuorum { weight: 2, threshold: 3 })
    ));
}

#[traced_test]
#[test]
fn rotated_policy_generations_verify_after_being_proven() {
    let mut cluster = Cluster::default_cluster();
    let quorum = cluster.quorum as usize;

    // Rotate node 0's key out, then run well past activation.
    cluster.propose_policy(&[4, 1, 2, 3]);
    cluster.process_votes(1, quorum);
    let proposal = cluster.produce_and_push_block().block_num();
    for _ in 0..10 {
        cluster.process_votes(1, quorum);
        cluster.produce_and_push_block();
    }

    let mut verifier = ProofVerifier::new(600);
    // Seed only generation 1 (the genesis policy).
    let genesis_policy = cluster
        .recorded
        .iter()
        .find(|s| s.header_state.policy_tracker.active().generation == 1)
        .unwrap()
        .header_state
        .policy_tracker
        .active()
        .clone();
    verifier.set_policy(genesis_policy);

    let find = |block_num| {
        cluster
            .recorded
            .iter()
            .find(|s| s.header_state.block_num() == block_num)
            .unwrap()
            .as_ref()
    };

    // A proof under the second generation fails while it is unknown.
    let gen2_qc_block = find(proposal + 7);
    let gen2_target = find(proposal + 6);
    let now = BlockTimestamp(gen2_qc_block.header_state.timestamp().0 + 2);
    let qc = signed_qc_over(gen2_qc_block, &cluster.finalizer_keys, &[1, 2, 3]);
    assert_eq!(
        verifier
            .verify(&heavy_proof(gen2_qc_block, qc.clone(), gen2_target), now)
            .unwrap_err(),
        ProofError::UnknownGeneration(2)
    );

    // Prove a first-generation block that carries the pending policy; the
    // verifier learns generation 2 from it.
    let carrier = find(proposal + 4);
    assert!(carrier.header_state.policy_tracker.latest_pending().is_some());
    let gen1_qc_block = find(proposal + 5);
    let qc1 = signed_qc_over(gen1_qc_block, &cluster.finalizer_keys, &[0, 1, 2]);
    verifier.verify(&heavy_proof(gen1_qc_block, qc1, carrier), now).unwrap();
    assert!(verifier.knows_generation(2));

    // Now the second-generation proof goes through.
    verifier.verify(&heavy_proof(gen2_qc_block, qc, gen2_target), now).unwrap();
}
