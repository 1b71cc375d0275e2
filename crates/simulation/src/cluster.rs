//! The virtual cluster.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use veldt_chain::{
    far_deadline, BlockStatus, ChainConfig, Collaborators, Controller, GenesisState,
    SavannaBlockState,
};
use veldt_finality::VoteStatus;
use veldt_store::ChainLimits;
use veldt_types::{
    AccountName, BlockId, BlockNum, BlockSigningAuthority, BlockTimestamp, BlsKeyPair,
    FinalizerAuthority, ProducerAuthority, ProducerSchedule, SignedBlock, PRODUCER_REPETITIONS,
};


/// Vote strength a node uses when asked to vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteMode {
    Strong,
    Weak,
}

/// Cluster parameters.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Validator count; every node runs one finalizer.
    pub num_nodes: usize,
    /// How many nodes appear in the producer schedule (the rest only
    /// validate and vote).
    pub num_producers: usize,
    /// Seed for any randomized behavior.
    pub seed: u64,
    /// Run settling rounds after the transition so tests start from the
    /// steady state (one block finalized per voted round).
    pub settle: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig { num_nodes: 4, num_producers: 1, seed: 42, settle: true }
    }
}

/// One cluster member.
pub struct ClusterNode {
    pub controller: Controller,
    pub producer_name: AccountName,
    producer_key: Arc<BlsKeyPair>,
    /// Savanna blocks this node has seen, in arrival order (vote targets).
    pub vote_targets: Vec<BlockId>,
    prev_lib: BlockNum,
}

impl ClusterNode {
    pub fn lib_num(&self) -> BlockNum {
        self.controller.last_irreversible_block_num()
    }

    /// True if irreversibility advanced since the last probe.
    pub fn lib_advancing(&mut self) -> bool {
        let lib = self.lib_num();
        if lib > self.prev_lib {
            self.prev_lib = lib;
            true
        } else {
            false
        }
    }

    pub fn reset_lib(&mut self) {
        self.prev_lib = self.lib_num();
    }

    pub fn forkdb_head_num(&self) -> BlockNum {
        self.controller.fork_db_head_block_num()
    }

    pub fn forkdb_head_id(&self) -> BlockId {
        self.controller.fork_db_head_block_id()
    }

    /// This node's block-signing key (tests forge blocks with it).
    pub fn producer_key(&self) -> &Arc<BlsKeyPair> {
        &self.producer_key
    }
}

/// A deterministic virtual network of controllers.
pub struct Cluster {
    pub nodes: Vec<ClusterNode>,
    /// Directional blocked pairs; `(a, b)` drops messages from a to b.
    partitions: HashSet<(usize, usize)>,
    /// Finalizer keys in policy order (one per node).
    pub finalizer_keys: Vec<Arc<BlsKeyPair>>,
    /// Savanna states recorded at production time, for proof building.
    pub recorded: Vec<Arc<SavannaBlockState>>,
    /// Policy proposal queued for the next produced block.
    queued_policy: Option<Vec<FinalizerAuthority>>,
    rng: ChaCha8Rng,
    /// Quorum weight of the initial policy.
    pub quorum: u64,
}

impl Cluster {
    /// Build a cluster and drive it through the transition to instant
    /// finality: the producer proposes a policy with one finalizer per
    /// node, and (optionally) settling rounds bring finality to steady
    /// state.
    pub fn new(config: ClusterConfig) -> Self {
        assert!(config.num_producers >= 1 && config.num_producers <= config.num_nodes);

        let producer_keys: Vec<Arc<BlsKeyPair>> = (0..config.num_nodes)
            .map(|i| Arc::new(BlsKeyPair::from_seed(&[i as u8 + 1; 32]).unwrap()))
            .collect();
        // Two spare keys beyond the node set, for rotation tests.
        let finalizer_keys: Vec<Arc<BlsKeyPair>> = (0..config.num_nodes + 2)
            .map(|i| Arc::new(BlsKeyPair::from_seed(&[i as u8 + 101; 32]).unwrap()))
            .collect();

        let producer_names: Vec<AccountName> = (0..config.num_nodes)
            .map(|i| AccountName::new(&format!("prod.{}", (b'a' + i as u8) as char)))
            .collect();
        let schedule = ProducerSchedule {
            version: 0,
            producers: (0..config.num_producers)
                .map(|i| ProducerAuthority {
                    producer_name: producer_names[i],
                    authority: BlockSigningAuthority::single(producer_keys[i].public_key()),
                })
                .collect(),
        };
        let genesis = GenesisState {
            initial_timestamp: BlockTimestamp(100),
            initial_schedule: schedule,
            initial_limits: ChainLimits::default(),
        };

        let nodes: Vec<ClusterNode> = (0..config.num_nodes)
            .map(|i| {
                let mut controller = Controller::new(
                    ChainConfig::default(),
                    genesis.clone(),
                    Collaborators::default(),
                );
                controller.set_node_finalizers(vec![finalizer_keys[i].clone()]);
                ClusterNode {
                    controller,
                    producer_name: producer_names[i],
                    producer_key: producer_keys[i].clone(),
                    vote_targets: Vec::new(),
                    prev_lib: 0,
                }
            })
            .collect();

        let quorum = (config.num_nodes as u64) * 2 / 3 + 1;
        let mut cluster = Cluster {
            nodes,
            partitions: HashSet::new(),
            finalizer_keys: finalizer_keys.clone(),
            recorded: Vec::new(),
            queued_policy: None,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            quorum,
        };

        // One plain block, then the transition block proposing a policy
        // with one finalizer per node.
        cluster.produce_and_push_block_on(0);
        cluster.queued_policy = Some(
            finalizer_keys[..config.num_nodes]
                .iter()
                .enumerate()
                .map(|(i, key)| FinalizerAuthority {
                    description: format!("node{i}"),
                    weight: 1,
                    public_key: key.public_key(),
                })
                .collect(),
        );
        cluster.produce_and_push_block_on(0);
        assert!(cluster.nodes[0].controller.head_block_state().is_savanna());

        if config.settle {
            // Vote every block until irreversibility advances each round.
            for _ in 0..6 {
                let quorum = cluster.quorum as usize;
                cluster.process_votes(1, quorum);
                cluster.produce_and_push_block_on(0);
            }
            for node in &mut cluster.nodes {
                node.reset_lib();
            }
        }
        cluster
    }

    /// Deterministic default cluster: 4 nodes, quorum 3.
    pub fn default_cluster() -> Self {
        Cluster::new(ClusterConfig::default())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Queue a finalizer-policy proposal for the next produced block.
    pub fn propose_policy(&mut self, key_indexes: &[usize]) {
        self.queued_policy = Some(
            key_indexes
                .iter()
                .enumerate()
                .map(|(position, &key_index)| FinalizerAuthority {
                    description: format!("node{position}"),
                    weight: 1,
                    public_key: self.finalizer_keys[key_index].public_key(),
                })
                .collect(),
        );
    }

    fn reachable(&self, from: usize, to: usize) -> bool {
        from == to || !self.partitions.contains(&(from, to))
    }

    /// Partition the cluster into disjoint groups; messages only flow
    /// within a group.
    pub fn split(&mut self, groups: &[&[usize]]) {
        self.partitions.clear();
        for (gi, group_a) in groups.iter().enumerate() {
            for (gj, group_b) in groups.iter().enumerate() {
                if gi == gj {
                    continue;
                }
                for &a in group_a.iter() {
                    for &b in group_b.iter() {
                        self.partitions.insert((a, b));
                    }
                }
            }
        }
    }

    /// Remove every partition.
    pub fn heal(&mut self) {
        self.partitions.clear();
    }

    /// The next slot at which `node` is the scheduled producer, strictly
    /// after `after`.
    fn next_slot_for(&self, node: usize, after: BlockTimestamp) -> BlockTimestamp {
        let schedule = self.nodes[node].controller.active_producers().clone();
        let mut slot = after.0 + 1;
        loop {
            let when = BlockTimestamp(slot);
            if schedule.scheduled_producer(when).producer_name == self.nodes[node].producer_name {
                return when;
            }
            slot += PRODUCER_REPETITIONS - (slot % PRODUCER_REPETITIONS);
        }
    }

    /// Produce a block on `producer` and deliver it to every reachable
    /// node. Returns the block.
    pub fn produce_and_push_block_on(&mut self, producer: usize) -> Arc<SignedBlock> {
        let when = self.next_slot_for(producer, self.nodes[producer].controller.head_block_time());
        let queued = self.queued_policy.take();
        let block = {
            let node = &mut self.nodes[producer];
            let features = node.controller.get_preactivated_protocol_features();
            node.controller
                .start_block(when, 0, &features, BlockStatus::Incomplete, None, far_deadline())
                .expect("start_block failed in cluster production");
            if let Some(policy) = queued {
                node.controller.set_proposed_finalizers(policy).unwrap();
            }
            node.controller.finalize_block().expect("finalize failed in cluster production");
            let key = node.producer_key.clone();
            node.controller
                .sign_block(&move |digest| key.sign(digest.as_bytes()))
                .expect("sign failed in cluster production");
            node.controller.commit_block().expect("commit failed in cluster production");
            node.controller.head_block_state().block().clone()
        };

        // Record savanna history for proof building and vote targets.
        if let Some(savanna) = self.nodes[producer].controller.head_block_state().as_savanna() {
            self.recorded.push(savanna.clone());
            let id = savanna.header_state.id;
            self.nodes[producer].vote_targets.push(id);
        }

        self.push_block_to_peers(producer, &block);
        block
    }

    /// Shorthand: node 0 produces.
    pub fn produce_and_push_block(&mut self) -> Arc<SignedBlock> {
        self.produce_and_push_block_on(0)
    }

    /// Deliver a block to every node reachable from `from`.
    pub fn push_block_to_peers(&mut self, from: usize, block: &Arc<SignedBlock>) {
        for to in 0..self.nodes.len() {
            if to == from || !self.reachable(from, to) {
                continue;
            }
            match self.nodes[to].controller.push_block(block.clone()) {
                Ok(()) => {
                    let vote_target = self.nodes[to]
                        .controller
                        .head_block_state()
                        .as_savanna()
                        .filter(|savanna| savanna.header_state.id == block.calculate_id())
                        .map(|savanna| savanna.header_state.id);
                    if let Some(id) = vote_target {
                        self.nodes[to].vote_targets.push(id);
                    }
                }
                Err(err) => {
                    debug!(from, to, %err, "peer rejected block");
                }
            }
        }
    }

    /// Node `voter` signs a vote on its `index`-th savanna block (`None` =
    /// latest) and delivers it to every reachable node. Returns the
    /// producer-side status.
    pub fn process_vote(
        &mut self,
        voter: usize,
        index: Option<usize>,
        mode: VoteMode,
    ) -> VoteStatus {
        let targets = &self.nodes[voter].vote_targets;
        let Some(&target) = (match index {
            Some(index) => targets.get(index),
            None => targets.last(),
        }) else {
            return VoteStatus::UnknownBlock;
        };
        let votes = self.nodes[voter]
            .controller
            .create_votes_for(&target, mode == VoteMode::Strong);
        let mut status = VoteStatus::UnknownBlock;
        for to in 0..self.nodes.len() {
            if !self.reachable(voter, to) {
                continue;
            }
            for vote in &votes {
                let this = self.nodes[to].controller.process_vote_message(voter as u32, vote);
                if to == 0 {
                    status = this;
                }
            }
        }
        status
    }

    /// Nodes `first..first+count` each vote on their `index`-th savanna
    /// block (`None` = latest). Returns the index of the next unvoted node.
    pub fn process_votes_mode(
        &mut self,
        first: usize,
        count: usize,
        index: Option<usize>,
        mode: VoteMode,
    ) -> usize {
        let mut node = first;
        for _ in 0..count {
            self.process_vote(node, index, mode);
            node += 1;
        }
        node
    }

    /// Strong votes on the latest block from `count` nodes starting at
    /// `first`.
    pub fn process_votes(&mut self, first: usize, count: usize) -> usize {
        self.process_votes_mode(first, count, None, VoteMode::Strong)
    }

    /// How many nodes saw irreversibility advance since last asked.
    pub fn num_lib_advancing(&mut self) -> usize {
        self.nodes
            .iter_mut()
            .map(|node| node.lib_advancing())
            .filter(|advanced| *advanced)
            .count()
    }

    /// Forget saved vote targets and re-baseline irreversibility probes.
    pub fn clear_votes_and_reset_lib(&mut self) {
        for node in &mut self.nodes {
            node.vote_targets.clear();
            node.reset_lib();
        }
    }

    /// Push `from`'s whole reversible branch to `to` (duplicates no-op).
    pub fn push_branch(&mut self, from: usize, to: usize) {
        let head = self.nodes[from].forkdb_head_num();
        let root = self.nodes[from].controller.last_irreversible_block_num();
        for block_num in root + 1..=head {
            let Some(block) = self.nodes[from].controller.fetch_block_by_number(block_num)
            else {
                break;
            };
            if let Err(err) = self.nodes[to].controller.push_block(block) {
                debug!(from, to, %err, "sync push rejected");
                break;
            }
        }
    }

    /// Verify LIB keeps advancing for a few voted rounds; used as a
    /// closing sanity check by scenario tests.
    pub fn produce_blocks_and_verify_lib_advancing(&mut self) -> bool {
        for _ in 0..3 {
            let quorum = self.quorum as usize;
            self.process_votes(1, quorum);
            self.produce_and_push_block();
            if self.num_lib_advancing() != self.num_nodes() {
                return false;
            }
        }
        true
    }

    /// Deterministic jitter source for tests that want randomized orders.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}
