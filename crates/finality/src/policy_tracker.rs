//! Finalizer-policy rotation.
//!
//! A policy proposed in block `B` first becomes *pending* in the first
//! block whose finality core reports `B` final, and becomes *active* in the
//! first block that reports the pending-promotion block final. Under
//! continuous strong QCs that is two 3-chains: proposed in `B`, pending in
//! `B+3`, active in `B+6`.

use sbor::prelude::*;
use tracing::info;
use veldt_types::{BlockNum, FinalizerPolicy};

/// Lifecycle state of a tracked policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum PolicyState {
    /// Proposed in its key block; waiting for that block to become final.
    Proposed,
    /// Pending activation; waiting for its promotion block to become final.
    Pending,
}

/// One in-flight policy, keyed by the block number its next promotion
/// waits on.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct TrackedPolicy {
    pub block_num: BlockNum,
    pub state: PolicyState,
    pub policy: FinalizerPolicy,
}

/// Carries the active finalizer policy plus every in-flight proposal
/// through the activation delay. Part of a block's header state: each block
/// derives its tracker from its parent's.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PolicyTracker {
    active: FinalizerPolicy,
    /// In-flight policies ordered by key block number, oldest first.
    in_flight: Vec<TrackedPolicy>,
}

impl PolicyTracker {
    pub fn new(active: FinalizerPolicy) -> Self {
        PolicyTracker { active, in_flight: Vec::new() }
    }

    /// The policy QCs are currently verified against.
    pub fn active(&self) -> &FinalizerPolicy {
        &self.active
    }

    /// The most recently promoted pending policy, if any.
    pub fn latest_pending(&self) -> Option<&FinalizerPolicy> {
        self.in_flight
            .iter()
            .rev()
            .find(|t| t.state == PolicyState::Pending)
            .map(|t| &t.policy)
    }

    /// All in-flight policies, oldest key block first.
    pub fn in_flight(&self) -> &[TrackedPolicy] {
        &self.in_flight
    }

    /// Generation the next proposal must carry: one past the newest
    /// generation known anywhere in the tracker.
    pub fn next_generation(&self) -> u32 {
        self.in_flight
            .iter()
            .map(|t| t.policy.generation)
            .max()
            .unwrap_or(self.active.generation)
            + 1
    }

    /// Record a policy proposed in `block_num`. A block proposes at most
    /// one policy: a second proposal in the same block replaces the first.
    pub fn propose(&mut self, block_num: BlockNum, policy: FinalizerPolicy) {
        self.in_flight
            .retain(|t| !(t.state == PolicyState::Proposed && t.block_num == block_num));
        let at = self
            .in_flight
            .partition_point(|t| t.block_num <= block_num);
        self.in_flight.insert(at, TrackedPolicy {
            block_num,
            state: PolicyState::Proposed,
            policy,
        });
    }

    /// Evaluate promotions for the block being built.
    ///
    /// `current_block_num` is the block whose header state this tracker
    /// will belong to; `last_final_block_num` comes from that block's
    /// finality core. Entries whose key block is now final promote, oldest
    /// first: pending entries become the active policy, proposed entries
    /// become pending re-keyed at the current block.
    pub fn evaluate_promotions(
        &mut self,
        current_block_num: BlockNum,
        last_final_block_num: BlockNum,
    ) {
        let mut promoted_pending = Vec::new();
        while let Some(first) = self.in_flight.first() {
            if first.block_num > last_final_block_num {
                break;
            }
            let tracked = self.in_flight.remove(0);
            match tracked.state {
                PolicyState::Pending => {
                    info!(
                        generation = tracked.policy.generation,
                        at_block = current_block_num,
                        "finalizer policy activated"
                    );
                    self.active = tracked.policy;
                }
                PolicyState::Proposed => {
                    promoted_pending.push(TrackedPolicy {
                        block_num: current_block_num,
                        state: PolicyState::Pending,
                        policy: tracked.policy,
                    });
                }
            }
        }
        self.in_flight.extend(promoted_pending);
        self.in_flight.sort_by_key(|t| t.block_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veldt_types::{BlsPublicKey, FinalizerAuthority};

    fn policy(generation: u32) -> FinalizerPolicy {
        FinalizerPolicy::new(
            generation,
            (0..4u8)
                .map(|i| FinalizerAuthority {
                    description: format!("fin{i}"),
                    weight: 1,
                    public_key: BlsPublicKey([generation as u8 * 10 + i; 48]),
                })
                .collect(),
        )
    }

    /// Drive a tracker block by block with the steady-state finality lag
    /// (block `n` reports `n - 3` final).
    fn advance(tracker: &mut PolicyTracker, block_num: BlockNum) {
        tracker.evaluate_promotions(block_num, block_num.saturating_sub(3));
    }

    #[test]
    fn single_rotation_takes_two_three_chains() {
        let mut tracker = PolicyTracker::new(policy(1));
        let b = 100;
        tracker.propose(b, policy(2));

        for n in b + 1..=b + 5 {
            advance(&mut tracker, n);
            assert_eq!(tracker.active().generation, 1, "still old policy at block {n}");
        }
        // Pending happened at b+3; its key block becomes final at b+6.
        advance(&mut tracker, b + 6);
        assert_eq!(tracker.active().generation, 2);
    }

    #[test]
    fn same_block_reproposal_wins() {
        let mut tracker = PolicyTracker::new(policy(1));
        tracker.propose(50, policy(2));
        tracker.propose(50, policy(3));
        assert_eq!(tracker.in_flight().len(), 1);
        assert_eq!(tracker.in_flight()[0].policy.generation, 3);
    }

    #[test]
    fn in_flight_proposals_activate_in_order() {
        let mut tracker = PolicyTracker::new(policy(2));
        let b = 200;
        // Proposals land in blocks b, b+1 and b+3.
        tracker.propose(b, policy(3));
        advance(&mut tracker, b + 1);
        tracker.propose(b + 1, policy(4));
        advance(&mut tracker, b + 2);
        advance(&mut tracker, b + 3);
        tracker.propose(b + 3, policy(5));

        advance(&mut tracker, b + 4);
        advance(&mut tracker, b + 5);
        assert_eq!(tracker.active().generation, 2);

        advance(&mut tracker, b + 6);
        assert_eq!(tracker.active().generation, 3);
        advance(&mut tracker, b + 7);
        assert_eq!(tracker.active().generation, 4);
        advance(&mut tracker, b + 8);
        assert_eq!(tracker.active().generation, 4);
        advance(&mut tracker, b + 9);
        assert_eq!(tracker.active().generation, 5);
        assert!(tracker.in_flight().is_empty());
    }

    #[test]
    fn next_generation_counts_in_flight_policies() {
        let mut tracker = PolicyTracker::new(policy(1));
        assert_eq!(tracker.next_generation(), 2);
        tracker.propose(10, policy(2));
        assert_eq!(tracker.next_generation(), 3);
        tracker.propose(11, policy(3));
        assert_eq!(tracker.next_generation(), 4);
    }

    #[test]
    fn stalled_finality_stalls_promotions() {
        let mut tracker = PolicyTracker::new(policy(1));
        tracker.propose(10, policy(2));
        // Finality never reaches block 10.
        for n in 11..30 {
            tracker.evaluate_promotions(n, 9);
        }
        assert_eq!(tracker.active().generation, 1);
        assert_eq!(tracker.in_flight()[0].state, PolicyState::Proposed);
    }
}
