//! The per-block finality core.
//!
//! A core is an immutable value attached to every block once instant
//! finality is active. It captures all QC links relevant to the two-chain
//! commit rule and a window of ancestor block references, and derives the
//! block's irreversibility pointers from them.
//!
//! Precondition violations in this module are programming errors in the
//! caller (the controller validates blocks before feeding them here), so
//! they are enforced with `assert!` rather than surfaced as `Result`s.

use sbor::prelude::*;
use veldt_types::{BlockNum, BlockRef, QcClaim, QcLink};

/// Per-block finality state.
///
/// # Invariants
///
/// 1. `links` is never empty.
/// 2. `last_final_block_num() <= final_on_strong_qc_block_num
///    <= latest_qc_claim().block_num`.
/// 3. If `refs` is empty, `links` has exactly one element whose source and
///    target both equal `final_on_strong_qc_block_num` and
///    `last_final_block_num()`.
/// 4. If `refs` is non-empty, `refs[0].block_num() == links[0].target_block_num
///    == last_final_block_num()`.
/// 5. If `refs` is non-empty, `refs.last().block_num() + 1
///    == links.last().source_block_num == current_block_num()`.
/// 6. `refs` block numbers are consecutive and timestamps strictly increase.
/// 7. `links` source block numbers are consecutive and target block numbers
///    are monotonically non-decreasing.
/// 8. `current_block_num() - last_final_block_num() == refs.len()`.
/// 9. `current_block_num() - links[0].source_block_num == links.len() - 1`.
///
/// Invariants 8 and 9 are implied by the others; all nine are checked by
/// [`FinalityCore::check_invariants`], which the tests use as an oracle.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalityCore {
    /// Relevant QC links, ascending by source block number.
    links: Vec<QcLink>,
    /// References to ancestor blocks with numbers at or above
    /// `last_final_block_num()`, ascending by block number.
    refs: Vec<BlockRef>,
    /// Highest ancestor made final by one more strong QC.
    final_on_strong_qc_block_num: BlockNum,
}

impl FinalityCore {
    /// The unique core of an instant-finality genesis block: one self-link,
    /// no refs, both pointers at the genesis block itself.
    pub fn genesis(block_num: BlockNum) -> Self {
        FinalityCore {
            links: vec![QcLink {
                source_block_num: block_num,
                target_block_num: block_num,
                is_link_strong: false,
            }],
            refs: Vec::new(),
            final_on_strong_qc_block_num: block_num,
        }
    }

    /// The block this core belongs to.
    pub fn current_block_num(&self) -> BlockNum {
        // Invariant 1 guarantees a last link.
        self.links.last().expect("links never empty").source_block_num
    }

    /// The highest ancestor known final: nothing at or below this number can
    /// be reversed.
    pub fn last_final_block_num(&self) -> BlockNum {
        self.links.first().expect("links never empty").target_block_num
    }

    /// The highest ancestor that one more strong QC would make final.
    pub fn final_on_strong_qc_block_num(&self) -> BlockNum {
        self.final_on_strong_qc_block_num
    }

    /// The QC claim this block's header carries.
    pub fn latest_qc_claim(&self) -> QcClaim {
        let last = self.links.last().expect("links never empty");
        QcClaim { block_num: last.target_block_num, is_strong_qc: last.is_link_strong }
    }

    /// The tracked QC links, ascending by source block number.
    pub fn links(&self) -> &[QcLink] {
        &self.links
    }

    /// The tracked ancestor references, ascending by block number.
    pub fn refs(&self) -> &[BlockRef] {
        &self.refs
    }

    /// Reference to the ancestor at `block_num`.
    ///
    /// Requires `last_final_block_num() <= block_num < current_block_num()`.
    pub fn get_block_reference(&self, block_num: BlockNum) -> &BlockRef {
        assert!(self.last_final_block_num() <= block_num, "reference below final window");
        assert!(block_num < self.current_block_num(), "reference at or above current block");

        // With the preconditions and invariant 8, the index is in range and
        // invariants 4 and 6 place the requested block exactly there.
        let index = (block_num - self.last_final_block_num()) as usize;
        &self.refs[index]
    }

    /// The QC link whose source is `block_num`.
    ///
    /// Requires `links[0].source_block_num <= block_num <= current_block_num()`.
    pub fn get_qc_link_from(&self, block_num: BlockNum) -> &QcLink {
        let first_source = self.links.first().expect("links never empty").source_block_num;
        assert!(first_source <= block_num, "link below tracked window");
        assert!(block_num <= self.current_block_num(), "link above current block");

        // Invariants 7 and 9 make this direct indexing valid.
        let index = (block_num - first_source) as usize;
        &self.links[index]
    }

    /// Produce the core of the next block.
    ///
    /// `current_block` must reference the block this core belongs to, and
    /// `most_recent_ancestor_with_qc` is the next block's QC claim, which
    /// may not regress below this block's own claim nor exceed this block.
    pub fn next(&self, current_block: &BlockRef, most_recent_ancestor_with_qc: QcClaim) -> Self {
        let claim = most_recent_ancestor_with_qc;
        assert_eq!(
            current_block.block_num(),
            self.current_block_num(),
            "current block reference does not match the core"
        );
        if let Some(last_ref) = self.refs.last() {
            assert_eq!(last_ref.block_num() + 1, current_block.block_num());
            assert!(last_ref.timestamp < current_block.timestamp, "timestamps must increase");
        }
        assert!(claim.block_num <= self.current_block_num(), "claim beyond current block");
        assert!(self.latest_qc_claim() <= claim, "claim regressed");

        let (new_last_final, new_final_on_strong_qc) = self.advanced_block_nums(claim);

        assert!(self.final_on_strong_qc_block_num <= new_final_on_strong_qc);
        assert!(self.last_final_block_num() <= new_last_final);

        // Garbage-collect links only when finality advanced; the surviving
        // front link is then the one sourced at the new strong-QC pointer,
        // whose target is the new final block (keeping invariant 4).
        let mut links_index = 0usize;
        if self.last_final_block_num() < new_last_final {
            links_index = (new_final_on_strong_qc
                - self.links.first().expect("links never empty").source_block_num)
                as usize;
        }
        let mut links = self.links[links_index..].to_vec();
        links.push(QcLink {
            source_block_num: self.current_block_num() + 1,
            target_block_num: claim.block_num,
            is_link_strong: claim.is_strong_qc,
        });

        // Drop refs below the new final block and append the current block.
        let refs_index = (new_last_final - self.last_final_block_num()) as usize;
        let mut refs = self.refs[refs_index..].to_vec();
        refs.push(*current_block);

        let next = FinalityCore { links, refs, final_on_strong_qc_block_num: new_final_on_strong_qc };
        debug_assert!(next.check_invariants().is_ok(), "{:?}", next.check_invariants());
        next
    }

    /// The two-chain case analysis: given the next block's claim, compute
    /// `(new_last_final_block_num, new_final_on_strong_qc_block_num)`.
    fn advanced_block_nums(&self, claim: QcClaim) -> (BlockNum, BlockNum) {
        let unchanged = (self.last_final_block_num(), self.final_on_strong_qc_block_num);

        if !claim.is_strong_qc {
            return unchanged;
        }
        let first_source = self.links.first().expect("links never empty").source_block_num;
        if claim.block_num < first_source {
            return unchanged;
        }

        let link1 = self.get_qc_link_from(claim.block_num);
        if !link1.is_link_strong || link1.target_block_num < first_source {
            return (self.last_final_block_num(), link1.target_block_num);
        }

        // Strong QC over a strong link: the two-chain completes and
        // link2's target becomes final.
        let link2 = self.get_qc_link_from(link1.target_block_num);
        (link2.target_block_num, link1.target_block_num)
    }

    /// Verify all nine invariants, returning the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.links.is_empty() {
            return Err("invariant 1: links empty".into());
        }
        let current = self.current_block_num();
        let last_final = self.last_final_block_num();
        if !(last_final <= self.final_on_strong_qc_block_num
            && self.final_on_strong_qc_block_num <= self.latest_qc_claim().block_num)
        {
            return Err(format!(
                "invariant 2: {last_final} <= {} <= {} violated",
                self.final_on_strong_qc_block_num,
                self.latest_qc_claim().block_num
            ));
        }
        if self.refs.is_empty() {
            let only = &self.links[0];
            if self.links.len() != 1
                || only.target_block_num != only.source_block_num
                || only.source_block_num != self.final_on_strong_qc_block_num
                || only.source_block_num != last_final
            {
                return Err("invariant 3: empty refs require a single genesis self-link".into());
            }
        } else {
            if self.refs[0].block_num() != self.links[0].target_block_num
                || self.refs[0].block_num() != last_final
            {
                return Err("invariant 4: refs front must sit at the final block".into());
            }
            let back = self.refs.last().expect("refs non-empty");
            if back.block_num() + 1 != self.links.last().expect("links never empty").source_block_num
                || back.block_num() + 1 != current
            {
                return Err("invariant 5: refs back must be the parent of the current block".into());
            }
        }
        for pair in self.refs.windows(2) {
            if pair[0].block_num() + 1 != pair[1].block_num() {
                return Err("invariant 6: refs block numbers must be consecutive".into());
            }
            if pair[0].timestamp >= pair[1].timestamp {
                return Err("invariant 6: refs timestamps must strictly increase".into());
            }
        }
        for pair in self.links.windows(2) {
            if pair[0].source_block_num + 1 != pair[1].source_block_num {
                return Err("invariant 7: links sources must be consecutive".into());
            }
            if pair[0].target_block_num > pair[1].target_block_num {
                return Err("invariant 7: links targets must not decrease".into());
            }
        }
        if (current - last_final) as usize != self.refs.len() {
            return Err("invariant 8: refs size mismatch".into());
        }
        if (current - self.links[0].source_block_num) as usize != self.links.len() - 1 {
            return Err("invariant 9: links size mismatch".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use veldt_types::{sha256, BlockId, BlockTimestamp};

    fn block_ref(num: BlockNum) -> BlockRef {
        BlockRef {
            block_id: BlockId::from_digest(num, sha256(&num.to_be_bytes())),
            timestamp: BlockTimestamp(num),
        }
    }

    /// Step a core forward with the given claim and re-check the oracle.
    fn step(core: &FinalityCore, claim: QcClaim) -> FinalityCore {
        let next = core.next(&block_ref(core.current_block_num()), claim);
        next.check_invariants().unwrap();
        assert_eq!(next.current_block_num(), core.current_block_num() + 1);
        assert_eq!(next.latest_qc_claim(), claim);
        assert!(next.last_final_block_num() >= core.last_final_block_num());
        assert!(next.final_on_strong_qc_block_num() >= core.final_on_strong_qc_block_num());
        next
    }

    #[test]
    fn genesis_satisfies_invariants() {
        let core = FinalityCore::genesis(10);
        core.check_invariants().unwrap();
        assert_eq!(core.current_block_num(), 10);
        assert_eq!(core.last_final_block_num(), 10);
        assert_eq!(core.final_on_strong_qc_block_num(), 10);
        assert_eq!(core.latest_qc_claim(), QcClaim { block_num: 10, is_strong_qc: false });
    }

    #[test]
    fn steady_strong_claims_advance_finality_with_two_chain_lag() {
        let mut core = FinalityCore::genesis(1);
        // Each block claims a strong QC over its parent.
        for _ in 0..10 {
            let claim = QcClaim { block_num: core.current_block_num(), is_strong_qc: true };
            core = step(&core, claim);
        }
        // Core of block 11: the two-chain rule keeps the final pointer two
        // behind the claimed block and the strong-QC pointer one behind.
        assert_eq!(core.current_block_num(), 11);
        assert_eq!(core.latest_qc_claim().block_num, 10);
        assert_eq!(core.final_on_strong_qc_block_num(), 9);
        assert_eq!(core.last_final_block_num(), 8);
    }

    #[test]
    fn weak_claims_do_not_advance_finality() {
        let mut core = FinalityCore::genesis(1);
        for _ in 0..3 {
            let claim = QcClaim { block_num: core.current_block_num(), is_strong_qc: true };
            core = step(&core, claim);
        }
        let final_before = core.last_final_block_num();
        for _ in 0..4 {
            let claim = QcClaim { block_num: core.current_block_num(), is_strong_qc: false };
            core = step(&core, claim);
        }
        assert_eq!(core.last_final_block_num(), final_before);
    }

    #[test]
    fn weak_then_strong_recovers() {
        let mut core = FinalityCore::genesis(1);
        for _ in 0..4 {
            let claim = QcClaim { block_num: core.current_block_num(), is_strong_qc: true };
            core = step(&core, claim);
        }
        // A weak QC interrupts the strong chain.
        core = step(&core, QcClaim { block_num: core.current_block_num(), is_strong_qc: false });
        let stalled = core.last_final_block_num();
        // Strong claims resume; finality catches back up after the strong
        // two-chain rebuilds.
        core = step(&core, QcClaim { block_num: core.current_block_num(), is_strong_qc: true });
        assert_eq!(core.last_final_block_num(), stalled);
        core = step(&core, QcClaim { block_num: core.current_block_num(), is_strong_qc: true });
        assert!(core.last_final_block_num() > stalled);
    }

    #[test]
    fn repeated_claims_hold_finality_still() {
        let mut core = FinalityCore::genesis(1);
        for _ in 0..4 {
            let claim = QcClaim { block_num: core.current_block_num(), is_strong_qc: true };
            core = step(&core, claim);
        }
        // Votes stop arriving: each new block repeats the same claim.
        let repeated = core.latest_qc_claim();
        let final_before = core.last_final_block_num();
        for _ in 0..5 {
            core = step(&core, repeated);
        }
        assert_eq!(core.last_final_block_num(), final_before);
    }

    #[test]
    #[should_panic(expected = "claim regressed")]
    fn regressing_claim_is_a_programming_error() {
        let mut core = FinalityCore::genesis(1);
        core = step(&core, QcClaim { block_num: 1, is_strong_qc: true });
        core = step(&core, QcClaim { block_num: 2, is_strong_qc: true });
        // Claiming an older block than the latest claim must panic.
        let _ = core.next(
            &block_ref(core.current_block_num()),
            QcClaim { block_num: 1, is_strong_qc: true },
        );
    }

    proptest! {
        /// Any valid claim sequence from genesis keeps all nine invariants.
        #[test]
        fn prop_invariants_hold_under_arbitrary_claim_sequences(
            choices in proptest::collection::vec((0u8..=4, any::<bool>()), 1..60),
        ) {
            let mut core = FinalityCore::genesis(1);
            for (lag, strong) in choices {
                let latest = core.latest_qc_claim();
                // Choose a claim between the latest claim and the current
                // block, biased by `lag`.
                let lo = latest.block_num;
                let hi = core.current_block_num();
                let block_num = hi.saturating_sub(lag as u32).max(lo);
                let mut claim = QcClaim { block_num, is_strong_qc: strong };
                if claim < latest {
                    claim = latest;
                }
                core = core.next(&block_ref(core.current_block_num()), claim);
                prop_assert!(core.check_invariants().is_ok(), "{:?}", core.check_invariants());
                prop_assert_eq!(core.latest_qc_claim(), claim);
            }
        }
    }
}
