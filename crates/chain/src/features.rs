//! Protocol features: recognition, preactivation and activation.
//!
//! Activation is two-phase. `preactivate_feature` validates a digest and
//! records it in the protocol-state row; the next `start_block` consumes
//! the preactivated list, runs the builtin activation handler, and moves
//! the digest into the activated set. Failures during validation reject
//! the block; during speculation they are subjective.

use crate::error::{ChainError, Result};
use sbor::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};
use veldt_types::{BlockNum, BlockTimestamp, Digest};

/// Builtin features with controller-level activation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BasicSbor)]
pub enum BuiltinFeature {
    /// Gates preactivation itself: until active, features requiring
    /// preactivation cannot be preactivated.
    PreactivateFeature,
    /// Enables `set_proposed_finalizers`, beginning the transition out of
    /// delegated production.
    InstantFinality,
    /// Stops scheduling new deferred transactions; existing ones are
    /// retired only as expired.
    DisableDeferredTrxsStage1,
    /// Allows actions to return values, covered by the action merkle.
    ActionReturnValue,
}

impl BuiltinFeature {
    pub const ALL: [BuiltinFeature; 4] = [
        BuiltinFeature::PreactivateFeature,
        BuiltinFeature::InstantFinality,
        BuiltinFeature::DisableDeferredTrxsStage1,
        BuiltinFeature::ActionReturnValue,
    ];

    /// The feature's consensus digest: a hash of its codename.
    pub fn digest(self) -> Digest {
        Digest::hash(self.codename())
    }

    pub fn codename(self) -> &'static str {
        match self {
            BuiltinFeature::PreactivateFeature => "PREACTIVATE_FEATURE",
            BuiltinFeature::InstantFinality => "INSTANT_FINALITY",
            BuiltinFeature::DisableDeferredTrxsStage1 => "DISABLE_DEFERRED_TRXS_STAGE_1",
            BuiltinFeature::ActionReturnValue => "ACTION_RETURN_VALUE",
        }
    }

    /// Intrinsics this feature whitelists for contracts. The activation
    /// handler is idempotent: re-activation on replay re-whitelists the
    /// same names.
    pub fn whitelisted_intrinsics(self) -> &'static [&'static str] {
        match self {
            BuiltinFeature::PreactivateFeature => &["preactivate_feature", "is_feature_activated"],
            BuiltinFeature::InstantFinality => &["set_finalizers"],
            BuiltinFeature::DisableDeferredTrxsStage1 => &[],
            BuiltinFeature::ActionReturnValue => &["set_action_return_value"],
        }
    }
}

/// Static description of one recognized feature.
#[derive(Debug, Clone)]
pub struct ProtocolFeature {
    pub digest: Digest,
    pub builtin: Option<BuiltinFeature>,
    pub dependencies: Vec<Digest>,
    /// Before this time the feature is "too early" to activate.
    pub earliest_allowed_activation_time: BlockTimestamp,
    pub preactivation_required: bool,
    pub enabled: bool,
}

/// The set of features this node recognizes, plus the activation bookkeeping
/// that must follow fork switches (activations performed by abandoned
/// blocks are popped, unlike the undo-session-tracked protocol-state row).
#[derive(Debug, Default)]
pub struct ProtocolFeatureManager {
    recognized: BTreeMap<Digest, ProtocolFeature>,
    /// Activated digests with their activation block, ascending.
    activations: Vec<(Digest, BlockNum)>,
    /// Intrinsics whitelisted by activated builtins.
    whitelisted_intrinsics: Vec<&'static str>,
}

impl ProtocolFeatureManager {
    /// A manager recognizing every builtin, enabled, with no activation
    /// time restriction.
    pub fn with_all_builtins() -> Self {
        let mut manager = ProtocolFeatureManager::default();
        for builtin in BuiltinFeature::ALL {
            manager.add_feature(ProtocolFeature {
                digest: builtin.digest(),
                builtin: Some(builtin),
                dependencies: match builtin {
                    // Everything else rides on the preactivation gate.
                    BuiltinFeature::PreactivateFeature => Vec::new(),
                    _ => vec![BuiltinFeature::PreactivateFeature.digest()],
                },
                earliest_allowed_activation_time: BlockTimestamp(0),
                preactivation_required: builtin != BuiltinFeature::PreactivateFeature,
                enabled: true,
            });
        }
        manager
    }

    pub fn add_feature(&mut self, feature: ProtocolFeature) {
        self.recognized.insert(feature.digest, feature);
    }

    pub fn get(&self, digest: &Digest) -> Option<&ProtocolFeature> {
        self.recognized.get(digest)
    }

    pub fn is_activated(&self, digest: &Digest) -> bool {
        self.activations.iter().any(|(d, _)| d == digest)
    }

    pub fn is_builtin_activated(&self, builtin: BuiltinFeature) -> bool {
        self.is_activated(&builtin.digest())
    }

    pub fn whitelisted_intrinsics(&self) -> &[&'static str] {
        &self.whitelisted_intrinsics
    }

    /// Validate a digest for preactivation against the current protocol
    /// state. `subjective` selects the §7 severity for failures.
    pub fn validate_preactivation(
        &self,
        digest: &Digest,
        now: BlockTimestamp,
        currently_activated: &[(Digest, BlockNum)],
        currently_preactivated: &[Digest],
        subjective: bool,
    ) -> Result<()> {
        let fail = |message: String| {
            if subjective {
                Err(ChainError::ProtocolFeatureSubjective(message))
            } else {
                Err(ChainError::ProtocolFeatureBadBlock(message))
            }
        };
        let Some(feature) = self.recognized.get(digest) else {
            return fail(format!("unrecognized protocol feature {digest}"));
        };
        if !feature.enabled {
            return fail(format!("protocol feature {digest} is disabled"));
        }
        if now < feature.earliest_allowed_activation_time {
            return fail(format!("protocol feature {digest} is too early to activate"));
        }
        if currently_activated.iter().any(|(d, _)| d == digest) {
            return fail(format!("protocol feature {digest} is already activated"));
        }
        if currently_preactivated.contains(digest) {
            return fail(format!("protocol feature {digest} is already preactivated"));
        }
        for dependency in &feature.dependencies {
            let satisfied = currently_activated.iter().any(|(d, _)| d == dependency)
                || currently_preactivated.contains(dependency);
            if !satisfied {
                return fail(format!(
                    "protocol feature {digest} depends on unactivated {dependency}"
                ));
            }
        }
        Ok(())
    }

    /// Validate the features a block requests at its start, per the block's
    /// activation rules (duplicates and unsatisfied dependencies reject the
    /// block regardless of speculation).
    pub fn check_block_activations(
        &self,
        timestamp: BlockTimestamp,
        currently_activated: &[(Digest, BlockNum)],
        new_features: &[Digest],
    ) -> Result<()> {
        for (position, digest) in new_features.iter().enumerate() {
            let Some(feature) = self.recognized.get(digest) else {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "block activates unrecognized protocol feature {digest}"
                )));
            };
            if !feature.enabled {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "block activates disabled protocol feature {digest}"
                )));
            }
            if timestamp < feature.earliest_allowed_activation_time {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "block activates protocol feature {digest} before its allowed time"
                )));
            }
            if currently_activated.iter().any(|(d, _)| d == digest)
                || new_features[..position].contains(digest)
            {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "duplicate activation of protocol feature {digest}"
                )));
            }
            for dependency in &feature.dependencies {
                let satisfied = currently_activated.iter().any(|(d, _)| d == dependency)
                    || new_features[..position].contains(dependency);
                if !satisfied {
                    return Err(ChainError::ProtocolFeatureBadBlock(format!(
                        "protocol feature {digest} activated before its dependency {dependency}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record an activation and run the builtin handler.
    pub fn activate(&mut self, digest: Digest, block_num: BlockNum) {
        if let Some(builtin) = self.recognized.get(&digest).and_then(|f| f.builtin) {
            for intrinsic in builtin.whitelisted_intrinsics() {
                if !self.whitelisted_intrinsics.contains(intrinsic) {
                    self.whitelisted_intrinsics.push(intrinsic);
                }
            }
            info!(feature = builtin.codename(), block_num, "builtin protocol feature activated");
        } else {
            debug!(%digest, block_num, "protocol feature activated");
        }
        self.activations.push((digest, block_num));
    }

    /// Discard activations performed by blocks above `block_num` (fork
    /// switches and aborted blocks).
    pub fn popped_blocks_to(&mut self, block_num: BlockNum) {
        self.activations.retain(|(_, activated_at)| *activated_at <= block_num);
        self.rebuild_whitelist();
    }

    fn rebuild_whitelist(&mut self) {
        self.whitelisted_intrinsics.clear();
        let activations = self.activations.clone();
        for (digest, _) in &activations {
            if let Some(builtin) = self.recognized.get(digest).and_then(|f| f.builtin) {
                for intrinsic in builtin.whitelisted_intrinsics() {
                    if !self.whitelisted_intrinsics.contains(intrinsic) {
                        self.whitelisted_intrinsics.push(intrinsic);
                    }
                }
            }
        }
    }

    /// Seed activations from a restored state (snapshot or replay).
    pub fn restore_activations(&mut self, activations: &[(Digest, BlockNum)]) {
        self.activations = activations.to_vec();
        self.rebuild_whitelist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preactivation_rejects_unknown_and_double() {
        let manager = ProtocolFeatureManager::with_all_builtins();
        let gate = BuiltinFeature::PreactivateFeature.digest();
        let finality = BuiltinFeature::InstantFinality.digest();

        assert!(matches!(
            manager.validate_preactivation(&Digest::hash(b"bogus"), BlockTimestamp(5), &[], &[], false),
            Err(ChainError::ProtocolFeatureBadBlock(_))
        ));
        // Speculative severity downgrades.
        assert!(matches!(
            manager.validate_preactivation(&Digest::hash(b"bogus"), BlockTimestamp(5), &[], &[], true),
            Err(ChainError::ProtocolFeatureSubjective(_))
        ));

        // Dependency gate: instant finality needs the preactivation gate.
        assert!(manager
            .validate_preactivation(&finality, BlockTimestamp(5), &[], &[], false)
            .is_err());
        assert!(manager
            .validate_preactivation(&finality, BlockTimestamp(5), &[(gate, 1)], &[], false)
            .is_ok());

        // Double preactivation.
        assert!(manager
            .validate_preactivation(&finality, BlockTimestamp(5), &[(gate, 1)], &[finality], false)
            .is_err());
    }

    #[test]
    fn block_activation_ordering_and_duplicates() {
        let manager = ProtocolFeatureManager::with_all_builtins();
        let gate = BuiltinFeature::PreactivateFeature.digest();
        let rv = BuiltinFeature::ActionReturnValue.digest();

        // Dependency satisfied within the same block, in order.
        assert!(manager
            .check_block_activations(BlockTimestamp(1), &[], &[gate, rv])
            .is_ok());
        // Out of order fails.
        assert!(manager
            .check_block_activations(BlockTimestamp(1), &[], &[rv, gate])
            .is_err());
        // Duplicate fails.
        assert!(manager
            .check_block_activations(BlockTimestamp(1), &[], &[gate, gate])
            .is_err());
    }

    #[test]
    fn activation_handler_is_idempotent_and_poppable() {
        let mut manager = ProtocolFeatureManager::with_all_builtins();
        let gate = BuiltinFeature::PreactivateFeature.digest();
        manager.activate(gate, 5);
        manager.activate(gate, 6);
        assert_eq!(
            manager
                .whitelisted_intrinsics()
                .iter()
                .filter(|i| **i == "preactivate_feature")
                .count(),
            1
        );
        manager.popped_blocks_to(4);
        assert!(!manager.is_builtin_activated(BuiltinFeature::PreactivateFeature));
        assert!(manager.whitelisted_intrinsics().is_empty());
    }
}
