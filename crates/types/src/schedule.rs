//! Producer authority schedules for the delegated-producer regime.

use crate::crypto::BlsPublicKey;
use crate::hash::Digest;
use crate::ids::AccountName;
use crate::time::BlockTimestamp;
use sbor::prelude::*;

/// Consecutive slots a producer keeps before the schedule rotates to the
/// next one.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// Keys (with weights) authorized to sign blocks for one producer.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockSigningAuthority {
    pub threshold: u32,
    pub keys: Vec<(BlsPublicKey, u32)>,
}

impl BlockSigningAuthority {
    /// Single-key authority, the common case.
    pub fn single(key: BlsPublicKey) -> Self {
        BlockSigningAuthority {
            threshold: 1,
            keys: vec![(key, 1)],
        }
    }

    /// True if `key` alone satisfies the threshold together with nothing
    /// else — sufficient for the single-signer block path.
    pub fn key_satisfies(&self, key: &BlsPublicKey) -> bool {
        self.keys
            .iter()
            .any(|(k, weight)| k == key && *weight >= self.threshold)
    }
}

/// One producer entry in a schedule.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProducerAuthority {
    pub producer_name: AccountName,
    pub authority: BlockSigningAuthority,
}

/// A versioned, ordered producer schedule.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerAuthority>,
}

impl ProducerSchedule {
    /// The producer scheduled for a slot: round-robin over the schedule,
    /// [`PRODUCER_REPETITIONS`] consecutive slots each.
    ///
    /// Panics on an empty schedule; a chain always has at least one
    /// producer.
    pub fn scheduled_producer(&self, timestamp: BlockTimestamp) -> &ProducerAuthority {
        assert!(!self.producers.is_empty(), "empty producer schedule");
        let index = (timestamp.slot() / PRODUCER_REPETITIONS) as usize % self.producers.len();
        &self.producers[index]
    }

    /// Stable digest of the schedule.
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }
}
