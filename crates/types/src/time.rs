//! Block timestamps.

use sbor::prelude::*;
use std::fmt;

/// Milliseconds between consecutive block slots.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// A block timestamp: the number of half-second slots since the chain epoch.
///
/// Strictly increasing along any branch; two blocks with the same parent
/// produced in different slots compare by slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
#[sbor(transparent)]
pub struct BlockTimestamp(pub u32);

impl BlockTimestamp {
    /// The slot immediately after this one.
    pub fn next(self) -> Self {
        BlockTimestamp(self.0 + 1)
    }

    /// Slot index.
    pub fn slot(self) -> u32 {
        self.0
    }

    /// Milliseconds since the chain epoch.
    pub fn to_millis(self) -> u64 {
        self.0 as u64 * BLOCK_INTERVAL_MS
    }

    /// Timestamp from milliseconds since the chain epoch (rounded down to
    /// the containing slot).
    pub fn from_millis(ms: u64) -> Self {
        BlockTimestamp((ms / BLOCK_INTERVAL_MS) as u32)
    }
}

impl fmt::Display for BlockTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

impl fmt::Debug for BlockTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}
