//! Ordered container diffs.
//!
//! Generates and applies compact diffs between ordered sequences. Used for
//! finalizer and proposer policy changes, where the diff travels in a block
//! header extension and therefore must be byte-identical across
//! implementations: the exact branch order of [`OrderedDiff::diff`] is part
//! of consensus.
//!
//! Example:
//!
//! ```
//! use veldt_types::OrderedDiff;
//!
//! let source = vec!['a', 'b', 'f', 'c', 'd'];
//! let target = vec!['b', 'f', 'c', 'd', 'e', 'h'];
//! let diff = OrderedDiff::diff(&source, &target).unwrap();
//! assert_eq!(OrderedDiff::apply(source, &diff).unwrap(), target);
//! ```

use crate::MAX_NUM_ARRAY_ELEMENTS;
use sbor::prelude::*;
use thiserror::Error;

/// Index type used inside diffs. `u16` bounds the representable container
/// size well above [`MAX_NUM_ARRAY_ELEMENTS`].
pub type DiffIndex = u16;

/// Errors from diff generation or application.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("container size exceeds the diff index range")]
    IndexOverflow,

    #[error("diff list size exceeds {MAX_NUM_ARRAY_ELEMENTS} elements")]
    TooManyElements,

    #[error("remove index {index} out of range for container of size {size}")]
    RemoveOutOfRange { index: usize, size: usize },

    #[error("insert index {index} out of range for container of size {size}")]
    InsertOutOfRange { index: usize, size: usize },
}

/// A compact ordered diff: removals are indexes into the source, insertions
/// are `(index, value)` pairs into the intermediate result. Applying the
/// removals left-to-right and then the insertions left-to-right converts the
/// source into the target.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct OrderedDiff<T> {
    pub remove_indexes: Vec<DiffIndex>,
    pub insert_indexes: Vec<(DiffIndex, T)>,
}

impl<T: Eq + Clone> OrderedDiff<T> {
    /// True if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.remove_indexes.is_empty() && self.insert_indexes.is_empty()
    }

    /// Generate the diff that rewrites `source` into `target`.
    pub fn diff(source: &[T], target: &[T]) -> Result<Self, DiffError> {
        let mut s = 0usize;
        let mut t = 0usize;
        let mut result = OrderedDiff {
            remove_indexes: Vec::new(),
            insert_indexes: Vec::new(),
        };

        let push_remove = |result: &mut Self, idx: usize| -> Result<(), DiffError> {
            if result.remove_indexes.len() >= MAX_NUM_ARRAY_ELEMENTS {
                return Err(DiffError::TooManyElements);
            }
            result.remove_indexes.push(idx as DiffIndex);
            Ok(())
        };
        let push_insert =
            |result: &mut Self, idx: usize, value: T| -> Result<(), DiffError> {
                if result.insert_indexes.len() >= MAX_NUM_ARRAY_ELEMENTS {
                    return Err(DiffError::TooManyElements);
                }
                result.insert_indexes.push((idx as DiffIndex, value));
                Ok(())
            };

        while s < source.len() || t < target.len() {
            if s > DiffIndex::MAX as usize || t > DiffIndex::MAX as usize {
                return Err(DiffError::IndexOverflow);
            }
            if s < source.len() && t < target.len() {
                if source[s] == target[t] {
                    // nothing to do, skip over
                    s += 1;
                    t += 1;
                } else if s == source.len() - 1 && t == target.len() - 1 {
                    // both at end, insert target and remove source
                    push_remove(&mut result, s)?;
                    push_insert(&mut result, t, target[t].clone())?;
                    s += 1;
                    t += 1;
                } else if s + 1 < source.len()
                    && t + 1 < target.len()
                    && source[s + 1] == target[t + 1]
                {
                    // misalignment, but next value equal, insert and remove
                    push_remove(&mut result, s)?;
                    push_insert(&mut result, t, target[t].clone())?;
                    s += 1;
                    t += 1;
                } else if t + 1 < target.len() && source[s] == target[t + 1] {
                    // source equals next target, insert current target
                    push_insert(&mut result, t, target[t].clone())?;
                    t += 1;
                } else {
                    // target matches next source, remove current source
                    push_remove(&mut result, s)?;
                    s += 1;
                }
            } else if s < source.len() {
                // remove extra in source
                push_remove(&mut result, s)?;
                s += 1;
            } else {
                // insert extra in target
                push_insert(&mut result, t, target[t].clone())?;
                t += 1;
            }
        }

        Ok(result)
    }

    /// Apply a diff produced by [`OrderedDiff::diff`] to `container`.
    pub fn apply(mut container: Vec<T>, diff: &Self) -> Result<Vec<T>, DiffError> {
        if diff.remove_indexes.len() > MAX_NUM_ARRAY_ELEMENTS
            || diff.insert_indexes.len() > MAX_NUM_ARRAY_ELEMENTS
        {
            return Err(DiffError::TooManyElements);
        }

        // Remove from the source, adjusting for prior removals.
        let mut offset = 0isize;
        for &index in &diff.remove_indexes {
            let adjusted = index as isize + offset;
            if adjusted < 0 || adjusted as usize >= container.len() {
                return Err(DiffError::RemoveOutOfRange {
                    index: index as usize,
                    size: container.len(),
                });
            }
            container.remove(adjusted as usize);
            offset -= 1;
        }

        // Insert into the intermediate result.
        for (index, value) in &diff.insert_indexes {
            let index = *index as usize;
            if index > container.len() {
                return Err(DiffError::InsertOutOfRange {
                    index,
                    size: container.len(),
                });
            }
            if container.len() >= MAX_NUM_ARRAY_ELEMENTS {
                return Err(DiffError::TooManyElements);
            }
            container.insert(index, value.clone());
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(source: Vec<char>, target: Vec<char>) {
        let diff = OrderedDiff::diff(&source, &target).unwrap();
        assert_eq!(OrderedDiff::apply(source, &diff).unwrap(), target);
    }

    #[test]
    fn documented_example() {
        let source = vec!['a', 'b', 'f', 'c', 'd'];
        let target = vec!['b', 'f', 'c', 'd', 'e', 'h'];
        round_trip(source, target);
    }

    #[test]
    fn equal_inputs_produce_empty_diff() {
        let xs = vec![1, 2, 3, 4];
        let diff = OrderedDiff::diff(&xs, &xs).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn boundary_shapes() {
        round_trip(vec![], vec![]);
        round_trip(vec![], vec!['a', 'b']);
        round_trip(vec!['a', 'b'], vec![]);
        round_trip(vec!['a'], vec!['b']);
        round_trip(vec!['a', 'x', 'b'], vec!['a', 'y', 'b']);
        round_trip(vec!['a', 'a', 'a'], vec!['a', 'a']);
    }

    #[test]
    fn apply_rejects_corrupt_remove_index() {
        let diff = OrderedDiff::<char> {
            remove_indexes: vec![5],
            insert_indexes: vec![],
        };
        assert!(matches!(
            OrderedDiff::apply(vec!['a'], &diff),
            Err(DiffError::RemoveOutOfRange { .. })
        ));
    }

    #[test]
    fn apply_rejects_corrupt_insert_index() {
        let diff = OrderedDiff::<char> {
            remove_indexes: vec![],
            insert_indexes: vec![(3, 'z')],
        };
        assert!(matches!(
            OrderedDiff::apply(vec!['a'], &diff),
            Err(DiffError::InsertOutOfRange { .. })
        ));
    }

    /// Independent re-implementation used as a consensus oracle: a diff
    /// computed by different code must be element-for-element identical,
    /// because the diff bytes travel in block headers.
    mod oracle {
        use super::super::{DiffIndex, OrderedDiff};

        pub fn diff<T: Eq + Clone>(source: &[T], target: &[T]) -> OrderedDiff<T> {
            let mut removes: Vec<DiffIndex> = Vec::new();
            let mut inserts: Vec<(DiffIndex, T)> = Vec::new();
            let (mut s, mut t) = (0, 0);
            loop {
                let s_left = source.len() - s;
                let t_left = target.len() - t;
                if s_left == 0 && t_left == 0 {
                    break;
                }
                if s_left == 0 {
                    inserts.push((t as DiffIndex, target[t].clone()));
                    t += 1;
                    continue;
                }
                if t_left == 0 {
                    removes.push(s as DiffIndex);
                    s += 1;
                    continue;
                }
                if source[s] == target[t] {
                    s += 1;
                    t += 1;
                    continue;
                }
                let both_last = s_left == 1 && t_left == 1;
                let next_aligned =
                    s_left > 1 && t_left > 1 && source[s + 1] == target[t + 1];
                if both_last || next_aligned {
                    removes.push(s as DiffIndex);
                    inserts.push((t as DiffIndex, target[t].clone()));
                    s += 1;
                    t += 1;
                } else if t_left > 1 && source[s] == target[t + 1] {
                    inserts.push((t as DiffIndex, target[t].clone()));
                    t += 1;
                } else {
                    removes.push(s as DiffIndex);
                    s += 1;
                }
            }
            OrderedDiff {
                remove_indexes: removes,
                insert_indexes: inserts,
            }
        }
    }

    proptest! {
        /// apply(diff(s, t)) == t for arbitrary inputs.
        #[test]
        fn prop_round_trip(
            source in proptest::collection::vec(0u8..6, 0..24),
            target in proptest::collection::vec(0u8..6, 0..24),
        ) {
            let diff = OrderedDiff::diff(&source, &target).unwrap();
            prop_assert_eq!(OrderedDiff::apply(source, &diff).unwrap(), target);
        }

        /// Two independent implementations emit identical diffs.
        #[test]
        fn prop_matches_oracle(
            source in proptest::collection::vec(0u8..6, 0..24),
            target in proptest::collection::vec(0u8..6, 0..24),
        ) {
            let diff = OrderedDiff::diff(&source, &target).unwrap();
            prop_assert_eq!(diff, oracle::diff(&source, &target));
        }

        /// diff(x, x) is empty for any x.
        #[test]
        fn prop_self_diff_is_empty(xs in proptest::collection::vec(0u8..6, 0..24)) {
            prop_assert!(OrderedDiff::diff(&xs, &xs).unwrap().is_empty());
        }
    }
}
