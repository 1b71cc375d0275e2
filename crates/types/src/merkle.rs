//! Merkle tree computation over 32-byte digests.
//!
//! Two algorithms coexist:
//!
//! - [`canonical_merkle`] — the legacy algorithm used for DPoS blocks. Node
//!   pairs are made *canonical* by masking the top bit of the first byte
//!   (cleared on the left, set on the right) before hashing, and a layer
//!   with an odd node count is padded by appending its own last element.
//! - [`symmetric_merkle`] — the algorithm used once instant finality is
//!   active. The leaf layer is padded to the next power of two by repeating
//!   the last leaf, and nodes are plain pair hashes, so inclusion proofs
//!   are simple index arithmetic.
//!
//! Both are deterministic functions of the input sequence.

use crate::hash::Digest;
use crate::time::BlockTimestamp;
use crate::BlockNum;

/// Root of the legacy canonical merkle tree.
pub fn canonical_merkle(mut digests: Vec<Digest>) -> Digest {
    if digests.is_empty() {
        return Digest::ZERO;
    }
    while digests.len() > 1 {
        if digests.len() % 2 != 0 {
            digests.push(*digests.last().unwrap());
        }
        let mut next = Vec::with_capacity(digests.len() / 2);
        for pair in digests.chunks_exact(2) {
            next.push(Digest::hash_pair(
                &canonical_left(pair[0]),
                &canonical_right(pair[1]),
            ));
        }
        digests = next;
    }
    digests[0]
}

fn canonical_left(mut d: Digest) -> Digest {
    d.0[0] &= 0x7f;
    d
}

fn canonical_right(mut d: Digest) -> Digest {
    d.0[0] |= 0x80;
    d
}

/// Root of the symmetric merkle tree.
pub fn symmetric_merkle(mut digests: Vec<Digest>) -> Digest {
    if digests.is_empty() {
        return Digest::ZERO;
    }
    let target = digests.len().next_power_of_two();
    let last = *digests.last().unwrap();
    digests.resize(target, last);

    while digests.len() > 1 {
        let mut next = Vec::with_capacity(digests.len() / 2);
        for pair in digests.chunks_exact(2) {
            next.push(Digest::hash_pair(&pair[0], &pair[1]));
        }
        digests = next;
    }
    digests[0]
}

/// Sibling path proving that `leaves[index]` is under the symmetric merkle
/// root of `leaves`. Branches are ordered leaf-to-root.
///
/// Panics if `index` is out of range.
pub fn generate_inclusion_proof(leaves: &[Digest], index: usize) -> Vec<Digest> {
    assert!(index < leaves.len(), "leaf index {index} out of range");
    let mut layer = leaves.to_vec();
    let target = layer.len().next_power_of_two();
    let last = *layer.last().unwrap();
    layer.resize(target, last);

    let mut branches = Vec::new();
    let mut idx = index;
    while layer.len() > 1 {
        branches.push(layer[idx ^ 1]);
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks_exact(2) {
            next.push(Digest::hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
        idx >>= 1;
    }
    branches
}

/// Recompute the symmetric merkle root from a leaf, its index and the
/// sibling path produced by [`generate_inclusion_proof`].
pub fn root_from_branches(leaf: Digest, index: usize, branches: &[Digest]) -> Digest {
    let mut acc = leaf;
    let mut idx = index;
    for sibling in branches {
        acc = if idx & 1 == 1 {
            Digest::hash_pair(sibling, &acc)
        } else {
            Digest::hash_pair(&acc, sibling)
        };
        idx >>= 1;
    }
    acc
}

/// The leaf hashed into a block's finality merkle tree.
///
/// Chain side and proof-verifier side must agree byte-for-byte, so both call
/// this function.
pub fn finality_leaf(
    block_num: BlockNum,
    finality_digest: Digest,
    timestamp: BlockTimestamp,
    parent_timestamp: BlockTimestamp,
) -> Digest {
    Digest::hash_of(&(block_num, finality_digest, timestamp.0, parent_timestamp.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n).map(|i| sha256(&[i as u8])).collect()
    }

    #[test]
    fn empty_trees_are_zero() {
        assert_eq!(canonical_merkle(vec![]), Digest::ZERO);
        assert_eq!(symmetric_merkle(vec![]), Digest::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let l = sha256(b"leaf");
        assert_eq!(canonical_merkle(vec![l]), l);
        assert_eq!(symmetric_merkle(vec![l]), l);
    }

    #[test]
    fn symmetric_four_leaves_is_nested_pair_hash() {
        let l = leaves(4);
        let expected = Digest::hash_pair(
            &Digest::hash_pair(&l[0], &l[1]),
            &Digest::hash_pair(&l[2], &l[3]),
        );
        assert_eq!(symmetric_merkle(l), expected);
    }

    #[test]
    fn algorithms_differ() {
        let l = leaves(4);
        assert_ne!(canonical_merkle(l.clone()), symmetric_merkle(l));
    }

    #[test]
    fn canonical_is_order_sensitive() {
        let l = leaves(3);
        let mut rev = l.clone();
        rev.reverse();
        assert_ne!(canonical_merkle(l), canonical_merkle(rev));
    }

    #[test]
    fn inclusion_proofs_verify_for_every_index() {
        for n in 1..=9usize {
            let l = leaves(n);
            let root = symmetric_merkle(l.clone());
            for i in 0..n {
                let branches = generate_inclusion_proof(&l, i);
                assert_eq!(
                    root_from_branches(l[i], i, &branches),
                    root,
                    "n={n} i={i}"
                );
            }
        }
    }

    #[test]
    fn inclusion_proof_rejects_wrong_leaf() {
        let l = leaves(4);
        let root = symmetric_merkle(l.clone());
        let branches = generate_inclusion_proof(&l, 1);
        assert_ne!(root_from_branches(l[2], 1, &branches), root);
    }
}
