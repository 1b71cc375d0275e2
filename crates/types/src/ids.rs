//! Identifier newtypes: block ids, transaction ids, account names.

use crate::hash::Digest;
use crate::BlockNum;
use sbor::prelude::*;
use std::fmt;

/// A block id: a 32-byte digest whose first four bytes carry the block
/// number big-endian, so the height of any block is recoverable from its id
/// alone.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
#[sbor(transparent)]
pub struct BlockId(pub Digest);

impl BlockId {
    /// Stamp a block number into a header digest to form the id.
    pub fn from_digest(block_num: BlockNum, digest: Digest) -> Self {
        let mut bytes = *digest.as_bytes();
        bytes[..4].copy_from_slice(&block_num.to_be_bytes());
        BlockId(Digest(bytes))
    }

    /// Recover the block number from the id prefix.
    pub fn block_num(&self) -> BlockNum {
        let bytes = self.0.as_bytes();
        BlockNum::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// The underlying digest.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{:?}", self.block_num(), self.0)
    }
}

/// A transaction id (digest of the unsigned transaction encoding).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
#[sbor(transparent)]
pub struct TransactionId(pub Digest);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx:{:?}", self.0)
    }
}

/// A compact account / permission name.
///
/// Names are at most twelve characters from `[a-z1-5.]`, packed into a
/// `u64` five bits at a time. The packing only has to be injective and
/// ordered; it is not a wire-compatible encoding of any other chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
#[sbor(transparent)]
pub struct AccountName(pub u64);

impl AccountName {
    /// Pack a name string.
    pub fn try_new(name: &str) -> Result<Self, String> {
        if name.len() > 12 {
            return Err(format!("name too long: {name}"));
        }
        let mut value: u64 = 0;
        for ch in name.bytes() {
            let sym = match ch {
                b'a'..=b'z' => ch - b'a' + 6,
                b'1'..=b'5' => ch - b'1' + 1,
                b'.' => 0,
                _ => return Err(format!("invalid name character: {}", ch as char)),
            };
            value = (value << 5) | sym as u64;
        }
        // Left-align so short names sort like their padded forms.
        value <<= 5 * (12 - name.len() as u64);
        Ok(AccountName(value))
    }

    /// Pack a name string. Panics on invalid characters or length, which is
    /// acceptable for the literal names used throughout the codebase.
    pub fn new(name: &str) -> Self {
        match Self::try_new(name) {
            Ok(name) => name,
            Err(err) => panic!("{err}"),
        }
    }

    /// Unpack back to the string form.
    pub fn as_string(&self) -> String {
        const SYMBOLS: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";
        let mut out = String::with_capacity(12);
        let mut value = self.0;
        for _ in 0..12 {
            let sym = (value >> 59) & 0x1f;
            out.push(SYMBOLS[sym as usize] as char);
            value <<= 5;
        }
        out.trim_end_matches('.').to_string()
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl fmt::Debug for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<&str> for AccountName {
    fn from(name: &str) -> Self {
        AccountName::new(name)
    }
}

impl serde::Serialize for AccountName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> serde::Deserialize<'de> for AccountName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        AccountName::try_new(&name).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256;

    #[test]
    fn block_id_embeds_block_num() {
        let id = BlockId::from_digest(0x01020304, sha256(b"header"));
        assert_eq!(id.block_num(), 0x01020304);

        let id2 = BlockId::from_digest(7, sha256(b"header"));
        assert_eq!(id2.block_num(), 7);
        // Suffix bytes still come from the digest.
        assert_eq!(&id2.0.as_bytes()[4..], &sha256(b"header").as_bytes()[4..]);
    }

    #[test]
    fn name_round_trip() {
        for name in ["veldt", "producer.a", "a", "zzzzzzzzzzzz", "abc.123"] {
            assert_eq!(AccountName::new(name).as_string(), name);
        }
    }

    #[test]
    fn name_ordering_is_lexicographic_for_same_length() {
        assert!(AccountName::new("alice") < AccountName::new("bob"));
    }
}
