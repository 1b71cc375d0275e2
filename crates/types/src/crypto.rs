//! BLS12-381 key and signature wrappers.
//!
//! Quorum certificates and finality proofs are signed with BLS keys in the
//! min_pk configuration (48-byte public keys, 96-byte signatures) so that
//! many finalizer signatures aggregate into one. The wrappers store the
//! compressed byte forms — which is what gets encoded, hashed and compared —
//! and parse into group points only at verification sites.

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use sbor::prelude::*;
use std::fmt;
use thiserror::Error;

/// Domain separation tag for finality signatures.
const DST: &[u8] = b"VELDT_BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from key and signature handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid BLS public key bytes")]
    InvalidPublicKey,

    #[error("invalid BLS signature bytes")]
    InvalidSignature,

    #[error("invalid BLS secret key seed")]
    InvalidSecretKey,

    #[error("cannot aggregate an empty set")]
    EmptyAggregation,
}

/// A BLS public key (48-byte compressed form).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlsPublicKey(pub [u8; 48]);

impl BlsPublicKey {
    /// Borrow the compressed bytes.
    pub fn as_bytes(&self) -> &[u8; 48] {
        &self.0
    }

    fn parse(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Verify a single (non-aggregated) signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> bool {
        let (Ok(pk), Ok(sig)) = (self.parse(), signature.parse()) else {
            return false;
        };
        sig.verify(true, message, DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bls:{:02x}{:02x}{:02x}{:02x}..",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// A BLS signature (96-byte compressed form), possibly an aggregate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlsSignature(pub [u8; 96]);

impl BlsSignature {
    /// A placeholder signature (not valid for any message).
    pub const NULL: BlsSignature = BlsSignature([0u8; 96]);

    /// Borrow the compressed bytes.
    pub fn as_bytes(&self) -> &[u8; 96] {
        &self.0
    }

    fn parse(&self) -> Result<Signature, CryptoError> {
        Signature::from_bytes(&self.0).map_err(|_| CryptoError::InvalidSignature)
    }

    /// Aggregate a non-empty set of signatures.
    pub fn aggregate<'a>(
        sigs: impl IntoIterator<Item = &'a BlsSignature>,
    ) -> Result<BlsSignature, CryptoError> {
        let parsed: Vec<Signature> = sigs
            .into_iter()
            .map(|s| s.parse())
            .collect::<Result<_, _>>()?;
        let refs: Vec<&Signature> = parsed.iter().collect();
        if refs.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let agg = AggregateSignature::aggregate(&refs, true)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(BlsSignature(agg.to_signature().to_bytes()))
    }

    /// Verify this signature as an aggregate where each `(key, message)`
    /// pair contributed one signature. Messages may repeat (several signers
    /// over the same digest).
    pub fn verify_messages(&self, pairs: &[(BlsPublicKey, &[u8])]) -> bool {
        if pairs.is_empty() {
            return false;
        }
        let parsed: Result<Vec<PublicKey>, _> = pairs.iter().map(|(k, _)| k.parse()).collect();
        let Ok(keys) = parsed else { return false };
        let key_refs: Vec<&PublicKey> = keys.iter().collect();
        let msgs: Vec<&[u8]> = pairs.iter().map(|(_, m)| *m).collect();
        let Ok(sig) = self.parse() else { return false };
        sig.aggregate_verify(true, &msgs, DST, &key_refs, true) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify this signature as an aggregate over a common `message` signed
    /// by every key in `signers`.
    pub fn verify_aggregate(&self, signers: &[BlsPublicKey], message: &[u8]) -> bool {
        if signers.is_empty() {
            return false;
        }
        let parsed: Result<Vec<PublicKey>, _> = signers.iter().map(|k| k.parse()).collect();
        let Ok(keys) = parsed else { return false };
        let refs: Vec<&PublicKey> = keys.iter().collect();
        let Ok(agg_pk) = AggregatePublicKey::aggregate(&refs, true) else {
            return false;
        };
        let Ok(sig) = self.parse() else { return false };
        sig.verify(true, message, DST, &[], &agg_pk.to_public_key(), true)
            == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sig:{:02x}{:02x}{:02x}{:02x}..",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// A BLS signing key pair.
pub struct BlsKeyPair {
    secret: SecretKey,
    public: BlsPublicKey,
}

impl BlsKeyPair {
    /// Derive a key pair from a 32-byte seed. Deterministic: the same seed
    /// always yields the same key, which the test clusters rely on.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret =
            SecretKey::key_gen(seed, &[]).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = BlsPublicKey(secret.sk_to_pk().to_bytes());
        Ok(Self { secret, public })
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.secret.sign(message, DST, &[]).to_bytes())
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> BlsPublicKey {
        self.public
    }
}

impl fmt::Debug for BlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
