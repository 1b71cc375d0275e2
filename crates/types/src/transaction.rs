//! Transactions, receipts and execution traces.

use crate::crypto::{BlsPublicKey, BlsSignature};
use crate::hash::Digest;
use crate::ids::{AccountName, TransactionId};
use crate::time::BlockTimestamp;
use crate::BlockNum;
use sbor::prelude::*;

/// An actor/permission pair authorizing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub struct PermissionLevel {
    pub actor: AccountName,
    pub permission: AccountName,
}

/// One action inside a transaction: a call into `account`'s contract.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ActionData {
    pub account: AccountName,
    pub name: AccountName,
    pub authorization: Vec<PermissionLevel>,
    pub data: Vec<u8>,
}

/// An unsigned transaction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Transaction {
    /// Dedup-table expiry.
    pub expiration: BlockTimestamp,
    /// TAPOS: low 16 bits of a recent block number...
    pub ref_block_num: u16,
    /// ...and a prefix of that block's id.
    pub ref_block_prefix: u32,
    pub max_net_usage_words: u32,
    pub max_cpu_usage_ms: u8,
    /// Deferred execution delay; zero for input transactions.
    pub delay_sec: u32,
    pub actions: Vec<ActionData>,
}

impl Transaction {
    /// The transaction id: digest of the unsigned encoding.
    pub fn id(&self) -> TransactionId {
        TransactionId(Digest::hash_of(self))
    }

    /// Total declared authorizations across all actions.
    pub fn declared_authorizations(&self) -> Vec<PermissionLevel> {
        let mut auths: Vec<PermissionLevel> = self
            .actions
            .iter()
            .flat_map(|a| a.authorization.iter().copied())
            .collect();
        auths.sort();
        auths.dedup();
        auths
    }
}

/// A transaction with its signatures. Each signature is paired with the key
/// that produced it; key recovery is a verification pass over these pairs.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PackedTransaction {
    pub transaction: Transaction,
    pub signatures: Vec<(BlsPublicKey, BlsSignature)>,
}

impl PackedTransaction {
    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Verify every signature pair over the transaction id, returning the
    /// signing keys. Pure; safe to run from a worker thread.
    pub fn recover_keys(&self) -> Result<Vec<BlsPublicKey>, crate::CryptoError> {
        let digest = self.id().0;
        let mut keys = Vec::with_capacity(self.signatures.len());
        for (key, sig) in &self.signatures {
            if !key.verify(digest.as_bytes(), sig) {
                return Err(crate::CryptoError::InvalidSignature);
            }
            keys.push(*key);
        }
        Ok(keys)
    }
}

/// Cached per-transaction metadata carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub packed: PackedTransaction,
    pub id: TransactionId,
    /// Implicit transactions (the on-block system transaction) skip
    /// authorization and dedup checks.
    pub implicit: bool,
    /// Deferred transactions resurrected from the generated-transaction
    /// table.
    pub scheduled: bool,
    /// CPU cost attributed to signature verification, billed up front.
    pub signature_cpu_usage_us: u64,
    /// Keys proven by the signatures, once recovered.
    pub recovered_keys: Vec<BlsPublicKey>,
}

impl TransactionMetadata {
    /// Metadata for an input transaction with its keys already recovered.
    pub fn recovered(
        packed: PackedTransaction,
        recovered_keys: Vec<BlsPublicKey>,
        signature_cpu_usage_us: u64,
    ) -> Self {
        let id = packed.id();
        TransactionMetadata {
            packed,
            id,
            implicit: false,
            scheduled: false,
            signature_cpu_usage_us,
            recovered_keys,
        }
    }

    /// Metadata for an implicit (system) transaction; no key recovery.
    pub fn implicit(packed: PackedTransaction) -> Self {
        let id = packed.id();
        TransactionMetadata {
            packed,
            id,
            implicit: true,
            scheduled: false,
            signature_cpu_usage_us: 0,
            recovered_keys: Vec::new(),
        }
    }

    /// Metadata for a resurrected deferred transaction.
    pub fn scheduled(packed: PackedTransaction) -> Self {
        let id = packed.id();
        TransactionMetadata {
            packed,
            id,
            implicit: false,
            scheduled: true,
            signature_cpu_usage_us: 0,
            recovered_keys: Vec::new(),
        }
    }
}

/// Receipt status recorded in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum TransactionReceiptStatus {
    /// Executed successfully, no error handler involved.
    Executed,
    /// Objective failure, error handler executed successfully.
    SoftFail,
    /// Objective failure, error handler also failed (or none).
    HardFail,
    /// Scheduled for deferred execution.
    Delayed,
    /// Deferred transaction retired unexecuted past its expiration.
    Expired,
}

/// The transaction as referenced by a receipt: deferred transactions are
/// referenced by id, input transactions are carried in full.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum TransactionVariant {
    Id(TransactionId),
    Packed(PackedTransaction),
}

/// A per-transaction receipt accumulated into the building block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct TransactionReceipt {
    pub status: TransactionReceiptStatus,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
    pub trx: TransactionVariant,
}

impl TransactionReceipt {
    /// Digest folded into the transaction merkle root.
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }
}

/// Trace of one executed action.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ActionTrace {
    pub action: ActionData,
    pub receiver: AccountName,
    /// Receiver's receive-sequence number at execution time.
    pub recv_sequence: u64,
    pub return_value: Vec<u8>,
    /// Digest over the trace details not individually provable (global
    /// sequence numbers, console output and the like).
    pub witness_hash: Digest,
}

impl ActionTrace {
    /// The action-receipt digest folded into the block's action merkle
    /// root, and the leaf shape action-inclusion proofs reproduce.
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }
}

/// Result of pushing a transaction, success or failure.
#[derive(Debug, Clone, Default)]
pub struct TransactionTrace {
    pub id: Option<TransactionId>,
    pub block_num: BlockNum,
    pub block_time: BlockTimestamp,
    pub elapsed_us: u64,
    pub net_usage: u64,
    pub cpu_usage_us: u32,
    pub scheduled: bool,
    /// Receipt header mirror (status, cpu, net) when a receipt was pushed.
    pub receipt: Option<TransactionReceipt>,
    pub action_traces: Vec<ActionTrace>,
    /// Structured error code, when failed.
    pub error_code: Option<u64>,
    /// Human-readable error, when failed.
    pub error: Option<String>,
}

impl TransactionTrace {
    /// True if execution succeeded and a receipt was recorded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
