//! Snapshot section plumbing and the database's persisted layout.
//!
//! A snapshot is an ordered list of named sections, each an ordered list of
//! sbor-encoded rows. The section order is fixed; the integrity hash is the
//! SHA-256 of the encoded whole, so two databases with identical logical
//! content hash identically.
//!
//! Snapshot headers are versioned. Global-property rows from legacy
//! versions are upgraded in place on load:
//!
//! - **v2**: rows predate the embedded chain id; it is recovered from the
//!   genesis state supplied by the caller.
//! - **v3**: rows predate the extended limit fields; the new fields are
//!   zero-filled and then clamped up to the defaults.
//! - **v4**: field-for-field mapping.
//! - **v5**: current.

use crate::database::Database;
use crate::objects::{ChainLimits, GlobalPropertyState, TableId, TableMeta};
use sbor::prelude::*;
use thiserror::Error;
use tracing::info;
use veldt_types::{sha256, BlockNum, Digest, ProducerSchedule};

/// Current snapshot header version.
pub const CURRENT_SNAPSHOT_VERSION: u32 = 5;

/// Oldest loadable snapshot header version.
pub const MINIMUM_SNAPSHOT_VERSION: u32 = 2;

/// Errors from snapshot encoding or decoding.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version {0} is not supported (minimum {MINIMUM_SNAPSHOT_VERSION}, current {CURRENT_SNAPSHOT_VERSION})")]
    UnsupportedVersion(u32),

    #[error("snapshot section {0:?} is missing")]
    MissingSection(&'static str),

    #[error("snapshot row in section {section:?} failed to decode")]
    RowDecode { section: &'static str },

    #[error("snapshot requires a genesis state to upgrade a v2 global property row")]
    MissingGenesis,
}

/// One named snapshot section.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct SnapshotSection {
    pub name: String,
    pub rows: Vec<Vec<u8>>,
}

/// A complete snapshot.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Snapshot {
    pub version: u32,
    pub sections: Vec<SnapshotSection>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot { version: CURRENT_SNAPSHOT_VERSION, sections: Vec::new() }
    }

    /// Append a section. Order of calls is the persisted order.
    pub fn add_section<T: sbor::BasicEncode>(&mut self, name: &str, rows: &[T]) {
        let rows = rows
            .iter()
            .map(|row| sbor::basic_encode(row).expect("snapshot rows always encode"))
            .collect();
        self.sections.push(SnapshotSection { name: name.to_string(), rows });
    }

    /// Find a section by name.
    pub fn section(&self, name: &'static str) -> Result<&SnapshotSection, SnapshotError> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .ok_or(SnapshotError::MissingSection(name))
    }

    /// Decode every row of a section.
    pub fn decode_section<T: sbor::BasicDecode>(
        &self,
        name: &'static str,
    ) -> Result<Vec<T>, SnapshotError> {
        self.section(name)?
            .rows
            .iter()
            .map(|bytes| {
                sbor::basic_decode(bytes).map_err(|_| SnapshotError::RowDecode { section: name })
            })
            .collect()
    }

    /// SHA-256 over the encoded snapshot.
    pub fn integrity_hash(&self) -> Digest {
        sha256(&sbor::basic_encode(self).expect("snapshot always encodes"))
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::new()
    }
}

// Legacy global-property row shapes.

#[derive(Debug, Clone, BasicSbor)]
struct GlobalPropertyRowV2 {
    proposed_schedule_block_num: Option<BlockNum>,
    proposed_schedule: ProducerSchedule,
    max_block_net_usage: u64,
    max_block_cpu_usage_us: u32,
}

#[derive(Debug, Clone, BasicSbor)]
struct GlobalPropertyRowV3 {
    chain_id: Digest,
    proposed_schedule_block_num: Option<BlockNum>,
    proposed_schedule: ProducerSchedule,
    max_block_net_usage: u64,
    max_block_cpu_usage_us: u32,
    max_transaction_net_usage: u32,
    max_transaction_cpu_usage_us: u32,
}

#[derive(Debug, Clone, BasicSbor)]
struct GlobalPropertyRowV4 {
    chain_id: Digest,
    proposed_schedule_block_num: Option<BlockNum>,
    proposed_schedule: ProducerSchedule,
    configuration: ChainLimits,
}

fn upgrade_global_row(
    snapshot_version: u32,
    bytes: &[u8],
    genesis_chain_id: Option<Digest>,
) -> Result<GlobalPropertyState, SnapshotError> {
    const SECTION: &str = "global_properties";
    match snapshot_version {
        2 => {
            let row: GlobalPropertyRowV2 = sbor::basic_decode(bytes)
                .map_err(|_| SnapshotError::RowDecode { section: SECTION })?;
            let chain_id = genesis_chain_id.ok_or(SnapshotError::MissingGenesis)?;
            let defaults = ChainLimits::default();
            Ok(GlobalPropertyState {
                chain_id,
                configuration: ChainLimits {
                    max_block_net_usage: row.max_block_net_usage,
                    max_block_cpu_usage_us: row.max_block_cpu_usage_us,
                    ..defaults
                },
                proposed_schedule_block_num: row.proposed_schedule_block_num,
                proposed_schedule: row.proposed_schedule,
            })
        }
        3 => {
            let row: GlobalPropertyRowV3 = sbor::basic_decode(bytes)
                .map_err(|_| SnapshotError::RowDecode { section: SECTION })?;
            let defaults = ChainLimits::default();
            Ok(GlobalPropertyState {
                chain_id: row.chain_id,
                configuration: ChainLimits {
                    max_block_net_usage: row.max_block_net_usage,
                    max_block_cpu_usage_us: row.max_block_cpu_usage_us,
                    max_transaction_net_usage: row.max_transaction_net_usage,
                    max_transaction_cpu_usage_us: row.max_transaction_cpu_usage_us,
                    ..defaults
                },
                proposed_schedule_block_num: row.proposed_schedule_block_num,
                proposed_schedule: row.proposed_schedule,
            })
        }
        4 => {
            let row: GlobalPropertyRowV4 = sbor::basic_decode(bytes)
                .map_err(|_| SnapshotError::RowDecode { section: SECTION })?;
            Ok(GlobalPropertyState {
                chain_id: row.chain_id,
                configuration: row.configuration,
                proposed_schedule_block_num: row.proposed_schedule_block_num,
                proposed_schedule: row.proposed_schedule,
            })
        }
        CURRENT_SNAPSHOT_VERSION => sbor::basic_decode(bytes)
            .map_err(|_| SnapshotError::RowDecode { section: SECTION }),
        other => Err(SnapshotError::UnsupportedVersion(other)),
    }
}

/// Contract-table row stream entry: a table header followed by its rows for
/// each index flavor.
#[derive(Debug, Clone, BasicSbor)]
enum TableRow {
    Table { id: TableId, meta: TableMeta },
    Row { key: u64, value: Vec<u8> },
    Idx64 { key: u64, value: u64 },
    Idx128 { key: u64, value: u128 },
    Idx256 { key: u64, value: [u8; 32] },
    IdxDouble { key: u64, value: u64 },
    IdxLongDouble { key: u64, value: [u8; 16] },
}

impl Database {
    /// Append this database's sections to a snapshot, in the fixed order.
    pub fn add_to_snapshot(&self, snapshot: &mut Snapshot) {
        let accounts: Vec<_> = self.accounts.values().cloned().collect();
        snapshot.add_section("accounts", &accounts);
        snapshot.add_section("global_properties", &[self.global.get().clone()]);
        snapshot.add_section("protocol_state", &[self.protocol.get().clone()]);
        snapshot.add_section(
            "dynamic_global_properties",
            &[self.dynamic.get().clone()],
        );
        let summaries: Vec<_> = self
            .block_summaries
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        snapshot.add_section("block_summaries", &summaries);
        let dedup: Vec<_> = self
            .transaction_dedup
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        snapshot.add_section("transactions", &dedup);
        let generated: Vec<_> = self.generated_transactions.values().cloned().collect();
        snapshot.add_section("generated_transactions", &generated);
        snapshot.add_section("contract_tables", &self.contract_table_rows());
    }

    fn contract_table_rows(&self) -> Vec<TableRow> {
        let mut rows = Vec::new();
        for (id, meta) in self.tables.tables.iter() {
            rows.push(TableRow::Table { id: *id, meta: meta.clone() });
            let in_table = |key: &(TableId, u64)| key.0 == *id;
            for (key, value) in self.tables.rows.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::Row { key: key.1, value: value.clone() });
            }
            for (key, value) in self.tables.idx64.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::Idx64 { key: key.1, value: *value });
            }
            for (key, value) in self.tables.idx128.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::Idx128 { key: key.1, value: *value });
            }
            for (key, value) in self.tables.idx256.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::Idx256 { key: key.1, value: *value });
            }
            for (key, value) in self.tables.idx_double.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::IdxDouble { key: key.1, value: *value });
            }
            for (key, value) in self.tables.idx_long_double.iter().filter(|(k, _)| in_table(k)) {
                rows.push(TableRow::IdxLongDouble { key: key.1, value: *value });
            }
        }
        rows
    }

    /// Load this database's sections from a snapshot, upgrading legacy
    /// global-property rows. `genesis_chain_id` is only required for v2.
    pub fn read_from_snapshot(
        &mut self,
        snapshot: &Snapshot,
        genesis_chain_id: Option<Digest>,
    ) -> Result<(), SnapshotError> {
        if !(MINIMUM_SNAPSHOT_VERSION..=CURRENT_SNAPSHOT_VERSION).contains(&snapshot.version) {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        if snapshot.version != CURRENT_SNAPSHOT_VERSION {
            info!(
                from = snapshot.version,
                to = CURRENT_SNAPSHOT_VERSION,
                "upgrading legacy snapshot on load"
            );
        }

        let accounts: Vec<crate::objects::AccountMetadata> =
            snapshot.decode_section("accounts")?;
        for account in accounts {
            self.accounts.insert(account.name, account);
        }

        let global_rows = &snapshot.section("global_properties")?.rows;
        let global_bytes = global_rows
            .first()
            .ok_or(SnapshotError::RowDecode { section: "global_properties" })?;
        self.global
            .set(upgrade_global_row(snapshot.version, global_bytes, genesis_chain_id)?);

        let protocol = snapshot
            .decode_section::<crate::objects::ProtocolState>("protocol_state")?
            .pop()
            .ok_or(SnapshotError::RowDecode { section: "protocol_state" })?;
        self.protocol.set(protocol);

        let dynamic = snapshot
            .decode_section::<crate::objects::DynamicGlobalProperties>(
                "dynamic_global_properties",
            )?
            .pop()
            .ok_or(SnapshotError::RowDecode { section: "dynamic_global_properties" })?;
        self.dynamic.set(dynamic);

        let summaries: Vec<(u16, veldt_types::BlockId)> =
            snapshot.decode_section("block_summaries")?;
        for (key, id) in summaries {
            self.block_summaries.insert(key, id);
        }
        let dedup: Vec<(veldt_types::TransactionId, veldt_types::BlockTimestamp)> =
            snapshot.decode_section("transactions")?;
        for (id, expiration) in dedup {
            self.transaction_dedup.insert(id, expiration);
        }
        let generated_rows: Vec<crate::objects::GeneratedTransaction> =
            snapshot.decode_section("generated_transactions")?;
        for generated in generated_rows {
            self.generated_transactions.insert(generated.trx_id, generated);
        }

        let mut current_table: Option<TableId> = None;
        let table_rows: Vec<TableRow> = snapshot.decode_section("contract_tables")?;
        for row in table_rows {
            match row {
                TableRow::Table { id, meta } => {
                    self.tables.tables.insert(id, meta);
                    current_table = Some(id);
                }
                other => {
                    let table = current_table
                        .ok_or(SnapshotError::RowDecode { section: "contract_tables" })?;
                    match other {
                        TableRow::Row { key, value } => {
                            self.tables.rows.insert((table, key), value);
                        }
                        TableRow::Idx64 { key, value } => {
                            self.tables.idx64.insert((table, key), value);
                        }
                        TableRow::Idx128 { key, value } => {
                            self.tables.idx128.insert((table, key), value);
                        }
                        TableRow::Idx256 { key, value } => {
                            self.tables.idx256.insert((table, key), value);
                        }
                        TableRow::IdxDouble { key, value } => {
                            self.tables.idx_double.insert((table, key), value);
                        }
                        TableRow::IdxLongDouble { key, value } => {
                            self.tables.idx_long_double.insert((table, key), value);
                        }
                        TableRow::Table { .. } => unreachable!(),
                    }
                }
            }
        }
        Ok(())
    }

    fn decode_rows<T: sbor::BasicDecode>(
        &self,
        snapshot: &Snapshot,
        name: &'static str,
    ) -> Result<Vec<T>, SnapshotError> {
        snapshot.decode_section(name)
    }
}
