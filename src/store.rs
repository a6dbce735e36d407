//! SQLite persistence for wallets, addresses, snapshots and sync state
//!
//! One database serves every wallet the engine manages; all rows are keyed
//! by wallet id. The committed snapshot tables are only ever written by
//! [`WalletStore::commit_snapshot`], which replaces a wallet's entire LKG
//! state inside a single transaction. Readers can therefore never observe a
//! half-committed sync.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use bitcoin::Txid;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::address::{AddressRecord, Chain, ScriptType};
use crate::types::{
    LkgSnapshot, SyncState, SyncStatus, TxDetail, TxStatus, TxSummary, Utxo, UtxoMetadata,
};

/// A wallet row. Watch-only wallets have no key material in this process
/// and are skipped by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRecord {
    pub id: String,
    pub network: String,
    pub is_watch_only: bool,
    pub created_at: u64,
}

pub struct WalletStore {
    conn: Connection,
}

impl WalletStore {
    /// Open or create the engine database at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).with_context(|| {
            format!("Failed to open wallet database: {}", db_path.as_ref().display())
        })?;
        let store = Self { conn };
        store.create_tables()?;
        info!("Wallet database opened: {}", db_path.as_ref().display());
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                network TEXT NOT NULL,
                is_watch_only INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS addresses (
                wallet_id TEXT NOT NULL,
                address TEXT NOT NULL,
                path TEXT NOT NULL,
                idx INTEGER NOT NULL,
                is_change INTEGER NOT NULL,
                script_type TEXT NOT NULL,
                scripthash TEXT NOT NULL,
                is_used INTEGER NOT NULL DEFAULT 0,
                label TEXT,
                PRIMARY KEY (wallet_id, address)
            );
            CREATE INDEX IF NOT EXISTS idx_addresses_chain
                ON addresses(wallet_id, script_type, is_change, idx);
            CREATE INDEX IF NOT EXISTS idx_addresses_scripthash
                ON addresses(scripthash);

            CREATE TABLE IF NOT EXISTS utxos (
                wallet_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                vout INTEGER NOT NULL,
                value_sat INTEGER NOT NULL,
                height INTEGER NOT NULL,
                address TEXT NOT NULL,
                script_pubkey BLOB NOT NULL,
                script_type TEXT NOT NULL,
                scripthash TEXT NOT NULL,
                confirmations INTEGER NOT NULL,
                PRIMARY KEY (wallet_id, txid, vout)
            );

            CREATE TABLE IF NOT EXISTS tx_summaries (
                wallet_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                block_height INTEGER,
                confirmations INTEGER NOT NULL,
                direction TEXT NOT NULL,
                value_delta_sat INTEGER NOT NULL,
                fee_sat INTEGER NOT NULL,
                fee_rate REAL NOT NULL,
                is_rbf INTEGER NOT NULL,
                status TEXT NOT NULL,
                input_count INTEGER NOT NULL,
                output_count INTEGER NOT NULL,
                size INTEGER NOT NULL,
                vsize INTEGER NOT NULL,
                PRIMARY KEY (wallet_id, txid)
            );

            CREATE TABLE IF NOT EXISTS tx_details (
                wallet_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                detail_json TEXT NOT NULL,
                PRIMARY KEY (wallet_id, txid)
            );

            CREATE TABLE IF NOT EXISTS snapshot_meta (
                wallet_id TEXT PRIMARY KEY,
                committed_at INTEGER NOT NULL,
                tip_height_at_commit INTEGER NOT NULL,
                confirmed_balance_sat INTEGER NOT NULL,
                unconfirmed_balance_sat INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tracked_txids (
                wallet_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (wallet_id, txid)
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                wallet_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_successful_sync_at INTEGER,
                last_attempt_at INTEGER,
                last_known_tip_height INTEGER NOT NULL DEFAULT 0,
                last_server_used TEXT,
                is_stale INTEGER NOT NULL DEFAULT 1,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS utxo_metadata (
                wallet_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                vout INTEGER NOT NULL,
                label TEXT NOT NULL,
                spent_observed_at INTEGER,
                PRIMARY KEY (wallet_id, txid, vout)
            );",
        )?;
        Ok(())
    }

    // ── wallets ─────────────────────────────────────────────────────────

    pub fn create_wallet(&self, record: &WalletRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO wallets (id, network, is_watch_only, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.network,
                record.is_watch_only,
                record.created_at as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_wallet(&self, wallet_id: &str) -> Result<Option<WalletRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, network, is_watch_only, created_at FROM wallets WHERE id = ?",
                params![wallet_id],
                |row| {
                    Ok(WalletRecord {
                        id: row.get(0)?,
                        network: row.get(1)?,
                        is_watch_only: row.get(2)?,
                        created_at: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, network, is_watch_only, created_at FROM wallets ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok(WalletRecord {
                id: row.get(0)?,
                network: row.get(1)?,
                is_watch_only: row.get(2)?,
                created_at: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ── addresses ───────────────────────────────────────────────────────

    pub fn upsert_address(&self, wallet_id: &str, record: &AddressRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO addresses
             (wallet_id, address, path, idx, is_change, script_type, scripthash, is_used, label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                wallet_id,
                record.address,
                record.path,
                record.index,
                record.is_change,
                record.script_type.as_str(),
                record.scripthash,
                record.is_used,
                record.label,
            ],
        )?;
        Ok(())
    }

    pub fn load_addresses(&self, wallet_id: &str) -> Result<Vec<AddressRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, path, idx, is_change, script_type, scripthash, is_used, label
             FROM addresses WHERE wallet_id = ?
             ORDER BY script_type, is_change, idx",
        )?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (address, path, index, is_change, script_type, scripthash, is_used, label) = row?;
            out.push(AddressRecord {
                address,
                path,
                index,
                is_change,
                script_type: script_type.parse()?,
                scripthash,
                is_used,
                label,
            });
        }
        Ok(out)
    }

    /// Highest derived index for one (script type, chain), or None when no
    /// address of that combination has been derived yet.
    pub fn max_address_index(
        &self,
        wallet_id: &str,
        script_type: ScriptType,
        chain: Chain,
    ) -> Result<Option<u32>> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(idx) FROM addresses
             WHERE wallet_id = ? AND script_type = ? AND is_change = ?",
            params![wallet_id, script_type.as_str(), chain.is_change()],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Highest index with on-chain usage evidence, per (script type, chain).
    pub fn highest_used_index(
        &self,
        wallet_id: &str,
        script_type: ScriptType,
        chain: Chain,
    ) -> Result<Option<u32>> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(idx) FROM addresses
             WHERE wallet_id = ? AND script_type = ? AND is_change = ? AND is_used = 1",
            params![wallet_id, script_type.as_str(), chain.is_change()],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    pub fn mark_addresses_used(&self, wallet_id: &str, scripthashes: &[String]) -> Result<usize> {
        let mut updated = 0;
        for scripthash in scripthashes {
            updated += self.conn.execute(
                "UPDATE addresses SET is_used = 1 WHERE wallet_id = ? AND scripthash = ?",
                params![wallet_id, scripthash],
            )?;
        }
        Ok(updated)
    }

    pub fn set_address_label(
        &self,
        wallet_id: &str,
        address: &str,
        label: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE addresses SET label = ? WHERE wallet_id = ? AND address = ?",
            params![label, wallet_id, address],
        )?;
        Ok(())
    }

    // ── committed snapshot ──────────────────────────────────────────────

    /// Replace the wallet's entire committed snapshot in one transaction.
    /// Either every table reflects the new snapshot or none does.
    pub fn commit_snapshot(&mut self, wallet_id: &str, snapshot: &LkgSnapshot) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM utxos WHERE wallet_id = ?", params![wallet_id])?;
        tx.execute(
            "DELETE FROM tx_summaries WHERE wallet_id = ?",
            params![wallet_id],
        )?;
        tx.execute(
            "DELETE FROM tx_details WHERE wallet_id = ?",
            params![wallet_id],
        )?;
        tx.execute(
            "DELETE FROM tracked_txids WHERE wallet_id = ?",
            params![wallet_id],
        )?;

        for utxo in &snapshot.utxos {
            tx.execute(
                "INSERT INTO utxos
                 (wallet_id, txid, vout, value_sat, height, address, script_pubkey,
                  script_type, scripthash, confirmations)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    wallet_id,
                    utxo.txid.to_string(),
                    utxo.vout,
                    utxo.value_sat as i64,
                    utxo.height,
                    utxo.address,
                    utxo.script_pubkey,
                    utxo.script_type.as_str(),
                    utxo.scripthash,
                    utxo.confirmations,
                ],
            )?;
        }

        for summary in &snapshot.summaries {
            tx.execute(
                "INSERT INTO tx_summaries
                 (wallet_id, txid, first_seen_at, block_height, confirmations, direction,
                  value_delta_sat, fee_sat, fee_rate, is_rbf, status, input_count,
                  output_count, size, vsize)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    wallet_id,
                    summary.txid.to_string(),
                    summary.first_seen_at as i64,
                    summary.block_height,
                    summary.confirmations,
                    summary.direction.as_str(),
                    summary.value_delta_sat,
                    summary.fee_sat as i64,
                    summary.fee_rate,
                    summary.is_rbf,
                    summary.status.as_str(),
                    summary.input_count,
                    summary.output_count,
                    summary.size,
                    summary.vsize,
                ],
            )?;
        }

        for (txid, detail) in &snapshot.details {
            let json = serde_json::to_string(detail)
                .with_context(|| format!("Failed to serialize detail for {}", txid))?;
            tx.execute(
                "INSERT INTO tx_details (wallet_id, txid, detail_json) VALUES (?1, ?2, ?3)",
                params![wallet_id, txid.to_string(), json],
            )?;
        }

        for (txid, added_at) in &snapshot.tracked_txids {
            tx.execute(
                "INSERT INTO tracked_txids (wallet_id, txid, added_at) VALUES (?1, ?2, ?3)",
                params![wallet_id, txid.to_string(), *added_at as i64],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO snapshot_meta
             (wallet_id, committed_at, tip_height_at_commit,
              confirmed_balance_sat, unconfirmed_balance_sat)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                wallet_id,
                snapshot.committed_at as i64,
                snapshot.tip_height_at_commit,
                snapshot.confirmed_balance_sat as i64,
                snapshot.unconfirmed_balance_sat as i64,
            ],
        )?;

        tx.commit()?;
        debug!(
            "Committed snapshot for {}: {} utxos, {} txs, tip {}",
            wallet_id,
            snapshot.utxos.len(),
            snapshot.summaries.len(),
            snapshot.tip_height_at_commit
        );
        Ok(())
    }

    /// Load the committed snapshot for a wallet. A wallet with no committed
    /// sync yet yields an empty snapshot.
    pub fn load_snapshot(&self, wallet_id: &str) -> Result<LkgSnapshot> {
        let mut snapshot = LkgSnapshot::empty();

        let meta = self
            .conn
            .query_row(
                "SELECT committed_at, tip_height_at_commit,
                        confirmed_balance_sat, unconfirmed_balance_sat
                 FROM snapshot_meta WHERE wallet_id = ?",
                params![wallet_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .optional()?;
        match meta {
            Some((committed_at, tip, confirmed, unconfirmed)) => {
                snapshot.committed_at = committed_at;
                snapshot.tip_height_at_commit = tip;
                snapshot.confirmed_balance_sat = confirmed;
                snapshot.unconfirmed_balance_sat = unconfirmed;
            }
            None => return Ok(snapshot),
        }

        let mut stmt = self.conn.prepare(
            "SELECT txid, vout, value_sat, height, address, script_pubkey,
                    script_type, scripthash, confirmations
             FROM utxos WHERE wallet_id = ?",
        )?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, u32>(8)?,
            ))
        })?;
        for row in rows {
            let (txid, vout, value, height, address, spk, script_type, scripthash, confs) = row?;
            snapshot.utxos.push(Utxo {
                txid: txid.parse().context("Corrupt txid in utxos table")?,
                vout,
                value_sat: value as u64,
                height,
                address,
                script_pubkey: spk,
                script_type: script_type.parse()?,
                scripthash,
                confirmations: confs,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT txid, first_seen_at, block_height, confirmations, direction,
                    value_delta_sat, fee_sat, fee_rate, is_rbf, status, input_count,
                    output_count, size, vsize
             FROM tx_summaries WHERE wallet_id = ?
             ORDER BY first_seen_at DESC",
        )?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<u32>>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, bool>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, u32>(10)?,
                row.get::<_, u32>(11)?,
                row.get::<_, u32>(12)?,
                row.get::<_, u32>(13)?,
            ))
        })?;
        for row in rows {
            let (
                txid,
                first_seen_at,
                block_height,
                confirmations,
                direction,
                value_delta_sat,
                fee_sat,
                fee_rate,
                is_rbf,
                status,
                input_count,
                output_count,
                size,
                vsize,
            ) = row?;
            snapshot.summaries.push(TxSummary {
                txid: txid.parse().context("Corrupt txid in tx_summaries table")?,
                first_seen_at: first_seen_at as u64,
                block_height,
                confirmations,
                direction: crate::types::TxDirection::from_str(&direction)?,
                value_delta_sat,
                fee_sat: fee_sat as u64,
                fee_rate,
                is_rbf,
                status: TxStatus::from_str(&status)?,
                input_count,
                output_count,
                size,
                vsize,
            });
        }

        let mut stmt = self
            .conn
            .prepare("SELECT txid, detail_json FROM tx_details WHERE wallet_id = ?")?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (txid, json) = row?;
            let txid: Txid = txid.parse().context("Corrupt txid in tx_details table")?;
            let detail: TxDetail = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt detail json for {}", txid))?;
            snapshot.details.insert(txid, detail);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT txid, added_at FROM tracked_txids WHERE wallet_id = ?")?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (txid, added_at) = row?;
            snapshot.tracked_txids.insert(
                txid.parse().context("Corrupt txid in tracked_txids table")?,
                added_at as u64,
            );
        }

        Ok(snapshot)
    }

    /// Look up one transaction detail without loading the whole snapshot.
    pub fn load_tx_detail(&self, wallet_id: &str, txid: Txid) -> Result<Option<TxDetail>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT detail_json FROM tx_details WHERE wallet_id = ? AND txid = ?",
                params![wallet_id, txid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).with_context(|| {
                format!("Corrupt detail json for {}", txid)
            })?)),
            None => Ok(None),
        }
    }

    /// All txids the wallet currently knows about, as a set for the
    /// no-transaction-deletion validation check.
    pub fn known_txids(&self, wallet_id: &str) -> Result<HashSet<Txid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT txid FROM tx_summaries WHERE wallet_id = ?")?;
        let rows = stmt.query_map(params![wallet_id], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?.parse().context("Corrupt txid in tx_summaries table")?);
        }
        Ok(out)
    }

    pub fn track_txid(&self, wallet_id: &str, txid: Txid, added_at: u64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tracked_txids (wallet_id, txid, added_at) VALUES (?1, ?2, ?3)",
            params![wallet_id, txid.to_string(), added_at as i64],
        )?;
        Ok(())
    }

    // ── sync state ──────────────────────────────────────────────────────

    pub fn load_sync_state(&self, wallet_id: &str) -> Result<SyncState> {
        let state = self
            .conn
            .query_row(
                "SELECT status, last_successful_sync_at, last_attempt_at,
                        last_known_tip_height, last_server_used, is_stale,
                        failure_count, last_error, last_error_at
                 FROM sync_state WHERE wallet_id = ?",
                params![wallet_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                    ))
                },
            )
            .optional()?;

        match state {
            Some((
                status,
                last_success,
                last_attempt,
                tip,
                server,
                is_stale,
                failure_count,
                last_error,
                last_error_at,
            )) => Ok(SyncState {
                status: SyncStatus::from_str(&status)?,
                last_successful_sync_at: last_success.map(|t| t as u64),
                last_attempt_at: last_attempt.map(|t| t as u64),
                last_known_tip_height: tip,
                last_server_used: server,
                is_stale,
                failure_count,
                last_error,
                last_error_at: last_error_at.map(|t| t as u64),
            }),
            None => Ok(SyncState::default()),
        }
    }

    pub fn save_sync_state(&self, wallet_id: &str, state: &SyncState) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state
             (wallet_id, status, last_successful_sync_at, last_attempt_at,
              last_known_tip_height, last_server_used, is_stale, failure_count,
              last_error, last_error_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                wallet_id,
                state.status.as_str(),
                state.last_successful_sync_at.map(|t| t as i64),
                state.last_attempt_at.map(|t| t as i64),
                state.last_known_tip_height,
                state.last_server_used,
                state.is_stale,
                state.failure_count,
                state.last_error,
                state.last_error_at.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    // ── utxo metadata ───────────────────────────────────────────────────

    pub fn set_utxo_label(&self, wallet_id: &str, txid: Txid, vout: u32, label: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO utxo_metadata (wallet_id, txid, vout, label, spent_observed_at)
             VALUES (?1, ?2, ?3, ?4, NULL)
             ON CONFLICT (wallet_id, txid, vout) DO UPDATE SET label = ?4",
            params![wallet_id, txid.to_string(), vout, label],
        )?;
        Ok(())
    }

    pub fn load_utxo_metadata(&self, wallet_id: &str) -> Result<Vec<UtxoMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT txid, vout, label, spent_observed_at FROM utxo_metadata WHERE wallet_id = ?",
        )?;
        let rows = stmt.query_map(params![wallet_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (txid, vout, label, spent_observed_at) = row?;
            out.push(UtxoMetadata {
                txid: txid.parse().context("Corrupt txid in utxo_metadata table")?,
                vout,
                label,
                spent_observed_at: spent_observed_at.map(|t| t as u64),
            });
        }
        Ok(out)
    }

    /// Record the first time a labelled UTXO was observed missing from the
    /// unspent set. Does not overwrite an earlier observation.
    pub fn mark_metadata_spent(
        &self,
        wallet_id: &str,
        txid: Txid,
        vout: u32,
        observed_at: u64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE utxo_metadata SET spent_observed_at = ?1
             WHERE wallet_id = ?2 AND txid = ?3 AND vout = ?4 AND spent_observed_at IS NULL",
            params![observed_at as i64, wallet_id, txid.to_string(), vout],
        )?;
        Ok(())
    }

    /// A UTXO thought spent that reappears (reorg) becomes live again.
    pub fn clear_metadata_spent(&self, wallet_id: &str, txid: Txid, vout: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE utxo_metadata SET spent_observed_at = NULL
             WHERE wallet_id = ? AND txid = ? AND vout = ?",
            params![wallet_id, txid.to_string(), vout],
        )?;
        Ok(())
    }

    /// Delete metadata whose spend was observed before the cutoff.
    pub fn prune_spent_metadata(&self, wallet_id: &str, cutoff: u64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM utxo_metadata
             WHERE wallet_id = ? AND spent_observed_at IS NOT NULL AND spent_observed_at < ?",
            params![wallet_id, cutoff as i64],
        )?;
        if deleted > 0 {
            debug!("Pruned {} spent utxo metadata rows for {}", deleted, wallet_id);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{derive_balances, TxDirection};
    use bitcoin::hashes::Hash;
    use std::collections::BTreeMap;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn store_with_wallet() -> WalletStore {
        let store = WalletStore::open_in_memory().unwrap();
        store
            .create_wallet(&WalletRecord {
                id: "w1".to_string(),
                network: "regtest".to_string(),
                is_watch_only: false,
                created_at: 1_700_000_000,
            })
            .unwrap();
        store
    }

    fn sample_utxo(byte: u8, value_sat: u64, height: u32) -> Utxo {
        Utxo {
            txid: txid(byte),
            vout: 0,
            value_sat,
            height,
            address: "bcrt1qexample".to_string(),
            script_pubkey: vec![0x00, 0x14, byte],
            script_type: ScriptType::NativeSegwit,
            scripthash: format!("{:064x}", byte),
            confirmations: 1,
        }
    }

    fn sample_summary(byte: u8) -> TxSummary {
        TxSummary {
            txid: txid(byte),
            first_seen_at: 1_700_000_100,
            block_height: Some(100),
            confirmations: 3,
            direction: TxDirection::Incoming,
            value_delta_sat: 50_000,
            fee_sat: 200,
            fee_rate: 1.4,
            is_rbf: true,
            status: TxStatus::Confirmed,
            input_count: 1,
            output_count: 2,
            size: 222,
            vsize: 141,
        }
    }

    #[test]
    fn test_wallet_round_trip() {
        let store = store_with_wallet();
        let loaded = store.get_wallet("w1").unwrap().unwrap();
        assert_eq!(loaded.network, "regtest");
        assert!(!loaded.is_watch_only);
        assert!(store.get_wallet("missing").unwrap().is_none());
        assert_eq!(store.list_wallets().unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_commit_and_reload() {
        let mut store = store_with_wallet();

        let utxos = vec![sample_utxo(1, 50_000, 100), sample_utxo(2, 10_000, 0)];
        let balances = derive_balances(&utxos);
        let mut tracked = BTreeMap::new();
        tracked.insert(txid(9), 1_700_000_200u64);

        let snapshot = LkgSnapshot {
            utxos,
            summaries: vec![sample_summary(1)],
            details: BTreeMap::new(),
            confirmed_balance_sat: balances.confirmed_sat,
            unconfirmed_balance_sat: balances.unconfirmed_sat,
            tracked_txids: tracked,
            committed_at: 1_700_000_300,
            tip_height_at_commit: 102,
        };

        store.commit_snapshot("w1", &snapshot).unwrap();
        let loaded = store.load_snapshot("w1").unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_snapshot_commit_replaces_previous_state() {
        let mut store = store_with_wallet();

        let first = LkgSnapshot {
            utxos: vec![sample_utxo(1, 50_000, 100)],
            summaries: vec![sample_summary(1)],
            confirmed_balance_sat: 50_000,
            ..LkgSnapshot::empty()
        };
        store.commit_snapshot("w1", &first).unwrap();

        let second = LkgSnapshot {
            utxos: vec![sample_utxo(2, 70_000, 101)],
            summaries: vec![sample_summary(1), sample_summary(2)],
            confirmed_balance_sat: 70_000,
            ..LkgSnapshot::empty()
        };
        store.commit_snapshot("w1", &second).unwrap();

        let loaded = store.load_snapshot("w1").unwrap();
        assert_eq!(loaded.utxos.len(), 1);
        assert_eq!(loaded.utxos[0].txid, txid(2));
        assert_eq!(loaded.summaries.len(), 2);
        assert_eq!(store.known_txids("w1").unwrap().len(), 2);
    }

    #[test]
    fn test_single_detail_lookup() {
        use crate::types::{TxDetail, TxDetailOutput};

        let mut store = store_with_wallet();
        let detail = TxDetail {
            txid: txid(1),
            raw_hex: "0200000000".to_string(),
            inputs: vec![],
            outputs: vec![TxDetailOutput {
                index: 0,
                address: Some("bcrt1qexample".to_string()),
                value_sat: 50_000,
                script_pubkey: vec![0x00, 0x14],
                is_wallet_owned: true,
            }],
            block_time: Some(1_700_000_000),
            size: 222,
            vsize: 141,
        };
        let mut details = BTreeMap::new();
        details.insert(txid(1), detail.clone());

        let snapshot = LkgSnapshot {
            details,
            ..LkgSnapshot::empty()
        };
        store.commit_snapshot("w1", &snapshot).unwrap();

        assert_eq!(store.load_tx_detail("w1", txid(1)).unwrap(), Some(detail));
        assert_eq!(store.load_tx_detail("w1", txid(2)).unwrap(), None);
    }

    #[test]
    fn test_empty_wallet_loads_empty_snapshot() {
        let store = store_with_wallet();
        let snapshot = store.load_snapshot("w1").unwrap();
        assert!(snapshot.utxos.is_empty());
        assert_eq!(snapshot.committed_at, 0);
    }

    #[test]
    fn test_address_index_queries() {
        let store = store_with_wallet();
        for index in 0..5u32 {
            let mut record = AddressRecord {
                address: format!("bcrt1qaddr{}", index),
                path: format!("84'/1'/0'/0/{}", index),
                index,
                is_change: false,
                script_type: ScriptType::NativeSegwit,
                scripthash: format!("{:064x}", index + 10),
                is_used: false,
                label: None,
            };
            if index < 2 {
                record.is_used = true;
            }
            store.upsert_address("w1", &record).unwrap();
        }

        assert_eq!(
            store
                .max_address_index("w1", ScriptType::NativeSegwit, Chain::External)
                .unwrap(),
            Some(4)
        );
        assert_eq!(
            store
                .highest_used_index("w1", ScriptType::NativeSegwit, Chain::External)
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            store
                .max_address_index("w1", ScriptType::Taproot, Chain::External)
                .unwrap(),
            None
        );

        // Marking by scripthash flips is_used
        store
            .mark_addresses_used("w1", &[format!("{:064x}", 13u32)])
            .unwrap();
        assert_eq!(
            store
                .highest_used_index("w1", ScriptType::NativeSegwit, Chain::External)
                .unwrap(),
            Some(3)
        );
    }

    #[test]
    fn test_sync_state_round_trip() {
        let store = store_with_wallet();

        // Unknown wallet starts with defaults
        let state = store.load_sync_state("w1").unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.is_stale);

        let updated = SyncState {
            status: SyncStatus::Synced,
            last_successful_sync_at: Some(1_700_000_400),
            last_attempt_at: Some(1_700_000_400),
            last_known_tip_height: 102,
            last_server_used: Some("localhost:50001".to_string()),
            is_stale: false,
            failure_count: 0,
            last_error: None,
            last_error_at: None,
        };
        store.save_sync_state("w1", &updated).unwrap();
        assert_eq!(store.load_sync_state("w1").unwrap(), updated);
    }

    #[test]
    fn test_utxo_metadata_grace_window() {
        let store = store_with_wallet();
        store.set_utxo_label("w1", txid(1), 0, "cold storage").unwrap();
        store.set_utxo_label("w1", txid(2), 1, "exchange refund").unwrap();

        // First observation sticks; later ones don't overwrite it
        store.mark_metadata_spent("w1", txid(1), 0, 1000).unwrap();
        store.mark_metadata_spent("w1", txid(1), 0, 2000).unwrap();
        let meta = store.load_utxo_metadata("w1").unwrap();
        let spent = meta.iter().find(|m| m.txid == txid(1)).unwrap();
        assert_eq!(spent.spent_observed_at, Some(1000));

        // Prune removes only observations older than the cutoff
        assert_eq!(store.prune_spent_metadata("w1", 1500).unwrap(), 1);
        let meta = store.load_utxo_metadata("w1").unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].txid, txid(2));

        // Reorg resurrection clears the observation
        store.mark_metadata_spent("w1", txid(2), 1, 3000).unwrap();
        store.clear_metadata_spent("w1", txid(2), 1).unwrap();
        let meta = store.load_utxo_metadata("w1").unwrap();
        assert_eq!(meta[0].spent_observed_at, None);
    }
}
