//! Core data model for the wallet engine
//!
//! Defines the UTXO, transaction and snapshot types shared between the sync
//! pipeline, the validator and the engine's committed state. The central
//! distinction is LKG ("last known good", the trusted committed snapshot)
//! versus staging (an untrusted snapshot fetched during a sync attempt,
//! promoted to LKG only after validation).

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::address::ScriptType;

/// An unspent transaction output as tracked by the wallet.
///
/// `height == 0` means unconfirmed. Uniquely identified by `(txid, vout)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
    pub height: u32,
    pub address: String,
    pub script_pubkey: Vec<u8>,
    pub script_type: ScriptType,
    pub scripthash: String,
    pub confirmations: u32,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }

    /// Recompute `confirmations` from a chain tip height.
    pub fn update_confirmations(&mut self, tip_height: u32) {
        self.confirmations = if self.height == 0 || self.height > tip_height {
            0
        } else {
            tip_height - self.height + 1
        };
    }
}

/// Direction of a transaction from the wallet's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxDirection {
    Incoming,
    Outgoing,
    SelfTransfer,
}

impl TxDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxDirection::Incoming => "incoming",
            TxDirection::Outgoing => "outgoing",
            TxDirection::SelfTransfer => "self-transfer",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "incoming" => Ok(TxDirection::Incoming),
            "outgoing" => Ok(TxDirection::Outgoing),
            "self-transfer" => Ok(TxDirection::SelfTransfer),
            _ => Err(anyhow::anyhow!("Invalid tx direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            _ => Err(anyhow::anyhow!("Invalid tx status: {}", s)),
        }
    }
}

/// Compact per-transaction record shown in history lists.
///
/// `value_delta_sat` is signed from the wallet's perspective; for a
/// self-transfer it equals the negated fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSummary {
    pub txid: Txid,
    /// Unix timestamp of the first time this wallet saw the transaction.
    /// Carried forward across syncs; the server cannot supply it.
    pub first_seen_at: u64,
    pub block_height: Option<u32>,
    pub confirmations: u32,
    pub direction: TxDirection,
    pub value_delta_sat: i64,
    pub fee_sat: u64,
    pub fee_rate: f64,
    pub is_rbf: bool,
    pub status: TxStatus,
    pub input_count: u32,
    pub output_count: u32,
    pub size: u32,
    pub vsize: u32,
}

/// One input of a fully decoded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetailInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
    pub address: String,
    pub value_sat: u64,
    pub is_wallet_owned: bool,
}

impl TxDetailInput {
    /// An input whose spending address/value the server omitted. Such
    /// entries trigger a secondary fetch of the referenced parent tx.
    pub fn is_unresolved(&self) -> bool {
        self.address.is_empty() && self.value_sat == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetailOutput {
    pub index: u32,
    pub address: Option<String>,
    pub value_sat: u64,
    pub script_pubkey: Vec<u8>,
    pub is_wallet_owned: bool,
}

/// Full decoded transaction, kept separately from the summary because it is
/// large and optional per wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetail {
    pub txid: Txid,
    pub raw_hex: String,
    pub inputs: Vec<TxDetailInput>,
    pub outputs: Vec<TxDetailOutput>,
    pub block_time: Option<u64>,
    pub size: u32,
    pub vsize: u32,
}

impl TxDetail {
    pub fn has_unresolved_inputs(&self) -> bool {
        self.inputs.iter().any(|i| i.is_unresolved())
    }
}

/// Confirmed/unconfirmed balance pair derived from a UTXO set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub confirmed_sat: u64,
    pub unconfirmed_sat: u64,
}

impl Balances {
    pub fn total_sat(&self) -> u64 {
        self.confirmed_sat + self.unconfirmed_sat
    }
}

/// Derive balances exclusively from a UTXO set. There is deliberately no
/// separate balance query anywhere in the engine: this function is the only
/// source of balance figures, which removes UTXO/balance divergence as a
/// failure mode.
pub fn derive_balances(utxos: &[Utxo]) -> Balances {
    let mut balances = Balances::default();
    for utxo in utxos {
        if utxo.is_confirmed() {
            balances.confirmed_sat += utxo.value_sat;
        } else {
            balances.unconfirmed_sat += utxo.value_sat;
        }
    }
    balances
}

/// The committed, trusted wallet snapshot shown to the user.
///
/// Mutated by exactly one path: the engine's commit step, which replaces it
/// wholesale with a fully validated snapshot. Never partially written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LkgSnapshot {
    pub utxos: Vec<Utxo>,
    pub summaries: Vec<TxSummary>,
    pub details: BTreeMap<Txid, TxDetail>,
    pub confirmed_balance_sat: u64,
    pub unconfirmed_balance_sat: u64,
    /// Txids the user has explicitly tracked (e.g. pending sends).
    pub tracked_txids: BTreeMap<Txid, u64>,
    pub committed_at: u64,
    pub tip_height_at_commit: u32,
}

impl LkgSnapshot {
    pub fn empty() -> Self {
        Self {
            utxos: Vec::new(),
            summaries: Vec::new(),
            details: BTreeMap::new(),
            confirmed_balance_sat: 0,
            unconfirmed_balance_sat: 0,
            tracked_txids: BTreeMap::new(),
            committed_at: 0,
            tip_height_at_commit: 0,
        }
    }
}

/// Completeness metadata attached to a staging snapshot by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingMeta {
    pub server_used: String,
    pub fetched_at: u64,
    pub tip_height: u32,
    pub scripthashes_queried: u32,
    pub scripthashes_succeeded: u32,
    pub tx_details_fetched: u32,
    pub tx_details_missing: Vec<Txid>,
    pub is_complete: bool,
}

/// Untrusted snapshot built fresh on each sync attempt. Discarded entirely
/// if validation fails; never partially merged into LKG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingSnapshot {
    pub utxos: Vec<Utxo>,
    pub summaries: Vec<TxSummary>,
    pub details: BTreeMap<Txid, TxDetail>,
    pub meta: StagingMeta,
}

impl StagingSnapshot {
    pub fn balances(&self) -> Balances {
        derive_balances(&self.utxos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
    Stale,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
            SyncStatus::Stale => "stale",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            "stale" => Ok(SyncStatus::Stale),
            _ => Err(anyhow::anyhow!("Invalid sync status: {}", s)),
        }
    }
}

/// Per-wallet sync lifecycle record.
///
/// Lifecycle: `idle -> syncing -> (synced | error)`. An error increments
/// `failure_count` and never mutates LKG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_successful_sync_at: Option<u64>,
    pub last_attempt_at: Option<u64>,
    pub last_known_tip_height: u32,
    pub last_server_used: Option<String>,
    pub is_stale: bool,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<u64>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_successful_sync_at: None,
            last_attempt_at: None,
            last_known_tip_height: 0,
            last_server_used: None,
            is_stale: true,
            failure_count: 0,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// User-attached note on a specific UTXO. Survives the spend of the UTXO for
/// a grace window so recently-spent coins can still be referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoMetadata {
    pub txid: Txid,
    pub vout: u32,
    pub label: String,
    /// Unix timestamp at which the engine first observed the UTXO as spent,
    /// or None while it is still unspent.
    pub spent_observed_at: Option<u64>,
}

/// Ephemeral result of building and signing a transaction. Exists only for
/// the duration of a send or fee-bump operation; never persisted unmodified.
#[derive(Debug, Clone)]
pub struct PreparedTx {
    pub input_total_sat: u64,
    pub output_total_sat: u64,
    pub fee_sat: u64,
    pub change_sat: u64,
    pub raw_hex: String,
    pub txid: Txid,
}

/// Map from txid to first-seen timestamp, used when promoting staging to LKG
/// to carry forward history the server cannot supply.
pub fn first_seen_index(summaries: &[TxSummary]) -> HashMap<Txid, u64> {
    summaries.iter().map(|s| (s.txid, s.first_seen_at)).collect()
}
