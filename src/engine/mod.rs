//! Wallet engine: sync orchestration and committed-state queries
//!
//! The engine owns the store, the server pool and the event bus, and runs
//! the offline-first sync contract: fetch an untrusted staging snapshot,
//! validate it against the committed state, and only then commit it in a
//! single transaction. A failed or rejected sync leaves the committed
//! snapshot untouched, so the user keeps seeing the last known good state.

pub mod discovery;
pub mod pipeline;
pub mod validator;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::Txid;
use tracing::{error, info, warn};

use crate::address::{AddressDeriver, AddressRecord, Chain, ScriptType};
use crate::config::EngineConfig;
use crate::electrum::{ChainClient, ChainError, ElectrumChainClient, ServerPool};
use crate::events::{EngineEvent, EventBus};
use crate::store::{WalletRecord, WalletStore};
use crate::types::{
    derive_balances, Balances, LkgSnapshot, SyncState, SyncStatus, TxDetail, TxSummary, Utxo,
    UtxoMetadata,
};
use discovery::AddressDiscovery;
use pipeline::SyncPipeline;
use validator::{RejectReason, SnapshotValidator, Verdict};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Wallet {0} not found")]
    WalletNotFound(String),

    #[error("Wallet {0} is already syncing")]
    AlreadySyncing(String),

    #[error("Sync for wallet {0} was cancelled")]
    Cancelled(String),

    #[error("Snapshot rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("All servers failed; last error: {0}")]
    AllServersFailed(ChainError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of a successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub wallet_id: String,
    pub tip_height: u32,
    pub utxo_count: usize,
    pub tx_count: usize,
    pub balances: Balances,
    pub warnings: Vec<String>,
    /// Token identifying the snapshot generation this sync produced.
    pub token: SyncToken,
}

/// Monotonic snapshot generation marker. A caller that selected coins
/// against one generation can detect that a newer sync landed before it
/// broadcasts, and rebuild instead of spending stale state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncToken(u64);

/// Advisory cancellation flag for an in-flight sync. The flag is consulted
/// between stages, never mid-stage: a sync that has already passed
/// validation commits its snapshot regardless.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct WalletEngine {
    config: EngineConfig,
    store: Mutex<WalletStore>,
    pool: ServerPool,
    events: EventBus,
    in_flight: Mutex<HashSet<String>>,
    derivers: Mutex<HashMap<String, AddressDeriver>>,
    generation: AtomicU64,
}

impl WalletEngine {
    pub fn new(config: EngineConfig, store: WalletStore) -> Self {
        let pool = ServerPool::new(config.servers.clone());
        Self {
            config,
            store: Mutex::new(store),
            pool,
            events: EventBus::new(),
            in_flight: Mutex::new(HashSet::new()),
            derivers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn current_token(&self) -> SyncToken {
        SyncToken(self.generation.load(Ordering::Acquire))
    }

    /// Whether a token still refers to the newest committed generation.
    pub fn is_token_current(&self, token: SyncToken) -> bool {
        token == self.current_token()
    }

    // ── wallet management ───────────────────────────────────────────────

    pub fn create_wallet(&self, record: &WalletRecord) -> Result<(), EngineError> {
        self.with_store(|store| store.create_wallet(record))?;
        info!("Created wallet {} ({})", record.id, record.network);
        Ok(())
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, EngineError> {
        self.with_store(|store| store.list_wallets())
    }

    /// Attach key material to a wallet. Wallets without a deriver are
    /// watch-only: they sync but skip discovery and cannot sign.
    pub fn register_deriver(&self, wallet_id: &str, deriver: AddressDeriver) {
        self.derivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(wallet_id.to_string(), deriver);
    }

    /// Derive and persist the next unused receive address for one script
    /// family.
    pub fn next_receive_address(
        &self,
        wallet_id: &str,
        script_type: ScriptType,
    ) -> Result<AddressRecord, EngineError> {
        let deriver = self
            .deriver_for(wallet_id)
            .ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))?;
        let next_index = self
            .with_store(|store| store.max_address_index(wallet_id, script_type, Chain::External))?
            .map(|max| max + 1)
            .unwrap_or(0);
        let record = deriver
            .derive_record(script_type, Chain::External, next_index)
            .map_err(EngineError::Other)?;
        self.with_store(|store| store.upsert_address(wallet_id, &record))?;
        Ok(record)
    }

    // ── queries (committed state only) ──────────────────────────────────

    pub fn balances(&self, wallet_id: &str) -> Result<Balances, EngineError> {
        let snapshot = self.with_store(|store| store.load_snapshot(wallet_id))?;
        Ok(derive_balances(&snapshot.utxos))
    }

    pub fn utxos(&self, wallet_id: &str) -> Result<Vec<Utxo>, EngineError> {
        Ok(self.with_store(|store| store.load_snapshot(wallet_id))?.utxos)
    }

    pub fn history(&self, wallet_id: &str) -> Result<Vec<TxSummary>, EngineError> {
        Ok(self
            .with_store(|store| store.load_snapshot(wallet_id))?
            .summaries)
    }

    pub fn transaction_detail(
        &self,
        wallet_id: &str,
        txid: Txid,
    ) -> Result<Option<TxDetail>, EngineError> {
        self.with_store(|store| store.load_tx_detail(wallet_id, txid))
    }

    pub fn sync_state(&self, wallet_id: &str) -> Result<SyncState, EngineError> {
        self.with_store(|store| store.load_sync_state(wallet_id))
    }

    pub fn utxo_metadata(&self, wallet_id: &str) -> Result<Vec<UtxoMetadata>, EngineError> {
        self.with_store(|store| store.load_utxo_metadata(wallet_id))
    }

    pub fn set_utxo_label(
        &self,
        wallet_id: &str,
        txid: Txid,
        vout: u32,
        label: &str,
    ) -> Result<(), EngineError> {
        self.with_store(|store| store.set_utxo_label(wallet_id, txid, vout, label))
    }

    /// Remember a txid (typically a just-broadcast send) so the next
    /// commits keep watching for it even before the server reports it.
    pub fn track_txid(&self, wallet_id: &str, txid: Txid) -> Result<(), EngineError> {
        self.with_store(|store| store.track_txid(wallet_id, txid, unix_now()))
    }

    /// Re-evaluate staleness against the configured threshold. Emits a
    /// `WalletStale` event on the fresh-to-stale transition.
    pub fn refresh_staleness(&self, wallet_id: &str) -> Result<bool, EngineError> {
        let mut state = self.with_store(|store| store.load_sync_state(wallet_id))?;
        let stale = match state.last_successful_sync_at {
            Some(at) => unix_now().saturating_sub(at) > self.config.stale_after_secs,
            None => true,
        };
        if stale && !state.is_stale {
            state.is_stale = true;
            if state.status == SyncStatus::Synced {
                state.status = SyncStatus::Stale;
            }
            self.with_store(|store| store.save_sync_state(wallet_id, &state))?;
            self.events.emit(EngineEvent::WalletStale {
                wallet_id: wallet_id.to_string(),
            });
        }
        Ok(stale)
    }

    // ── sync ────────────────────────────────────────────────────────────

    /// Sync against the configured server pool, trying servers in health
    /// order until one yields an acceptable snapshot. A wallet whose last
    /// successful sync is still within the staleness threshold is skipped
    /// with `Ok(None)` unless `force` is set.
    pub async fn sync(
        &self,
        wallet_id: &str,
        force: bool,
    ) -> Result<Option<SyncReport>, EngineError> {
        self.sync_cancellable(wallet_id, force, &CancelToken::new())
            .await
    }

    /// Like [`sync`](Self::sync), but consults `cancel` between stages so
    /// the caller can abandon a slow sync without tearing down the engine.
    pub async fn sync_cancellable(
        &self,
        wallet_id: &str,
        force: bool,
        cancel: &CancelToken,
    ) -> Result<Option<SyncReport>, EngineError> {
        if !force && !self.refresh_staleness(wallet_id)? {
            info!("Wallet {} is still fresh; skipping sync", wallet_id);
            return Ok(None);
        }
        let servers = self.pool.ranked()?;
        let _guard = self.begin_sync(wallet_id)?;

        let mut last_error = ChainError::NoServers;
        for server in servers {
            let client = match connect(&server).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("Could not reach {}: {}", server, e);
                    self.pool.record_failure(&server);
                    last_error = e;
                    continue;
                }
            };

            match self.sync_attempt(wallet_id, &client, cancel).await {
                Ok(report) => {
                    self.pool.record_success(&server);
                    return Ok(Some(report));
                }
                Err(EngineError::Chain(e)) => {
                    self.pool.record_failure(&server);
                    last_error = e;
                }
                Err(EngineError::Rejected(reason)) => {
                    // A rejected snapshot is the server's fault too; note
                    // the failure against its health, then abort rather
                    // than shop for a server whose answer happens to pass
                    // validation.
                    self.pool.record_failure(&server);
                    self.record_sync_failure(wallet_id, &reason.to_string())?;
                    return Err(EngineError::Rejected(reason));
                }
                Err(EngineError::Cancelled(w)) => {
                    self.settle_cancelled(wallet_id)?;
                    return Err(EngineError::Cancelled(w));
                }
                Err(other) => {
                    self.record_sync_failure(wallet_id, &other.to_string())?;
                    return Err(other);
                }
            }
        }

        self.record_sync_failure(wallet_id, &last_error.to_string())?;
        Err(EngineError::AllServersFailed(last_error))
    }

    /// One full sync attempt against a specific client. Public so hosts
    /// and tests can drive the engine with their own transport.
    pub async fn sync_with_client(
        &self,
        wallet_id: &str,
        client: &dyn ChainClient,
    ) -> Result<SyncReport, EngineError> {
        self.sync_with_client_cancellable(wallet_id, client, &CancelToken::new())
            .await
    }

    /// Cancellable variant of [`sync_with_client`](Self::sync_with_client).
    pub async fn sync_with_client_cancellable(
        &self,
        wallet_id: &str,
        client: &dyn ChainClient,
        cancel: &CancelToken,
    ) -> Result<SyncReport, EngineError> {
        let _guard = self.begin_sync(wallet_id)?;
        let result = self.sync_attempt(wallet_id, client, cancel).await;
        match &result {
            Err(EngineError::Cancelled(_)) => self.settle_cancelled(wallet_id)?,
            Err(e) => self.record_sync_failure(wallet_id, &e.to_string())?,
            Ok(_) => {}
        }
        result
    }

    async fn sync_attempt(
        &self,
        wallet_id: &str,
        client: &dyn ChainClient,
        cancel: &CancelToken,
    ) -> Result<SyncReport, EngineError> {
        check_cancel(wallet_id, cancel)?;
        let now = unix_now();

        let (wallet, previous, known_txids, mut addresses, mut state) =
            self.with_store(|store| {
                let wallet = store.get_wallet(wallet_id)?;
                let previous = store.load_snapshot(wallet_id)?;
                let known = store.known_txids(wallet_id)?;
                let addresses = store.load_addresses(wallet_id)?;
                let state = store.load_sync_state(wallet_id)?;
                Ok((wallet, previous, known, addresses, state))
            })?;
        let wallet = wallet.ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))?;

        state.status = SyncStatus::Syncing;
        state.last_attempt_at = Some(now);
        self.with_store(|store| store.save_sync_state(wallet_id, &state))?;
        self.events.emit(EngineEvent::SyncStatusChanged {
            wallet_id: wallet_id.to_string(),
            status: SyncStatus::Syncing,
        });

        // Discovery extends the address frontier before fetching; a
        // watch-only wallet just syncs the addresses it already has.
        let mut warnings = Vec::new();
        if let Some(deriver) = self.deriver_for(wallet_id) {
            let discovery = AddressDiscovery::new(
                self.config.gap_limit,
                self.config.max_discovery_rounds,
                self.config.batch_size,
            );
            let outcome = discovery.run(client, &deriver, addresses).await?;
            if outcome.failed_queries > 0 {
                warnings.push(format!(
                    "{} discovery history queries failed; the address frontier may be short",
                    outcome.failed_queries
                ));
            }
            self.with_store(|store| {
                for record in &outcome.records {
                    store.upsert_address(wallet_id, record)?;
                }
                Ok(())
            })?;
            addresses = outcome.records;
        } else {
            info!("Wallet {} is watch-only; skipping discovery", wallet.id);
        }
        check_cancel(wallet_id, cancel)?;

        let pipeline = SyncPipeline::new(client, self.config.batch_size);
        let first_seen = crate::types::first_seen_index(&previous.summaries);
        let staging = pipeline
            .fetch_staging(&addresses, &first_seen, &previous.details, now)
            .await?;
        // Last cancellation point: once validation starts, the attempt
        // runs to commit.
        check_cancel(wallet_id, cancel)?;

        let validator = SnapshotValidator::new(
            self.config.reorg_tolerance_blocks,
            self.config.max_parse_failure_ratio,
        );
        let Verdict {
            rejection,
            warnings: validation_warnings,
        } = validator.validate(&staging, &previous, &known_txids);
        if let Some(reason) = rejection {
            return Err(EngineError::Rejected(reason));
        }
        warnings.extend(validation_warnings);

        // Promotion: assemble the new committed snapshot, carrying forward
        // what the server cannot know (tracked txids; first-seen times are
        // already threaded through the pipeline).
        let balances = staging.balances();
        let snapshot = LkgSnapshot {
            utxos: staging.utxos,
            summaries: staging.summaries,
            details: staging.details,
            confirmed_balance_sat: balances.confirmed_sat,
            unconfirmed_balance_sat: balances.unconfirmed_sat,
            tracked_txids: previous.tracked_txids.clone(),
            committed_at: now,
            tip_height_at_commit: staging.meta.tip_height,
        };

        let used_scripthashes: Vec<String> = snapshot
            .utxos
            .iter()
            .map(|u| u.scripthash.clone())
            .collect();

        self.with_store(|store| {
            store.commit_snapshot(wallet_id, &snapshot)?;
            store.mark_addresses_used(wallet_id, &used_scripthashes)?;
            Ok(())
        })?;
        self.reconcile_utxo_metadata(wallet_id, &snapshot, now)?;

        state.status = SyncStatus::Synced;
        state.last_successful_sync_at = Some(now);
        state.last_known_tip_height = snapshot.tip_height_at_commit;
        state.last_server_used = Some(staging.meta.server_used.clone());
        state.is_stale = false;
        state.failure_count = 0;
        state.last_error = None;
        state.last_error_at = None;
        self.with_store(|store| store.save_sync_state(wallet_id, &state))?;

        let token = SyncToken(self.generation.fetch_add(1, Ordering::AcqRel) + 1);

        self.events.emit(EngineEvent::SnapshotCommitted {
            wallet_id: wallet_id.to_string(),
            tip_height: snapshot.tip_height_at_commit,
            confirmed_balance_sat: balances.confirmed_sat,
            unconfirmed_balance_sat: balances.unconfirmed_sat,
        });
        self.events.emit(EngineEvent::SyncStatusChanged {
            wallet_id: wallet_id.to_string(),
            status: SyncStatus::Synced,
        });

        info!(
            "Sync committed for {}: tip {}, {} utxos, {} sats confirmed",
            wallet_id,
            snapshot.tip_height_at_commit,
            snapshot.utxos.len(),
            balances.confirmed_sat
        );

        Ok(SyncReport {
            wallet_id: wallet_id.to_string(),
            tip_height: snapshot.tip_height_at_commit,
            utxo_count: snapshot.utxos.len(),
            tx_count: snapshot.summaries.len(),
            balances,
            warnings,
            token,
        })
    }

    /// Broadcast a raw transaction and start tracking its txid.
    pub async fn broadcast(
        &self,
        wallet_id: &str,
        client: &dyn ChainClient,
        raw_hex: &str,
    ) -> Result<Txid, EngineError> {
        let txid = client.broadcast(raw_hex).await?;
        self.track_txid(wallet_id, txid)?;
        self.events.emit(EngineEvent::TxBroadcast {
            wallet_id: wallet_id.to_string(),
            txid,
        });
        info!("Broadcast {} for wallet {}", txid, wallet_id);
        Ok(txid)
    }

    // ── internals ───────────────────────────────────────────────────────

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut WalletStore) -> anyhow::Result<T>,
    ) -> Result<T, EngineError> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut store).map_err(EngineError::Other)
    }

    fn deriver_for(&self, wallet_id: &str) -> Option<AddressDeriver> {
        self.derivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(wallet_id)
            .cloned()
    }

    fn begin_sync(&self, wallet_id: &str) -> Result<SyncGuard<'_>, EngineError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(wallet_id.to_string()) {
            return Err(EngineError::AlreadySyncing(wallet_id.to_string()));
        }
        Ok(SyncGuard {
            engine: self,
            wallet_id: wallet_id.to_string(),
        })
    }

    /// A cancelled sync is not a failure: drop back to idle without
    /// touching the failure counters, but never clobber a state the
    /// attempt did not set.
    fn settle_cancelled(&self, wallet_id: &str) -> Result<(), EngineError> {
        let mut state = self.with_store(|store| store.load_sync_state(wallet_id))?;
        if state.status == SyncStatus::Syncing {
            state.status = SyncStatus::Idle;
            self.with_store(|store| store.save_sync_state(wallet_id, &state))?;
            self.events.emit(EngineEvent::SyncStatusChanged {
                wallet_id: wallet_id.to_string(),
                status: SyncStatus::Idle,
            });
        }
        info!("Sync cancelled for {}", wallet_id);
        Ok(())
    }

    fn record_sync_failure(&self, wallet_id: &str, message: &str) -> Result<(), EngineError> {
        let now = unix_now();
        let mut state = self.with_store(|store| store.load_sync_state(wallet_id))?;
        state.status = SyncStatus::Error;
        state.failure_count += 1;
        state.last_error = Some(message.to_string());
        state.last_error_at = Some(now);
        self.with_store(|store| store.save_sync_state(wallet_id, &state))?;
        self.events.emit(EngineEvent::SyncStatusChanged {
            wallet_id: wallet_id.to_string(),
            status: SyncStatus::Error,
        });
        error!("Sync failed for {}: {}", wallet_id, message);
        Ok(())
    }

    /// Keep UTXO labels consistent with the new snapshot: note first-spend
    /// observations, resurrect labels for reorged-back coins, and prune
    /// labels whose spend is past the grace window.
    fn reconcile_utxo_metadata(
        &self,
        wallet_id: &str,
        snapshot: &LkgSnapshot,
        now: u64,
    ) -> Result<(), EngineError> {
        let live: HashSet<(Txid, u32)> =
            snapshot.utxos.iter().map(|u| (u.txid, u.vout)).collect();
        let grace_secs = self.config.spent_metadata_grace_days as u64 * 86_400;

        self.with_store(|store| {
            for meta in store.load_utxo_metadata(wallet_id)? {
                let key = (meta.txid, meta.vout);
                if live.contains(&key) {
                    if meta.spent_observed_at.is_some() {
                        store.clear_metadata_spent(wallet_id, meta.txid, meta.vout)?;
                    }
                } else if meta.spent_observed_at.is_none() {
                    store.mark_metadata_spent(wallet_id, meta.txid, meta.vout, now)?;
                }
            }
            store.prune_spent_metadata(wallet_id, now.saturating_sub(grace_secs))?;
            Ok(())
        })
    }
}

/// Clears the in-flight marker however the sync attempt ends.
struct SyncGuard<'a> {
    engine: &'a WalletEngine,
    wallet_id: String,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.engine
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.wallet_id);
    }
}

fn check_cancel(wallet_id: &str, cancel: &CancelToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled(wallet_id.to_string()));
    }
    Ok(())
}

async fn connect(server: &str) -> Result<ElectrumChainClient, ChainError> {
    let server = server.to_string();
    tokio::task::spawn_blocking(move || ElectrumChainClient::connect(&server))
        .await
        .map_err(|e| ChainError::Connect {
            server: "unknown".to_string(),
            reason: e.to_string(),
        })?
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
