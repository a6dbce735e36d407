//! Staging snapshot construction
//!
//! Fetches a wallet's remote state in three stages: unspent outputs per
//! scripthash, history per scripthash, then full transactions for every
//! history entry. Inputs whose parent transaction is not part of the wallet
//! history get a secondary parent fetch so spending addresses and the fee
//! can be resolved. Everything lands in a [`StagingSnapshot`] with
//! completeness metadata; nothing here touches committed state.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{Transaction, Txid};
use tracing::{debug, warn};

use crate::address::{scripthash_hex, AddressRecord};
use crate::electrum::{batched_history, batched_unspent, ChainClient, ChainError};
use crate::types::{
    StagingMeta, StagingSnapshot, TxDetail, TxDetailInput, TxDetailOutput, TxDirection, TxStatus,
    TxSummary, Utxo,
};

pub struct SyncPipeline<'a> {
    client: &'a dyn ChainClient,
    batch_size: usize,
}

impl<'a> SyncPipeline<'a> {
    pub fn new(client: &'a dyn ChainClient, batch_size: usize) -> Self {
        Self { client, batch_size }
    }

    /// Build a staging snapshot for the given address set.
    /// `prior_first_seen` carries forward first-seen timestamps the server
    /// cannot supply; unknown transactions are stamped with `now`.
    /// `cached_details` lets previously committed transactions skip the
    /// per-txid fetch in stage 3.
    pub async fn fetch_staging(
        &self,
        addresses: &[AddressRecord],
        prior_first_seen: &HashMap<Txid, u64>,
        cached_details: &BTreeMap<Txid, TxDetail>,
        now: u64,
    ) -> Result<StagingSnapshot, ChainError> {
        let by_scripthash: HashMap<&str, &AddressRecord> = addresses
            .iter()
            .map(|a| (a.scripthash.as_str(), a))
            .collect();
        let scripthashes: Vec<String> =
            addresses.iter().map(|a| a.scripthash.clone()).collect();

        // Stage 1 + 2: tip, unspent outputs and history fetched
        // concurrently, batched, tolerating per-scripthash failures. A
        // scripthash counts as succeeded only when both queries came back.
        let (tip_height, (unspent_map, _), (history_map, _)) = tokio::join!(
            self.client.tip_height(),
            batched_unspent(self.client, &scripthashes, self.batch_size),
            batched_history(self.client, &scripthashes, self.batch_size),
        );
        let tip_height = tip_height?;

        let succeeded = scripthashes
            .iter()
            .filter(|sh| unspent_map.contains_key(*sh) && history_map.contains_key(*sh))
            .count() as u32;
        let queried = scripthashes.len() as u32;

        // Collect the txid universe with the best height evidence per txid.
        let mut tx_heights: BTreeMap<Txid, Option<u32>> = BTreeMap::new();
        for entries in history_map.values() {
            for entry in entries {
                let slot = tx_heights.entry(entry.txid).or_insert(None);
                if entry.height.is_some() {
                    *slot = entry.height;
                }
            }
        }

        // Stage 3: decode every transaction in the history. Details
        // already committed are reused from the cache, unless an input is
        // still unresolved or the transaction confirmed since it was
        // cached (the block time only comes with a fresh fetch); only the
        // rest goes to the server.
        let mut decoded: HashMap<Txid, DecodedTx> = HashMap::new();
        let mut details_missing: Vec<Txid> = Vec::new();
        for (&txid, height) in &tx_heights {
            if let Some(cached) = cached_details.get(&txid) {
                let reusable = !cached.has_unresolved_inputs()
                    && (cached.block_time.is_some() || height.is_none());
                if reusable {
                    if let Ok(tx) = deserialize_hex::<Transaction>(&cached.raw_hex) {
                        decoded.insert(
                            txid,
                            DecodedTx {
                                tx,
                                raw_hex: cached.raw_hex.clone(),
                                block_time: cached.block_time,
                            },
                        );
                        continue;
                    }
                }
            }
            match self.fetch_decoded(txid).await {
                Ok(tx) => {
                    decoded.insert(txid, tx);
                }
                Err(e) => {
                    warn!("Transaction {} failed to fetch or decode: {}", txid, e);
                    details_missing.push(txid);
                }
            }
        }

        // Secondary fetch: parents referenced by inputs but absent from the
        // wallet history. Failures leave the input unresolved, which is a
        // per-transaction warning rather than a snapshot failure.
        let parent_txids: HashSet<Txid> = decoded
            .values()
            .flat_map(|d| d.tx.input.iter().map(|i| i.previous_output.txid))
            .filter(|txid| !decoded.contains_key(txid))
            .collect();
        let mut parents: HashMap<Txid, Transaction> = HashMap::new();
        for txid in parent_txids {
            match self.fetch_decoded(txid).await {
                Ok(d) => {
                    parents.insert(txid, d.tx);
                }
                Err(e) => {
                    debug!("Parent {} unavailable, inputs stay unresolved: {}", txid, e);
                }
            }
        }

        let mut details = BTreeMap::new();
        let mut summaries = Vec::new();
        for (txid, height) in &tx_heights {
            let Some(d) = decoded.get(txid) else { continue };
            let detail = build_detail(d, &decoded, &parents, &by_scripthash);
            let summary = build_summary(
                d,
                &detail,
                *height,
                tip_height,
                prior_first_seen.get(txid).copied().unwrap_or(now),
            );
            summaries.push(summary);
            details.insert(*txid, detail);
        }
        // Newest first, stable under equal timestamps.
        summaries.sort_by(|a, b| {
            b.first_seen_at
                .cmp(&a.first_seen_at)
                .then_with(|| a.txid.cmp(&b.txid))
        });

        let mut utxos = Vec::new();
        for (scripthash, entries) in &unspent_map {
            let Some(record) = by_scripthash.get(scripthash.as_str()) else {
                continue;
            };
            for entry in entries {
                let script_pubkey = decoded
                    .get(&entry.txid)
                    .and_then(|d| d.tx.output.get(entry.vout as usize))
                    .map(|o| o.script_pubkey.to_bytes())
                    .unwrap_or_default();
                let mut utxo = Utxo {
                    txid: entry.txid,
                    vout: entry.vout,
                    value_sat: entry.value_sat,
                    height: entry.height,
                    address: record.address.clone(),
                    script_pubkey,
                    script_type: record.script_type,
                    scripthash: scripthash.clone(),
                    confirmations: 0,
                };
                utxo.update_confirmations(tip_height);
                utxos.push(utxo);
            }
        }
        utxos.sort_by(|a, b| a.txid.cmp(&b.txid).then(a.vout.cmp(&b.vout)));

        let meta = StagingMeta {
            server_used: self.client.server_id(),
            fetched_at: now,
            tip_height,
            scripthashes_queried: queried,
            scripthashes_succeeded: succeeded,
            tx_details_fetched: decoded.len() as u32,
            tx_details_missing: details_missing,
            is_complete: succeeded == queried,
        };

        debug!(
            "Staging snapshot built from {}: {} utxos, {} txs, tip {}, complete={}",
            meta.server_used,
            utxos.len(),
            summaries.len(),
            tip_height,
            meta.is_complete
        );

        Ok(StagingSnapshot {
            utxos,
            summaries,
            details,
            meta,
        })
    }

    async fn fetch_decoded(&self, txid: Txid) -> Result<DecodedTx, ChainError> {
        let fetched = self.client.get_transaction(txid).await?;
        let tx: Transaction =
            deserialize_hex(&fetched.raw_hex).map_err(|_| ChainError::Parse {
                what: format!("raw transaction {}", txid),
            })?;
        if tx.compute_txid() != txid {
            return Err(ChainError::Parse {
                what: format!("transaction {} (txid mismatch)", txid),
            });
        }
        Ok(DecodedTx {
            tx,
            raw_hex: fetched.raw_hex,
            block_time: fetched.block_time,
        })
    }
}

struct DecodedTx {
    tx: Transaction,
    raw_hex: String,
    block_time: Option<u64>,
}

fn script_owner<'r>(
    script_pubkey: &bitcoin::Script,
    by_scripthash: &HashMap<&str, &'r AddressRecord>,
) -> Option<&'r AddressRecord> {
    by_scripthash.get(scripthash_hex(script_pubkey).as_str()).copied()
}

fn build_detail(
    d: &DecodedTx,
    wallet_txs: &HashMap<Txid, DecodedTx>,
    parents: &HashMap<Txid, Transaction>,
    by_scripthash: &HashMap<&str, &AddressRecord>,
) -> TxDetail {
    let inputs = d
        .tx
        .input
        .iter()
        .map(|input| {
            let prev = input.previous_output;
            let prev_out = wallet_txs
                .get(&prev.txid)
                .and_then(|p| p.tx.output.get(prev.vout as usize))
                .or_else(|| {
                    parents
                        .get(&prev.txid)
                        .and_then(|p| p.output.get(prev.vout as usize))
                });
            match prev_out {
                Some(out) => {
                    let owner = script_owner(&out.script_pubkey, by_scripthash);
                    TxDetailInput {
                        prev_txid: prev.txid,
                        prev_vout: prev.vout,
                        address: owner
                            .map(|r| r.address.clone())
                            .unwrap_or_else(|| display_address(&out.script_pubkey)),
                        value_sat: out.value.to_sat(),
                        is_wallet_owned: owner.is_some(),
                    }
                }
                // Parent unavailable: empty address and zero value mark the
                // input as unresolved.
                None => TxDetailInput {
                    prev_txid: prev.txid,
                    prev_vout: prev.vout,
                    address: String::new(),
                    value_sat: 0,
                    is_wallet_owned: false,
                },
            }
        })
        .collect();

    let outputs = d
        .tx
        .output
        .iter()
        .enumerate()
        .map(|(index, out)| {
            let owner = script_owner(&out.script_pubkey, by_scripthash);
            TxDetailOutput {
                index: index as u32,
                address: owner.map(|r| r.address.clone()).or_else(|| {
                    let s = display_address(&out.script_pubkey);
                    if s.is_empty() {
                        None
                    } else {
                        Some(s)
                    }
                }),
                value_sat: out.value.to_sat(),
                script_pubkey: out.script_pubkey.to_bytes(),
                is_wallet_owned: owner.is_some(),
            }
        })
        .collect();

    TxDetail {
        txid: d.tx.compute_txid(),
        raw_hex: d.raw_hex.clone(),
        inputs,
        outputs,
        block_time: d.block_time,
        size: d.tx.total_size() as u32,
        vsize: d.tx.vsize() as u32,
    }
}

/// Best-effort display form for a third-party output script. Non-standard
/// scripts yield an empty string.
fn display_address(script: &bitcoin::Script) -> String {
    // Network only affects the human-readable prefix of third-party
    // addresses shown in detail views; ownership never goes through here.
    bitcoin::Address::from_script(script, bitcoin::Network::Bitcoin)
        .map(|a| a.to_string())
        .unwrap_or_default()
}

fn build_summary(
    d: &DecodedTx,
    detail: &TxDetail,
    height: Option<u32>,
    tip_height: u32,
    first_seen_at: u64,
) -> TxSummary {
    let wallet_in: u64 = detail
        .inputs
        .iter()
        .filter(|i| i.is_wallet_owned)
        .map(|i| i.value_sat)
        .sum();
    let wallet_out: u64 = detail
        .outputs
        .iter()
        .filter(|o| o.is_wallet_owned)
        .map(|o| o.value_sat)
        .sum();

    let direction = if wallet_in == 0 {
        TxDirection::Incoming
    } else if detail.outputs.iter().all(|o| o.is_wallet_owned) {
        TxDirection::SelfTransfer
    } else {
        TxDirection::Outgoing
    };

    // Fee is only knowable when every input resolved.
    let all_inputs_resolved = !detail.has_unresolved_inputs();
    let fee_sat = if all_inputs_resolved {
        let total_in: u64 = detail.inputs.iter().map(|i| i.value_sat).sum();
        let total_out: u64 = detail.outputs.iter().map(|o| o.value_sat).sum();
        total_in.saturating_sub(total_out)
    } else {
        0
    };
    let fee_rate = if fee_sat > 0 && detail.vsize > 0 {
        fee_sat as f64 / detail.vsize as f64
    } else {
        0.0
    };

    let is_rbf = d
        .tx
        .input
        .iter()
        .any(|i| i.sequence.to_consensus_u32() < 0xFFFF_FFFE);

    let confirmations = match height {
        Some(h) if h <= tip_height => tip_height - h + 1,
        _ => 0,
    };

    TxSummary {
        txid: detail.txid,
        first_seen_at,
        block_height: height,
        confirmations,
        direction,
        value_delta_sat: wallet_out as i64 - wallet_in as i64,
        fee_sat,
        fee_rate,
        is_rbf,
        status: if confirmations > 0 {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        },
        input_count: d.tx.input.len() as u32,
        output_count: d.tx.output.len() as u32,
        size: detail.size,
        vsize: detail.vsize,
    }
}
