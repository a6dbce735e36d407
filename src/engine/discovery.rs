//! Gap-limit address discovery
//!
//! Extends each (script type, chain) keychain until a full gap-limit window
//! of consecutive addresses shows no on-chain activity. Usage evidence from
//! earlier syncs (records already marked used) and fresh server history are
//! merged, so restoring a wallet on a new machine converges on the same
//! frontier. Rounds are hard-capped to bound the work a hostile server can
//! induce.

use tracing::{debug, info, warn};

use crate::address::{AddressDeriver, AddressRecord, Chain, ScriptType, ALL_SCRIPT_TYPES};
use crate::electrum::{batched_history, ChainClient};

/// Result of discovery across every keychain of a wallet.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    /// Full, updated address list (existing plus newly derived records,
    /// with `is_used` reflecting merged evidence).
    pub records: Vec<AddressRecord>,
    pub newly_derived: u32,
    pub newly_used: u32,
    pub rounds_used: u32,
    /// History queries that errored. Addresses behind a failed query stay
    /// unknown rather than counting as unused, and a nonzero count is
    /// surfaced to the caller since the frontier may have stopped short.
    pub failed_queries: u32,
}

pub struct AddressDiscovery {
    gap_limit: u32,
    max_rounds: u32,
    batch_size: usize,
}

impl AddressDiscovery {
    pub fn new(gap_limit: u32, max_rounds: u32, batch_size: usize) -> Self {
        Self {
            gap_limit: gap_limit.max(1),
            max_rounds: max_rounds.max(1),
            batch_size,
        }
    }

    /// Run discovery on all eight keychains (four script families, two
    /// chains each). `existing` is the wallet's current address table.
    pub async fn run(
        &self,
        client: &dyn ChainClient,
        deriver: &AddressDeriver,
        existing: Vec<AddressRecord>,
    ) -> anyhow::Result<DiscoveryOutcome> {
        let mut outcome = DiscoveryOutcome::default();

        for script_type in ALL_SCRIPT_TYPES {
            for chain in [Chain::External, Chain::Internal] {
                let chain_records: Vec<AddressRecord> = existing
                    .iter()
                    .filter(|r| r.script_type == script_type && r.is_change == chain.is_change())
                    .cloned()
                    .collect();
                let result = self
                    .discover_chain(client, deriver, script_type, chain, chain_records)
                    .await?;
                outcome.newly_derived += result.newly_derived;
                outcome.newly_used += result.newly_used;
                outcome.rounds_used = outcome.rounds_used.max(result.rounds_used);
                outcome.failed_queries += result.failed_queries;
                outcome.records.extend(result.records);
            }
        }

        info!(
            "Discovery finished: {} addresses ({} new, {} newly used)",
            outcome.records.len(),
            outcome.newly_derived,
            outcome.newly_used
        );
        Ok(outcome)
    }

    async fn discover_chain(
        &self,
        client: &dyn ChainClient,
        deriver: &AddressDeriver,
        script_type: ScriptType,
        chain: Chain,
        mut records: Vec<AddressRecord>,
    ) -> anyhow::Result<DiscoveryOutcome> {
        records.sort_by_key(|r| r.index);
        let mut outcome = DiscoveryOutcome::default();

        for round in 0..self.max_rounds {
            outcome.rounds_used = round + 1;

            // The frontier always keeps gap_limit addresses beyond the
            // highest index with usage evidence.
            let highest_used = records.iter().filter(|r| r.is_used).map(|r| r.index).max();
            let target_max = match highest_used {
                Some(used) => used + self.gap_limit,
                None => self.gap_limit - 1,
            };
            let next_index = records.iter().map(|r| r.index + 1).max().unwrap_or(0);
            for index in next_index..=target_max {
                records.push(deriver.derive_record(script_type, chain, index)?);
                outcome.newly_derived += 1;
            }

            // Query history for every address still lacking evidence; fresh
            // evidence merges with what earlier syncs recorded.
            let unused: Vec<String> = records
                .iter()
                .filter(|r| !r.is_used)
                .map(|r| r.scripthash.clone())
                .collect();
            if unused.is_empty() {
                break;
            }
            let (histories, failures) = batched_history(client, &unused, self.batch_size).await;
            if failures > 0 {
                // A failed query is not evidence of an unused address; the
                // affected scripthashes are simply absent from `histories`
                // and keep their unknown status for the next sync.
                outcome.failed_queries += failures;
                warn!(
                    "Discovery {}/{:?}: {} history queries failed; frontier may stop short",
                    script_type, chain, failures
                );
            }

            let mut found_new_use = false;
            for record in records.iter_mut().filter(|r| !r.is_used) {
                if let Some(entries) = histories.get(&record.scripthash) {
                    if !entries.is_empty() {
                        record.is_used = true;
                        outcome.newly_used += 1;
                        found_new_use = true;
                    }
                }
            }

            // A clean window: every address up to the frontier was checked
            // and nothing new turned up.
            if !found_new_use {
                break;
            }
        }

        debug!(
            "Discovery {}/{:?}: {} addresses, {} rounds",
            script_type,
            chain,
            records.len(),
            outcome.rounds_used
        );
        outcome.records = records;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electrum::{ChainError, FetchedTx, HistoryEntry, UnspentEntry};
    use async_trait::async_trait;
    use bitcoin::bip32::Xpriv;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, Txid};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fake chain that reports history for a fixed set of scripthashes and
    /// errors on another.
    struct FakeChain {
        active: HashSet<String>,
        failing: HashSet<String>,
        queries: Mutex<u32>,
    }

    impl FakeChain {
        fn new(active: impl IntoIterator<Item = String>) -> Self {
            Self {
                active: active.into_iter().collect(),
                failing: HashSet::new(),
                queries: Mutex::new(0),
            }
        }

        fn with_failing(mut self, failing: impl IntoIterator<Item = String>) -> Self {
            self.failing = failing.into_iter().collect();
            self
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn tip_height(&self) -> Result<u32, ChainError> {
            Ok(100)
        }

        async fn list_unspent(&self, _scripthash: &str) -> Result<Vec<UnspentEntry>, ChainError> {
            Ok(Vec::new())
        }

        async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryEntry>, ChainError> {
            *self.queries.lock().unwrap() += 1;
            if self.failing.contains(scripthash) {
                return Err(ChainError::Call {
                    method: "get_history".to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            if self.active.contains(scripthash) {
                Ok(vec![HistoryEntry {
                    txid: Txid::from_byte_array([1; 32]),
                    height: Some(50),
                }])
            } else {
                Ok(Vec::new())
            }
        }

        async fn get_transaction(&self, _txid: Txid) -> Result<FetchedTx, ChainError> {
            Err(ChainError::Parse {
                what: "not implemented".to_string(),
            })
        }

        async fn broadcast(&self, _raw_hex: &str) -> Result<Txid, ChainError> {
            Err(ChainError::NoServers)
        }

        fn server_id(&self) -> String {
            "fake:50001".to_string()
        }
    }

    fn deriver() -> AddressDeriver {
        let master = Xpriv::new_master(Network::Regtest, &[3u8; 32]).unwrap();
        AddressDeriver::new(master, Network::Regtest)
    }

    fn scripthash_of(deriver: &AddressDeriver, st: ScriptType, chain: Chain, index: u32) -> String {
        deriver.derive_record(st, chain, index).unwrap().scripthash
    }

    #[tokio::test]
    async fn test_unused_wallet_derives_exactly_one_gap_window() {
        let deriver = deriver();
        let chain = FakeChain::new([]);
        let discovery = AddressDiscovery::new(5, 10, 25);

        let outcome = discovery.run(&chain, &deriver, Vec::new()).await.unwrap();
        // 4 script types x 2 chains x gap_limit addresses
        assert_eq!(outcome.records.len(), 4 * 2 * 5);
        assert_eq!(outcome.newly_used, 0);
        assert!(outcome.records.iter().all(|r| !r.is_used));
    }

    #[tokio::test]
    async fn test_frontier_extends_past_used_addresses() {
        let deriver = deriver();
        // Index 3 of external native segwit is active; the frontier must
        // extend to index 3 + gap.
        let active = scripthash_of(&deriver, ScriptType::NativeSegwit, Chain::External, 3);
        let chain = FakeChain::new([active]);
        let discovery = AddressDiscovery::new(5, 10, 25);

        let outcome = discovery.run(&chain, &deriver, Vec::new()).await.unwrap();
        let segwit_external: Vec<_> = outcome
            .records
            .iter()
            .filter(|r| r.script_type == ScriptType::NativeSegwit && !r.is_change)
            .collect();
        assert_eq!(segwit_external.len(), 9); // indices 0..=8 (3 + gap 5)
        assert_eq!(outcome.newly_used, 1);
        assert!(segwit_external.iter().any(|r| r.index == 3 && r.is_used));
    }

    #[tokio::test]
    async fn test_existing_evidence_is_merged_not_refetched() {
        let deriver = deriver();
        let chain = FakeChain::new([]);
        let discovery = AddressDiscovery::new(3, 10, 25);

        // Database already knows index 2 was used.
        let mut existing = Vec::new();
        for index in 0..3u32 {
            let mut record = deriver
                .derive_record(ScriptType::Taproot, Chain::External, index)
                .unwrap();
            record.is_used = index == 2;
            existing.push(record);
        }

        let outcome = discovery.run(&chain, &deriver, existing).await.unwrap();
        let taproot_external: Vec<_> = outcome
            .records
            .iter()
            .filter(|r| r.script_type == ScriptType::Taproot && !r.is_change)
            .collect();
        // Frontier honors the stored evidence: indices 0..=5
        assert_eq!(taproot_external.len(), 6);
        assert!(taproot_external.iter().any(|r| r.index == 2 && r.is_used));
    }

    #[tokio::test]
    async fn test_failed_history_queries_are_counted_not_treated_as_unused() {
        let deriver = deriver();
        // One query errors every round; the address behind it must stay
        // unknown instead of looking like a clean gap slot, and the outcome
        // must say so.
        let failing = scripthash_of(&deriver, ScriptType::NativeSegwit, Chain::External, 1);
        let chain = FakeChain::new([]).with_failing([failing.clone()]);
        let discovery = AddressDiscovery::new(3, 10, 25);

        let outcome = discovery.run(&chain, &deriver, Vec::new()).await.unwrap();
        assert!(outcome.failed_queries >= 1);
        let record = outcome
            .records
            .iter()
            .find(|r| r.scripthash == failing)
            .unwrap();
        assert!(!record.is_used);
        assert_eq!(outcome.newly_used, 0);
    }

    #[tokio::test]
    async fn test_rounds_are_capped() {
        let deriver = deriver();
        // Every even-indexed legacy external address is active, which would
        // keep extending the frontier forever without the cap.
        let active: Vec<String> = (0..60u32)
            .filter(|i| i % 2 == 0)
            .map(|i| scripthash_of(&deriver, ScriptType::Legacy, Chain::External, i))
            .collect();
        let chain = FakeChain::new(active);
        let discovery = AddressDiscovery::new(2, 3, 25);

        let outcome = discovery.run(&chain, &deriver, Vec::new()).await.unwrap();
        assert_eq!(outcome.rounds_used, 3);
    }
}
