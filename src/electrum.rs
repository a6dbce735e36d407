//! Electrum protocol client
//!
//! Thin async facade over `electrum-client`. The blocking protocol calls run
//! on the tokio blocking pool; everything above this module talks to the
//! [`ChainClient`] trait, which keeps the sync pipeline testable against a
//! scripted fake.
//!
//! Raw JSON-RPC calls are used instead of the typed client API so that
//! response parsing stays in one place and parse failures can be counted by
//! the sync validator instead of aborting the whole batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::Txid;
use electrum_client::{ElectrumApi, Param};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

/// Remote-fetch failures. `Parse` errors are counted by the validator
/// rather than treated as fatal per call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("Failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("Electrum call {method} failed: {reason}")]
    Call { method: String, reason: String },

    #[error("Unparseable {what} in server response")]
    Parse { what: String },

    #[error("Server rejected transaction broadcast: {reason}")]
    BroadcastRejected { reason: String },

    #[error("No servers configured")]
    NoServers,
}

/// One entry of `blockchain.scripthash.listunspent`. Height 0 means the
/// output is unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentEntry {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
    pub height: u32,
}

/// One entry of `blockchain.scripthash.get_history`. Electrum reports
/// height 0 for mempool transactions and -1 for mempool transactions with
/// unconfirmed parents; both map to `None` here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub height: Option<u32>,
}

/// A fetched transaction, verbose when the server supports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTx {
    pub txid: Txid,
    pub raw_hex: String,
    pub block_time: Option<u64>,
}

/// The remote calls the sync pipeline needs, as a seam for testing.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn tip_height(&self) -> Result<u32, ChainError>;
    async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentEntry>, ChainError>;
    async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryEntry>, ChainError>;
    async fn get_transaction(&self, txid: Txid) -> Result<FetchedTx, ChainError>;
    async fn broadcast(&self, raw_hex: &str) -> Result<Txid, ChainError>;
    /// Identifies the server behind this client for snapshot provenance.
    fn server_id(&self) -> String;
}

/// `electrum-client` backed implementation. One TCP session per instance;
/// the underlying client serializes calls internally.
pub struct ElectrumChainClient {
    server: String,
    client: Arc<electrum_client::Client>,
}

impl ElectrumChainClient {
    pub fn connect(server: &str) -> Result<Self, ChainError> {
        let client = electrum_client::Client::new(server).map_err(|e| ChainError::Connect {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Connected to electrum server {}", server);
        Ok(Self {
            server: server.to_string(),
            client: Arc::new(client),
        })
    }

    /// Run one raw call on the blocking pool.
    async fn raw(&self, method: &'static str, params: Vec<Param>) -> Result<Value, ChainError> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.raw_call(method, params))
            .await
            .map_err(|e| ChainError::Call {
                method: method.to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| ChainError::Call {
                method: method.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ChainClient for ElectrumChainClient {
    async fn tip_height(&self) -> Result<u32, ChainError> {
        let resp = self.raw("blockchain.headers.subscribe", Vec::new()).await?;
        parse_tip_height(&resp)
    }

    async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentEntry>, ChainError> {
        let resp = self
            .raw(
                "blockchain.scripthash.listunspent",
                vec![Param::String(scripthash.to_string())],
            )
            .await?;
        parse_unspent_list(&resp)
    }

    async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryEntry>, ChainError> {
        let resp = self
            .raw(
                "blockchain.scripthash.get_history",
                vec![Param::String(scripthash.to_string())],
            )
            .await?;
        parse_history_list(&resp)
    }

    async fn get_transaction(&self, txid: Txid) -> Result<FetchedTx, ChainError> {
        // Ask for the verbose form; servers without verbose support return a
        // bare hex string, which parse_fetched_tx accepts too.
        let resp = self
            .raw(
                "blockchain.transaction.get",
                vec![Param::String(txid.to_string()), Param::Bool(true)],
            )
            .await;
        let resp = match resp {
            Ok(v) => v,
            Err(_) => {
                self.raw(
                    "blockchain.transaction.get",
                    vec![Param::String(txid.to_string())],
                )
                .await?
            }
        };
        parse_fetched_tx(txid, &resp)
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<Txid, ChainError> {
        let resp = self
            .raw(
                "blockchain.transaction.broadcast",
                vec![Param::String(raw_hex.to_string())],
            )
            .await
            .map_err(|e| ChainError::BroadcastRejected {
                reason: e.to_string(),
            })?;
        let txid_str = resp.as_str().ok_or_else(|| ChainError::Parse {
            what: "broadcast txid".to_string(),
        })?;
        txid_str.parse().map_err(|_| ChainError::Parse {
            what: "broadcast txid".to_string(),
        })
    }

    fn server_id(&self) -> String {
        self.server.clone()
    }
}

fn parse_txid(value: &Value, what: &str) -> Result<Txid, ChainError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ChainError::Parse {
            what: what.to_string(),
        })
}

pub(crate) fn parse_tip_height(resp: &Value) -> Result<u32, ChainError> {
    resp["height"]
        .as_u64()
        .map(|h| h as u32)
        .ok_or_else(|| ChainError::Parse {
            what: "tip height".to_string(),
        })
}

pub(crate) fn parse_unspent_list(resp: &Value) -> Result<Vec<UnspentEntry>, ChainError> {
    let entries = resp.as_array().ok_or_else(|| ChainError::Parse {
        what: "listunspent array".to_string(),
    })?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        out.push(UnspentEntry {
            txid: parse_txid(&entry["tx_hash"], "unspent tx_hash")?,
            vout: entry["tx_pos"].as_u64().ok_or_else(|| ChainError::Parse {
                what: "unspent tx_pos".to_string(),
            })? as u32,
            value_sat: entry["value"].as_u64().ok_or_else(|| ChainError::Parse {
                what: "unspent value".to_string(),
            })?,
            height: entry["height"].as_u64().unwrap_or(0) as u32,
        });
    }
    Ok(out)
}

pub(crate) fn parse_history_list(resp: &Value) -> Result<Vec<HistoryEntry>, ChainError> {
    let entries = resp.as_array().ok_or_else(|| ChainError::Parse {
        what: "history array".to_string(),
    })?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let height = entry["height"].as_i64().unwrap_or(0);
        out.push(HistoryEntry {
            txid: parse_txid(&entry["tx_hash"], "history tx_hash")?,
            // 0 = mempool, -1 = mempool with unconfirmed parent
            height: if height > 0 { Some(height as u32) } else { None },
        });
    }
    Ok(out)
}

pub(crate) fn parse_fetched_tx(txid: Txid, resp: &Value) -> Result<FetchedTx, ChainError> {
    if let Some(hex) = resp.as_str() {
        return Ok(FetchedTx {
            txid,
            raw_hex: hex.to_string(),
            block_time: None,
        });
    }
    let raw_hex = resp["hex"]
        .as_str()
        .ok_or_else(|| ChainError::Parse {
            what: "transaction hex".to_string(),
        })?
        .to_string();
    Ok(FetchedTx {
        txid,
        raw_hex,
        block_time: resp["blocktime"].as_u64(),
    })
}

/// Per-server failure bookkeeping. A server's score is its consecutive
/// failure count; every success resets it to zero.
#[derive(Debug, Default, Clone)]
struct ServerHealth {
    consecutive_failures: u32,
}

/// Ordered server list with health-aware selection. The healthiest server is
/// tried first on each sync attempt; configuration order breaks ties so the
/// user's preference holds while everything is healthy.
pub struct ServerPool {
    servers: Vec<String>,
    health: Mutex<HashMap<String, ServerHealth>>,
}

impl ServerPool {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            health: Mutex::new(HashMap::new()),
        }
    }

    /// Servers in preference order for the next attempt.
    pub fn ranked(&self) -> Result<Vec<String>, ChainError> {
        if self.servers.is_empty() {
            return Err(ChainError::NoServers);
        }
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(usize, &String)> = self.servers.iter().enumerate().collect();
        ranked.sort_by_key(|(pos, server)| {
            let failures = health
                .get(*server)
                .map(|h| h.consecutive_failures)
                .unwrap_or(0);
            (failures, *pos)
        });
        Ok(ranked.into_iter().map(|(_, s)| s.clone()).collect())
    }

    pub fn record_success(&self, server: &str) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.entry(server.to_string()).or_default().consecutive_failures = 0;
    }

    pub fn record_failure(&self, server: &str) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        let entry = health.entry(server.to_string()).or_default();
        entry.consecutive_failures += 1;
        warn!(
            "Server {} failed ({} consecutive)",
            server, entry.consecutive_failures
        );
    }
}

/// Query many scripthashes in bounded chunks, tolerating per-scripthash
/// failures. Returns successful results keyed by scripthash plus the count
/// of failed queries; the validator judges whether the failure rate is
/// acceptable.
pub async fn batched_unspent(
    client: &dyn ChainClient,
    scripthashes: &[String],
    batch_size: usize,
) -> (HashMap<String, Vec<UnspentEntry>>, u32) {
    let mut results = HashMap::new();
    let mut failures = 0u32;
    for chunk in scripthashes.chunks(batch_size.max(1)) {
        // Each chunk fans out in parallel; the chunk size bounds the
        // number of in-flight requests per server.
        let fetched = join_all(chunk.iter().map(|sh| client.list_unspent(sh))).await;
        for (scripthash, result) in chunk.iter().zip(fetched) {
            match result {
                Ok(entries) => {
                    results.insert(scripthash.clone(), entries);
                }
                Err(e) => {
                    warn!("listunspent failed for {}: {}", scripthash, e);
                    failures += 1;
                }
            }
        }
        tokio::task::yield_now().await;
    }
    (results, failures)
}

/// Batched form of `get_history`, same failure semantics as
/// [`batched_unspent`].
pub async fn batched_history(
    client: &dyn ChainClient,
    scripthashes: &[String],
    batch_size: usize,
) -> (HashMap<String, Vec<HistoryEntry>>, u32) {
    let mut results = HashMap::new();
    let mut failures = 0u32;
    for chunk in scripthashes.chunks(batch_size.max(1)) {
        let fetched = join_all(chunk.iter().map(|sh| client.get_history(sh))).await;
        for (scripthash, result) in chunk.iter().zip(fetched) {
            match result {
                Ok(entries) => {
                    results.insert(scripthash.clone(), entries);
                }
                Err(e) => {
                    warn!("get_history failed for {}: {}", scripthash, e);
                    failures += 1;
                }
            }
        }
        tokio::task::yield_now().await;
    }
    (results, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TXID_HEX: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    #[test]
    fn test_parse_tip_height() {
        let resp = json!({"height": 840000, "hex": "00ff"});
        assert_eq!(parse_tip_height(&resp).unwrap(), 840000);
        assert!(parse_tip_height(&json!({"hex": "00"})).is_err());
    }

    #[test]
    fn test_parse_unspent_entries() {
        let resp = json!([
            {"tx_hash": TXID_HEX, "tx_pos": 1, "value": 50000, "height": 100},
            {"tx_hash": TXID_HEX, "tx_pos": 0, "value": 7000, "height": 0},
        ]);
        let entries = parse_unspent_list(&resp).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].vout, 1);
        assert_eq!(entries[0].value_sat, 50000);
        assert_eq!(entries[0].height, 100);
        assert_eq!(entries[1].height, 0); // unconfirmed
    }

    #[test]
    fn test_parse_unspent_rejects_missing_value() {
        let resp = json!([{"tx_hash": TXID_HEX, "tx_pos": 0, "height": 1}]);
        assert!(matches!(
            parse_unspent_list(&resp),
            Err(ChainError::Parse { .. })
        ));
    }

    #[test]
    fn test_history_height_conventions() {
        let resp = json!([
            {"tx_hash": TXID_HEX, "height": 500},
            {"tx_hash": TXID_HEX, "height": 0},
            {"tx_hash": TXID_HEX, "height": -1},
        ]);
        let entries = parse_history_list(&resp).unwrap();
        assert_eq!(entries[0].height, Some(500));
        assert_eq!(entries[1].height, None);
        assert_eq!(entries[2].height, None);
    }

    #[test]
    fn test_fetched_tx_verbose_and_plain() {
        let txid = Txid::all_zeros();

        let verbose = json!({"hex": "0200aabb", "blocktime": 1700000000u64, "size": 4});
        let tx = parse_fetched_tx(txid, &verbose).unwrap();
        assert_eq!(tx.raw_hex, "0200aabb");
        assert_eq!(tx.block_time, Some(1700000000));

        let plain = json!("0200ccdd");
        let tx = parse_fetched_tx(txid, &plain).unwrap();
        assert_eq!(tx.raw_hex, "0200ccdd");
        assert_eq!(tx.block_time, None);
    }

    #[test]
    fn test_server_pool_prefers_healthy_servers() {
        let pool = ServerPool::new(vec![
            "a:50001".to_string(),
            "b:50001".to_string(),
            "c:50001".to_string(),
        ]);

        // Configuration order while all healthy
        assert_eq!(pool.ranked().unwrap()[0], "a:50001");

        pool.record_failure("a:50001");
        pool.record_failure("a:50001");
        pool.record_failure("b:50001");
        let ranked = pool.ranked().unwrap();
        assert_eq!(ranked, vec!["c:50001", "b:50001", "a:50001"]);

        // Success resets the count
        pool.record_success("a:50001");
        assert_eq!(pool.ranked().unwrap()[0], "a:50001");
    }

    #[test]
    fn test_empty_server_pool_errors() {
        let pool = ServerPool::new(Vec::new());
        assert!(matches!(pool.ranked(), Err(ChainError::NoServers)));
    }

    /// Tracks how many scripthash queries are in flight at once.
    struct ConcurrencyMeter {
        in_flight: AtomicU32,
        peak: AtomicU32,
    }

    impl ConcurrencyMeter {
        fn new() -> Self {
            Self {
                in_flight: AtomicU32::new(0),
                peak: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainClient for ConcurrencyMeter {
        async fn tip_height(&self) -> Result<u32, ChainError> {
            Ok(100)
        }

        async fn list_unspent(&self, _scripthash: &str) -> Result<Vec<UnspentEntry>, ChainError> {
            Ok(Vec::new())
        }

        async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryEntry>, ChainError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if scripthash == "bad" {
                return Err(ChainError::Call {
                    method: "get_history".to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            Ok(Vec::new())
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
            "meter:50001".to_string()
        }
    }

    #[tokio::test]
    async fn test_batched_history_fans_out_and_tolerates_failures() {
        let meter = ConcurrencyMeter::new();
        let mut hashes: Vec<String> = (0..7).map(|i| format!("sh{i}")).collect();
        hashes.push("bad".to_string());

        let (results, failures) = batched_history(&meter, &hashes, 4).await;
        assert_eq!(results.len(), 7);
        assert_eq!(failures, 1);

        // Queries inside a chunk overlap; the chunk size caps how many.
        let peak = meter.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "chunk queries never overlapped (peak {peak})");
        assert!(peak <= 4, "chunk size did not bound concurrency (peak {peak})");
    }
}
