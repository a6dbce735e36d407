//! Staging snapshot validation
//!
//! Pure sanity checks applied to every staging snapshot before it can
//! replace the committed state. A rejected snapshot is discarded whole; the
//! committed snapshot is never touched by a failed sync. The checks guard
//! against a lying or broken server zeroing out a wallet, silently dropping
//! history, or feeding garbage that happens to decode.

use std::collections::HashSet;

use bitcoin::Txid;
use tracing::{info, warn};

use crate::types::{LkgSnapshot, StagingSnapshot};

/// Why a staging snapshot was refused promotion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("Snapshot incomplete: {succeeded}/{queried} scripthash queries succeeded")]
    Incomplete { queried: u32, succeeded: u32 },

    #[error("Balance zero-out: committed confirmed balance of {lkg_confirmed_sat} sat vanished and the snapshot is not credible enough to accept it")]
    BalanceZeroOut { lkg_confirmed_sat: u64 },

    #[error("All {missing} previously known transactions are absent from an incomplete snapshot")]
    TxDeletion { missing: usize },

    #[error("Tip height regressed {regression} blocks (from {lkg_tip} to {staging_tip}), beyond the {tolerance} block reorg tolerance")]
    HeightRegression {
        lkg_tip: u32,
        staging_tip: u32,
        regression: u32,
        tolerance: u32,
    },

    #[error("Transaction decode failure ratio {ratio:.3} exceeds the {max_ratio:.3} maximum")]
    ParseFailures { ratio: f64, max_ratio: f64 },
}

/// Validation output: either promoted (possibly with warnings worth
/// logging) or rejected with the first failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub rejection: Option<RejectReason>,
    pub warnings: Vec<String>,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

pub struct SnapshotValidator {
    reorg_tolerance_blocks: u32,
    max_parse_failure_ratio: f64,
}

impl SnapshotValidator {
    pub fn new(reorg_tolerance_blocks: u32, max_parse_failure_ratio: f64) -> Self {
        Self {
            reorg_tolerance_blocks,
            max_parse_failure_ratio,
        }
    }

    /// Run all checks against the staging snapshot. `known_txids` is the
    /// set committed previously; a fresh wallet passes trivially.
    pub fn validate(
        &self,
        staging: &StagingSnapshot,
        lkg: &LkgSnapshot,
        known_txids: &HashSet<Txid>,
    ) -> Verdict {
        let mut warnings = Vec::new();

        // 1. Completeness: every scripthash query must have succeeded for
        // the absence of a UTXO to mean anything.
        let meta = &staging.meta;
        if !meta.is_complete || meta.scripthashes_succeeded < meta.scripthashes_queried {
            return self.reject(RejectReason::Incomplete {
                queried: meta.scripthashes_queried,
                succeeded: meta.scripthashes_succeeded,
            });
        }

        // 2. Zero-out: a positive confirmed balance dropping to zero is
        // only believable when the snapshot still shows some transaction
        // history, every detail decoded, and the tip is within the reorg
        // tolerance. A genuine spend-to-empty satisfies all of those.
        let staging_balances = staging.balances();
        if lkg.confirmed_balance_sat > 0 && staging_balances.confirmed_sat == 0 {
            let tip_ok = staging.meta.tip_height + self.reorg_tolerance_blocks
                >= lkg.tip_height_at_commit;
            if staging.summaries.is_empty() || !meta.tx_details_missing.is_empty() || !tip_ok {
                return self.reject(RejectReason::BalanceZeroOut {
                    lkg_confirmed_sat: lkg.confirmed_balance_sat,
                });
            }
            warnings.push(format!(
                "confirmed balance dropped from {} sat to zero",
                lkg.confirmed_balance_sat
            ));
            let has_new_txs = staging
                .summaries
                .iter()
                .any(|s| !known_txids.contains(&s.txid));
            if !has_new_txs {
                warnings.push(
                    "balance zero-out without any previously unseen transactions".to_string(),
                );
            }
        }

        // 3. Transaction deletion: the whole known history vanishing is
        // rejected unless the sync was provably complete, in which case an
        // address-set change is a plausible benign cause. Individual txids
        // dropping out is normal (replaced or evicted pending
        // transactions) and only worth a warning.
        let staging_txids: HashSet<Txid> = staging.summaries.iter().map(|s| s.txid).collect();
        if !known_txids.is_empty() && staging.summaries.is_empty() {
            if !meta.is_complete {
                return self.reject(RejectReason::TxDeletion {
                    missing: known_txids.len(),
                });
            }
            warnings.push(format!(
                "all {} known transactions gone from a complete snapshot",
                known_txids.len()
            ));
        } else {
            let missing = known_txids.difference(&staging_txids).count();
            if missing > 0 {
                warnings.push(format!(
                    "{} previously known transactions no longer reported (replaced or evicted)",
                    missing
                ));
            }
        }

        // 4. Tip height regression beyond the reorg tolerance means the
        // server is on a bogus or badly stale chain.
        if staging.meta.tip_height < lkg.tip_height_at_commit {
            let regression = lkg.tip_height_at_commit - staging.meta.tip_height;
            if regression > self.reorg_tolerance_blocks {
                return self.reject(RejectReason::HeightRegression {
                    lkg_tip: lkg.tip_height_at_commit,
                    staging_tip: staging.meta.tip_height,
                    regression,
                    tolerance: self.reorg_tolerance_blocks,
                });
            }
            warnings.push(format!(
                "tip regressed {} blocks, within reorg tolerance",
                regression
            ));
        }

        // 5. Parse failure ratio. A few undecodable transactions are
        // tolerated (and left out); too many means the transport or server
        // is corrupting data.
        let attempted = meta.tx_details_fetched + meta.tx_details_missing.len() as u32;
        if attempted > 0 {
            let ratio = meta.tx_details_missing.len() as f64 / attempted as f64;
            if ratio > self.max_parse_failure_ratio {
                return self.reject(RejectReason::ParseFailures {
                    ratio,
                    max_ratio: self.max_parse_failure_ratio,
                });
            }
            if !meta.tx_details_missing.is_empty() {
                warnings.push(format!(
                    "{} of {} transaction details failed to decode",
                    meta.tx_details_missing.len(),
                    attempted
                ));
            }
        }

        if !warnings.is_empty() {
            for warning in &warnings {
                warn!("Snapshot warning: {}", warning);
            }
        }
        info!(
            "Snapshot accepted: {} utxos, {} txs, tip {}",
            staging.utxos.len(),
            staging.summaries.len(),
            staging.meta.tip_height
        );
        Verdict {
            rejection: None,
            warnings,
        }
    }

    fn reject(&self, reason: RejectReason) -> Verdict {
        warn!("Snapshot rejected: {}", reason);
        Verdict {
            rejection: Some(reason),
            warnings: Vec::new(),
        }
    }
}
