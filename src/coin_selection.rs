//! Coin selection for transaction construction
//!
//! Pure, stateless selection over caller-supplied UTXO snapshots: safe to
//! call from any context, including while a sync is in flight. Largest-first
//! greedy accumulation with the fee re-estimated on every iteration from
//! per-script-type virtual-size tables.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::address::ScriptType;
use crate::types::Utxo;

/// Fixed transaction overhead in vbytes: version, segwit marker/flag share,
/// input/output counts, locktime.
pub const TX_OVERHEAD_VBYTES: f64 = 10.5;

/// Selection failures consumers match on.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient funds: have {available_sat} sats, need {required_sat} sats (including {fee_sat} fee)")]
    Insufficient {
        available_sat: u64,
        required_sat: u64,
        fee_sat: u64,
    },

    #[error("Dust fold inflated fee to {folded_fee_sat} sats, over {cap}x the {estimated_fee_sat} sat estimate - selection bug suspected")]
    DustFoldExceedsCap {
        folded_fee_sat: u64,
        estimated_fee_sat: u64,
        cap: f64,
    },

    #[error("No spendable outputs")]
    NoCandidates,
}

/// Result of a successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub input_total_sat: u64,
    pub fee_sat: u64,
    /// Zero when change was folded into the fee or none was requested.
    pub change_sat: u64,
}

/// Estimate virtual size for a set of input and output script types.
pub fn estimate_vsize(inputs: &[ScriptType], outputs: &[ScriptType]) -> f64 {
    TX_OVERHEAD_VBYTES
        + inputs.iter().map(|t| t.input_vbytes()).sum::<f64>()
        + outputs.iter().map(|t| t.output_vbytes()).sum::<f64>()
}

/// Fee for a given vsize at a rate, rounded up.
pub fn fee_for_vsize(vsize: f64, fee_rate_sat_vb: f64) -> u64 {
    (vsize * fee_rate_sat_vb).ceil() as u64
}

/// Cheap structural hash of a UTXO set, used to key the sort cache. FNV-1a
/// over identity and value; collisions only cost a redundant re-sort check.
fn structural_hash(utxos: &[Utxo]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut mix = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for utxo in utxos {
        mix(utxo.txid.as_ref());
        mix(&utxo.vout.to_le_bytes());
        mix(&utxo.value_sat.to_le_bytes());
    }
    hash
}

/// Coin selector with a cached descending sort of the last-seen UTXO set.
pub struct CoinSelector {
    dust_threshold_sat: u64,
    dust_fold_fee_cap: f64,
    sort_cache: Mutex<Option<(u64, Vec<Utxo>)>>,
}

impl CoinSelector {
    pub fn new(dust_threshold_sat: u64, dust_fold_fee_cap: f64) -> Self {
        Self {
            dust_threshold_sat,
            dust_fold_fee_cap,
            sort_cache: Mutex::new(None),
        }
    }

    pub fn dust_threshold_sat(&self) -> u64 {
        self.dust_threshold_sat
    }

    /// Return the candidate set sorted by value descending, reusing the
    /// cached sort when the set is structurally unchanged.
    fn sorted_descending(&self, utxos: &[Utxo]) -> Vec<Utxo> {
        let hash = structural_hash(utxos);
        let mut cache = self.sort_cache.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((cached_hash, ref sorted)) = *cache {
            if cached_hash == hash && sorted.len() == utxos.len() {
                debug!("Coin selector: reusing cached sort ({} candidates)", sorted.len());
                return sorted.clone();
            }
        }

        let mut sorted = utxos.to_vec();
        sorted.sort_by(|a, b| b.value_sat.cmp(&a.value_sat));
        *cache = Some((hash, sorted.clone()));
        sorted
    }

    /// Select UTXOs to cover `target_sat` plus fees at `fee_rate_sat_vb`.
    ///
    /// `change_type` present means the caller intends a change output; the
    /// fee estimate then includes it. Positive change below the dust
    /// threshold is folded into the fee instead of creating an output,
    /// subject to the configured sanity cap.
    pub fn select(
        &self,
        utxos: &[Utxo],
        target_sat: u64,
        fee_rate_sat_vb: f64,
        recipient_types: &[ScriptType],
        change_type: Option<ScriptType>,
    ) -> Result<Selection, SelectionError> {
        if utxos.is_empty() {
            return Err(SelectionError::NoCandidates);
        }

        let candidates = self.sorted_descending(utxos);
        let available_sat: u64 = candidates.iter().map(|u| u.value_sat).sum();

        let mut output_types: Vec<ScriptType> = recipient_types.to_vec();
        if let Some(change) = change_type {
            output_types.push(change);
        }

        let mut selected: Vec<Utxo> = Vec::new();
        let mut input_types: Vec<ScriptType> = Vec::new();
        let mut input_total_sat = 0u64;
        let mut fee_sat = 0u64;

        // Greedy largest-first: re-estimate the fee each time an input is
        // added, since the input's own vbytes raise the requirement.
        for utxo in candidates {
            input_total_sat += utxo.value_sat;
            input_types.push(utxo.script_type);
            selected.push(utxo);

            fee_sat = fee_for_vsize(
                estimate_vsize(&input_types, &output_types),
                fee_rate_sat_vb,
            );

            if input_total_sat >= target_sat + fee_sat {
                break;
            }
        }

        if input_total_sat < target_sat + fee_sat {
            return Err(SelectionError::Insufficient {
                available_sat,
                required_sat: target_sat + fee_sat,
                fee_sat,
            });
        }

        let excess_sat = input_total_sat - target_sat - fee_sat;

        let (fee_sat, change_sat) = match change_type {
            Some(change) if excess_sat >= self.dust_threshold_sat => {
                debug!(
                    "Selected {} inputs, {} sat fee, {} sat change ({})",
                    selected.len(),
                    fee_sat,
                    excess_sat,
                    change
                );
                (fee_sat, excess_sat)
            }
            Some(_) if excess_sat > 0 => {
                // Sub-dust change is not worth an output: fold into the fee,
                // minus the vbytes the change output no longer costs.
                let without_change = fee_for_vsize(
                    estimate_vsize(&input_types, recipient_types),
                    fee_rate_sat_vb,
                );
                let folded_fee = input_total_sat - target_sat;
                let cap = (without_change as f64 * self.dust_fold_fee_cap).ceil() as u64;
                if folded_fee > cap {
                    warn!(
                        "Dust fold would pay {} sats against a {} sat estimate - rejecting",
                        folded_fee, without_change
                    );
                    return Err(SelectionError::DustFoldExceedsCap {
                        folded_fee_sat: folded_fee,
                        estimated_fee_sat: without_change,
                        cap: self.dust_fold_fee_cap,
                    });
                }
                info!("Folding {} sat sub-dust change into fee", excess_sat);
                (folded_fee, 0)
            }
            // Exact hit, or the caller asked for no change output: all
            // excess goes to fee by construction.
            _ => (input_total_sat - target_sat, 0),
        };

        Ok(Selection {
            inputs: selected,
            input_total_sat,
            fee_sat,
            change_sat,
        })
    }

    /// Spend-all amount: every economical UTXO into a single output of the
    /// given type, zero change. Returns 0 when fees exceed the total.
    pub fn calculate_max_sendable(
        &self,
        utxos: &[Utxo],
        fee_rate_sat_vb: f64,
        recipient_type: ScriptType,
    ) -> u64 {
        let spendable = self.filter_dust(utxos, fee_rate_sat_vb);
        if spendable.is_empty() {
            return 0;
        }

        let total: u64 = spendable.iter().map(|u| u.value_sat).sum();
        let input_types: Vec<ScriptType> = spendable.iter().map(|u| u.script_type).collect();
        let fee = fee_for_vsize(
            estimate_vsize(&input_types, &[recipient_type]),
            fee_rate_sat_vb,
        );

        total.saturating_sub(fee)
    }

    /// Drop outputs not worth the cost of spending them at the current rate.
    pub fn filter_dust(&self, utxos: &[Utxo], fee_rate_sat_vb: f64) -> Vec<Utxo> {
        utxos
            .iter()
            .filter(|u| {
                let spend_cost = fee_for_vsize(u.script_type.input_vbytes(), fee_rate_sat_vb);
                u.value_sat > spend_cost
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn utxo(n: u8, value_sat: u64, script_type: ScriptType) -> Utxo {
        Utxo {
            txid: Txid::from_byte_array([n; 32]),
            vout: 0,
            value_sat,
            height: 100,
            address: String::new(),
            script_pubkey: Vec::new(),
            script_type,
            scripthash: String::new(),
            confirmations: 1,
        }
    }

    fn selector() -> CoinSelector {
        CoinSelector::new(546, 5.0)
    }

    #[test]
    fn test_selects_largest_first() {
        let utxos = vec![
            utxo(1, 10_000, ScriptType::NativeSegwit),
            utxo(2, 100_000, ScriptType::NativeSegwit),
            utxo(3, 50_000, ScriptType::NativeSegwit),
        ];
        let selection = selector()
            .select(
                &utxos,
                60_000,
                2.0,
                &[ScriptType::NativeSegwit],
                Some(ScriptType::NativeSegwit),
            )
            .unwrap();
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value_sat, 100_000);
        assert!(selection.input_total_sat >= 60_000 + selection.fee_sat);
        assert_eq!(
            selection.input_total_sat,
            60_000 + selection.fee_sat + selection.change_sat
        );
    }

    #[test]
    fn test_fee_grows_with_each_added_input() {
        let utxos = vec![
            utxo(1, 30_000, ScriptType::Legacy),
            utxo(2, 30_000, ScriptType::Legacy),
            utxo(3, 30_000, ScriptType::Legacy),
        ];
        let selection = selector()
            .select(
                &utxos,
                55_000,
                10.0,
                &[ScriptType::NativeSegwit],
                Some(ScriptType::NativeSegwit),
            )
            .unwrap();
        // Two legacy inputs at 148 vB each plus overhead and two outputs:
        // well above a single-input estimate.
        assert_eq!(selection.inputs.len(), 2);
        let single_input_fee =
            fee_for_vsize(
                estimate_vsize(
                    &[ScriptType::Legacy],
                    &[ScriptType::NativeSegwit, ScriptType::NativeSegwit],
                ),
                10.0,
            );
        assert!(selection.fee_sat > single_input_fee);
    }

    #[test]
    fn test_insufficient_returns_error_never_negative_change() {
        let utxos = vec![utxo(1, 5_000, ScriptType::NativeSegwit)];
        let err = selector()
            .select(
                &utxos,
                5_000,
                5.0,
                &[ScriptType::NativeSegwit],
                Some(ScriptType::NativeSegwit),
            )
            .unwrap_err();
        assert!(matches!(err, SelectionError::Insufficient { .. }));
    }

    #[test]
    fn test_selection_covers_target_plus_fee() {
        // Termination property over a spread of targets.
        let utxos: Vec<Utxo> = (1..=10)
            .map(|n| utxo(n, n as u64 * 7_000, ScriptType::NativeSegwit))
            .collect();
        for target in [1_000u64, 25_000, 100_000, 300_000] {
            match selector().select(
                &utxos,
                target,
                3.0,
                &[ScriptType::Taproot],
                Some(ScriptType::NativeSegwit),
            ) {
                Ok(sel) => {
                    assert!(sel.input_total_sat >= target + sel.fee_sat);
                    assert_eq!(sel.input_total_sat, target + sel.fee_sat + sel.change_sat);
                }
                Err(SelectionError::Insufficient { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_sub_dust_change_folds_into_fee() {
        // Input covers target + fee with ~300 sats left over: below dust,
        // so no change output and the excess lands in the fee.
        let fee_two_outputs = fee_for_vsize(
            estimate_vsize(
                &[ScriptType::NativeSegwit],
                &[ScriptType::NativeSegwit, ScriptType::NativeSegwit],
            ),
            2.0,
        );
        let target = 50_000u64;
        let utxos = vec![utxo(1, target + fee_two_outputs + 300, ScriptType::NativeSegwit)];

        let selection = selector()
            .select(
                &utxos,
                target,
                2.0,
                &[ScriptType::NativeSegwit],
                Some(ScriptType::NativeSegwit),
            )
            .unwrap();
        assert_eq!(selection.change_sat, 0);
        assert_eq!(selection.fee_sat, selection.input_total_sat - target);
    }

    #[test]
    fn test_dust_fold_cap_rejects_runaway_fee() {
        // Cap of 1.0: any fold above the bare estimate must reject.
        let tight = CoinSelector::new(100_000, 1.0);
        let utxos = vec![utxo(1, 200_000, ScriptType::NativeSegwit)];
        let err = tight
            .select(
                &utxos,
                120_000,
                1.0,
                &[ScriptType::NativeSegwit],
                Some(ScriptType::NativeSegwit),
            )
            .unwrap_err();
        assert!(matches!(err, SelectionError::DustFoldExceedsCap { .. }));
    }

    #[test]
    fn test_max_sendable_is_total_minus_fee() {
        let utxos = vec![
            utxo(1, 50_000, ScriptType::NativeSegwit),
            utxo(2, 30_000, ScriptType::Taproot),
        ];
        let max = selector().calculate_max_sendable(&utxos, 2.0, ScriptType::NativeSegwit);
        let fee = fee_for_vsize(
            estimate_vsize(
                &[ScriptType::NativeSegwit, ScriptType::Taproot],
                &[ScriptType::NativeSegwit],
            ),
            2.0,
        );
        assert_eq!(max, 80_000 - fee);
    }

    #[test]
    fn test_filter_dust_drops_uneconomical_outputs() {
        let utxos = vec![
            utxo(1, 100, ScriptType::NativeSegwit), // below spend cost at 2 sat/vB
            utxo(2, 50_000, ScriptType::NativeSegwit),
        ];
        let kept = selector().filter_dust(&utxos, 2.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value_sat, 50_000);

        // At a very high rate even mid-sized legacy outputs become dust.
        let utxos = vec![utxo(3, 10_000, ScriptType::Legacy)];
        assert!(selector().filter_dust(&utxos, 100.0).is_empty());
    }

    #[test]
    fn test_sort_cache_reused_for_unchanged_set() {
        let sel = selector();
        let utxos = vec![
            utxo(1, 10_000, ScriptType::NativeSegwit),
            utxo(2, 20_000, ScriptType::NativeSegwit),
        ];
        let first = sel.sorted_descending(&utxos);
        let second = sel.sorted_descending(&utxos);
        assert_eq!(first, second);
        assert_eq!(first[0].value_sat, 20_000);

        // Changing a value invalidates the cache.
        let mut changed = utxos.clone();
        changed[0].value_sat = 30_000;
        let third = sel.sorted_descending(&changed);
        assert_eq!(third[0].value_sat, 30_000);
    }
}
