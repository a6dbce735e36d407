//! Fee bumping: replace-by-fee and child-pays-for-parent
//!
//! Both paths start from an analysis step that decides whether a pending
//! transaction is bumpable and what the bump must achieve, then hand the
//! numbers to the transaction builder. RBF rebuilds the original payment
//! with a higher fee absorbed by a caller-designated change output; CPFP
//! spends one of the stuck transaction's wallet-owned outputs at a fee high
//! enough to lift the whole package rate.

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use tracing::info;

use crate::address::ScriptType;
use crate::coin_selection::{estimate_vsize, fee_for_vsize};
use crate::tx_builder::{BuildError, Recipient, TxBuilder, TxInputSpec, TxTemplate};
use crate::types::{TxDetail, TxStatus, TxSummary};

#[derive(Debug, thiserror::Error)]
pub enum BumpError {
    #[error("Transaction {txid} is already confirmed")]
    AlreadyConfirmed { txid: Txid },

    #[error("Transaction {txid} does not signal replaceability")]
    NotSignalingRbf { txid: Txid },

    #[error("New fee rate {offered:.2} sat/vB is below the minimum {required:.2} sat/vB")]
    RateTooLow { offered: f64, required: f64 },

    #[error("Replacement fee {new_fee_sat} sats does not exceed the original {original_fee_sat} sats")]
    FeeNotIncreased {
        original_fee_sat: u64,
        new_fee_sat: u64,
    },

    #[error("Inputs cannot cover the replacement outputs plus {fee_sat} sat fee")]
    InsufficientForBump { fee_sat: u64 },

    #[error("Change of {change_sat} sats cannot absorb the fee increase without falling below dust ({dust_sat} sats)")]
    ChangeBelowDust { change_sat: u64, dust_sat: u64 },

    #[error("Designated change address is not among the outputs of {txid}")]
    ChangeAddressMissing { txid: Txid },

    #[error("Transaction {txid} has no wallet-spendable output for CPFP")]
    NoSpendableOutput { txid: Txid },

    #[error("Output {txid}:{vout} holds {value_sat} sats, below the {required_sat} sats the child needs")]
    OutputTooSmall {
        txid: Txid,
        vout: u32,
        value_sat: u64,
        required_sat: u64,
    },

    #[error("Stored raw transaction for {txid} is corrupt: {reason}")]
    CorruptDetail { txid: Txid, reason: String },

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// What an RBF replacement must satisfy, derived from the original tx.
#[derive(Debug, Clone, PartialEq)]
pub struct RbfAnalysis {
    pub txid: Txid,
    pub original_fee_sat: u64,
    pub original_fee_rate: f64,
    /// BIP125 floor: integer part of the original rate, plus one.
    pub min_new_fee_rate: f64,
}

/// A stuck transaction's CPFP options: one entry per wallet-owned output
/// that could anchor a child.
#[derive(Debug, Clone, PartialEq)]
pub struct CpfpAnalysis {
    pub parent_txid: Txid,
    pub parent_fee_sat: u64,
    pub parent_vsize: u32,
    pub candidates: Vec<CpfpCandidate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpfpCandidate {
    pub vout: u32,
    pub value_sat: u64,
    pub address: String,
    pub script_type: ScriptType,
}

impl CpfpAnalysis {
    /// Effective package fee rate if a child paying `child_fee_sat` over
    /// `child_vsize` vbytes is attached.
    pub fn package_rate(&self, child_fee_sat: u64, child_vsize: f64) -> f64 {
        (self.parent_fee_sat + child_fee_sat) as f64 / (self.parent_vsize as f64 + child_vsize)
    }
}

pub struct FeeBumper {
    dust_threshold_sat: u64,
}

impl FeeBumper {
    pub fn new(dust_threshold_sat: u64) -> Self {
        Self { dust_threshold_sat }
    }

    /// Decide whether a transaction can be replaced and at what minimum
    /// rate. Only pending, RBF-signaling transactions qualify.
    pub fn analyze_rbf(&self, summary: &TxSummary) -> Result<RbfAnalysis, BumpError> {
        if summary.status == TxStatus::Confirmed {
            return Err(BumpError::AlreadyConfirmed { txid: summary.txid });
        }
        if !summary.is_rbf {
            return Err(BumpError::NotSignalingRbf { txid: summary.txid });
        }
        Ok(RbfAnalysis {
            txid: summary.txid,
            original_fee_sat: summary.fee_sat,
            original_fee_rate: summary.fee_rate,
            min_new_fee_rate: summary.fee_rate.floor() + 1.0,
        })
    }

    /// Build the replacement template: same inputs, the original outputs
    /// (`outputs`, change included), with the fee increase taken from the
    /// output matching `change_address`. The change output is never
    /// inferred; a `change_address` absent from `outputs` fails the bump,
    /// as does a change that cannot absorb the increase without falling
    /// below dust.
    pub fn build_rbf_replacement(
        &self,
        builder: &TxBuilder,
        analysis: &RbfAnalysis,
        inputs: &[TxInputSpec],
        mut outputs: Vec<Recipient>,
        change_address: &Address,
        new_fee_rate: f64,
    ) -> Result<TxTemplate, BumpError> {
        if new_fee_rate < analysis.min_new_fee_rate {
            return Err(BumpError::RateTooLow {
                offered: new_fee_rate,
                required: analysis.min_new_fee_rate,
            });
        }

        let change_index = outputs
            .iter()
            .position(|o| o.address == *change_address)
            .ok_or(BumpError::ChangeAddressMissing {
                txid: analysis.txid,
            })?;

        let input_total: u64 = inputs.iter().map(|i| i.value_sat).sum();
        let input_types: Vec<ScriptType> = inputs.iter().map(|i| i.script_type).collect();
        let output_types: Vec<ScriptType> = outputs
            .iter()
            .map(|r| ScriptType::from_address(&r.address.to_string()))
            .collect();

        let fee_sat = fee_for_vsize(estimate_vsize(&input_types, &output_types), new_fee_rate);
        if fee_sat <= analysis.original_fee_sat {
            return Err(BumpError::FeeNotIncreased {
                original_fee_sat: analysis.original_fee_sat,
                new_fee_sat: fee_sat,
            });
        }
        let fee_delta = fee_sat - analysis.original_fee_sat;

        let change_sat = outputs[change_index].amount_sat;
        if change_sat < fee_delta + self.dust_threshold_sat {
            return Err(BumpError::ChangeBelowDust {
                change_sat: change_sat.saturating_sub(fee_delta),
                dust_sat: self.dust_threshold_sat,
            });
        }
        outputs[change_index].amount_sat = change_sat - fee_delta;

        let output_total: u64 = outputs.iter().map(|o| o.amount_sat).sum();
        if output_total + fee_sat > input_total {
            return Err(BumpError::InsufficientForBump { fee_sat });
        }

        let change = outputs.remove(change_index);
        info!(
            "RBF replacement for {}: fee {} -> {} sats, change reduced to {} sats",
            analysis.txid, analysis.original_fee_sat, fee_sat, change.amount_sat
        );

        // Replacements always re-signal so they can be bumped again.
        builder
            .build_multi(inputs, outputs, Some(change), true)
            .map_err(BumpError::from)
    }

    /// Find the outputs of a pending transaction that could anchor a CPFP
    /// child. Outputs without a known address are not wallet-spendable.
    pub fn analyze_cpfp(
        &self,
        summary: &TxSummary,
        detail: &TxDetail,
    ) -> Result<CpfpAnalysis, BumpError> {
        if summary.status == TxStatus::Confirmed {
            return Err(BumpError::AlreadyConfirmed { txid: summary.txid });
        }

        let candidates: Vec<CpfpCandidate> = detail
            .outputs
            .iter()
            .filter(|o| o.is_wallet_owned)
            .filter_map(|o| {
                o.address.as_ref().map(|address| CpfpCandidate {
                    vout: o.index,
                    value_sat: o.value_sat,
                    address: address.clone(),
                    script_type: ScriptType::from_address(address),
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(BumpError::NoSpendableOutput { txid: summary.txid });
        }

        Ok(CpfpAnalysis {
            parent_txid: summary.txid,
            parent_fee_sat: summary.fee_sat,
            parent_vsize: summary.vsize,
            candidates,
        })
    }

    /// Build the child template: one input (the chosen parent output), one
    /// output to `destination`, fee sized so the parent+child package
    /// reaches `target_package_rate`.
    pub fn build_cpfp_child(
        &self,
        builder: &TxBuilder,
        analysis: &CpfpAnalysis,
        detail: &TxDetail,
        candidate: &CpfpCandidate,
        destination: Address,
        destination_type: ScriptType,
        target_package_rate: f64,
        rbf: bool,
    ) -> Result<TxTemplate, BumpError> {
        let child_vsize = estimate_vsize(&[candidate.script_type], &[destination_type]);
        let package_vsize = analysis.parent_vsize as f64 + child_vsize;
        let package_fee = fee_for_vsize(package_vsize, target_package_rate);
        let child_fee_sat = package_fee.saturating_sub(analysis.parent_fee_sat);

        let required_sat = child_fee_sat + self.dust_threshold_sat;
        if candidate.value_sat < required_sat {
            return Err(BumpError::OutputTooSmall {
                txid: analysis.parent_txid,
                vout: candidate.vout,
                value_sat: candidate.value_sat,
                required_sat,
            });
        }

        let parent_tx: Transaction =
            deserialize_hex(&detail.raw_hex).map_err(|e| BumpError::CorruptDetail {
                txid: analysis.parent_txid,
                reason: e.to_string(),
            })?;

        let input = TxInputSpec {
            outpoint: OutPoint::new(analysis.parent_txid, candidate.vout),
            value_sat: candidate.value_sat,
            script_pubkey: parent_tx
                .output
                .get(candidate.vout as usize)
                .ok_or_else(|| BumpError::CorruptDetail {
                    txid: analysis.parent_txid,
                    reason: format!("output {} missing from raw tx", candidate.vout),
                })?
                .script_pubkey
                .clone(),
            script_type: candidate.script_type,
            prev_tx: Some(parent_tx),
        };

        info!(
            "CPFP child for {}: spends output {}, {} sat child fee lifts package to {:.2} sat/vB",
            analysis.parent_txid,
            candidate.vout,
            child_fee_sat,
            analysis.package_rate(child_fee_sat, child_vsize)
        );

        builder
            .build_single(
                &[input],
                Recipient {
                    address: destination,
                    amount_sat: candidate.value_sat - child_fee_sat,
                },
                None,
                rbf,
            )
            .map_err(BumpError::from)
    }
}
