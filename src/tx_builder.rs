//! Transaction building, signing and extraction
//!
//! Produces an unsigned transaction template and then signs it, dispatching
//! per input on the script family because the PSBT metadata each family
//! needs is different:
//!
//! - Taproot key-path spends carry the 32-byte tweaked output key and sign
//!   with Schnorr over the tweaked private key
//! - Native segwit inputs carry a witness UTXO only
//! - Wrapped segwit inputs add an explicit redeem script
//! - Legacy inputs require the entire previous raw transaction; building
//!   fails loudly when it is missing, since the input could never be
//!   finalized later

use anyhow::Result;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::{CompressedPublicKey, Keypair, Secp256k1, XOnlyPublicKey};
use bitcoin::psbt::Psbt;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{All, Message, Scalar, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::TapTweakHash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::{debug, info};

use crate::address::ScriptType;
use crate::coin_selection::{estimate_vsize, fee_for_vsize};
use crate::types::PreparedTx;

/// Opt-in replace-by-fee sequence number.
pub const SEQUENCE_RBF: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;
/// Final sequence, RBF disabled.
pub const SEQUENCE_FINAL: Sequence = Sequence::MAX;

/// Construction and signing failures. Always surfaced synchronously to the
/// caller; silent failure in signing or fee logic risks loss of funds.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No inputs supplied")]
    NoInputs,

    #[error("No recipients supplied")]
    NoRecipients,

    #[error("Output of {value_sat} sats is below the {dust_sat} sat dust threshold")]
    DustOutput { value_sat: u64, dust_sat: u64 },

    #[error("Outputs plus fee ({required_sat} sats) exceed inputs ({input_sat} sats)")]
    OutputsExceedInputs { input_sat: u64, required_sat: u64 },

    #[error("Send-max amount would be non-positive: {total_sat} sat inputs cannot cover {fee_sat} sat fee")]
    SendMaxNonPositive { total_sat: u64, fee_sat: u64 },

    #[error("Legacy input {index} spending {txid}:{vout} is missing its previous raw transaction")]
    MissingPrevTx { index: usize, txid: Txid, vout: u32 },

    #[error("Previous transaction attached to input {index} does not match outpoint {txid}:{vout}")]
    PrevTxMismatch { index: usize, txid: Txid, vout: u32 },

    #[error("No signing key supplied for input {index}")]
    MissingKey { index: usize },

    #[error("Signing key for input {index} does not match its output script")]
    KeyMismatch { index: usize },

    #[error("Input {index} has a malformed {script_type} script pubkey")]
    MalformedScript { index: usize, script_type: ScriptType },

    #[error("Sighash computation failed for input {index}: {reason}")]
    Sighash { index: usize, reason: String },

    #[error("Failed to extract final transaction: {0}")]
    Extract(String),
}

/// Everything the builder needs to know about one input being spent.
#[derive(Debug, Clone)]
pub struct TxInputSpec {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub script_pubkey: ScriptBuf,
    pub script_type: ScriptType,
    /// Full previous transaction. Mandatory for legacy inputs; ignored for
    /// the segwit families.
    pub prev_tx: Option<Transaction>,
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub address: Address,
    pub amount_sat: u64,
}

/// Where the signing keys come from.
///
/// `PerInput` keys are consumed and wiped the moment their input is
/// signed. `Shared` is the "signed by a single imported key" mode: one key
/// re-used across address formats, kept intact until every input is signed
/// and wiped only at the end.
pub enum SigningKeys {
    PerInput(Vec<SecretKey>),
    Shared(SecretKey),
}

/// An unsigned transaction plus the per-input context signing needs.
#[derive(Debug)]
pub struct TxTemplate {
    pub psbt: Psbt,
    pub inputs: Vec<TxInputSpec>,
    pub input_total_sat: u64,
    pub output_total_sat: u64,
    pub fee_sat: u64,
    pub change_sat: u64,
}

/// Transaction builder: template construction plus signing.
pub struct TxBuilder {
    secp: Secp256k1<All>,
    dust_threshold_sat: u64,
    signing_chunk_size: usize,
}

impl TxBuilder {
    pub fn new(dust_threshold_sat: u64, signing_chunk_size: usize) -> Self {
        Self {
            secp: Secp256k1::new(),
            dust_threshold_sat,
            signing_chunk_size: signing_chunk_size.max(1),
        }
    }

    /// Build a template paying one recipient, with optional change.
    pub fn build_single(
        &self,
        inputs: &[TxInputSpec],
        recipient: Recipient,
        change: Option<Recipient>,
        rbf: bool,
    ) -> Result<TxTemplate, BuildError> {
        self.build_multi(inputs, vec![recipient], change, rbf)
    }

    /// Build a template paying multiple recipients, with optional change.
    pub fn build_multi(
        &self,
        inputs: &[TxInputSpec],
        recipients: Vec<Recipient>,
        change: Option<Recipient>,
        rbf: bool,
    ) -> Result<TxTemplate, BuildError> {
        if inputs.is_empty() {
            return Err(BuildError::NoInputs);
        }
        if recipients.is_empty() {
            return Err(BuildError::NoRecipients);
        }

        for recipient in &recipients {
            if recipient.amount_sat < self.dust_threshold_sat {
                return Err(BuildError::DustOutput {
                    value_sat: recipient.amount_sat,
                    dust_sat: self.dust_threshold_sat,
                });
            }
        }
        if let Some(ref change) = change {
            if change.amount_sat < self.dust_threshold_sat {
                return Err(BuildError::DustOutput {
                    value_sat: change.amount_sat,
                    dust_sat: self.dust_threshold_sat,
                });
            }
        }

        let input_total_sat: u64 = inputs.iter().map(|i| i.value_sat).sum();
        let recipient_total: u64 = recipients.iter().map(|r| r.amount_sat).sum();
        let change_sat = change.as_ref().map(|c| c.amount_sat).unwrap_or(0);
        let output_total_sat = recipient_total + change_sat;

        if output_total_sat > input_total_sat {
            return Err(BuildError::OutputsExceedInputs {
                input_sat: input_total_sat,
                required_sat: output_total_sat,
            });
        }

        let mut tx_outputs: Vec<TxOut> = recipients
            .iter()
            .map(|r| TxOut {
                value: Amount::from_sat(r.amount_sat),
                script_pubkey: r.address.script_pubkey(),
            })
            .collect();
        if let Some(ref change) = change {
            tx_outputs.push(TxOut {
                value: Amount::from_sat(change.amount_sat),
                script_pubkey: change.address.script_pubkey(),
            });
        }

        self.assemble(inputs, tx_outputs, rbf).map(|psbt| TxTemplate {
            psbt,
            inputs: inputs.to_vec(),
            input_total_sat,
            output_total_sat,
            fee_sat: input_total_sat - output_total_sat,
            change_sat,
        })
    }

    /// Build a "send-max" template: spends every provided input into a
    /// single output, zero change, amount = total inputs minus the
    /// estimated fee.
    pub fn build_send_max(
        &self,
        inputs: &[TxInputSpec],
        recipient: &Address,
        recipient_type: ScriptType,
        fee_rate_sat_vb: f64,
        rbf: bool,
    ) -> Result<TxTemplate, BuildError> {
        if inputs.is_empty() {
            return Err(BuildError::NoInputs);
        }

        let input_total_sat: u64 = inputs.iter().map(|i| i.value_sat).sum();
        let input_types: Vec<ScriptType> = inputs.iter().map(|i| i.script_type).collect();
        let fee_sat = fee_for_vsize(
            estimate_vsize(&input_types, &[recipient_type]),
            fee_rate_sat_vb,
        );

        if fee_sat >= input_total_sat {
            return Err(BuildError::SendMaxNonPositive {
                total_sat: input_total_sat,
                fee_sat,
            });
        }
        let amount_sat = input_total_sat - fee_sat;

        info!(
            "Send-max: {} inputs, {} sats total, {} sat fee, {} sats to recipient",
            inputs.len(),
            input_total_sat,
            fee_sat,
            amount_sat
        );

        let tx_outputs = vec![TxOut {
            value: Amount::from_sat(amount_sat),
            script_pubkey: recipient.script_pubkey(),
        }];

        self.assemble(inputs, tx_outputs, rbf).map(|psbt| TxTemplate {
            psbt,
            inputs: inputs.to_vec(),
            input_total_sat,
            output_total_sat: amount_sat,
            fee_sat,
            change_sat: 0,
        })
    }

    /// Construct the unsigned transaction and populate per-input PSBT
    /// metadata for each script family.
    fn assemble(
        &self,
        inputs: &[TxInputSpec],
        outputs: Vec<TxOut>,
        rbf: bool,
    ) -> Result<Psbt, BuildError> {
        let sequence = if rbf { SEQUENCE_RBF } else { SEQUENCE_FINAL };

        let tx_inputs: Vec<TxIn> = inputs
            .iter()
            .map(|spec| TxIn {
                previous_output: spec.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect();

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
            .map_err(|e| BuildError::Extract(e.to_string()))?;

        for (index, spec) in inputs.iter().enumerate() {
            let witness_utxo = TxOut {
                value: Amount::from_sat(spec.value_sat),
                script_pubkey: spec.script_pubkey.clone(),
            };

            match spec.script_type {
                ScriptType::Taproot => {
                    // The advertised key must be the tweaked output key from
                    // the script pubkey, not the internal key; a signer
                    // checking against the internal key would verify against
                    // the wrong script and fail silently.
                    let output_key = taproot_output_key(&spec.script_pubkey)
                        .ok_or(BuildError::MalformedScript {
                            index,
                            script_type: ScriptType::Taproot,
                        })?;
                    psbt.inputs[index].witness_utxo = Some(witness_utxo);
                    psbt.inputs[index].tap_internal_key = Some(output_key);
                }
                ScriptType::NativeSegwit => {
                    psbt.inputs[index].witness_utxo = Some(witness_utxo);
                }
                ScriptType::WrappedSegwit => {
                    psbt.inputs[index].witness_utxo = Some(witness_utxo);
                    // Redeem script is attached at signing time once the
                    // public key is known.
                }
                ScriptType::Legacy => {
                    let prev_tx = spec.prev_tx.as_ref().ok_or(BuildError::MissingPrevTx {
                        index,
                        txid: spec.outpoint.txid,
                        vout: spec.outpoint.vout,
                    })?;
                    if prev_tx.compute_txid() != spec.outpoint.txid
                        || prev_tx.output.len() <= spec.outpoint.vout as usize
                    {
                        return Err(BuildError::PrevTxMismatch {
                            index,
                            txid: spec.outpoint.txid,
                            vout: spec.outpoint.vout,
                        });
                    }
                    psbt.inputs[index].non_witness_utxo = Some(prev_tx.clone());
                }
            }
        }

        debug!(
            "Assembled template: {} inputs, {} outputs, rbf={}",
            psbt.inputs.len(),
            psbt.unsigned_tx.output.len(),
            rbf
        );

        Ok(psbt)
    }

    /// Sign every input of a template and extract the final transaction.
    ///
    /// Per-input keys are wiped with `non_secure_erase` as soon as their
    /// input is signed; a shared imported key survives until the last
    /// input and is wiped before this returns. SecretKey does not clear
    /// its bytes on drop, so the wipe must be explicit (and remains
    /// best-effort: the compiler is free to keep copies).
    pub fn sign(&self, template: TxTemplate, keys: SigningKeys) -> Result<PreparedTx, BuildError> {
        let mut template = template;
        match keys {
            SigningKeys::PerInput(keys) => {
                if keys.len() != template.inputs.len() {
                    return Err(BuildError::MissingKey { index: keys.len() });
                }
                for (index, mut key) in keys.into_iter().enumerate() {
                    let result = self.sign_input(&mut template, index, &key);
                    key.non_secure_erase();
                    result?;
                }
            }
            SigningKeys::Shared(mut key) => {
                for index in 0..template.inputs.len() {
                    if let Err(e) = self.sign_input(&mut template, index, &key) {
                        key.non_secure_erase();
                        return Err(e);
                    }
                }
                key.non_secure_erase();
            }
        }
        self.extract(template)
    }

    /// Async variant of [`sign`] that yields control periodically so large
    /// input sets do not block a host UI thread.
    pub async fn sign_chunked(
        &self,
        template: TxTemplate,
        keys: SigningKeys,
    ) -> Result<PreparedTx, BuildError> {
        let mut template = template;
        match keys {
            SigningKeys::PerInput(keys) => {
                if keys.len() != template.inputs.len() {
                    return Err(BuildError::MissingKey { index: keys.len() });
                }
                for (index, mut key) in keys.into_iter().enumerate() {
                    let result = self.sign_input(&mut template, index, &key);
                    key.non_secure_erase();
                    result?;
                    if (index + 1) % self.signing_chunk_size == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }
            SigningKeys::Shared(mut key) => {
                for index in 0..template.inputs.len() {
                    if let Err(e) = self.sign_input(&mut template, index, &key) {
                        key.non_secure_erase();
                        return Err(e);
                    }
                    if (index + 1) % self.signing_chunk_size == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                key.non_secure_erase();
            }
        }
        self.extract(template)
    }

    /// Sign one input, dispatching on its script type tag.
    fn sign_input(
        &self,
        template: &mut TxTemplate,
        index: usize,
        key: &SecretKey,
    ) -> Result<(), BuildError> {
        match template.inputs[index].script_type {
            ScriptType::Taproot => self.sign_taproot(template, index, key),
            ScriptType::NativeSegwit => self.sign_segwit(template, index, key, false),
            ScriptType::WrappedSegwit => self.sign_segwit(template, index, key, true),
            ScriptType::Legacy => self.sign_legacy(template, index, key),
        }
    }

    fn sign_taproot(
        &self,
        template: &mut TxTemplate,
        index: usize,
        key: &SecretKey,
    ) -> Result<(), BuildError> {
        let expected = taproot_output_key(&template.inputs[index].script_pubkey).ok_or(
            BuildError::MalformedScript {
                index,
                script_type: ScriptType::Taproot,
            },
        )?;

        // Accept either the untweaked internal key (apply the BIP341 tweak
        // here) or an already-tweaked key, verifying against the output key
        // in both cases.
        let mut tweaked = tweak_taproot_key(&self.secp, key)
            .map_err(|_| BuildError::KeyMismatch { index })?;
        let mut signing_key = if XOnlyPublicKey::from(tweaked.public_key(&self.secp)) == expected {
            tweaked
        } else if XOnlyPublicKey::from(key.public_key(&self.secp)) == expected {
            *key
        } else {
            tweaked.non_secure_erase();
            return Err(BuildError::KeyMismatch { index });
        };

        let prevouts: Vec<TxOut> = template
            .inputs
            .iter()
            .map(|spec| TxOut {
                value: Amount::from_sat(spec.value_sat),
                script_pubkey: spec.script_pubkey.clone(),
            })
            .collect();
        let prevouts_refs: Vec<&TxOut> = prevouts.iter().collect();

        let mut cache = SighashCache::new(&template.psbt.unsigned_tx);
        let sighash = cache
            .taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts_refs),
                TapSighashType::Default,
            )
            .map_err(|e| BuildError::Sighash {
                index,
                reason: e.to_string(),
            })?;

        let msg = Message::from_digest(sighash.to_byte_array());
        let mut keypair = Keypair::from_secret_key(&self.secp, &signing_key);
        // Local key copies are wiped once the keypair holds the material.
        signing_key.non_secure_erase();
        tweaked.non_secure_erase();
        let signature = self.secp.sign_schnorr(&msg, &keypair);
        keypair.non_secure_erase();

        let taproot_sig = bitcoin::taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        };
        template.psbt.inputs[index].final_script_witness =
            Some(Witness::from_slice(&[taproot_sig.to_vec()]));

        debug!("Signed input {} (taproot key-path)", index);
        Ok(())
    }

    fn sign_segwit(
        &self,
        template: &mut TxTemplate,
        index: usize,
        key: &SecretKey,
        wrapped: bool,
    ) -> Result<(), BuildError> {
        let pubkey = key.public_key(&self.secp);
        let compressed = CompressedPublicKey(pubkey);
        let wpkh = compressed.wpubkey_hash();
        let witness_script = ScriptBuf::new_p2wpkh(&wpkh);

        // The key must hash to the output we are spending.
        let spk = &template.inputs[index].script_pubkey;
        let matches = if wrapped {
            *spk == ScriptBuf::new_p2sh(&witness_script.script_hash())
        } else {
            *spk == witness_script
        };
        if !matches {
            return Err(BuildError::KeyMismatch { index });
        }

        let value = Amount::from_sat(template.inputs[index].value_sat);
        let mut cache = SighashCache::new(&template.psbt.unsigned_tx);
        let sighash = cache
            .p2wpkh_signature_hash(index, &witness_script, value, EcdsaSighashType::All)
            .map_err(|e| BuildError::Sighash {
                index,
                reason: e.to_string(),
            })?;

        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = bitcoin::ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&msg, key),
            sighash_type: EcdsaSighashType::All,
        };

        template.psbt.inputs[index].final_script_witness =
            Some(Witness::p2wpkh(&signature, &pubkey));

        if wrapped {
            // P2SH-P2WPKH: script_sig is a single push of the redeem script.
            let redeem = PushBytesBuf::try_from(witness_script.to_bytes())
                .map_err(|_| BuildError::MalformedScript {
                    index,
                    script_type: ScriptType::WrappedSegwit,
                })?;
            template.psbt.inputs[index].redeem_script = Some(witness_script);
            template.psbt.inputs[index].final_script_sig = Some(
                bitcoin::script::Builder::new().push_slice(redeem).into_script(),
            );
        }

        debug!(
            "Signed input {} ({})",
            index,
            if wrapped { "wrapped segwit" } else { "native segwit" }
        );
        Ok(())
    }

    fn sign_legacy(
        &self,
        template: &mut TxTemplate,
        index: usize,
        key: &SecretKey,
    ) -> Result<(), BuildError> {
        let spec = &template.inputs[index];

        // The previous tx was checked at build time; re-verify the spent
        // output's value against it before signing.
        let prev_tx = spec.prev_tx.as_ref().ok_or(BuildError::MissingPrevTx {
            index,
            txid: spec.outpoint.txid,
            vout: spec.outpoint.vout,
        })?;
        let prev_out = prev_tx
            .output
            .get(spec.outpoint.vout as usize)
            .ok_or(BuildError::PrevTxMismatch {
                index,
                txid: spec.outpoint.txid,
                vout: spec.outpoint.vout,
            })?;
        if prev_out.value.to_sat() != spec.value_sat || prev_out.script_pubkey != spec.script_pubkey
        {
            return Err(BuildError::PrevTxMismatch {
                index,
                txid: spec.outpoint.txid,
                vout: spec.outpoint.vout,
            });
        }

        let pubkey = bitcoin::PublicKey::new(key.public_key(&self.secp));
        if spec.script_pubkey != ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) {
            return Err(BuildError::KeyMismatch { index });
        }

        let script_pubkey = spec.script_pubkey.clone();
        let cache = SighashCache::new(&template.psbt.unsigned_tx);
        let sighash = cache
            .legacy_signature_hash(index, &script_pubkey, EcdsaSighashType::All.to_u32())
            .map_err(|e| BuildError::Sighash {
                index,
                reason: e.to_string(),
            })?;

        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = bitcoin::ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&msg, key),
            sighash_type: EcdsaSighashType::All,
        };

        let sig_push = PushBytesBuf::try_from(signature.to_vec()).map_err(|_| {
            BuildError::MalformedScript {
                index,
                script_type: ScriptType::Legacy,
            }
        })?;
        let pk_push = PushBytesBuf::try_from(pubkey.to_bytes()).map_err(|_| {
            BuildError::MalformedScript {
                index,
                script_type: ScriptType::Legacy,
            }
        })?;
        template.psbt.inputs[index].final_script_sig = Some(
            bitcoin::script::Builder::new()
                .push_slice(sig_push)
                .push_slice(pk_push)
                .into_script(),
        );

        debug!("Signed input {} (legacy)", index);
        Ok(())
    }

    fn extract(&self, template: TxTemplate) -> Result<PreparedTx, BuildError> {
        // Every signed input carries a final witness, a final script_sig,
        // or both; an input with neither was never signed.
        let unsigned_count = template
            .psbt
            .inputs
            .iter()
            .filter(|input| {
                input.final_script_witness.is_none() && input.final_script_sig.is_none()
            })
            .count();
        if unsigned_count > 0 {
            return Err(BuildError::Extract(format!(
                "{} inputs not fully signed",
                unsigned_count
            )));
        }

        let tx = template
            .psbt
            .extract_tx()
            .map_err(|e| BuildError::Extract(e.to_string()))?;
        let txid = tx.compute_txid();
        let raw_hex = bitcoin::consensus::encode::serialize_hex(&tx);

        info!(
            "Transaction ready: txid {}, {} inputs, {} outputs, {} sat fee",
            txid,
            tx.input.len(),
            tx.output.len(),
            template.fee_sat
        );

        Ok(PreparedTx {
            input_total_sat: template.input_total_sat,
            output_total_sat: template.output_total_sat,
            fee_sat: template.fee_sat,
            change_sat: template.change_sat,
            raw_hex,
            txid,
        })
    }
}

/// Extract the x-only output key from a P2TR script pubkey
/// (`OP_1 <32-byte key>`).
pub fn taproot_output_key(script_pubkey: &ScriptBuf) -> Option<XOnlyPublicKey> {
    let bytes = script_pubkey.as_bytes();
    if bytes.len() != 34 || bytes[0] != 0x51 || bytes[1] != 0x20 {
        return None;
    }
    XOnlyPublicKey::from_slice(&bytes[2..34]).ok()
}

/// Apply the BIP341 key-path tweak to an internal key. The internal key is
/// negated first when its point has odd parity, then the TapTweak of its
/// x-only form (no script tree) is added.
pub fn tweak_taproot_key(secp: &Secp256k1<All>, internal: &SecretKey) -> Result<SecretKey> {
    let mut key = *internal;

    let has_odd_y = key.public_key(secp).serialize()[0] == 0x03;
    if has_odd_y {
        key = key.negate();
    }

    let internal_xonly = XOnlyPublicKey::from(key.public_key(secp));
    let tweak_hash = TapTweakHash::from_key_and_tweak(internal_xonly, None);
    let tweak = Scalar::from_be_bytes(tweak_hash.to_byte_array())
        .map_err(|_| anyhow::anyhow!("Invalid tweak scalar"))?;

    key.add_tweak(&tweak)
        .map_err(|_| anyhow::anyhow!("Failed to apply taproot tweak"))
}
