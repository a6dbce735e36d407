//! Address records, script-type classification and key derivation
//!
//! Every address the wallet touches is classified exactly once into a
//! `ScriptType` when its record is created; the tag is then threaded through
//! coin selection and transaction building instead of being re-derived by
//! string matching at each call site.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::key::{CompressedPublicKey, Secp256k1, XOnlyPublicKey};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Network, Script};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// The four script families the engine supports. Each carries distinct
/// PSBT input metadata and virtual-size costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    Taproot,
    NativeSegwit,
    WrappedSegwit,
    Legacy,
}

pub const ALL_SCRIPT_TYPES: [ScriptType; 4] = [
    ScriptType::Taproot,
    ScriptType::NativeSegwit,
    ScriptType::WrappedSegwit,
    ScriptType::Legacy,
];

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Taproot => "taproot",
            ScriptType::NativeSegwit => "native-segwit",
            ScriptType::WrappedSegwit => "wrapped-segwit",
            ScriptType::Legacy => "legacy",
        }
    }

    /// Classify an address string by its prefix. This is the single place
    /// where prefix-based detection happens.
    pub fn from_address(address: &str) -> ScriptType {
        let lower = address.to_lowercase();
        if lower.starts_with("bc1p") || lower.starts_with("tb1p") || lower.starts_with("bcrt1p") {
            ScriptType::Taproot
        } else if lower.starts_with("bc1q")
            || lower.starts_with("tb1q")
            || lower.starts_with("bcrt1q")
        {
            ScriptType::NativeSegwit
        } else if lower.starts_with('3') || lower.starts_with('2') {
            ScriptType::WrappedSegwit
        } else {
            ScriptType::Legacy
        }
    }

    /// BIP purpose number for the standard derivation path of this family.
    pub fn purpose(&self) -> u32 {
        match self {
            ScriptType::Taproot => 86,
            ScriptType::NativeSegwit => 84,
            ScriptType::WrappedSegwit => 49,
            ScriptType::Legacy => 44,
        }
    }

    /// Virtual size contributed by one input of this type, including its
    /// share of witness data.
    pub fn input_vbytes(&self) -> f64 {
        match self {
            ScriptType::Taproot => 57.5,
            ScriptType::NativeSegwit => 68.0,
            ScriptType::WrappedSegwit => 91.0,
            ScriptType::Legacy => 148.0,
        }
    }

    /// Virtual size of one output paying to this type.
    pub fn output_vbytes(&self) -> f64 {
        match self {
            ScriptType::Taproot => 43.0,
            ScriptType::NativeSegwit => 31.0,
            ScriptType::WrappedSegwit => 32.0,
            ScriptType::Legacy => 34.0,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "taproot" => Ok(ScriptType::Taproot),
            "native-segwit" => Ok(ScriptType::NativeSegwit),
            "wrapped-segwit" => Ok(ScriptType::WrappedSegwit),
            "legacy" => Ok(ScriptType::Legacy),
            _ => Err(anyhow!("Invalid script type: {}", s)),
        }
    }
}

/// External (receive) or internal (change) keychain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Chain::Internal)
    }
}

/// A derived address row. Created by key derivation, later marked used by
/// discovery or sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub path: String,
    pub index: u32,
    pub is_change: bool,
    pub script_type: ScriptType,
    pub scripthash: String,
    pub is_used: bool,
    pub label: Option<String>,
}

/// Electrum-protocol scripthash: sha256 of the output script, reversed,
/// hex encoded. Used as the remote query key for every address.
pub fn scripthash_hex(script: &Script) -> String {
    let mut hash = Sha256::digest(script.as_bytes()).to_vec();
    hash.reverse();
    hex::encode(&hash)
}

/// Standard derivation path `m/purpose'/coin'/0'/chain/index` for a script
/// type on a given network.
pub fn derivation_path(
    script_type: ScriptType,
    network: Network,
    chain: Chain,
    index: u32,
) -> Result<DerivationPath> {
    let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
    let path = format!(
        "m/{}h/{}h/0h/{}/{}",
        script_type.purpose(),
        coin_type,
        chain.index(),
        index
    );
    DerivationPath::from_str(&path).with_context(|| format!("Invalid derivation path: {}", path))
}

/// Key deriver for wallets that hold key material. Watch-only and multisig
/// wallets have no deriver; discovery skips them cleanly.
#[derive(Clone)]
pub struct AddressDeriver {
    master: Xpriv,
    network: Network,
}

impl AddressDeriver {
    pub fn new(master: Xpriv, network: Network) -> Self {
        Self { master, network }
    }

    /// Build a deriver from raw seed bytes. The working copy of the seed
    /// is wiped when this function returns.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let seed = Zeroizing::new(seed.to_vec());
        let master = Xpriv::new_master(network, &seed)
            .context("Failed to derive master key from seed")?;
        Ok(Self::new(master, network))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Account-level xpub `m/purpose'/coin'/0'` for one script family.
    pub fn account_xpub(&self, script_type: ScriptType) -> Result<Xpub> {
        let secp = Secp256k1::new();
        let coin_type = if self.network == Network::Bitcoin { 0 } else { 1 };
        let path = DerivationPath::from_str(&format!(
            "m/{}h/{}h/0h",
            script_type.purpose(),
            coin_type
        ))?;
        let account_xpriv = self.master.derive_priv(&secp, &path)?;
        Ok(Xpub::from_priv(&secp, &account_xpriv))
    }

    /// Derive the secret key for one address slot. The returned key should
    /// be used immediately; SecretKey zeroizes on drop.
    pub fn derive_secret(
        &self,
        script_type: ScriptType,
        chain: Chain,
        index: u32,
    ) -> Result<SecretKey> {
        let secp = Secp256k1::new();
        let path = derivation_path(script_type, self.network, chain, index)?;
        Ok(self.master.derive_priv(&secp, &path)?.private_key)
    }

    /// Derive a full address record for one slot.
    pub fn derive_record(
        &self,
        script_type: ScriptType,
        chain: Chain,
        index: u32,
    ) -> Result<AddressRecord> {
        let secp = Secp256k1::new();
        let path = derivation_path(script_type, self.network, chain, index)?;
        let secret = self.master.derive_priv(&secp, &path)?.private_key;
        let pubkey = secret.public_key(&secp);

        let address = match script_type {
            ScriptType::Taproot => {
                let xonly = XOnlyPublicKey::from(pubkey);
                Address::p2tr(&secp, xonly, None, self.network)
            }
            ScriptType::NativeSegwit => {
                Address::p2wpkh(&CompressedPublicKey(pubkey), self.network)
            }
            ScriptType::WrappedSegwit => {
                Address::p2shwpkh(&CompressedPublicKey(pubkey), self.network)
            }
            ScriptType::Legacy => {
                Address::p2pkh(bitcoin::PublicKey::new(pubkey), self.network)
            }
        };

        let script = address.script_pubkey();

        Ok(AddressRecord {
            address: address.to_string(),
            path: path.to_string(),
            index,
            is_change: chain.is_change(),
            script_type,
            scripthash: scripthash_hex(&script),
            is_used: false,
            label: None,
        })
    }
}

/// Parse and network-check an address string, returning the parsed address
/// together with its script type tag.
pub fn parse_address(address: &str, network: Network) -> Result<(Address, ScriptType)> {
    let parsed = Address::from_str(address)
        .with_context(|| format!("Invalid address: {}", address))?
        .require_network(network)
        .with_context(|| format!("Address {} is not valid for {:?}", address, network))?;
    Ok((parsed, ScriptType::from_address(address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_classification() {
        assert_eq!(
            ScriptType::from_address("bc1pxw5z9gry9h8xjmpeuqqyz0r33"),
            ScriptType::Taproot
        );
        assert_eq!(
            ScriptType::from_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx"),
            ScriptType::NativeSegwit
        );
        assert_eq!(
            ScriptType::from_address("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7k"),
            ScriptType::NativeSegwit
        );
        assert_eq!(
            ScriptType::from_address("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"),
            ScriptType::WrappedSegwit
        );
        assert_eq!(
            ScriptType::from_address("2N3oefVeg6stiTb5Kh3ozCSkaqmx91FDbsm"),
            ScriptType::WrappedSegwit
        );
        assert_eq!(
            ScriptType::from_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"),
            ScriptType::Legacy
        );
    }

    #[test]
    fn test_script_type_round_trip() {
        for st in ALL_SCRIPT_TYPES {
            assert_eq!(st.as_str().parse::<ScriptType>().unwrap(), st);
        }
    }

    #[test]
    fn test_derivation_paths_per_family() {
        let path = derivation_path(ScriptType::Taproot, Network::Bitcoin, Chain::External, 5)
            .unwrap()
            .to_string();
        assert_eq!(path, "86'/0'/0'/0/5");

        let path = derivation_path(ScriptType::Legacy, Network::Regtest, Chain::Internal, 0)
            .unwrap()
            .to_string();
        assert_eq!(path, "44'/1'/0'/1/0");
    }

    #[test]
    fn test_derived_addresses_match_their_type() {
        let master = Xpriv::new_master(Network::Regtest, &[7u8; 32]).unwrap();
        let deriver = AddressDeriver::new(master, Network::Regtest);

        for st in ALL_SCRIPT_TYPES {
            let record = deriver.derive_record(st, Chain::External, 0).unwrap();
            assert_eq!(ScriptType::from_address(&record.address), st, "family {st}");
            assert!(!record.is_change);
            assert!(!record.is_used);
            assert_eq!(record.scripthash.len(), 64);
        }
    }

    #[test]
    fn test_scripthash_is_reversed_sha256() {
        let script_bytes = [0x51u8, 0x20, 0xaa]; // arbitrary
        let script = Script::from_bytes(&script_bytes);
        let mut expected = Sha256::digest(script_bytes).to_vec();
        expected.reverse();
        assert_eq!(scripthash_hex(script), hex::encode(expected));
    }

    #[test]
    fn test_from_seed_matches_explicit_master() {
        let seed = [3u8; 32];
        let explicit = Xpriv::new_master(Network::Regtest, &seed).unwrap();
        let from_master = AddressDeriver::new(explicit, Network::Regtest);
        let from_seed = AddressDeriver::from_seed(&seed, Network::Regtest).unwrap();

        let a = from_master
            .derive_record(ScriptType::Taproot, Chain::External, 0)
            .unwrap();
        let b = from_seed
            .derive_record(ScriptType::Taproot, Chain::External, 0)
            .unwrap();
        assert_eq!(a.address, b.address);
    }

    #[test]
    fn test_change_chain_derives_distinct_addresses() {
        let master = Xpriv::new_master(Network::Regtest, &[9u8; 32]).unwrap();
        let deriver = AddressDeriver::new(master, Network::Regtest);

        let external = deriver
            .derive_record(ScriptType::NativeSegwit, Chain::External, 0)
            .unwrap();
        let internal = deriver
            .derive_record(ScriptType::NativeSegwit, Chain::Internal, 0)
            .unwrap();
        assert_ne!(external.address, internal.address);
        assert!(internal.is_change);
    }
}
