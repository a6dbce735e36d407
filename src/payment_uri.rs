//! BIP21-style payment URI parsing and construction
//!
//! `bitcoin:<address>?amount=<BTC-decimal>&label=<text>&message=<text>`.
//! Amounts are expressed in whole bitcoin in the URI and converted to
//! integer satoshis for the rest of the engine.

use anyhow::{anyhow, Context, Result};
use bitcoin::Network;

use crate::address::parse_address;

const SATS_PER_BTC: u64 = 100_000_000;

/// A parsed payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUri {
    pub address: String,
    pub amount_sat: Option<u64>,
    pub label: Option<String>,
    pub message: Option<String>,
}

impl PaymentUri {
    /// Parse a BIP21 URI, validating the address against the given network.
    /// A bare address string (no scheme) is accepted too.
    pub fn parse(uri: &str, network: Network) -> Result<Self> {
        let rest = uri
            .strip_prefix("bitcoin:")
            .or_else(|| uri.strip_prefix("BITCOIN:"))
            .unwrap_or(uri);

        let (address_part, query) = match rest.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (rest, None),
        };

        if address_part.is_empty() {
            return Err(anyhow!("Payment URI has no address"));
        }
        parse_address(address_part, network)?;

        let mut amount_sat = None;
        let mut label = None;
        let mut message = None;

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Malformed URI parameter: {}", pair))?;
                match key {
                    "amount" => {
                        amount_sat = Some(btc_str_to_sat(value)?);
                    }
                    "label" => label = Some(percent_decode(value)?),
                    "message" => message = Some(percent_decode(value)?),
                    // Unknown non-required parameters are ignored per BIP21;
                    // req-* parameters we don't understand must fail.
                    _ if key.starts_with("req-") => {
                        return Err(anyhow!("Unsupported required parameter: {}", key));
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            address: address_part.to_string(),
            amount_sat,
            label,
            message,
        })
    }

    /// Render the URI form. An empty parameter set yields a bare
    /// `bitcoin:<address>`.
    pub fn to_uri(&self) -> String {
        let mut params = Vec::new();
        if let Some(sats) = self.amount_sat {
            params.push(format!("amount={}", sat_to_btc_str(sats)));
        }
        if let Some(ref label) = self.label {
            params.push(format!("label={}", percent_encode(label)));
        }
        if let Some(ref message) = self.message {
            params.push(format!("message={}", percent_encode(message)));
        }

        if params.is_empty() {
            format!("bitcoin:{}", self.address)
        } else {
            format!("bitcoin:{}?{}", self.address, params.join("&"))
        }
    }
}

/// Convert a BTC decimal string ("0.001") to satoshis, rejecting more than
/// 8 fractional digits.
pub fn btc_str_to_sat(value: &str) -> Result<u64> {
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if frac.len() > 8 {
        return Err(anyhow!("Amount has more than 8 decimal places: {}", value));
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .with_context(|| format!("Invalid BTC amount: {}", value))?
    };

    let frac_sats: u64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<8}", frac);
        padded
            .parse()
            .with_context(|| format!("Invalid BTC amount: {}", value))?
    };

    whole
        .checked_mul(SATS_PER_BTC)
        .and_then(|w| w.checked_add(frac_sats))
        .ok_or_else(|| anyhow!("BTC amount overflows: {}", value))
}

/// Render satoshis as a minimal BTC decimal string.
pub fn sat_to_btc_str(sats: u64) -> String {
    let whole = sats / SATS_PER_BTC;
    let frac = sats % SATS_PER_BTC;
    if frac == 0 {
        format!("{}", whole)
    } else {
        let frac = format!("{:08}", frac);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(s: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        match b {
            b'%' => {
                let hi = chars.next().ok_or_else(|| anyhow!("Truncated percent escape"))?;
                let lo = chars.next().ok_or_else(|| anyhow!("Truncated percent escape"))?;
                let byte = u8::from_str_radix(
                    std::str::from_utf8(&[hi, lo]).context("Invalid percent escape")?,
                    16,
                )
                .context("Invalid percent escape")?;
                bytes.push(byte);
            }
            b'+' => bytes.push(b' '),
            _ => bytes.push(b),
        }
    }
    String::from_utf8(bytes).context("Percent-decoded value is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    #[test]
    fn test_btc_to_sat_conversion() {
        assert_eq!(btc_str_to_sat("1").unwrap(), 100_000_000);
        assert_eq!(btc_str_to_sat("0.001").unwrap(), 100_000);
        assert_eq!(btc_str_to_sat("0.00000001").unwrap(), 1);
        assert_eq!(btc_str_to_sat("21.5").unwrap(), 2_150_000_000);
        assert!(btc_str_to_sat("0.000000001").is_err()); // 9 decimals
        assert!(btc_str_to_sat("abc").is_err());
    }

    #[test]
    fn test_sat_to_btc_round_trip() {
        for sats in [1u64, 546, 100_000, 100_000_000, 2_150_000_000] {
            assert_eq!(btc_str_to_sat(&sat_to_btc_str(sats)).unwrap(), sats);
        }
    }

    #[test]
    fn test_parse_full_uri() {
        let uri = format!("bitcoin:{}?amount=0.001&label=Coffee%20Shop&message=order", ADDR);
        let parsed = PaymentUri::parse(&uri, bitcoin::Network::Regtest).unwrap();
        assert_eq!(parsed.address, ADDR);
        assert_eq!(parsed.amount_sat, Some(100_000));
        assert_eq!(parsed.label.as_deref(), Some("Coffee Shop"));
        assert_eq!(parsed.message.as_deref(), Some("order"));
    }

    #[test]
    fn test_parse_bare_address() {
        let parsed = PaymentUri::parse(ADDR, bitcoin::Network::Regtest).unwrap();
        assert_eq!(parsed.address, ADDR);
        assert_eq!(parsed.amount_sat, None);
    }

    #[test]
    fn test_rejects_unknown_required_param() {
        let uri = format!("bitcoin:{}?req-somethingyoudontunderstand=1", ADDR);
        assert!(PaymentUri::parse(&uri, bitcoin::Network::Regtest).is_err());
    }

    #[test]
    fn test_rejects_wrong_network_address() {
        // Mainnet address on regtest
        let uri = "bitcoin:bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4?amount=1";
        assert!(PaymentUri::parse(uri, bitcoin::Network::Regtest).is_err());
    }

    #[test]
    fn test_uri_construction_round_trip() {
        let original = PaymentUri {
            address: ADDR.to_string(),
            amount_sat: Some(250_000),
            label: Some("rent & utilities".to_string()),
            message: None,
        };
        let rendered = original.to_uri();
        assert!(rendered.starts_with("bitcoin:"));
        let parsed = PaymentUri::parse(&rendered, bitcoin::Network::Regtest).unwrap();
        assert_eq!(parsed, original);
    }
}
