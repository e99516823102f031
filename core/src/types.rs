//! Primitive overlay types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest unit count per coin
pub const COIN: u64 = 100_000_000;

/// Monetary amount in base units
pub type Amount = u64;

/// 32-byte hash, displayed and serialized as lower-case hex
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

pub type BlockHash = Hash256;
pub type TxId = Hash256;

impl Hash256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash256(arr))
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a specific transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.txid, self.index)
    }
}

/// Output script a payment is locked to
///
/// The overlay never interprets script bytes; it only builds the canonical
/// pay-to-pubkey form for a collateral key and compares scripts for equality.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PayScript(pub Vec<u8>);

impl PayScript {
    /// Canonical pay-to-pubkey-hash style script for a hex-encoded key
    pub fn for_pubkey(pubkey_hex: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(pubkey_hex.as_bytes());
        let digest = hasher.finalize();
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(&digest[..20]);
        script.extend_from_slice(&[0x88, 0xac]);
        PayScript(script)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PayScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PayScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayScript({})", self.to_hex())
    }
}

impl Serialize for PayScript {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PayScript {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(PayScript)
            .map_err(serde::de::Error::custom)
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script: PayScript,
}

/// The slice of a transaction the overlay inspects: its outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn pays(&self, script: &PayScript, value: Amount) -> bool {
        self.outputs
            .iter()
            .any(|out| &out.script == script && out.value == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let h = Hash256([0xab; 32]);
        let parsed: Hash256 = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hash_rejects_bad_length() {
        assert!(Hash256::from_hex("abcd").is_err());
    }

    #[test]
    fn outpoint_display() {
        let op = OutPoint::new(Hash256([0u8; 32]), 7);
        assert!(op.to_string().ends_with("-7"));
        assert_eq!(op.to_string().len(), 66);
    }

    #[test]
    fn pay_script_is_deterministic() {
        let a = PayScript::for_pubkey("aa".repeat(32).as_str());
        let b = PayScript::for_pubkey("aa".repeat(32).as_str());
        let c = PayScript::for_pubkey("bb".repeat(32).as_str());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0.len(), 25);
    }

    #[test]
    fn transaction_pays_exact_match_only() {
        let script = PayScript::for_pubkey("aa");
        let tx = Transaction {
            outputs: vec![TxOut {
                value: 50 * COIN,
                script: script.clone(),
            }],
        };
        assert!(tx.pays(&script, 50 * COIN));
        assert!(!tx.pays(&script, 50 * COIN + 1));
        assert!(!tx.pays(&PayScript::for_pubkey("bb"), 50 * COIN));
    }
}
