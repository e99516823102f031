//! Meridian cryptography
//!
//! Keypairs, canonical-string message signing and hashing for the
//! service-node overlay. Overlay messages are always signed as UTF-8
//! strings built by concatenating field encodings; verification rebuilds
//! the exact string, so any divergence fails.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("message does not match signature")]
    MessageMismatch,
}

/// Operational or collateral key pair
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore a keypair from its hex-encoded secret
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Public key as a hex string
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Secret key as a hex string
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Short key identifier embedded in canonical signed strings
    pub fn key_id(&self) -> String {
        key_id(&self.public_key_hex())
    }

    /// Sign raw bytes
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Sign a canonical message string, returning the signature as hex
    pub fn sign_message(&self, message: &str) -> String {
        hex::encode(self.sign(message.as_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.public_key_hex())
    }
}

/// Short identifier of a hex-encoded public key: the first 20 bytes of its
/// SHA-256, hex-encoded.
pub fn key_id(pubkey_hex: &str) -> String {
    let digest = hash256(pubkey_hex.as_bytes());
    hex::encode(&digest[..20])
}

/// Check that a hex string is a well-formed public key
pub fn is_valid_pubkey(pubkey_hex: &str) -> bool {
    decode_pubkey(pubkey_hex).is_ok()
}

fn decode_pubkey(pubkey_hex: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(pubkey_hex).map_err(|_| CryptoError::InvalidPublicKey)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Verify raw bytes against a hex public key
pub fn verify(pubkey_hex: &str, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let verifying_key = decode_pubkey(pubkey_hex)?;
    let sig_array: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_array);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::MessageMismatch)
}

/// Verify a canonical message string against a hex signature
pub fn verify_message(
    pubkey_hex: &str,
    message: &str,
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let signature = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidSignature)?;
    verify(pubkey_hex, message.as_bytes(), &signature)
}

/// SHA-256 digest
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest as a hex string
pub fn hash256_hex(data: &[u8]) -> String {
    hex::encode(hash256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = KeyPair::generate();
        let message = "outpoint-0|deadbeef|1700000000";
        let sig = keypair.sign_message(message);
        assert!(verify_message(&keypair.public_key_hex(), message, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_altered_message() {
        let keypair = KeyPair::generate();
        let sig = keypair.sign_message("hello");
        assert_eq!(
            verify_message(&keypair.public_key_hex(), "hell0", &sig),
            Err(CryptoError::MessageMismatch)
        );
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let sig = a.sign_message("hello");
        assert!(verify_message(&b.public_key_hex(), "hello", &sig).is_err());
    }

    #[test]
    fn secret_round_trip() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(keypair.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn bad_keys_are_rejected() {
        assert!(KeyPair::from_secret_hex("not-hex").is_err());
        assert!(!is_valid_pubkey("abcd"));
        let keypair = KeyPair::generate();
        assert!(is_valid_pubkey(&keypair.public_key_hex()));
    }

    #[test]
    fn key_id_is_stable() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.key_id(), key_id(&keypair.public_key_hex()));
        assert_eq!(keypair.key_id().len(), 40);
    }
}
