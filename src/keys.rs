//! Ed25519 identity: keypair generation, BIP-39 mnemonic import/export, and
//! the derived public-key hash used as a peer's relay-selection identity.

use bip39::Mnemonic;
use ed25519_dalek::SigningKey;
use thiserror::Error;

use crate::crypto;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
}

/// An Ed25519 keypair plus its derived public-key hash and recovery mnemonic.
#[derive(Clone)]
pub struct KeyPair {
    /// Hex-encoded Ed25519 private key seed (32 bytes → 64 hex chars). Never logged.
    pub private_key_hex: String,
    /// Hex-encoded Ed25519 public key (32 bytes → 64 hex chars). This is the peer identity.
    pub public_key_hex: String,
    /// `h32(public_key_bytes)`, hex-encoded — the distance metric input for relay selection.
    pub public_key_hash_hex: String,
    /// Space-separated 24-word BIP-39 mnemonic. Shown once on first launch.
    pub mnemonic: String,
}

impl KeyPair {
    pub fn seed_bytes(&self) -> Result<[u8; 32], KeyError> {
        let bytes = hex::decode(&self.private_key_hex).map_err(|_| KeyError::InvalidPrivateKey)?;
        bytes.try_into().map_err(|_| KeyError::InvalidPrivateKey)
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], KeyError> {
        let bytes = hex::decode(&self.public_key_hex).map_err(|_| KeyError::InvalidPrivateKey)?;
        bytes.try_into().map_err(|_| KeyError::InvalidPrivateKey)
    }
}

/// Generate a brand-new Ed25519 keypair and BIP-39 mnemonic.
pub fn generate_keypair() -> KeyPair {
    // Generate a 24-word (256-bit entropy) mnemonic.
    let mnemonic = Mnemonic::generate(24).expect("24-word mnemonic generation is infallible");

    keypair_from_mnemonic_internal(&mnemonic)
}

/// Derive an Ed25519 keypair from an existing 24-word BIP-39 mnemonic.
pub fn import_from_mnemonic(words: Vec<String>) -> Result<KeyPair, KeyError> {
    let phrase = words.join(" ");
    let mnemonic = phrase
        .parse::<Mnemonic>()
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;

    Ok(keypair_from_mnemonic_internal(&mnemonic))
}

fn keypair_from_mnemonic_internal(mnemonic: &Mnemonic) -> KeyPair {
    // Derive 64-byte PBKDF2 seed (BIP-39 standard, no passphrase).
    let seed = mnemonic.to_seed("");
    // Use first 32 bytes as the Ed25519 private key seed.
    let seed_bytes: [u8; 32] = seed[..32].try_into().expect("seed is always 64 bytes");

    let signing_key = SigningKey::from_bytes(&seed_bytes);
    let public_key_bytes = signing_key.verifying_key().to_bytes();

    let words: Vec<&str> = mnemonic.words().collect();

    KeyPair {
        private_key_hex: hex::encode(seed_bytes),
        public_key_hex: hex::encode(public_key_bytes),
        public_key_hash_hex: crypto::generic_hash_hex(&public_key_bytes),
        mnemonic: words.join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_reimport() {
        let kp1 = generate_keypair();
        assert_eq!(kp1.mnemonic.split_whitespace().count(), 24);
        assert_eq!(kp1.private_key_hex.len(), 64);
        assert_eq!(kp1.public_key_hex.len(), 64);
        assert_eq!(kp1.public_key_hash_hex.len(), 64);

        let words: Vec<String> = kp1.mnemonic.split_whitespace().map(String::from).collect();
        let kp2 = import_from_mnemonic(words).expect("valid mnemonic");

        assert_eq!(kp1.private_key_hex, kp2.private_key_hex);
        assert_eq!(kp1.public_key_hex, kp2.public_key_hex);
        assert_eq!(kp1.public_key_hash_hex, kp2.public_key_hash_hex);
    }

    #[test]
    fn bad_mnemonic_returns_error() {
        let bad: Vec<String> = vec!["not".into(), "valid".into()];
        assert!(import_from_mnemonic(bad).is_err());
    }

    #[test]
    fn distinct_keypairs_have_distinct_identities() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public_key_hex, b.public_key_hex);
        assert_ne!(a.public_key_hash_hex, b.public_key_hash_hex);
    }
}
