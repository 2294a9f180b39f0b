//! Shared cryptographic primitives: hashing, Ed25519 signing, Curve25519
//! key exchange, sealed box and authenticated secretbox encode/decode.
//!
//! Ed25519 <-> X25519 conversion uses the standard birational map
//! (RFC 8032 §5.1.5 / RFC 7748 §4.1): the secret is SHA-512-clamped, the
//! public key is the Edwards point re-expressed in Montgomery form.

use chacha20poly1305::{
    aead::Aead, AeadCore, KeyInit, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("sealed-box envelope too short or malformed")]
    InvalidEnvelope,
    #[error("AEAD encryption failed")]
    Encrypt,
    #[error("AEAD decryption failed — wrong key or tampered ciphertext")]
    Decrypt,
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

// ─── Generic hash ───────────────────────────────────────────────────────────

/// 32-byte BLAKE3 digest of `data`, hex-encoded.
pub fn generic_hash_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// 32-byte BLAKE3 digest of `data`, raw bytes.
pub fn generic_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ─── Ed25519 <-> X25519 conversion ──────────────────────────────────────────

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
pub fn ed25519_seed_to_x25519(seed_bytes: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed_bytes);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    StaticSecret::from(key)
}

/// Convert a 32-byte Ed25519 compressed public key to X25519 Montgomery form.
pub fn ed25519_pubkey_to_x25519(pubkey_bytes: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY(*pubkey_bytes);
    let point = compressed
        .decompress()
        .ok_or(CryptoError::InvalidKeyLength(32))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Derive a 32-byte AEAD key from an X25519 shared secret, bound to `salt`
/// (typically the ephemeral public key) and an `info` label.
pub fn derive_aead_key(shared: &[u8; 32], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("HKDF output length is valid");
    key
}

// ─── Ed25519 signing (login digest) ─────────────────────────────────────────

/// `h32("login:" || floor(now_seconds / 300))`, the bucketed login digest.
pub fn login_digest(now_unix_seconds: u64) -> [u8; 32] {
    let bucket = now_unix_seconds / 300;
    generic_hash(format!("login:{bucket}").as_bytes())
}

/// Sign `digest` with the Ed25519 private key, returning the detached signature bytes.
pub fn sign_detached(seed_bytes: &[u8; 32], digest: &[u8; 32]) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(seed_bytes);
    signing_key.sign(digest).to_bytes()
}

/// Verify a detached Ed25519 signature over `digest`.
pub fn verify_detached(
    pubkey_bytes: &[u8; 32],
    digest: &[u8; 32],
    signature_bytes: &[u8; 64],
) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_bytes(signature_bytes);
    verifying_key
        .verify_strict(digest, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

// ─── Sealed box (asymmetric, for the pairing handshake) ─────────────────────

const SEALED_VERSION: u8 = 0x01;
const EPK_LEN: usize = 32;
const SEALED_MIN_LEN: usize = 1 + EPK_LEN + NONCE_LEN + MAC_LEN;
const SEALED_INFO: &[u8] = b"beacon:sealed-box:v1";

/// Anonymous-sender asymmetric encryption: only the holder of `recipient_pk`'s
/// long-term secret can decrypt, and no prior session state is needed.
///
/// Wire format: `VERSION[1] | ephemeral_pk[32] | nonce[24] | ciphertext`.
pub fn seal(plaintext: &[u8], recipient_pk_bytes: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let recipient_x25519 = ed25519_pubkey_to_x25519(recipient_pk_bytes)?;

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient_x25519);

    let aead_key = derive_aead_key(shared.as_bytes(), ephemeral_public.as_bytes(), SEALED_INFO);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(1 + EPK_LEN + NONCE_LEN + ciphertext.len());
    out.push(SEALED_VERSION);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed-box envelope with the recipient's long-term Ed25519 seed.
pub fn unseal(envelope: &[u8], recipient_seed_bytes: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < SEALED_MIN_LEN {
        return Err(CryptoError::InvalidEnvelope);
    }
    if envelope[0] != SEALED_VERSION {
        return Err(CryptoError::InvalidEnvelope);
    }

    let epk_bytes: [u8; 32] = envelope[1..33].try_into().unwrap();
    let nonce_bytes: [u8; NONCE_LEN] = envelope[33..33 + NONCE_LEN].try_into().unwrap();
    let ciphertext = &envelope[33 + NONCE_LEN..];

    let ephemeral_public = X25519Public::from(epk_bytes);
    let recipient_x25519 = ed25519_seed_to_x25519(recipient_seed_bytes);
    let shared = recipient_x25519.diffie_hellman(&ephemeral_public);
    let aead_key = derive_aead_key(shared.as_bytes(), &epk_bytes, SEALED_INFO);

    let cipher =
        XChaCha20Poly1305::new_from_slice(&aead_key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = XNonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

// ─── Secretbox (symmetric, for session traffic) ─────────────────────────────

/// `nonce[24] || secretbox(plaintext, nonce, key) (incl. 16-byte MAC)`. `key`
/// is a 32-byte X25519-derived shared key; a fresh random nonce is generated
/// per call.
pub fn secretbox_encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`secretbox_encrypt`]. Returns `Err` on any authentication
/// failure — callers on a shared bus are expected to see many messages that
/// simply aren't theirs, and must treat that as a non-fatal skip.
pub fn secretbox_decrypt(payload: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_LEN + MAC_LEN {
        return Err(CryptoError::InvalidEnvelope);
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let nonce = XNonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_ed25519_keypair() -> ([u8; 32], [u8; 32]) {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        (seed, *signing.verifying_key().as_bytes())
    }

    #[test]
    fn generic_hash_is_deterministic_and_32_bytes() {
        let a = generic_hash_hex(b"hello");
        let b = generic_hash_hex(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn generic_hash_differs_for_different_inputs() {
        assert_ne!(generic_hash_hex(b"a"), generic_hash_hex(b"b"));
    }

    #[test]
    fn login_digest_is_stable_within_a_bucket() {
        let bucket = 1_700_000_000u64 / 300;
        assert_eq!(bucket, 5_666_666);
        let a = login_digest(1_700_000_000);
        let b = login_digest(1_700_000_000 + 299);
        assert_eq!(a, b, "digest must be stable across the whole 300s bucket");
    }

    #[test]
    fn login_digest_changes_across_buckets() {
        let a = login_digest(1_700_000_000);
        let b = login_digest(1_700_000_000 + 300);
        assert_ne!(a, b);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (seed, pk) = random_ed25519_keypair();
        let digest = login_digest(1_700_000_000);
        let sig = sign_detached(&seed, &digest);
        assert!(verify_detached(&pk, &digest, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (seed, _pk) = random_ed25519_keypair();
        let (_, other_pk) = random_ed25519_keypair();
        let digest = login_digest(1_700_000_000);
        let sig = sign_detached(&seed, &digest);
        assert!(verify_detached(&other_pk, &digest, &sig).is_err());
    }

    #[test]
    fn seal_and_unseal_roundtrip() {
        let (recipient_seed, recipient_pk) = random_ed25519_keypair();
        let payload = br#"{"hello":"world"}"#;
        let envelope = seal(payload, &recipient_pk).unwrap();
        let recovered = unseal(&envelope, &recipient_seed).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn unseal_with_wrong_key_fails() {
        let (_recipient_seed, recipient_pk) = random_ed25519_keypair();
        let (wrong_seed, _) = random_ed25519_keypair();
        let envelope = seal(b"secret", &recipient_pk).unwrap();
        assert!(unseal(&envelope, &wrong_seed).is_err());
    }

    #[test]
    fn unseal_tampered_envelope_fails() {
        let (recipient_seed, recipient_pk) = random_ed25519_keypair();
        let mut envelope = seal(b"secret", &recipient_pk).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;
        assert!(unseal(&envelope, &recipient_seed).is_err());
    }

    #[test]
    fn secretbox_roundtrip() {
        let key = [7u8; 32];
        let plaintext = b"session payload";
        let wire = secretbox_encrypt(plaintext, &key).unwrap();
        assert_eq!(wire.len(), NONCE_LEN + plaintext.len() + MAC_LEN);
        let recovered = secretbox_decrypt(&wire, &key).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn secretbox_wrong_key_fails_silently() {
        let key = [1u8; 32];
        let other = [2u8; 32];
        let wire = secretbox_encrypt(b"hi", &key).unwrap();
        assert!(secretbox_decrypt(&wire, &other).is_err());
    }

    #[test]
    fn secretbox_rejects_short_payload() {
        let key = [1u8; 32];
        assert!(secretbox_decrypt(&[0u8; 4], &key).is_err());
    }
}
