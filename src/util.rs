use digest::Digest;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let mut csprng = rand::rngs::OsRng {};
    let Keypair { public, secret } = Keypair::generate(&mut csprng);
    (secret, public)
}

/// SHA-256 digest as a lowercase 64-char hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Random 16-byte nonce as hex
pub fn generate_nonce() -> String {
    let mut csprng = rand::rngs::OsRng {};
    let mut bytes = [0u8; 16];
    csprng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive a privacy-preserving identifier from a raw device id and a salt.
///
/// The raw device id never leaves the device; only this derived value is
/// shared with the backend.
pub fn hash_device_id(device_id: &str, salt: &str) -> String {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), device_id.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(b"pollsat-device-id", &mut okm)
        .expect("pollsat: unexpected hkdf output length");
    hex::encode(okm)
}
