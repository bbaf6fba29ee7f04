/// Symmetric sealing for stored secrets and provider tokens
///
/// AES-256-GCM with a freshly generated 12-byte nonce prepended to the
/// ciphertext, emitted as URL-safe base64. Keys shorter than 32 bytes are
/// right-padded with zeros; longer keys are truncated. A production
/// deployment must use a full 32-byte key.
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::RngCore;
use thiserror::Error;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("malformed base64 input")]
    InvalidEncoding,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// Extend or truncate a key to exactly 32 bytes
fn derive_key(key: &str) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    let bytes = key.as_bytes();
    let n = bytes.len().min(KEY_SIZE);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Encrypt plaintext, returning nonce-prefixed ciphertext as base64
pub fn seal(key: &str, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key(key)).map_err(|_| CryptoError::Encrypt)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(URL_SAFE.encode(out))
}

/// Decrypt base64-encoded, nonce-prefixed ciphertext
pub fn open(key: &str, encoded: &str) -> Result<String, CryptoError> {
    let data = URL_SAFE
        .decode(encoded)
        .map_err(|_| CryptoError::InvalidEncoding)?;

    if data.len() < NONCE_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(&derive_key(key)).map_err(|_| CryptoError::Decrypt)?;
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = "0123456789abcdef0123456789abcdef";
        let sealed = seal(key, "hello world").unwrap();
        assert_eq!(open(key, &sealed).unwrap(), "hello world");
    }

    #[test]
    fn test_short_and_long_keys() {
        // Short key is zero-padded, long key truncated to 32 bytes
        let sealed = seal("short", "payload").unwrap();
        assert_eq!(open("short", &sealed).unwrap(), "payload");

        let long = "0123456789abcdef0123456789abcdefEXTRA";
        let truncated = "0123456789abcdef0123456789abcdef";
        let sealed = seal(long, "payload").unwrap();
        assert_eq!(open(truncated, &sealed).unwrap(), "payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal("key-a", "payload").unwrap();
        assert!(matches!(open("key-b", &sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = "test-key";
        let sealed = seal(key, "payload").unwrap();
        let mut raw = URL_SAFE.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE.encode(raw);
        assert!(matches!(open(key, &tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_malformed_base64() {
        assert!(matches!(
            open("key", "not!!valid@@base64"),
            Err(CryptoError::InvalidEncoding)
        ));
    }

    #[test]
    fn test_ciphertext_too_short() {
        let short = URL_SAFE.encode([1u8, 2, 3]);
        assert!(matches!(
            open("key", &short),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = "test-key";
        let a = seal(key, "same input").unwrap();
        let b = seal(key, "same input").unwrap();
        assert_ne!(a, b);
    }
}
