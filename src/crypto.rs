//! Sealed-blob encryption for backups and secrets.
//!
//! Wire format: `IV(16) ∥ TAG(16) ∥ CIPHERTEXT`. Cipher is AES-256-GCM
//! with a 16-byte random nonce. The key is derived from the user password
//! with Argon2id on standard hardware, or a bare SHA-256 digest on
//! constrained device tiers where Argon2's memory cost is prohibitive.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-256-GCM parameterized with the 16-byte nonce the blob format carries.
type BlobCipher = AesGcm<Aes256, U16>;

/// Nonce length in bytes.
pub const IV_LEN: usize = 16;
/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Derived key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;
/// Salt length for Argon2id derivation.
pub const SALT_LEN: usize = 16;

/// Crypto failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The blob is shorter than `IV + TAG`.
    #[error("sealed blob truncated: {0} bytes")]
    Truncated(usize),
    /// Authentication failed — wrong key or corrupted data.
    #[error("decryption failed: wrong key or corrupted blob")]
    Decrypt,
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    Kdf(String),
}

/// Key derivation algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfKind {
    /// Argon2id with a persisted random salt. The default.
    Argon2id,
    /// Single SHA-256 of the password, saltless. Constrained devices only.
    Sha256,
}

impl Default for KdfKind {
    fn default() -> Self {
        Self::Argon2id
    }
}

/// A derived AES-256 key. Debug output never shows the bytes.
#[derive(Clone)]
pub struct SealKey([u8; KEY_LEN]);

impl SealKey {
    /// Wrap raw key bytes (for tests and key files).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey(__REDACTED__)")
    }
}

/// Derive an AES-256 key from a password.
///
/// `salt` is required for [`KdfKind::Argon2id`] and ignored for
/// [`KdfKind::Sha256`] (that tier trades salting for the ability to decrypt
/// a snapshot with nothing but the password).
pub fn derive_key(password: &str, salt: &[u8], kdf: KdfKind) -> Result<SealKey, CryptoError> {
    let mut key = [0u8; KEY_LEN];
    match kdf {
        KdfKind::Argon2id => {
            argon2::Argon2::default()
                .hash_password_into(password.as_bytes(), salt, &mut key)
                .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        }
        KdfKind::Sha256 => {
            let digest = Sha256::digest(password.as_bytes());
            key.copy_from_slice(&digest);
        }
    }
    Ok(SealKey(key))
}

/// Generate a random salt for Argon2id derivation.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` into the sealed-blob format.
pub fn seal(key: &SealKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = BlobCipher::new_from_slice(&key.0).map_err(|_| CryptoError::Encrypt)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    // The aead crate appends the tag to the ciphertext; the blob format
    // wants IV ∥ TAG ∥ CIPHERTEXT, so peel it off the end.
    let mut sealed = cipher
        .encrypt(iv.as_slice().into(), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let tag_start = sealed.len().saturating_sub(TAG_LEN);
    let tag = sealed.split_off(tag_start);

    let mut blob = Vec::with_capacity(IV_LEN.saturating_add(TAG_LEN).saturating_add(sealed.len()));
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Decrypt a sealed blob back to plaintext.
pub fn open(key: &SealKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < IV_LEN.saturating_add(TAG_LEN) {
        return Err(CryptoError::Truncated(blob.len()));
    }
    let (iv, rest) = blob.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let cipher = BlobCipher::new_from_slice(&key.0).map_err(|_| CryptoError::Decrypt)?;

    // Reassemble ciphertext ∥ tag, the layout the aead crate expects.
    let mut joined = Vec::with_capacity(ciphertext.len().saturating_add(TAG_LEN));
    joined.extend_from_slice(ciphertext);
    joined.extend_from_slice(tag);

    cipher
        .decrypt(iv.into(), joined.as_slice())
        .map_err(|_| CryptoError::Decrypt)
}
