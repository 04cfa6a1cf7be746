//! Credential vault: AES-256-GCM decryption of stored database secrets.
//!
//! Stored form is `base64(nonce[12] || ciphertext || tag[16])`. Plaintext
//! only ever lives in a [`Plaintext`] held by the caller for one connection
//! attempt; it redacts itself when formatted with `{:?}`.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::symm::{Cipher, decrypt_aead, encrypt_aead};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// A decrypted secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Plaintext(String);

impl Plaintext {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Plaintext(****)")
    }
}

pub struct CredentialVault {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build a vault from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, VaultError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(format!("not base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| VaultError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", b.len())))?;
        Ok(Self { key })
    }

    /// Decrypt one stored secret. Deterministic: a failure here is permanent
    /// for this ciphertext.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Plaintext, VaultError> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::Decryption("ciphertext is not valid base64".into()))?;
        if raw.is_empty() {
            return Err(VaultError::Decryption("ciphertext is empty".into()));
        }
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Decryption("ciphertext is truncated".into()));
        }

        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);
        let bytes = decrypt_aead(Cipher::aes_256_gcm(), &self.key, Some(nonce), &[], body, tag)
            .map_err(|_| VaultError::Decryption("authentication failed (wrong key or corrupted data)".into()))?;

        String::from_utf8(bytes)
            .map(Plaintext)
            .map_err(|_| VaultError::Decryption("plaintext is not valid UTF-8".into()))
    }

    /// Decrypt an optional stored secret. Absent ciphertext and empty
    /// plaintext both mean "no credential".
    pub fn decrypt_optional(&self, ciphertext: Option<&str>) -> Result<Option<Plaintext>, VaultError> {
        match ciphertext.filter(|c| !c.trim().is_empty()) {
            None => Ok(None),
            Some(c) => self.decrypt(c).map(|p| (!p.is_empty()).then_some(p)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce).map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut tag = [0u8; TAG_LEN];
        let body = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            &[],
            plaintext.as_bytes(),
            &mut tag,
        )
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        out.extend_from_slice(&tag);
        Ok(BASE64.encode(out))
    }
}

#[cfg(test)]
pub(crate) fn test_vault() -> CredentialVault {
    CredentialVault::from_base64_key(&BASE64.encode([7u8; KEY_LEN])).unwrap()
}
