//! Credential encryption at rest
//!
//! Registry passwords, env values and cluster kubeconfigs are stored as
//! AES-256-GCM frames: `hex(nonce) ‖ hex(tag) ‖ hex(ciphertext)`. The key is
//! the SHA-256 digest of the operator-supplied master key, so any string
//! length or encoding can be used as `ENCRYPTION_KEY`.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce, Tag};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// Nonce width in bytes
pub const NONCE_LEN: usize = 16;

/// Authentication tag width in bytes
pub const TAG_LEN: usize = 16;

/// Smallest valid frame, in hex characters
pub const MIN_FRAME_LEN: usize = (NONCE_LEN + TAG_LEN) * 2;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Cipher error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("ENCRYPTION_KEY is empty after trimming")]
    EmptyMasterKey,

    #[error(
        "encrypted text is too short ({len} chars, expected at least {min}); \
         the data is corrupted or not in the expected format"
    )]
    TooShort { len: usize, min: usize },

    #[error("encrypted text contains invalid hex characters")]
    InvalidHex,

    #[error(
        "authentication failed, likely caused by an incorrect ENCRYPTION_KEY; \
         make sure it matches the key used to encrypt the data"
    )]
    WrongKey,

    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8,

    #[error("encryption failed")]
    Encrypt,
}

/// Symmetric key derived from the process master key
#[derive(Clone)]
pub struct CipherKey {
    bytes: Zeroizing<[u8; 32]>,
}

impl CipherKey {
    /// Derive a key from a master-key string
    ///
    /// Surrounding whitespace is ignored since keys mounted from secrets or
    /// config maps often carry a trailing newline.
    pub fn from_master_key(master_key: &str) -> Result<Self, CipherError> {
        let trimmed = master_key.trim();
        if trimmed.is_empty() {
            return Err(CipherError::EmptyMasterKey);
        }

        let digest = Sha256::digest(trimmed.as_bytes());
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&digest);

        Ok(Self { bytes })
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Encrypts and decrypts stored credentials
#[derive(Clone, Debug)]
pub struct CredentialCipher {
    key: CipherKey,
}

impl CredentialCipher {
    /// Create a cipher bound to a key
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    fn aead(&self) -> Aes256Gcm16 {
        Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(&self.key.bytes[..]))
    }

    /// Encrypt a plaintext string into a hex frame
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .aead()
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CipherError::Encrypt)?;

        let mut frame = String::with_capacity(MIN_FRAME_LEN + buffer.len() * 2);
        frame.push_str(&hex::encode(nonce));
        frame.push_str(&hex::encode(tag));
        frame.push_str(&hex::encode(&buffer));
        Ok(frame)
    }

    /// Decrypt a hex frame produced by [`CredentialCipher::encrypt`]
    pub fn decrypt(&self, frame: &str) -> Result<String, CipherError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(CipherError::TooShort {
                len: frame.len(),
                min: MIN_FRAME_LEN,
            });
        }
        if !frame.is_ascii() {
            return Err(CipherError::InvalidHex);
        }

        let (nonce_hex, rest) = frame.split_at(NONCE_LEN * 2);
        let (tag_hex, data_hex) = rest.split_at(TAG_LEN * 2);

        let nonce = hex::decode(nonce_hex).map_err(|_| CipherError::InvalidHex)?;
        let tag = hex::decode(tag_hex).map_err(|_| CipherError::InvalidHex)?;
        let mut buffer = hex::decode(data_hex).map_err(|_| CipherError::InvalidHex)?;

        self.aead()
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(&tag),
            )
            .map_err(|_| CipherError::WrongKey)?;

        String::from_utf8(buffer).map_err(|_| CipherError::InvalidUtf8)
    }
}
