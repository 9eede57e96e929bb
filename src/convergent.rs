// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Convergent encryption and locator derivation.
//!
//! Every persistent storage unit owns an ordered list of [`ConvergentConfig`]s
//! (newest first). From a unit's config and an item's content hash we derive:
//!
//! ```text
//! locator = hex(HMAC-SHA256(locator_salt, content_hash))
//! key     = HMAC-SHA256(secret_value, content_hash)        // AES-256-GCM key
//! nonce   = SHA-256(key || "cdn-storage/convergent-nonce")[..12]
//! ```
//!
//! Identical inputs always give identical locators, keys and ciphertexts, so
//! re-writing the same item to a unit is a no-op in effect. Because salt and
//! secret are per-unit, the same item lands at unrelated addresses on
//! different units.
//!
//! # Example
//!
//! ```
//! use cdn_storage::convergent::{ConvergentConfig, ConvergentEncryption, AES_GCM};
//!
//! let enc = ConvergentEncryption::new(vec![ConvergentConfig {
//!     cipher: AES_GCM.into(),
//!     locator_salt: "salt".into(),
//!     secret_value: "secret".into(),
//! }]).unwrap();
//!
//! let hash = cdn_storage::convergent::hash_bytes(b"some log");
//! let sealed = enc.seal(&hash, b"some log").unwrap();
//! assert_eq!(enc.open(&hash, &sealed).unwrap(), b"some log");
//! assert_eq!(enc.locator(&hash).unwrap(), enc.locator(&hash).unwrap());
//! ```

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Only cipher currently understood by [`ConvergentEncryption`].
pub const AES_GCM: &str = "aes-gcm";

const NONCE_DOMAIN: &[u8] = b"cdn-storage/convergent-nonce";
const HASH_CHUNK: usize = 8 * 1024;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressingError {
    #[error("no convergent encryption config provided")]
    NoConfig,
    #[error("unsupported cipher '{0}'")]
    UnsupportedCipher(String),
    #[error("empty key material: {0}")]
    EmptyKeyMaterial(&'static str),
    #[error("cannot derive an address from an empty content hash")]
    EmptyIdentity,
    #[error("key material rejected by HMAC")]
    InvalidKey,
    #[error("encryption failure")]
    Encrypt,
    #[error("content could not be decrypted with any configured key")]
    Decrypt,
    #[error("reading content to hash failed: {0}")]
    Io(String),
}

/// One generation of convergent key material for a unit.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvergentConfig {
    pub cipher: String,
    pub locator_salt: String,
    pub secret_value: String,
}

impl std::fmt::Debug for ConvergentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergentConfig")
            .field("cipher", &self.cipher)
            .field("locator_salt", &"<redacted>")
            .field("secret_value", &"<redacted>")
            .finish()
    }
}

impl ConvergentConfig {
    fn validate(&self) -> Result<(), AddressingError> {
        if self.cipher != AES_GCM {
            return Err(AddressingError::UnsupportedCipher(self.cipher.clone()));
        }
        if self.locator_salt.is_empty() {
            return Err(AddressingError::EmptyKeyMaterial("locator_salt"));
        }
        if self.secret_value.is_empty() {
            return Err(AddressingError::EmptyKeyMaterial("secret_value"));
        }
        Ok(())
    }

    /// Content locator under this config.
    pub fn locator(&self, content_hash: &str) -> Result<String, AddressingError> {
        if content_hash.is_empty() {
            return Err(AddressingError::EmptyIdentity);
        }
        Ok(hex::encode(hmac(self.locator_salt.as_bytes(), content_hash.as_bytes())?))
    }

    /// Content encryption key under this config.
    pub fn key(&self, content_hash: &str) -> Result<[u8; 32], AddressingError> {
        if content_hash.is_empty() {
            return Err(AddressingError::EmptyIdentity);
        }
        hmac(self.secret_value.as_bytes(), content_hash.as_bytes())
    }
}

/// A unit's validated key ring. Index 0 is the newest generation and the only
/// one used for writing.
#[derive(Debug, Clone)]
pub struct ConvergentEncryption {
    configs: Vec<ConvergentConfig>,
}

impl ConvergentEncryption {
    pub fn new(configs: Vec<ConvergentConfig>) -> Result<Self, AddressingError> {
        if configs.is_empty() {
            return Err(AddressingError::NoConfig);
        }
        for config in &configs {
            config.validate()?;
        }
        Ok(Self { configs })
    }

    pub fn configs(&self) -> &[ConvergentConfig] {
        &self.configs
    }

    fn newest(&self) -> &ConvergentConfig {
        // non-empty by construction
        &self.configs[0]
    }

    /// Locator for new writes (newest config).
    pub fn locator(&self, content_hash: &str) -> Result<String, AddressingError> {
        self.newest().locator(content_hash)
    }

    /// Deterministically encrypt `plaintext` with the newest key.
    pub fn seal(&self, content_hash: &str, plaintext: &[u8]) -> Result<Vec<u8>, AddressingError> {
        let key = self.newest().key(content_hash)?;
        seal_with_key(&key, plaintext)
    }

    /// Decrypt trying every configured key, newest first.
    pub fn open(&self, content_hash: &str, sealed: &[u8]) -> Result<Vec<u8>, AddressingError> {
        for config in &self.configs {
            let key = config.key(content_hash)?;
            if let Ok(plain) = open_with_key(&key, sealed) {
                return Ok(plain);
            }
        }
        Err(AddressingError::Decrypt)
    }
}

fn hmac(key: &[u8], msg: &[u8]) -> Result<[u8; 32], AddressingError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| AddressingError::InvalidKey)?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().into())
}

fn derive_nonce(key: &[u8; 32]) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(NONCE_DOMAIN);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

fn seal_with_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, AddressingError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = derive_nonce(key);
    cipher
        .encrypt(Nonce::<U12>::from_slice(&nonce), plaintext)
        .map_err(|_| AddressingError::Encrypt)
}

fn open_with_key(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, AddressingError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = derive_nonce(key);
    cipher
        .decrypt(Nonce::<U12>::from_slice(&nonce), sealed)
        .map_err(|_| AddressingError::Decrypt)
}

/// Integrity hash of a full content buffer (hex SHA-512).
pub fn hash_bytes(content: &[u8]) -> String {
    hex::encode(Sha512::digest(content))
}

/// Integrity hash of a content stream, read to the end.
pub async fn content_hash<R>(reader: &mut R) -> Result<String, AddressingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| AddressingError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
