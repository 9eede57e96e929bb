// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Signing and field encryption for persisted rows.
//!
//! Rows in the `item`, `item_unit` and `storage_unit` tables are plain structs.
//! Before a write, the repository asks an [`EntityCodec`] to encrypt the
//! sensitive column and to sign the canonical form of the row; after a read it
//! verifies the signature *before* anything else, then decrypts only when the
//! caller asked for it.
//!
//! Canonical form is the list of column values, each length-prefixed, so that
//! `("ab", "c")` and `("a", "bc")` never sign the same.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
/// SHA-256 block size
const HMAC_BLOCK: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("signature mismatch on {entity}")]
    BadSignature { entity: String },
    #[error("malformed signature encoding on {entity}")]
    MalformedSignature { entity: String },
    #[error("sealed field is malformed")]
    MalformedField,
    #[error("sealed field could not be decrypted")]
    Decrypt,
    #[error("field encryption failed")]
    Encrypt,
}

/// Sign / verify / encrypt / decrypt hooks the repositories run their rows
/// through.
pub trait EntityCodec: Send + Sync {
    /// Hex signature over the canonical encoding of `fields`.
    fn sign(&self, entity: &str, fields: &[&[u8]]) -> String;

    fn verify(&self, entity: &str, fields: &[&[u8]], signature: &str) -> Result<(), CodecError>;

    /// Seal `plaintext`, binding it to `bound` (e.g. the row id) as AAD.
    fn encrypt_field(&self, plaintext: &[u8], bound: &[&[u8]]) -> Result<Vec<u8>, CodecError>;

    fn decrypt_field(&self, sealed: &[u8], bound: &[&[u8]]) -> Result<Vec<u8>, CodecError>;
}

/// HMAC-SHA256 signatures plus AES-256-GCM field encryption with random nonces.
pub struct KeyedCodec {
    /// Signing key, zero-padded to a full block as HMAC would pad it
    signing_block: [u8; HMAC_BLOCK],
    cipher: Aes256Gcm,
}

impl KeyedCodec {
    /// Build a codec from two secrets. Each secret is stretched with SHA-256.
    pub fn new(signing_secret: &str, encryption_secret: &str) -> Self {
        let mut signing_block = [0u8; HMAC_BLOCK];
        signing_block[..32].copy_from_slice(&Sha256::digest(signing_secret.as_bytes()));
        let enc_key: [u8; 32] = Sha256::digest(encryption_secret.as_bytes()).into();
        Self {
            signing_block,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&enc_key)),
        }
    }

    fn mac(&self, entity: &str, fields: &[&[u8]]) -> HmacSha256 {
        let mut mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&self.signing_block));
        mac.update(&canonical(&[entity.as_bytes()]));
        mac.update(&canonical(fields));
        mac
    }
}

/// Length-prefixed concatenation of `parts`.
pub fn canonical(parts: &[&[u8]]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 8).sum();
    let mut out = Vec::with_capacity(total);
    for part in parts {
        out.extend_from_slice(&(part.len() as u64).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

impl EntityCodec for KeyedCodec {
    fn sign(&self, entity: &str, fields: &[&[u8]]) -> String {
        hex::encode(self.mac(entity, fields).finalize().into_bytes())
    }

    fn verify(&self, entity: &str, fields: &[&[u8]], signature: &str) -> Result<(), CodecError> {
        let expected = hex::decode(signature).map_err(|_| CodecError::MalformedSignature {
            entity: entity.to_string(),
        })?;
        self.mac(entity, fields)
            .verify_slice(&expected)
            .map_err(|_| CodecError::BadSignature {
                entity: entity.to_string(),
            })
    }

    fn encrypt_field(&self, plaintext: &[u8], bound: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = canonical(bound);
        let sealed = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CodecError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt_field(&self, sealed: &[u8], bound: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
        if sealed.len() < NONCE_LEN {
            return Err(CodecError::MalformedField);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let aad = canonical(bound);
        self.cipher
            .decrypt(Nonce::<U12>::from_slice(nonce), Payload { msg: body, aad: &aad })
            .map_err(|_| CodecError::Decrypt)
    }
}
