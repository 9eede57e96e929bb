// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::CodecError;
use crate::convergent::AddressingError;
use crate::index::ItemType;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Malformed or unusable backend configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Signature or decryption verification failed.
    #[error("Integrity check failed: {0}")]
    Integrity(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Transient backend or network failure. Safe to retry.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Credentials rejected by the backend. Retrying every tick is pointless.
    #[error("Backend rejected credentials: {0}")]
    Fatal(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Addressing(#[from] AddressingError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl StorageError {
    /// Worth retrying on the next tick without backing off.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Signature, decryption or content hash mismatch.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::Codec(_) | Self::Addressing(AddressingError::Decrypt)
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Raw object contract a persistent storage variant implements.
///
/// Backends only move opaque (already encrypted) bytes around. Identity,
/// addressing and encryption live in [`super::driver::StorageUnit`].
#[async_trait]
pub trait UnitBackend: Send + Sync {
    /// Backend kind identifier, e.g. `"local"` or `"swift"`.
    fn kind(&self) -> &'static str;

    /// Store `data` at `locator`, replacing anything there. The object must
    /// not become visible to readers until fully written.
    async fn put_object(&self, item_type: ItemType, locator: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Fetch the object at `locator`. Missing objects are `NotFound`.
    async fn get_object(&self, item_type: ItemType, locator: &str) -> Result<Vec<u8>, StorageError>;

    /// Existence probe. Network trouble must surface as an error, never as `false`.
    async fn object_exists(&self, item_type: ItemType, locator: &str) -> Result<bool, StorageError>;
}

/// Ordered, append-only chunk store used as the first write target.
#[async_trait]
pub trait BufferBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Append `chunk` for `locator` under `order_key`. Equal keys keep arrival order.
    async fn add(&self, locator: &str, order_key: f64, chunk: &str) -> Result<(), StorageError>;

    /// All chunks for `locator`, sorted by order key. Unknown locators yield an empty list.
    async fn chunks(&self, locator: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, locator: &str) -> Result<bool, StorageError>;

    /// Drop every chunk stored for `locator`.
    async fn remove(&self, locator: &str) -> Result<(), StorageError>;
}
