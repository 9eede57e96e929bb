// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unit drivers: the generic layer between callers and raw backends.
//!
//! A [`StorageUnit`] wraps any [`UnitBackend`] with the unit's identity and
//! convergent key ring. Plaintext goes in through an [`ItemWriter`] and comes
//! out through a [`ContentReader`]; the backend only ever sees sealed bytes
//! at the locator derived for this unit.
//!
//! The [`Buffer`] wraps a [`BufferBackend`]. It is unencrypted and addresses
//! items by their api ref hash, so chunks can be appended before the content
//! hash exists.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use super::traits::{BufferBackend, StorageError, UnitBackend};
use super::{ContentReader, ItemUnit};
use crate::convergent::{hash_bytes, AddressingError, ConvergentEncryption};
use crate::index::{Item, ItemType};
use crate::metrics::{self, LatencyTimer};

/// What every unit (persistent or buffer) offers the orchestrator.
#[async_trait]
pub trait Unit: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Backend kind, e.g. `"local"` or `"redis"`.
    fn kind(&self) -> &'static str;

    /// Locator of `item` on this unit.
    fn new_locator(&self, item: &Item) -> Result<String, StorageError>;

    /// Open the plaintext of `item_unit`, which must belong to this unit.
    async fn new_reader(&self, item_unit: &ItemUnit) -> Result<ContentReader, StorageError>;

    async fn item_exists(&self, item: &Item) -> Result<bool, StorageError>;
}

/// A persistent storage unit.
pub struct StorageUnit {
    id: String,
    name: String,
    sync_interval: Duration,
    encryption: ConvergentEncryption,
    backend: Arc<dyn UnitBackend>,
}

impl std::fmt::Debug for StorageUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.backend.kind())
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

impl StorageUnit {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        sync_interval: Duration,
        encryption: ConvergentEncryption,
        backend: Arc<dyn UnitBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sync_interval,
            encryption,
            backend,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn encryption(&self) -> &ConvergentEncryption {
        &self.encryption
    }

    fn require_hash<'i>(&self, item: &'i Item) -> Result<&'i str, StorageError> {
        if item.hash.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "item {} has no hash (not completed, or loaded without decryption)",
                item.id
            )));
        }
        Ok(&item.hash)
    }

    /// Open a write stream for `item_unit`. Nothing reaches the backend until
    /// [`ItemWriter::close`].
    pub fn new_writer(&self, item_unit: &ItemUnit) -> Result<ItemWriter<'_>, StorageError> {
        let hash = self.require_hash(&item_unit.item)?;
        let expected = self.encryption.locator(hash)?;
        if item_unit.locator != expected {
            return Err(StorageError::InvalidInput(format!(
                "item unit {} locator was not derived by unit '{}'",
                item_unit.id, self.name
            )));
        }
        Ok(ItemWriter {
            unit: self,
            item_id: item_unit.item_id.clone(),
            item_type: item_unit.item.item_type,
            locator: expected,
            hash: hash.to_string(),
            staged: Vec::new(),
        })
    }

    /// Copy a reader obtained from [`Unit::new_reader`] into `sink`.
    pub async fn read<R, W>(&self, item_unit: &ItemUnit, reader: &mut R, sink: &mut W) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let copied = tokio::io::copy(reader, sink)
            .await
            .map_err(|e| StorageError::Backend(format!("copying item unit {}: {}", item_unit.id, e)))?;
        metrics::record_bytes_read(&self.name, copied as usize);
        Ok(copied)
    }
}

#[async_trait]
impl Unit for StorageUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    fn new_locator(&self, item: &Item) -> Result<String, StorageError> {
        let hash = self.require_hash(item)?;
        Ok(self.encryption.locator(hash)?)
    }

    async fn new_reader(&self, item_unit: &ItemUnit) -> Result<ContentReader, StorageError> {
        let hash = self.require_hash(&item_unit.item)?;
        if item_unit.locator.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "item unit {} was loaded without decryption",
                item_unit.id
            )));
        }

        let _timer = LatencyTimer::new(self.name.as_str(), "read");
        let sealed = match self.backend.get_object(item_unit.item.item_type, &item_unit.locator).await {
            Ok(sealed) => sealed,
            Err(e) => {
                metrics::record_operation(&self.name, "read", "error");
                return Err(e);
            }
        };

        match self.encryption.open(hash, &sealed) {
            Ok(plain) => {
                metrics::record_operation(&self.name, "read", "success");
                Ok(ContentReader::new(plain))
            }
            Err(AddressingError::Decrypt) => {
                error!(unit = %self.name, item_id = %item_unit.item_id, "No configured key decrypts item content");
                metrics::record_integrity_failure(&self.name);
                Err(StorageError::Integrity(format!(
                    "item {} on unit '{}' could not be decrypted",
                    item_unit.item_id, self.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Probe every locator in the key ring, newest first. Never decrypts.
    async fn item_exists(&self, item: &Item) -> Result<bool, StorageError> {
        let hash = self.require_hash(item)?;
        for config in self.encryption.configs() {
            let locator = config.locator(hash)?;
            if self.backend.object_exists(item.item_type, &locator).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Write stream for one item on one unit.
///
/// Plaintext is staged in memory. [`close`](Self::close) checks it against
/// the item hash, seals it and writes the object in one `put_object`.
/// Dropping an unclosed writer discards the staged bytes.
pub struct ItemWriter<'a> {
    unit: &'a StorageUnit,
    item_id: String,
    item_type: ItemType,
    locator: String,
    hash: String,
    staged: Vec<u8>,
}

impl ItemWriter<'_> {
    /// Finalize the write. The object becomes visible to readers only if
    /// this returns `Ok`.
    pub async fn close(self) -> Result<(), StorageError> {
        let unit = self.unit;
        let actual = hash_bytes(&self.staged);
        if actual != self.hash {
            error!(unit = %unit.name, item_id = %self.item_id, "Content does not match item hash");
            metrics::record_integrity_failure(&unit.name);
            return Err(StorageError::Integrity(format!(
                "content written for item {} does not match its hash",
                self.item_id
            )));
        }

        let sealed = unit.encryption.seal(&self.hash, &self.staged)?;
        let plain_len = self.staged.len();

        let _timer = LatencyTimer::new(unit.name.as_str(), "write");
        match unit.backend.put_object(self.item_type, &self.locator, sealed).await {
            Ok(()) => {
                metrics::record_operation(&unit.name, "write", "success");
                metrics::record_bytes_written(&unit.name, plain_len);
                debug!(unit = %unit.name, item_id = %self.item_id, bytes = plain_len, "Item written");
                Ok(())
            }
            Err(e) => {
                metrics::record_operation(&unit.name, "write", "error");
                Err(e)
            }
        }
    }
}

impl AsyncWrite for ItemWriter<'_> {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().staged.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Does not commit; call [`ItemWriter::close`].
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// The always-present first write target.
pub struct Buffer {
    id: String,
    name: String,
    backend: Arc<dyn BufferBackend>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.backend.kind())
            .finish()
    }
}

impl Buffer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, backend: Arc<dyn BufferBackend>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            backend,
        }
    }

    fn require_locator(item_unit: &ItemUnit) -> Result<&str, StorageError> {
        if item_unit.locator.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "buffer item unit {} has no locator",
                item_unit.id
            )));
        }
        Ok(&item_unit.locator)
    }

    /// Append one chunk (typically one log line) for the item.
    pub async fn add(&self, item_unit: &ItemUnit, order_key: f64, chunk: &str) -> Result<(), StorageError> {
        if order_key.is_nan() {
            return Err(StorageError::InvalidInput("order key must be a number".into()));
        }
        let locator = Self::require_locator(item_unit)?;
        let result = self.backend.add(locator, order_key, chunk).await;
        metrics::record_operation(&self.name, "add", if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Drop everything buffered for the item.
    pub async fn remove(&self, item_unit: &ItemUnit) -> Result<(), StorageError> {
        let locator = Self::require_locator(item_unit)?;
        self.backend.remove(locator).await
    }
}

#[async_trait]
impl Unit for Buffer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    fn new_locator(&self, item: &Item) -> Result<String, StorageError> {
        if item.api_ref_hash.is_empty() {
            return Err(AddressingError::EmptyIdentity.into());
        }
        Ok(item.api_ref_hash.clone())
    }

    /// Chunks joined with `\n`, no trailing newline. No chunks, empty reader.
    async fn new_reader(&self, item_unit: &ItemUnit) -> Result<ContentReader, StorageError> {
        let locator = Self::require_locator(item_unit)?;
        let _timer = LatencyTimer::new(self.name.as_str(), "read");
        let chunks = self.backend.chunks(locator).await?;
        metrics::record_operation(&self.name, "read", "success");
        if chunks.is_empty() {
            return Ok(ContentReader::empty());
        }
        Ok(ContentReader::new(chunks.join("\n").into_bytes()))
    }

    async fn item_exists(&self, item: &Item) -> Result<bool, StorageError> {
        let locator = self.new_locator(item)?;
        self.backend.exists(&locator).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use dashmap::DashMap;

    use crate::index::ItemType;
    use crate::storage::traits::{StorageError, UnitBackend};

    /// Object map keyed by (type, locator).
    #[derive(Default)]
    pub struct MemoryObjects {
        pub objects: DashMap<(ItemType, String), Vec<u8>>,
    }

    #[async_trait]
    impl UnitBackend for MemoryObjects {
        fn kind(&self) -> &'static str {
            "memory-objects"
        }

        async fn put_object(&self, item_type: ItemType, locator: &str, data: Vec<u8>) -> Result<(), StorageError> {
            self.objects.insert((item_type, locator.to_string()), data);
            Ok(())
        }

        async fn get_object(&self, item_type: ItemType, locator: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .get(&(item_type, locator.to_string()))
                .map(|r| r.value().clone())
                .ok_or_else(|| StorageError::NotFound(locator.to_string()))
        }

        async fn object_exists(&self, item_type: ItemType, locator: &str) -> Result<bool, StorageError> {
            Ok(self.objects.contains_key(&(item_type, locator.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryObjects;
    use super::*;
    use crate::convergent::{ConvergentConfig, AES_GCM};
    use crate::index::{ApiRef, ItemStatus};
    use crate::storage::memory::InMemoryBuffer;
    use tokio::io::AsyncWriteExt;

    fn ring(pairs: &[(&str, &str)]) -> ConvergentEncryption {
        ConvergentEncryption::new(
            pairs
                .iter()
                .map(|(salt, secret)| ConvergentConfig {
                    cipher: AES_GCM.into(),
                    locator_salt: salt.to_string(),
                    secret_value: secret.to_string(),
                })
                .collect(),
        )
        .unwrap()
    }

    fn completed_item(content: &[u8]) -> Item {
        let mut item = Item::new(ApiRef { project_key: "P".into(), ..Default::default() }, ItemType::StepLog).unwrap();
        item.id = "item-1".into();
        item.hash = hash_bytes(content);
        item.status = ItemStatus::Completed;
        item
    }

    fn unit_with(backend: Arc<MemoryObjects>, keys: &[(&str, &str)]) -> StorageUnit {
        StorageUnit::new("unit-1", "unit", Duration::from_secs(1), ring(keys), backend)
    }

    fn item_unit_for(unit: &dyn Unit, item: &Item) -> ItemUnit {
        ItemUnit {
            id: "iu-1".into(),
            item_id: item.id.clone(),
            unit_id: unit.id().to_string(),
            locator: unit.new_locator(item).unwrap(),
            created: 0,
            item: item.clone(),
        }
    }

    async fn write(unit: &StorageUnit, item_unit: &ItemUnit, content: &[u8]) -> Result<(), StorageError> {
        let mut writer = unit.new_writer(item_unit)?;
        writer.write_all(content).await.unwrap();
        writer.close().await
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let backend = Arc::new(MemoryObjects::default());
        let unit = unit_with(backend.clone(), &[("salt", "secret")]);
        let item = completed_item(b"hello\nworld");
        let item_unit = item_unit_for(&unit, &item);

        assert!(!unit.item_exists(&item).await.unwrap());
        write(&unit, &item_unit, b"hello\nworld").await.unwrap();
        assert!(unit.item_exists(&item).await.unwrap());

        let stored = backend.objects.iter().next().unwrap().value().clone();
        assert_ne!(stored, b"hello\nworld", "backend must only see ciphertext");

        let mut reader = unit.new_reader(&item_unit).await.unwrap();
        let mut sink = Vec::new();
        let n = unit.read(&item_unit, &mut reader, &mut sink).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(sink, b"hello\nworld");
    }

    #[tokio::test]
    async fn test_dropped_writer_writes_nothing() {
        let backend = Arc::new(MemoryObjects::default());
        let unit = unit_with(backend.clone(), &[("salt", "secret")]);
        let item = completed_item(b"abc");
        let item_unit = item_unit_for(&unit, &item);

        {
            let mut writer = unit.new_writer(&item_unit).unwrap();
            writer.write_all(b"abc").await.unwrap();
        }
        assert!(backend.objects.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_content_not_matching_hash() {
        let backend = Arc::new(MemoryObjects::default());
        let unit = unit_with(backend.clone(), &[("salt", "secret")]);
        let item = completed_item(b"expected");
        let item_unit = item_unit_for(&unit, &item);

        let err = write(&unit, &item_unit, b"something else").await.unwrap_err();
        assert!(err.is_integrity());
        assert!(backend.objects.is_empty());
    }

    #[tokio::test]
    async fn test_writer_requires_this_units_locator() {
        let backend = Arc::new(MemoryObjects::default());
        let unit = unit_with(backend, &[("salt", "secret")]);
        let item = completed_item(b"x");
        let mut item_unit = item_unit_for(&unit, &item);
        item_unit.locator = "someone-elses".into();

        assert!(matches!(unit.new_writer(&item_unit), Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_rotated_key_still_reads_old_content() {
        let backend = Arc::new(MemoryObjects::default());
        let old = unit_with(backend.clone(), &[("salt-1", "secret-1")]);
        let item = completed_item(b"legacy");
        let old_item_unit = item_unit_for(&old, &item);
        write(&old, &old_item_unit, b"legacy").await.unwrap();

        let rotated = unit_with(backend, &[("salt-2", "secret-2"), ("salt-1", "secret-1")]);
        assert!(rotated.item_exists(&item).await.unwrap());
        assert_ne!(rotated.new_locator(&item).unwrap(), old_item_unit.locator);

        let reader = rotated.new_reader(&old_item_unit).await.unwrap();
        assert_eq!(reader.into_inner(), b"legacy");
    }

    #[tokio::test]
    async fn test_wrong_keys_fail_integrity() {
        let backend = Arc::new(MemoryObjects::default());
        let writer_unit = unit_with(backend.clone(), &[("salt", "secret")]);
        let item = completed_item(b"secret log");
        let item_unit = item_unit_for(&writer_unit, &item);
        write(&writer_unit, &item_unit, b"secret log").await.unwrap();

        let other = unit_with(backend, &[("salt", "other-secret")]);
        let err = other.new_reader(&item_unit).await.unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_redacted_item_is_rejected() {
        let unit = unit_with(Arc::new(MemoryObjects::default()), &[("salt", "secret")]);
        let mut item = completed_item(b"x");
        item.hash.clear();
        assert!(matches!(unit.new_locator(&item), Err(StorageError::InvalidInput(_))));
        assert!(unit.item_exists(&item).await.is_err());
    }

    #[tokio::test]
    async fn test_buffer_joins_chunks_in_order() {
        let buffer = Buffer::new("buf-1", "buffer", Arc::new(InMemoryBuffer::new()));
        let item = completed_item(b"");
        let item_unit = item_unit_for(&buffer, &item);
        assert_eq!(item_unit.locator, item.api_ref_hash);

        buffer.add(&item_unit, 2.0, "second log").await.unwrap();
        buffer.add(&item_unit, 1.0, "first log").await.unwrap();

        let reader = buffer.new_reader(&item_unit).await.unwrap();
        assert_eq!(reader.into_inner(), b"first log\nsecond log");
        assert!(buffer.item_exists(&item).await.unwrap());

        // restartable
        let again = buffer.new_reader(&item_unit).await.unwrap();
        assert_eq!(again.len(), "first log\nsecond log".len());
    }

    #[tokio::test]
    async fn test_buffer_reader_for_unknown_item_is_empty() {
        let buffer = Buffer::new("buf-1", "buffer", Arc::new(InMemoryBuffer::new()));
        let item = completed_item(b"");
        let item_unit = item_unit_for(&buffer, &item);

        assert!(buffer.new_reader(&item_unit).await.unwrap().is_empty());
        assert!(!buffer.item_exists(&item).await.unwrap());
    }

    #[tokio::test]
    async fn test_buffer_rejects_nan_order_key() {
        let buffer = Buffer::new("buf-1", "buffer", Arc::new(InMemoryBuffer::new()));
        let item = completed_item(b"");
        let item_unit = item_unit_for(&buffer, &item);
        assert!(matches!(
            buffer.add(&item_unit, f64::NAN, "x").await,
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_buffer_remove() {
        let buffer = Buffer::new("buf-1", "buffer", Arc::new(InMemoryBuffer::new()));
        let item = completed_item(b"");
        let item_unit = item_unit_for(&buffer, &item);
        buffer.add(&item_unit, 1.0, "x").await.unwrap();
        buffer.remove(&item_unit).await.unwrap();
        assert!(!buffer.item_exists(&item).await.unwrap());
    }
}
