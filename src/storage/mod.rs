// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage units, the buffer, and their persisted mappings.
//!
//! - [`traits`]: error taxonomy plus the raw [`UnitBackend`](traits::UnitBackend)
//!   and [`BufferBackend`](traits::BufferBackend) contracts
//! - [`driver`]: [`StorageUnit`] and [`Buffer`], which add identity,
//!   addressing and encryption on top of a backend
//! - [`local`], [`swift`]: persistent backends
//! - [`memory`], [`redis`]: buffer backends
//! - [`registry`]: kind string → backend factory
//! - [`repository`]: `storage_unit` / `item_unit` tables
//! - [`sql`]: shared connection pool and schema

pub mod driver;
pub mod local;
pub mod memory;
pub mod redis;
pub mod registry;
pub mod repository;
pub mod sql;
pub mod swift;
pub mod traits;

pub use driver::{Buffer, ItemWriter, StorageUnit, Unit};

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::convergent::ConvergentConfig;
use crate::index::Item;

/// "Item X is durably present on unit Y at address `locator`."
///
/// Created in memory by
/// [`RunningStorageUnits::new_item_unit`](crate::units::RunningStorageUnits::new_item_unit)
/// and persisted separately. Never mutated once persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUnit {
    pub id: String,
    pub item_id: String,
    pub unit_id: String,
    /// Empty when loaded without decryption.
    pub locator: String,
    /// Epoch millis
    pub created: i64,
    pub item: Item,
}

/// Persisted identity and settings of a storage unit (the buffer included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUnitRecord {
    pub id: String,
    pub name: String,
    pub created: i64,
    pub sync_interval_ms: u64,
    pub kind: String,
    /// Newest first. Empty when loaded without decryption, and for the buffer.
    pub encryption: Vec<ConvergentConfig>,
}

/// Forward-only plaintext stream handed out by unit readers.
///
/// Content is fetched and decrypted up front, so the reader holds no backend
/// handle and dropping it releases everything.
#[derive(Debug)]
pub struct ContentReader {
    inner: Cursor<Vec<u8>>,
}

impl ContentReader {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            inner: Cursor::new(content),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Total plaintext length, independent of how much has been read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.get_ref().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl AsyncRead for ContentReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
