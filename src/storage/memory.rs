// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{BufferBackend, StorageError};

/// Process-local buffer backend. Each locator holds its chunks sorted by
/// order key; ties stay in arrival order.
pub struct InMemoryBuffer {
    data: DashMap<String, Vec<(f64, String)>>,
}

impl InMemoryBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of buffered items (locators), not chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BufferBackend for InMemoryBuffer {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, locator: &str, order_key: f64, chunk: &str) -> Result<(), StorageError> {
        let mut entry = self.data.entry(locator.to_string()).or_default();
        // Insert after every chunk with key <= order_key.
        let at = entry.partition_point(|(key, _)| *key <= order_key);
        entry.insert(at, (order_key, chunk.to_string()));
        Ok(())
    }

    async fn chunks(&self, locator: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .get(locator)
            .map(|r| r.value().iter().map(|(_, chunk)| chunk.clone()).collect())
            .unwrap_or_default())
    }

    async fn exists(&self, locator: &str) -> Result<bool, StorageError> {
        Ok(self.data.get(locator).is_some_and(|r| !r.value().is_empty()))
    }

    async fn remove(&self, locator: &str) -> Result<(), StorageError> {
        self.data.remove(locator);
        Ok(())
    }
}
