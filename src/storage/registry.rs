// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend kind → constructor table.
//!
//! Populated once and handed to
//! [`RunningStorageUnits::init`](crate::units::RunningStorageUnits::init).
//! Each factory receives the opaque `params` object from configuration and
//! deserializes it into its own typed config.
//!
//! ```
//! use cdn_storage::storage::registry::DriverRegistry;
//!
//! let registry = DriverRegistry::with_defaults();
//! assert!(registry.has_unit_kind("local"));
//! assert!(registry.has_buffer_kind("memory"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use super::local::{LocalBackend, LocalStorageConfig};
use super::memory::InMemoryBuffer;
use super::redis::{RedisBuffer, RedisBufferConfig};
use super::swift::{SwiftBackend, SwiftStorageConfig};
use super::traits::{BufferBackend, StorageError, UnitBackend};

pub type UnitFactory =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn UnitBackend>, StorageError>> + Send + Sync>;
pub type BufferFactory =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn BufferBackend>, StorageError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DriverRegistry {
    units: HashMap<String, UnitFactory>,
    buffers: HashMap<String, BufferFactory>,
}

/// Deserialize backend params, reporting problems as configuration errors.
pub fn parse_params<T: DeserializeOwned>(kind: &str, params: serde_json::Value) -> Result<T, StorageError> {
    serde_json::from_value(params).map_err(|e| StorageError::Config(format!("invalid {} params: {}", kind, e)))
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `local` and `swift` units; `memory` and `redis` buffers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_unit("local", |params| {
            async move {
                let config: LocalStorageConfig = parse_params("local", params)?;
                let backend: Arc<dyn UnitBackend> = Arc::new(LocalBackend::init(config).await?);
                Ok(backend)
            }
            .boxed()
        });

        registry.register_unit("swift", |params| {
            async move {
                let config: SwiftStorageConfig = parse_params("swift", params)?;
                let backend: Arc<dyn UnitBackend> = Arc::new(SwiftBackend::init(config).await?);
                Ok(backend)
            }
            .boxed()
        });

        registry.register_buffer("memory", |_params| {
            async move {
                let backend: Arc<dyn BufferBackend> = Arc::new(InMemoryBuffer::new());
                Ok(backend)
            }
            .boxed()
        });

        registry.register_buffer("redis", |params| {
            async move {
                let config: RedisBufferConfig = parse_params("redis", params)?;
                let backend: Arc<dyn BufferBackend> = Arc::new(RedisBuffer::connect(&config).await?);
                Ok(backend)
            }
            .boxed()
        });

        registry
    }

    /// Register (or replace) a persistent unit kind.
    pub fn register_unit<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn UnitBackend>, StorageError>> + Send + Sync + 'static,
    {
        self.units.insert(kind.to_string(), Arc::new(factory));
    }

    /// Register (or replace) a buffer kind.
    pub fn register_buffer<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn BufferBackend>, StorageError>> + Send + Sync + 'static,
    {
        self.buffers.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn has_unit_kind(&self, kind: &str) -> bool {
        self.units.contains_key(kind)
    }

    pub fn has_buffer_kind(&self, kind: &str) -> bool {
        self.buffers.contains_key(kind)
    }

    pub async fn build_unit(&self, kind: &str, params: serde_json::Value) -> Result<Arc<dyn UnitBackend>, StorageError> {
        let factory = self
            .units
            .get(kind)
            .ok_or_else(|| StorageError::Config(format!("unknown storage unit kind '{}'", kind)))?;
        factory(params).await
    }

    pub async fn build_buffer(&self, kind: &str, params: serde_json::Value) -> Result<Arc<dyn BufferBackend>, StorageError> {
        let factory = self
            .buffers
            .get(kind)
            .ok_or_else(|| StorageError::Config(format!("unknown buffer kind '{}'", kind)))?;
        factory(params).await
    }
}
