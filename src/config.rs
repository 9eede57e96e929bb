// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the storage units.
//!
//! # Example
//!
//! ```
//! use cdn_storage::config::{Configuration, StorageConfiguration};
//! use cdn_storage::convergent::{ConvergentConfig, AES_GCM};
//!
//! // Minimal config: in-memory buffer, no persistent units
//! let config = Configuration::default();
//! assert_eq!(config.buffer.kind, "memory");
//! assert_eq!(config.resync.batch_limit, 100);
//!
//! // One local unit
//! let config = Configuration {
//!     storages: vec![StorageConfiguration {
//!         name: "local".into(),
//!         sync_interval_ms: 1_000,
//!         kind: "local".into(),
//!         params: serde_json::json!({ "path": "/var/lib/cdn" }),
//!         encryption: vec![ConvergentConfig {
//!             cipher: AES_GCM.into(),
//!             locator_salt: "salt".into(),
//!             secret_value: "secret".into(),
//!         }],
//!     }],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::convergent::ConvergentConfig;
use crate::storage::traits::StorageError;

/// Top-level configuration handed to
/// [`RunningStorageUnits::init`](crate::units::RunningStorageUnits::init).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub buffer: BufferConfiguration,

    #[serde(default)]
    pub storages: Vec<StorageConfiguration>,

    #[serde(default)]
    pub resync: ResyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfiguration {
    #[serde(default = "default_buffer_name")]
    pub name: String,

    /// Registered buffer kind ("memory", "redis")
    #[serde(default = "default_buffer_kind")]
    pub kind: String,

    /// Kind-specific parameters, e.g. `{"url": "redis://...", "ttl_secs": 86400}`
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfiguration {
    pub name: String,

    /// Resync tick interval (default: 60s)
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Registered unit kind ("local", "swift")
    pub kind: String,

    /// Kind-specific parameters, e.g. `{"path": "/var/lib/cdn"}`
    #[serde(default)]
    pub params: serde_json::Value,

    /// Newest first
    pub encryption: Vec<ConvergentConfig>,
}

impl StorageConfiguration {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResyncSettings {
    /// Max items discovered per tick (default: 100)
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Deadline for syncing a single item (default: 30s)
    #[serde(default = "default_item_timeout_ms")]
    pub item_timeout_ms: u64,

    /// Ceiling for the fatal-error backoff (default: 10 min)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Probe the target with `item_exists` after each write (default: true)
    #[serde(default = "default_verify_after_write")]
    pub verify_after_write: bool,
}

impl ResyncSettings {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_buffer_name() -> String { "buffer".to_string() }
fn default_buffer_kind() -> String { "memory".to_string() }
fn default_sync_interval_ms() -> u64 { 60_000 }
fn default_batch_limit() -> usize { 100 }
fn default_item_timeout_ms() -> u64 { 30_000 }
fn default_max_backoff_ms() -> u64 { 600_000 } // 10 min
fn default_verify_after_write() -> bool { true }

impl Default for BufferConfiguration {
    fn default() -> Self {
        Self {
            name: default_buffer_name(),
            kind: default_buffer_kind(),
            params: serde_json::Value::Null,
        }
    }
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            item_timeout_ms: default_item_timeout_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            verify_after_write: default_verify_after_write(),
        }
    }
}

impl Configuration {
    /// Structural checks. Backend params and key material are checked when
    /// the units are initialized.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.buffer.name.is_empty() {
            return Err(StorageError::Config("buffer name is empty".into()));
        }
        if self.buffer.kind.is_empty() {
            return Err(StorageError::Config("buffer kind is empty".into()));
        }

        let mut names = HashSet::new();
        names.insert(self.buffer.name.as_str());
        for storage in &self.storages {
            if storage.name.is_empty() {
                return Err(StorageError::Config("storage unit name is empty".into()));
            }
            if !names.insert(storage.name.as_str()) {
                return Err(StorageError::Config(format!("duplicate unit name '{}'", storage.name)));
            }
            if storage.sync_interval_ms == 0 {
                return Err(StorageError::Config(format!(
                    "storage unit '{}' has a zero sync interval",
                    storage.name
                )));
            }
        }

        if self.resync.batch_limit == 0 {
            return Err(StorageError::Config("resync batch_limit must be positive".into()));
        }
        if self.resync.item_timeout_ms == 0 {
            return Err(StorageError::Config("resync item_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::AES_GCM;

    fn storage(name: &str) -> StorageConfiguration {
        StorageConfiguration {
            name: name.into(),
            sync_interval_ms: 1000,
            kind: "local".into(),
            params: serde_json::json!({ "path": "/tmp/x" }),
            encryption: vec![ConvergentConfig {
                cipher: AES_GCM.into(),
                locator_salt: "s".into(),
                secret_value: "v".into(),
            }],
        }
    }

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.buffer.name, "buffer");
        assert_eq!(config.resync.item_timeout(), Duration::from_secs(30));
        assert_eq!(config.resync.max_backoff(), Duration::from_secs(600));
        assert!(config.resync.verify_after_write);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: Configuration = serde_json::from_value(serde_json::json!({
            "buffer": { "name": "redis_buffer", "kind": "redis", "params": { "url": "redis://localhost" } },
            "storages": [{
                "name": "local_storage",
                "kind": "local",
                "params": { "path": "/var/lib/cdn" },
                "encryption": [{ "cipher": "aes-gcm", "locator_salt": "a", "secret_value": "b" }]
            }]
        }))
        .unwrap();

        assert_eq!(config.buffer.kind, "redis");
        assert_eq!(config.storages[0].sync_interval(), Duration::from_secs(60));
        assert_eq!(config.resync.batch_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = Configuration {
            storages: vec![storage("a"), storage("a")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_unit_cannot_shadow_buffer() {
        let config = Configuration {
            storages: vec![storage("buffer")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut zero_interval = storage("a");
        zero_interval.sync_interval_ms = 0;
        let config = Configuration {
            storages: vec![zero_interval],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.resync.batch_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.buffer.name.clear();
        assert!(config.validate().is_err());
    }
}
