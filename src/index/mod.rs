// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item index: identity and lifecycle records for log items.
//!
//! An [`Item`] is inserted as [`ItemStatus::Incoming`] when a producer starts
//! streaming log lines into the buffer, and moved to
//! [`ItemStatus::Completed`] once the producer is done and the content hash
//! is known. Only completed items are replicated to storage units.
//!
//! ```
//! use cdn_storage::index::{compute_api_ref_hash, ApiRef};
//!
//! let api_ref = ApiRef { project_key: "PROJ".into(), step_order: Some(2), ..Default::default() };
//! let hash = compute_api_ref_hash(&api_ref).unwrap();
//! assert_eq!(hash, compute_api_ref_hash(&api_ref.clone()).unwrap());
//! ```

mod store;

pub use store::ItemIndex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::storage::traits::StorageError;

/// What produced a log: project, workflow run, job and step or service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRef {
    pub project_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_run_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_run_job_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_run_job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement_service_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement_service_name: Option<String>,
}

/// Stable hash of an [`ApiRef`] (hex SHA-256 of its JSON form).
///
/// Fields serialize in declaration order, so equal references always hash
/// the same.
pub fn compute_api_ref_hash(api_ref: &ApiRef) -> Result<String, StorageError> {
    let json = serde_json::to_vec(api_ref)
        .map_err(|e| StorageError::InvalidInput(format!("api ref not serializable: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&json)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Incoming,
    Completed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Incoming" => Ok(Self::Incoming),
            "Completed" => Ok(Self::Completed),
            other => Err(StorageError::Integrity(format!("unknown item status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    StepLog,
    ServiceLog,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepLog => "StepLog",
            Self::ServiceLog => "ServiceLog",
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StepLog" => Ok(Self::StepLog),
            "ServiceLog" => Ok(Self::ServiceLog),
            other => Err(StorageError::Integrity(format!("unknown item type '{}'", other))),
        }
    }
}

/// A log item as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    /// Epoch millis
    pub created: i64,
    /// Epoch millis
    pub last_modified: i64,
    /// Content integrity hash. Empty until the item is completed, and empty
    /// (redacted) when loaded without decryption.
    pub hash: String,
    pub api_ref: ApiRef,
    pub api_ref_hash: String,
    pub status: ItemStatus,
    pub item_type: ItemType,
}

impl Item {
    /// A fresh `Incoming` item for `api_ref`. `id` and `created` are assigned
    /// on insert.
    pub fn new(api_ref: ApiRef, item_type: ItemType) -> Result<Self, StorageError> {
        let api_ref_hash = compute_api_ref_hash(&api_ref)?;
        Ok(Self {
            id: String::new(),
            created: 0,
            last_modified: 0,
            hash: String::new(),
            api_ref,
            api_ref_hash,
            status: ItemStatus::Incoming,
            item_type,
        })
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Options for loading signed rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Decrypt encrypted columns. Signatures are verified either way.
    pub decrypt: bool,
}

impl LoadOptions {
    pub const WITH_DECRYPTION: Self = Self { decrypt: true };
    pub const DEFAULT: Self = Self { decrypt: false };
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_ref_hash_is_stable() {
        let a = ApiRef { project_key: "KEY".into(), run_id: Some(4), ..Default::default() };
        let b = a.clone();
        assert_eq!(compute_api_ref_hash(&a).unwrap(), compute_api_ref_hash(&b).unwrap());
    }

    #[test]
    fn test_api_ref_hash_differs_per_step() {
        let a = ApiRef { project_key: "KEY".into(), step_order: Some(1), ..Default::default() };
        let b = ApiRef { project_key: "KEY".into(), step_order: Some(2), ..Default::default() };
        assert_ne!(compute_api_ref_hash(&a).unwrap(), compute_api_ref_hash(&b).unwrap());
    }

    #[test]
    fn test_new_item_is_incoming() {
        let item = Item::new(ApiRef { project_key: "P".into(), ..Default::default() }, ItemType::StepLog).unwrap();
        assert_eq!(item.status, ItemStatus::Incoming);
        assert!(!item.api_ref_hash.is_empty());
        assert!(item.id.is_empty());
        assert!(!item.is_completed());
    }

    #[test]
    fn test_status_and_type_parse() {
        assert_eq!("Completed".parse::<ItemStatus>().unwrap(), ItemStatus::Completed);
        assert_eq!("ServiceLog".parse::<ItemType>().unwrap(), ItemType::ServiceLog);
        assert!("Done".parse::<ItemStatus>().is_err());
        assert_eq!(ItemType::StepLog.to_string(), "StepLog");
    }
}
