// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # CDN Storage
//!
//! Storage tier for CI/CD build logs: a fast ordered buffer for live output,
//! and any number of encrypted, content-addressed persistent units that are
//! kept in sync with it in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingest Layer                         │
//! │  • Item registered in the index (status Incoming)          │
//! │  • Log lines appended to the buffer with an order key      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (item hashed and marked Completed)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Item Index (SQL)                        │
//! │  • Signed rows, sealed hash                                │
//! │  • item_unit rows record which unit holds which item       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               (one resync task per unit, fixed interval)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Persistent Storage Units                  │
//! │  • Local filesystem, OpenStack Swift                       │
//! │  • Locator and key derived per unit from the content hash  │
//! │  • AES-256-GCM at rest, key ring for rotation              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cdn_storage::{
//!     hash_bytes, ApiRef, Configuration, Database, DriverRegistry, Item, ItemStatus, ItemType,
//!     KeyedCodec, RunningStorageUnits,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cdn_storage::StorageError> {
//!     let db = Database::connect("sqlite:///var/lib/cdn/index.db?mode=rwc").await?;
//!     let codec = Arc::new(KeyedCodec::new("signing-secret", "encryption-secret"));
//!     let units = RunningStorageUnits::init(Configuration::default(), db, codec, &DriverRegistry::with_defaults()).await?;
//!     units.start()?;
//!
//!     // Register the item and stream lines into the buffer
//!     let mut item = Item::new(ApiRef { project_key: "PROJ".into(), ..Default::default() }, ItemType::StepLog)?;
//!     units.index().insert_item(&mut item).await?;
//!     let mut buffered = units.new_item_unit(units.buffer().as_ref(), &item)?;
//!     units.buffer().add(&buffered, 1.0, "this is the first log").await?;
//!     units.insert_item_unit(&mut buffered).await?;
//!
//!     // Complete it; resync copies it to every unit
//!     item.hash = hash_bytes(b"this is the first log");
//!     item.status = ItemStatus::Completed;
//!     units.index().update_item(&mut item).await?;
//!
//!     units.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`units`]: [`RunningStorageUnits`], the orchestrator and resync tasks
//! - [`storage`]: buffer and unit drivers, backends, persisted mappings
//! - [`index`]: the item index
//! - [`convergent`]: per-unit content addressing and encryption
//! - [`codec`]: row signing and field encryption
//! - [`config`]: configuration surface
//! - [`resilience`]: retry logic
//! - [`metrics`]: `metrics` crate instrumentation

pub mod codec;
pub mod config;
pub mod convergent;
pub mod index;
pub mod metrics;
pub mod resilience;
pub mod storage;
pub mod units;

pub use codec::{CodecError, EntityCodec, KeyedCodec};
pub use config::{BufferConfiguration, Configuration, ResyncSettings, StorageConfiguration};
pub use convergent::{content_hash, hash_bytes, AddressingError, ConvergentConfig, ConvergentEncryption};
pub use index::{ApiRef, Item, ItemIndex, ItemStatus, ItemType, LoadOptions};
pub use metrics::LatencyTimer;
pub use resilience::retry::RetryConfig;
pub use storage::registry::DriverRegistry;
pub use storage::repository::UnitRepository;
pub use storage::sql::Database;
pub use storage::traits::{BufferBackend, StorageError, UnitBackend};
pub use storage::{Buffer, ContentReader, ItemUnit, ItemWriter, StorageUnit, StorageUnitRecord, Unit};
pub use units::{ResyncReport, RunningStorageUnits, Shutdown, UnitsState};
