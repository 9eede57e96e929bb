// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Units orchestrator.
//!
//! [`RunningStorageUnits`] owns the buffer, every persistent unit that
//! initialized successfully, and one resync task per unit.
//!
//! # Lifecycle
//!
//! ```text
//! init() → Initialized → start() → Running → shutdown() → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cdn_storage::{Configuration, Database, DriverRegistry, KeyedCodec, RunningStorageUnits, UnitsState};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), cdn_storage::StorageError> {
//! let db = Database::connect("sqlite:///var/lib/cdn/index.db?mode=rwc").await?;
//! let codec = Arc::new(KeyedCodec::new("signing-secret", "encryption-secret"));
//! let units = RunningStorageUnits::init(Configuration::default(), db, codec, &DriverRegistry::with_defaults()).await?;
//! assert_eq!(units.state(), UnitsState::Initialized);
//!
//! units.start()?;
//! // ... ingest through units.buffer() ...
//! units.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod resync;
mod types;

pub use types::{ResyncReport, Shutdown, UnitsState};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::codec::EntityCodec;
use crate::config::Configuration;
use crate::convergent::ConvergentEncryption;
use crate::index::{Item, ItemIndex, LoadOptions};
use crate::metrics;
use crate::storage::registry::DriverRegistry;
use crate::storage::repository::UnitRepository;
use crate::storage::sql::Database;
use crate::storage::traits::StorageError;
use crate::storage::{Buffer, ItemUnit, StorageUnit, StorageUnitRecord, Unit};

use resync::{PassState, SyncContext};

/// The running storage tier.
pub struct RunningStorageUnits {
    ctx: SyncContext,
    /// Config order
    storages: Vec<Arc<StorageUnit>>,
    by_name: HashMap<String, Arc<StorageUnit>>,

    state: watch::Sender<UnitsState>,
    state_rx: watch::Receiver<UnitsState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunningStorageUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningStorageUnits")
            .field("state", &self.state())
            .field("buffer", &self.ctx.buffer)
            .field("storages", &self.storages)
            .finish()
    }
}

impl RunningStorageUnits {
    /// Build the buffer and every configured unit, registering each in the
    /// `storage_unit` table.
    ///
    /// A unit whose backend or key ring fails to initialize is logged and
    /// left out. A buffer failure fails the whole call.
    #[tracing::instrument(skip_all, fields(buffer = %config.buffer.name, storages = config.storages.len()))]
    pub async fn init(
        config: Configuration,
        db: Database,
        codec: Arc<dyn EntityCodec>,
        registry: &DriverRegistry,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let repo = UnitRepository::new(db, codec);

        // ========== Buffer (required) ==========
        let backend = match registry.build_buffer(&config.buffer.kind, config.buffer.params.clone()).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(kind = %config.buffer.kind, error = %e, "Buffer failed to initialize");
                metrics::record_unit_init_failure(&config.buffer.name, &config.buffer.kind);
                return Err(e);
            }
        };
        let mut record = StorageUnitRecord {
            id: String::new(),
            name: config.buffer.name.clone(),
            created: 0,
            sync_interval_ms: 0,
            kind: backend.kind().to_string(),
            encryption: Vec::new(),
        };
        repo.upsert_unit(&mut record).await?;
        let buffer = Arc::new(Buffer::new(record.id, record.name, backend));
        info!(buffer = %config.buffer.name, kind = %config.buffer.kind, "Buffer ready");

        // ========== Persistent units (best effort) ==========
        let mut storages = Vec::with_capacity(config.storages.len());
        for storage in &config.storages {
            let encryption = match ConvergentEncryption::new(storage.encryption.clone()) {
                Ok(encryption) => encryption,
                Err(e) => {
                    error!(unit = %storage.name, error = %e, "Storage unit key ring rejected, unit disabled");
                    metrics::record_unit_init_failure(&storage.name, &storage.kind);
                    continue;
                }
            };
            let backend = match registry.build_unit(&storage.kind, storage.params.clone()).await {
                Ok(backend) => backend,
                Err(e) => {
                    error!(unit = %storage.name, kind = %storage.kind, error = %e, "Storage unit failed to initialize, unit disabled");
                    metrics::record_unit_init_failure(&storage.name, &storage.kind);
                    continue;
                }
            };

            let mut record = StorageUnitRecord {
                id: String::new(),
                name: storage.name.clone(),
                created: 0,
                sync_interval_ms: storage.sync_interval_ms,
                kind: storage.kind.clone(),
                encryption: storage.encryption.clone(),
            };
            repo.upsert_unit(&mut record).await?;

            info!(unit = %storage.name, kind = %storage.kind, unit_id = %record.id, "Storage unit ready");
            storages.push(Arc::new(StorageUnit::new(
                record.id,
                record.name,
                storage.sync_interval(),
                encryption,
                backend,
            )));
        }

        if storages.len() < config.storages.len() {
            warn!(
                configured = config.storages.len(),
                loaded = storages.len(),
                "Some storage units are disabled"
            );
        }
        metrics::set_units_loaded(storages.len());

        let by_id = storages.iter().map(|u| (u.id().to_string(), u.clone())).collect();
        let passes = storages
            .iter()
            .map(|u| (u.id().to_string(), Arc::new(tokio::sync::Mutex::new(PassState::default()))))
            .collect();
        let by_name = storages.iter().map(|u| (u.name().to_string(), u.clone())).collect();

        let (state_tx, state_rx) = watch::channel(UnitsState::Initialized);
        let (shutdown_tx, _) = watch::channel(false);
        metrics::set_units_state("Initialized");

        Ok(Self {
            ctx: SyncContext {
                repo,
                buffer,
                units: Arc::new(by_id),
                passes: Arc::new(passes),
                settings: config.resync,
            },
            storages,
            by_name,
            state: state_tx,
            state_rx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn state(&self) -> UnitsState {
        *self.state_rx.borrow()
    }

    /// Receiver for watching lifecycle changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<UnitsState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: UnitsState) {
        let _ = self.state.send(state);
        metrics::set_units_state(&state.to_string());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookups
    // ═══════════════════════════════════════════════════════════════════════

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.ctx.buffer
    }

    /// Persistent unit by configured name.
    pub fn storage(&self, name: &str) -> Result<Arc<StorageUnit>, StorageError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("storage unit '{}'", name)))
    }

    pub fn storage_by_id(&self, id: &str) -> Result<Arc<StorageUnit>, StorageError> {
        self.ctx
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("storage unit {}", id)))
    }

    /// Loaded persistent units, in configuration order.
    pub fn storages(&self) -> &[Arc<StorageUnit>] {
        &self.storages
    }

    pub fn repository(&self) -> &UnitRepository {
        &self.ctx.repo
    }

    pub fn index(&self) -> &ItemIndex {
        self.ctx.repo.index()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Item units
    // ═══════════════════════════════════════════════════════════════════════

    /// In-memory mapping of `item` onto `unit`, locator derived. Persist it
    /// with [`insert_item_unit`](Self::insert_item_unit) once the content is
    /// durably written.
    pub fn new_item_unit(&self, unit: &dyn Unit, item: &Item) -> Result<ItemUnit, StorageError> {
        resync::new_item_unit(unit, item)
    }

    pub async fn insert_item_unit(&self, item_unit: &mut ItemUnit) -> Result<(), StorageError> {
        self.ctx.repo.insert_item_unit(item_unit).await
    }

    pub async fn load_all_units(&self, opts: LoadOptions) -> Result<Vec<StorageUnitRecord>, StorageError> {
        self.ctx.repo.load_all_units(opts).await
    }

    pub async fn load_unit_by_name(&self, name: &str, opts: LoadOptions) -> Result<StorageUnitRecord, StorageError> {
        self.ctx.repo.load_unit_by_name(name, opts).await
    }

    pub async fn load_unit_by_id(&self, id: &str, opts: LoadOptions) -> Result<StorageUnitRecord, StorageError> {
        self.ctx.repo.load_unit_by_id(id, opts).await
    }

    pub async fn load_item_unit_by_id(&self, id: &str, opts: LoadOptions) -> Result<ItemUnit, StorageError> {
        self.ctx.repo.load_item_unit_by_id(id, opts).await
    }

    pub async fn load_item_unit_by_unit(
        &self,
        unit_id: &str,
        item_id: &str,
        opts: LoadOptions,
    ) -> Result<ItemUnit, StorageError> {
        self.ctx.repo.load_item_unit_by_unit(unit_id, item_id, opts).await
    }

    pub async fn load_item_units_by_item(&self, item_id: &str, opts: LoadOptions) -> Result<Vec<ItemUnit>, StorageError> {
        self.ctx.repo.load_item_units_by_item(item_id, opts).await
    }

    pub async fn load_all_item_id_unknown_by_unit(&self, unit_id: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        self.ctx.repo.load_all_item_id_unknown_by_unit(unit_id, limit).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resync
    // ═══════════════════════════════════════════════════════════════════════

    /// One resync pass over the named unit, outside the schedule. Waits for
    /// a scheduled pass on the same unit to finish first. Honors shutdown if
    /// the orchestrator is stopping.
    pub async fn sync_unit_once(&self, name: &str) -> Result<ResyncReport, StorageError> {
        let unit = self.storage(name)?;
        let shutdown = Shutdown::new(self.shutdown_tx.subscribe());
        resync::run_pass(&self.ctx, &unit, &shutdown).await
    }

    /// Spawn one resync task per loaded unit.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<(), StorageError> {
        let state = self.state();
        if state != UnitsState::Initialized {
            return Err(StorageError::InvalidInput(format!("cannot start units in state {}", state)));
        }

        let mut tasks = self.tasks.lock();
        for unit in &self.storages {
            let shutdown = Shutdown::new(self.shutdown_tx.subscribe());
            tasks.push(tokio::spawn(resync::run_unit_loop(self.ctx.clone(), unit.clone(), shutdown)));
        }
        drop(tasks);

        self.set_state(UnitsState::Running);
        info!(units = self.storages.len(), "Storage units running");
        Ok(())
    }

    /// Signal every resync task and wait for them to finish. In-flight items
    /// complete or fail on their own; no new item is started.
    pub async fn shutdown(&self) {
        if matches!(self.state(), UnitsState::ShuttingDown | UnitsState::Stopped) {
            return;
        }
        info!("Shutting down storage units...");
        self.set_state(UnitsState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Resync task ended abnormally");
            }
        }

        self.set_state(UnitsState::Stopped);
        info!("Storage units shutdown complete");
    }
}

impl Drop for RunningStorageUnits {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KeyedCodec;
    use crate::config::StorageConfiguration;
    use crate::convergent::{hash_bytes, ConvergentConfig, AES_GCM};
    use crate::index::{ApiRef, ItemStatus, ItemType};
    use crate::storage::sql::test_support::temp_database;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn local(name: &str, root: &std::path::Path, salt: &str, interval_ms: u64) -> StorageConfiguration {
        StorageConfiguration {
            name: name.into(),
            sync_interval_ms: interval_ms,
            kind: "local".into(),
            params: serde_json::json!({ "path": root.join(name) }),
            encryption: vec![ConvergentConfig {
                cipher: AES_GCM.into(),
                locator_salt: salt.into(),
                secret_value: format!("{}-secret", salt),
            }],
        }
    }

    async fn units_with(storages: Vec<StorageConfiguration>) -> (RunningStorageUnits, tempfile::TempDir) {
        let (db, dir) = temp_database().await;
        let config = Configuration { storages, ..Default::default() };
        let units = RunningStorageUnits::init(
            config,
            db,
            Arc::new(KeyedCodec::new("sign", "enc")),
            &DriverRegistry::with_defaults(),
        )
        .await
        .unwrap();
        (units, dir)
    }

    /// Ingest `lines` through the buffer and mark the item completed.
    async fn ingest(units: &RunningStorageUnits, step: i64, lines: &[&str]) -> Item {
        let mut item = Item::new(
            ApiRef { project_key: "P".into(), step_order: Some(step), ..Default::default() },
            ItemType::StepLog,
        )
        .unwrap();
        units.index().insert_item(&mut item).await.unwrap();

        let mut buffered = units.new_item_unit(units.buffer().as_ref(), &item).unwrap();
        for (i, line) in lines.iter().enumerate() {
            units.buffer().add(&buffered, i as f64, line).await.unwrap();
        }
        units.insert_item_unit(&mut buffered).await.unwrap();

        item.hash = hash_bytes(lines.join("\n").as_bytes());
        item.status = ItemStatus::Completed;
        units.index().update_item(&mut item).await.unwrap();
        item
    }

    #[tokio::test]
    async fn test_init_registers_units() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![local("a", root.path(), "s1", 1000)]).await;

        assert_eq!(units.state(), UnitsState::Initialized);
        assert_eq!(units.storages().len(), 1);
        let a = units.storage("a").unwrap();
        assert_eq!(units.storage_by_id(a.id()).unwrap().name(), "a");

        let records = units.load_all_units(LoadOptions::DEFAULT).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"buffer"));
        assert!(names.contains(&"a"));
    }

    #[tokio::test]
    async fn test_unknown_storage_is_not_found() {
        let (units, _dir) = units_with(vec![]).await;
        assert!(units.storage("missing").unwrap_err().is_not_found());
        assert!(units.storage_by_id("missing").unwrap_err().is_not_found());
        assert!(units.sync_unit_once("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_unit_is_left_out() {
        let root = tempfile::tempdir().unwrap();
        let mut broken = local("broken", root.path(), "s2", 1000);
        broken.kind = "webdav".into();
        let mut no_keys = local("no-keys", root.path(), "s3", 1000);
        no_keys.encryption.clear();

        let (units, _dir) = units_with(vec![local("ok", root.path(), "s1", 1000), broken, no_keys]).await;
        assert_eq!(units.storages().len(), 1);
        assert!(units.storage("ok").is_ok());
        assert!(units.storage("broken").is_err());
    }

    #[tokio::test]
    async fn test_buffer_failure_fails_init() {
        let (db, _dir) = temp_database().await;
        let mut config = Configuration::default();
        config.buffer.kind = "kafka".into();
        let result = RunningStorageUnits::init(
            config,
            db,
            Arc::new(KeyedCodec::new("sign", "enc")),
            &DriverRegistry::with_defaults(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_unit_once_copies_buffered_content() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![local("a", root.path(), "s1", 60_000)]).await;
        let item = ingest(&units, 1, &["first", "second"]).await;
        let a = units.storage("a").unwrap();

        let report = units.sync_unit_once("a").await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.synced, 1);
        assert!(report.is_success());
        assert!(a.item_exists(&item).await.unwrap());

        let mapping = units
            .load_item_unit_by_unit(a.id(), &item.id, LoadOptions::WITH_DECRYPTION)
            .await
            .unwrap();
        let mut content = String::new();
        a.new_reader(&mapping).await.unwrap().read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "first\nsecond");

        let again = units.sync_unit_once("a").await.unwrap();
        assert_eq!(again.discovered, 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_another_unit_when_buffer_is_gone() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![
            local("a", root.path(), "s1", 60_000),
            local("b", root.path(), "s2", 60_000),
        ])
        .await;
        let item = ingest(&units, 1, &["only line"]).await;

        units.sync_unit_once("a").await.unwrap();
        let buffered = units
            .load_item_unit_by_unit(units.buffer().id(), &item.id, LoadOptions::WITH_DECRYPTION)
            .await
            .unwrap();
        units.buffer().remove(&buffered).await.unwrap();

        let report = units.sync_unit_once("b").await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(units.storage("b").unwrap().item_exists(&item).await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![local("a", root.path(), "s1", 60_000)]).await;
        let mut item = ingest(&units, 1, &["real"]).await;
        item.hash = hash_bytes(b"not what was buffered");
        units.index().update_item(&mut item).await.unwrap();

        let report = units.sync_unit_once("a").await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(
            units.load_all_item_id_unknown_by_unit(units.storage("a").unwrap().id(), 10).await.unwrap(),
            vec![item.id]
        );
    }

    #[tokio::test]
    async fn test_passes_on_one_unit_do_not_overlap() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![local("a", root.path(), "s1", 60_000)]).await;
        ingest(&units, 1, &["line"]).await;
        let a = units.storage("a").unwrap();

        // Stand in for a scheduled pass that is still running
        let in_progress = units.ctx.passes[a.id()].clone().lock_owned().await;
        let blocked = tokio::time::timeout(Duration::from_millis(100), units.sync_unit_once("a")).await;
        assert!(blocked.is_err(), "manual pass ran alongside an active one");

        drop(in_progress);
        let report = units.sync_unit_once("a").await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_failing_item_does_not_starve_newer_items() {
        let root = tempfile::tempdir().unwrap();
        let (db, _dir) = temp_database().await;
        let mut config = Configuration { storages: vec![local("a", root.path(), "s1", 60_000)], ..Default::default() };
        config.resync.batch_limit = 1;
        let units = RunningStorageUnits::init(
            config,
            db,
            Arc::new(KeyedCodec::new("sign", "enc")),
            &DriverRegistry::with_defaults(),
        )
        .await
        .unwrap();

        let mut poisoned = ingest(&units, 1, &["real"]).await;
        poisoned.hash = hash_bytes(b"not what was buffered");
        units.index().update_item(&mut poisoned).await.unwrap();
        let good = ingest(&units, 2, &["fine"]).await;

        let a = units.storage("a").unwrap();
        for _ in 0..3 {
            units.sync_unit_once("a").await.unwrap();
        }
        assert!(a.item_exists(&good).await.unwrap());
        assert_eq!(
            units.load_all_item_id_unknown_by_unit(a.id(), 10).await.unwrap(),
            vec![poisoned.id.clone()]
        );

        // The failing item keeps getting retried once nothing else is waiting
        let report = units.sync_unit_once("a").await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let (units, _dir) = units_with(vec![local("a", root.path(), "s1", 20)]).await;
        let item = ingest(&units, 1, &["tick"]).await;
        let mut state_rx = units.state_receiver();

        units.start().unwrap();
        assert_eq!(units.state(), UnitsState::Running);
        assert!(units.start().is_err());
        assert_eq!(*state_rx.borrow_and_update(), UnitsState::Running);

        let a = units.storage("a").unwrap();
        let mut synced = false;
        for _ in 0..100 {
            if a.item_exists(&item).await.unwrap() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced, "resync task never copied the item");

        units.shutdown().await;
        assert_eq!(units.state(), UnitsState::Stopped);
        units.shutdown().await;
    }
}
