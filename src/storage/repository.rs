// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence for `storage_unit` and `item_unit` rows.
//!
//! Both tables are signed with the [`EntityCodec`]. A unit's encryption
//! configs and an item unit's locator are sealed, bound to the row identity.
//! As with items, signatures are always verified and decryption only happens
//! when the caller asks for it.

use std::sync::Arc;

use sqlx::any::AnyRow;
use tracing::{debug, error};

use super::sql::{get_i64, get_string, map_sqlx, Database};
use super::traits::StorageError;
use super::{ItemUnit, StorageUnitRecord};
use crate::codec::EntityCodec;
use crate::convergent::ConvergentConfig;
use crate::index::{now_millis, ItemIndex, ItemStatus, LoadOptions};
use crate::resilience::retry::{retry, RetryConfig};

const UNIT_ENTITY: &str = "storage_unit";
const ITEM_UNIT_ENTITY: &str = "item_unit";

const UNIT_COLUMNS: &str =
    "SELECT id, name, created, sync_interval_ms, kind, cipher_encryption, signature FROM storage_unit";
const ITEM_UNIT_COLUMNS: &str =
    "SELECT id, item_id, unit_id, cipher_locator, created, signature FROM item_unit";

/// Query surface over units and item units.
#[derive(Clone)]
pub struct UnitRepository {
    db: Database,
    codec: Arc<dyn EntityCodec>,
    index: ItemIndex,
}

impl UnitRepository {
    pub fn new(db: Database, codec: Arc<dyn EntityCodec>) -> Self {
        let index = ItemIndex::new(db.clone(), codec.clone());
        Self { db, codec, index }
    }

    pub fn index(&self) -> &ItemIndex {
        &self.index
    }

    // ═══════════════════════════════════════════════════════════════════════
    // storage_unit
    // ═══════════════════════════════════════════════════════════════════════

    fn seal_encryption(&self, unit: &StorageUnitRecord) -> Result<String, StorageError> {
        let json = serde_json::to_vec(&unit.encryption)
            .map_err(|e| StorageError::InvalidInput(format!("encryption configs: {}", e)))?;
        let sealed = self
            .codec
            .encrypt_field(&json, &[unit.id.as_bytes(), unit.name.as_bytes()])?;
        Ok(hex::encode(sealed))
    }

    fn sign_unit(&self, unit: &StorageUnitRecord, cipher_encryption: &str) -> String {
        let created = unit.created.to_string();
        let interval = unit.sync_interval_ms.to_string();
        self.codec
            .sign(UNIT_ENTITY, &unit_fields(unit, &created, &interval, cipher_encryption))
    }

    /// Insert the unit, or update the existing row with the same name while
    /// keeping its id and creation time. `unit.id` and `unit.created` are
    /// filled in from whichever row ends up persisted.
    #[tracing::instrument(skip(self, unit), fields(unit = %unit.name))]
    pub async fn upsert_unit(&self, unit: &mut StorageUnitRecord) -> Result<(), StorageError> {
        if unit.name.is_empty() {
            return Err(StorageError::InvalidInput("storage unit name is empty".into()));
        }

        match self.load_unit_by_name(&unit.name, LoadOptions::DEFAULT).await {
            Ok(existing) => {
                unit.id = existing.id;
                unit.created = existing.created;
                self.update_unit(unit).await
            }
            Err(StorageError::NotFound(_)) => match self.insert_unit(unit).await {
                // Lost a race with another process registering the same name
                Err(StorageError::AlreadyExists(_)) => {
                    let existing = self.load_unit_by_name(&unit.name, LoadOptions::DEFAULT).await?;
                    unit.id = existing.id;
                    unit.created = existing.created;
                    self.update_unit(unit).await
                }
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    async fn insert_unit(&self, unit: &mut StorageUnitRecord) -> Result<(), StorageError> {
        unit.id = uuid::Uuid::new_v4().to_string();
        unit.created = now_millis();
        let cipher = self.seal_encryption(unit)?;
        let signature = self.sign_unit(unit, &cipher);

        sqlx::query(
            "INSERT INTO storage_unit (id, name, created, sync_interval_ms, kind, cipher_encryption, signature) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&unit.id)
        .bind(&unit.name)
        .bind(unit.created)
        .bind(unit.sync_interval_ms as i64)
        .bind(&unit.kind)
        .bind(&cipher)
        .bind(&signature)
        .execute(self.db.pool())
        .await
        .map_err(map_sqlx)?;

        debug!(unit_id = %unit.id, "Storage unit registered");
        Ok(())
    }

    async fn update_unit(&self, unit: &StorageUnitRecord) -> Result<(), StorageError> {
        let cipher = self.seal_encryption(unit)?;
        let signature = self.sign_unit(unit, &cipher);

        let result = sqlx::query(
            "UPDATE storage_unit SET sync_interval_ms = ?, kind = ?, cipher_encryption = ?, signature = ? WHERE id = ?",
        )
        .bind(unit.sync_interval_ms as i64)
        .bind(&unit.kind)
        .bind(&cipher)
        .bind(&signature)
        .bind(&unit.id)
        .execute(self.db.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("storage unit {}", unit.id)));
        }
        Ok(())
    }

    pub async fn load_all_units(&self, opts: LoadOptions) -> Result<Vec<StorageUnitRecord>, StorageError> {
        let query = format!("{} ORDER BY created, name", UNIT_COLUMNS);
        let rows = retry("unit_load_all", &RetryConfig::query(), || async {
            sqlx::query(&query).fetch_all(self.db.pool()).await.map_err(map_sqlx)
        })
        .await?;
        rows.iter().map(|row| self.unit_from_row(row, opts)).collect()
    }

    pub async fn load_unit_by_name(&self, name: &str, opts: LoadOptions) -> Result<StorageUnitRecord, StorageError> {
        let query = format!("{} WHERE name = ?", UNIT_COLUMNS);
        match self.fetch_optional(&query, &[name]).await? {
            Some(row) => self.unit_from_row(&row, opts),
            None => Err(StorageError::NotFound(format!("storage unit '{}'", name))),
        }
    }

    pub async fn load_unit_by_id(&self, id: &str, opts: LoadOptions) -> Result<StorageUnitRecord, StorageError> {
        let query = format!("{} WHERE id = ?", UNIT_COLUMNS);
        match self.fetch_optional(&query, &[id]).await? {
            Some(row) => self.unit_from_row(&row, opts),
            None => Err(StorageError::NotFound(format!("storage unit {}", id))),
        }
    }

    fn unit_from_row(&self, row: &AnyRow, opts: LoadOptions) -> Result<StorageUnitRecord, StorageError> {
        let sync_interval_ms = get_i64(row, "sync_interval_ms")?;
        let mut unit = StorageUnitRecord {
            id: get_string(row, "id")?,
            name: get_string(row, "name")?,
            created: get_i64(row, "created")?,
            sync_interval_ms: u64::try_from(sync_interval_ms)
                .map_err(|_| StorageError::Integrity(format!("negative sync interval {}", sync_interval_ms)))?,
            kind: get_string(row, "kind")?,
            encryption: Vec::new(),
        };
        let cipher = get_string(row, "cipher_encryption")?;
        let signature = get_string(row, "signature")?;

        let created = unit.created.to_string();
        let interval = unit.sync_interval_ms.to_string();
        if let Err(e) = self.codec.verify(
            UNIT_ENTITY,
            &unit_fields(&unit, &created, &interval, &cipher),
            &signature,
        ) {
            error!(unit_id = %unit.id, error = %e, "Storage unit signature verification failed");
            crate::metrics::record_integrity_failure("storage_unit");
            return Err(StorageError::Integrity(format!("storage unit {}: {}", unit.id, e)));
        }

        if opts.decrypt {
            let sealed = hex::decode(&cipher)
                .map_err(|e| StorageError::Integrity(format!("storage unit {} encryption: {}", unit.id, e)))?;
            let json = self
                .codec
                .decrypt_field(&sealed, &[unit.id.as_bytes(), unit.name.as_bytes()])?;
            unit.encryption = serde_json::from_slice::<Vec<ConvergentConfig>>(&json)
                .map_err(|e| StorageError::Integrity(format!("storage unit {} encryption: {}", unit.id, e)))?;
        }
        Ok(unit)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // item_unit
    // ═══════════════════════════════════════════════════════════════════════

    fn sign_item_unit(&self, iu: &ItemUnit, cipher_locator: &str) -> String {
        let created = iu.created.to_string();
        self.codec.sign(ITEM_UNIT_ENTITY, &item_unit_fields(iu, cipher_locator, &created))
    }

    /// Persist the mapping. A second row for the same `(item, unit)` pair is
    /// [`StorageError::AlreadyExists`].
    #[tracing::instrument(skip(self, item_unit), fields(item_id = %item_unit.item_id, unit_id = %item_unit.unit_id))]
    pub async fn insert_item_unit(&self, item_unit: &mut ItemUnit) -> Result<(), StorageError> {
        if item_unit.item_id.is_empty() || item_unit.unit_id.is_empty() {
            return Err(StorageError::InvalidInput("item unit needs an item id and a unit id".into()));
        }
        if item_unit.locator.is_empty() {
            return Err(StorageError::InvalidInput("item unit locator is empty".into()));
        }
        if item_unit.id.is_empty() {
            item_unit.id = uuid::Uuid::new_v4().to_string();
        }
        item_unit.created = now_millis();

        let sealed = self.codec.encrypt_field(
            item_unit.locator.as_bytes(),
            &[item_unit.id.as_bytes(), item_unit.item_id.as_bytes(), item_unit.unit_id.as_bytes()],
        )?;
        let cipher_locator = hex::encode(sealed);
        let signature = self.sign_item_unit(item_unit, &cipher_locator);

        sqlx::query(
            "INSERT INTO item_unit (id, item_id, unit_id, cipher_locator, created, signature) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item_unit.id)
        .bind(&item_unit.item_id)
        .bind(&item_unit.unit_id)
        .bind(&cipher_locator)
        .bind(item_unit.created)
        .bind(&signature)
        .execute(self.db.pool())
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    pub async fn load_item_unit_by_id(&self, id: &str, opts: LoadOptions) -> Result<ItemUnit, StorageError> {
        let query = format!("{} WHERE id = ?", ITEM_UNIT_COLUMNS);
        match self.fetch_optional(&query, &[id]).await? {
            Some(row) => self.item_unit_from_row(&row, opts).await,
            None => Err(StorageError::NotFound(format!("item unit {}", id))),
        }
    }

    pub async fn load_item_unit_by_unit(
        &self,
        unit_id: &str,
        item_id: &str,
        opts: LoadOptions,
    ) -> Result<ItemUnit, StorageError> {
        let query = format!("{} WHERE unit_id = ? AND item_id = ?", ITEM_UNIT_COLUMNS);
        match self.fetch_optional(&query, &[unit_id, item_id]).await? {
            Some(row) => self.item_unit_from_row(&row, opts).await,
            None => Err(StorageError::NotFound(format!("item {} on unit {}", item_id, unit_id))),
        }
    }

    /// Every unit currently holding the item, oldest mapping first.
    pub async fn load_item_units_by_item(&self, item_id: &str, opts: LoadOptions) -> Result<Vec<ItemUnit>, StorageError> {
        let query = format!("{} WHERE item_id = ? ORDER BY created", ITEM_UNIT_COLUMNS);
        let rows = retry("item_unit_load_by_item", &RetryConfig::query(), || async {
            sqlx::query(&query)
                .bind(item_id)
                .fetch_all(self.db.pool())
                .await
                .map_err(map_sqlx)
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.item_unit_from_row(row, opts).await?);
        }
        Ok(out)
    }

    /// Ids of Completed items with no mapping on `unit_id`, oldest first,
    /// at most `limit` of them.
    pub async fn load_all_item_id_unknown_by_unit(&self, unit_id: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = retry("item_unit_unknown_by_unit", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT item.id AS id FROM item \
                 LEFT JOIN item_unit ON item_unit.item_id = item.id AND item_unit.unit_id = ? \
                 WHERE item.status = ? AND item_unit.id IS NULL \
                 ORDER BY item.created, item.id \
                 LIMIT ?",
            )
            .bind(unit_id)
            .bind(ItemStatus::Completed.as_str())
            .bind(limit)
            .fetch_all(self.db.pool())
            .await
            .map_err(map_sqlx)
        })
        .await?;

        rows.iter().map(|row| get_string(row, "id")).collect()
    }

    async fn item_unit_from_row(&self, row: &AnyRow, opts: LoadOptions) -> Result<ItemUnit, StorageError> {
        let id = get_string(row, "id")?;
        let item_id = get_string(row, "item_id")?;
        let unit_id = get_string(row, "unit_id")?;
        let cipher_locator = get_string(row, "cipher_locator")?;
        let created = get_i64(row, "created")?;
        let signature = get_string(row, "signature")?;

        let created_text = created.to_string();
        let row_key = ItemUnitKey { id: &id, item_id: &item_id, unit_id: &unit_id };
        if let Err(e) = self.codec.verify(
            ITEM_UNIT_ENTITY,
            &row_key.fields(&cipher_locator, &created_text),
            &signature,
        ) {
            error!(item_unit_id = %id, error = %e, "Item unit signature verification failed");
            crate::metrics::record_integrity_failure("item_unit");
            return Err(StorageError::Integrity(format!("item unit {}: {}", id, e)));
        }

        let locator = if opts.decrypt {
            let sealed = hex::decode(&cipher_locator)
                .map_err(|e| StorageError::Integrity(format!("item unit {} locator: {}", id, e)))?;
            let plain = self
                .codec
                .decrypt_field(&sealed, &[id.as_bytes(), item_id.as_bytes(), unit_id.as_bytes()])?;
            String::from_utf8(plain).map_err(|e| StorageError::Integrity(format!("item unit {} locator: {}", id, e)))?
        } else {
            String::new()
        };

        let item = self.index.load_item_by_id(&item_id, opts).await?;
        Ok(ItemUnit {
            id,
            item_id,
            unit_id,
            locator,
            created,
            item,
        })
    }

    async fn fetch_optional(&self, query: &str, binds: &[&str]) -> Result<Option<AnyRow>, StorageError> {
        retry("repository_load", &RetryConfig::query(), || async {
            let mut q = sqlx::query(query);
            for value in binds {
                q = q.bind(*value);
            }
            q.fetch_optional(self.db.pool()).await.map_err(map_sqlx)
        })
        .await
    }
}

fn unit_fields<'a>(
    unit: &'a StorageUnitRecord,
    created: &'a str,
    interval: &'a str,
    cipher_encryption: &'a str,
) -> [&'a [u8]; 6] {
    [
        unit.id.as_bytes(),
        unit.name.as_bytes(),
        created.as_bytes(),
        interval.as_bytes(),
        unit.kind.as_bytes(),
        cipher_encryption.as_bytes(),
    ]
}

struct ItemUnitKey<'a> {
    id: &'a str,
    item_id: &'a str,
    unit_id: &'a str,
}

impl<'a> ItemUnitKey<'a> {
    fn fields(&self, cipher_locator: &'a str, created: &'a str) -> [&'a [u8]; 5] {
        [
            self.id.as_bytes(),
            self.item_id.as_bytes(),
            self.unit_id.as_bytes(),
            cipher_locator.as_bytes(),
            created.as_bytes(),
        ]
    }
}

fn item_unit_fields<'a>(iu: &'a ItemUnit, cipher_locator: &'a str, created: &'a str) -> [&'a [u8]; 5] {
    ItemUnitKey {
        id: &iu.id,
        item_id: &iu.item_id,
        unit_id: &iu.unit_id,
    }
    .fields(cipher_locator, created)
}
