// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use sqlx::any::AnyRow;
use tracing::{debug, error};

use super::{now_millis, ApiRef, Item, ItemStatus, LoadOptions};
use crate::codec::EntityCodec;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::{get_i64, get_string, map_sqlx, Database};
use crate::storage::traits::StorageError;

const ENTITY: &str = "item";

const SELECT_COLUMNS: &str =
    "SELECT id, created, last_modified, cipher_hash, api_ref, api_ref_hash, status, type, signature FROM item";

/// Signed, partially encrypted store of [`Item`] records.
///
/// The `hash` column is sealed with the codec and bound to the item's id,
/// api ref hash and type, so a sealed hash cannot be replayed onto another
/// row. Every row is signed; a row that fails verification is reported as an
/// integrity error whether or not decryption was requested.
#[derive(Clone)]
pub struct ItemIndex {
    db: Database,
    codec: Arc<dyn EntityCodec>,
}

/// Raw column values in signing order.
struct ItemRow {
    id: String,
    created: i64,
    last_modified: i64,
    cipher_hash: String,
    api_ref: String,
    api_ref_hash: String,
    status: String,
    item_type: String,
}

impl ItemIndex {
    pub fn new(db: Database, codec: Arc<dyn EntityCodec>) -> Self {
        Self { db, codec }
    }

    fn seal_hash(&self, item: &Item) -> Result<String, StorageError> {
        let sealed = self.codec.encrypt_field(
            item.hash.as_bytes(),
            &[item.id.as_bytes(), item.api_ref_hash.as_bytes(), item.item_type.as_str().as_bytes()],
        )?;
        Ok(hex::encode(sealed))
    }

    fn to_row(&self, item: &Item) -> Result<ItemRow, StorageError> {
        let api_ref = serde_json::to_string(&item.api_ref)
            .map_err(|e| StorageError::InvalidInput(format!("api ref not serializable: {}", e)))?;
        Ok(ItemRow {
            id: item.id.clone(),
            created: item.created,
            last_modified: item.last_modified,
            cipher_hash: self.seal_hash(item)?,
            api_ref,
            api_ref_hash: item.api_ref_hash.clone(),
            status: item.status.as_str().to_string(),
            item_type: item.item_type.as_str().to_string(),
        })
    }

    /// Insert a new `Incoming` item, assigning its id and timestamps.
    #[tracing::instrument(skip(self, item), fields(api_ref_hash = %item.api_ref_hash))]
    pub async fn insert_item(&self, item: &mut Item) -> Result<(), StorageError> {
        if item.api_ref_hash.is_empty() {
            return Err(StorageError::InvalidInput("item api_ref_hash must be set".into()));
        }
        if item.status != ItemStatus::Incoming {
            return Err(StorageError::InvalidInput(format!(
                "new items must be Incoming, got {}",
                item.status
            )));
        }

        item.id = uuid::Uuid::new_v4().to_string();
        item.created = now_millis();
        item.last_modified = item.created;

        let row = self.to_row(item)?;
        let signature = sign_row(self.codec.as_ref(), &row);

        sqlx::query(
            "INSERT INTO item (id, created, last_modified, cipher_hash, api_ref, api_ref_hash, status, type, signature) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(row.created)
        .bind(row.last_modified)
        .bind(&row.cipher_hash)
        .bind(&row.api_ref)
        .bind(&row.api_ref_hash)
        .bind(&row.status)
        .bind(&row.item_type)
        .bind(&signature)
        .execute(self.db.pool())
        .await
        .map_err(map_sqlx)?;

        debug!(item_id = %item.id, "Item inserted");
        Ok(())
    }

    /// Persist a status/hash change. Moving to `Completed` requires a hash.
    #[tracing::instrument(skip(self, item), fields(item_id = %item.id, status = %item.status))]
    pub async fn update_item(&self, item: &mut Item) -> Result<(), StorageError> {
        if item.status == ItemStatus::Completed && item.hash.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "item {} cannot be Completed without a hash",
                item.id
            )));
        }

        let previous = item.last_modified;
        item.last_modified = now_millis().max(previous);

        let row = self.to_row(item)?;
        let signature = sign_row(self.codec.as_ref(), &row);

        let result = sqlx::query(
            "UPDATE item SET last_modified = ?, cipher_hash = ?, api_ref = ?, api_ref_hash = ?, status = ?, type = ?, signature = ? \
             WHERE id = ?",
        )
        .bind(row.last_modified)
        .bind(&row.cipher_hash)
        .bind(&row.api_ref)
        .bind(&row.api_ref_hash)
        .bind(&row.status)
        .bind(&row.item_type)
        .bind(&signature)
        .bind(&row.id)
        .execute(self.db.pool())
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            item.last_modified = previous;
            return Err(StorageError::NotFound(format!("item {}", item.id)));
        }
        Ok(())
    }

    pub async fn load_item_by_id(&self, id: &str, opts: LoadOptions) -> Result<Item, StorageError> {
        let query = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = self.fetch_one_by(&query, id).await?;
        match row {
            Some(row) => self.from_row(&row, opts),
            None => Err(StorageError::NotFound(format!("item {}", id))),
        }
    }

    pub async fn load_item_by_api_ref_hash(&self, api_ref_hash: &str, opts: LoadOptions) -> Result<Item, StorageError> {
        let query = format!("{} WHERE api_ref_hash = ?", SELECT_COLUMNS);
        let row = self.fetch_one_by(&query, api_ref_hash).await?;
        match row {
            Some(row) => self.from_row(&row, opts),
            None => Err(StorageError::NotFound(format!("item with api ref hash {}", api_ref_hash))),
        }
    }

    async fn fetch_one_by(&self, query: &str, key: &str) -> Result<Option<AnyRow>, StorageError> {
        retry("index_load", &RetryConfig::query(), || async {
            sqlx::query(query)
                .bind(key)
                .fetch_optional(self.db.pool())
                .await
                .map_err(map_sqlx)
        })
        .await
    }

    fn from_row(&self, row: &AnyRow, opts: LoadOptions) -> Result<Item, StorageError> {
        let raw = ItemRow {
            id: get_string(row, "id")?,
            created: get_i64(row, "created")?,
            last_modified: get_i64(row, "last_modified")?,
            cipher_hash: get_string(row, "cipher_hash")?,
            api_ref: get_string(row, "api_ref")?,
            api_ref_hash: get_string(row, "api_ref_hash")?,
            status: get_string(row, "status")?,
            item_type: get_string(row, "type")?,
        };
        let signature = get_string(row, "signature")?;

        if let Err(e) = verify_row(self.codec.as_ref(), &raw, &signature) {
            error!(item_id = %raw.id, error = %e, "Item signature verification failed");
            crate::metrics::record_integrity_failure("index");
            return Err(StorageError::Integrity(format!("item {}: {}", raw.id, e)));
        }

        let api_ref: ApiRef = serde_json::from_str(&raw.api_ref)
            .map_err(|e| StorageError::Integrity(format!("item {} api ref: {}", raw.id, e)))?;
        let status = raw.status.parse()?;
        let item_type: super::ItemType = raw.item_type.parse()?;

        let hash = if opts.decrypt {
            let sealed = hex::decode(&raw.cipher_hash)
                .map_err(|e| StorageError::Integrity(format!("item {} sealed hash: {}", raw.id, e)))?;
            let plain = self.codec.decrypt_field(
                &sealed,
                &[raw.id.as_bytes(), raw.api_ref_hash.as_bytes(), item_type.as_str().as_bytes()],
            )?;
            String::from_utf8(plain)
                .map_err(|e| StorageError::Integrity(format!("item {} hash: {}", raw.id, e)))?
        } else {
            String::new()
        };

        Ok(Item {
            id: raw.id,
            created: raw.created,
            last_modified: raw.last_modified,
            hash,
            api_ref,
            api_ref_hash: raw.api_ref_hash,
            status,
            item_type,
        })
    }
}

fn sign_row(codec: &dyn EntityCodec, row: &ItemRow) -> String {
    let created = row.created.to_string();
    let last_modified = row.last_modified.to_string();
    codec.sign(ENTITY, &row_fields(row, &created, &last_modified))
}

fn verify_row(codec: &dyn EntityCodec, row: &ItemRow, signature: &str) -> Result<(), crate::codec::CodecError> {
    let created = row.created.to_string();
    let last_modified = row.last_modified.to_string();
    codec.verify(ENTITY, &row_fields(row, &created, &last_modified), signature)
}

fn row_fields<'a>(row: &'a ItemRow, created: &'a str, last_modified: &'a str) -> [&'a [u8]; 8] {
    [
        row.id.as_bytes(),
        created.as_bytes(),
        last_modified.as_bytes(),
        row.cipher_hash.as_bytes(),
        row.api_ref.as_bytes(),
        row.api_ref_hash.as_bytes(),
        row.status.as_bytes(),
        row.item_type.as_bytes(),
    ]
}
