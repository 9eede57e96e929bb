// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL persistence for the item index and the unit tables.
//!
//! One shared [`AnyPool`] (SQLite or MySQL) backs three tables:
//!
//! ```sql
//! item         (id, created, last_modified, cipher_hash, api_ref, api_ref_hash, status, type, signature)
//! storage_unit (id, name, created, sync_interval_ms, kind, cipher_encryption, signature)
//! item_unit    (id, item_id, unit_id, cipher_locator, created, signature)
//! ```
//!
//! `cipher_*` columns hold hex-encoded sealed values produced by the
//! [`EntityCodec`](crate::codec::EntityCodec); `signature` is the codec's HMAC
//! over the row.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as BLOB through the `Any` driver, so string
//! columns are read with [`get_string`], which falls back to `Vec<u8>`.

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::StorageError;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS item (
        id TEXT PRIMARY KEY,
        created INTEGER NOT NULL,
        last_modified INTEGER NOT NULL,
        cipher_hash TEXT NOT NULL,
        api_ref TEXT NOT NULL,
        api_ref_hash TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        type TEXT NOT NULL,
        signature TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_item_status ON item (status)",
    r#"
    CREATE TABLE IF NOT EXISTS storage_unit (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        created INTEGER NOT NULL,
        sync_interval_ms INTEGER NOT NULL,
        kind TEXT NOT NULL,
        cipher_encryption TEXT NOT NULL,
        signature TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_unit (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL REFERENCES item (id),
        unit_id TEXT NOT NULL REFERENCES storage_unit (id),
        cipher_locator TEXT NOT NULL,
        created INTEGER NOT NULL,
        signature TEXT NOT NULL,
        UNIQUE (item_id, unit_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_item_unit_unit ON item_unit (unit_id)",
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS item (
        id VARCHAR(36) PRIMARY KEY,
        created BIGINT NOT NULL,
        last_modified BIGINT NOT NULL,
        cipher_hash TEXT NOT NULL,
        api_ref TEXT NOT NULL,
        api_ref_hash VARCHAR(64) NOT NULL,
        status VARCHAR(16) NOT NULL,
        type VARCHAR(16) NOT NULL,
        signature VARCHAR(64) NOT NULL,
        UNIQUE INDEX idx_item_api_ref_hash (api_ref_hash),
        INDEX idx_item_status (status)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS storage_unit (
        id VARCHAR(36) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        created BIGINT NOT NULL,
        sync_interval_ms BIGINT NOT NULL,
        kind VARCHAR(32) NOT NULL,
        cipher_encryption TEXT NOT NULL,
        signature VARCHAR(64) NOT NULL,
        UNIQUE INDEX idx_storage_unit_name (name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_unit (
        id VARCHAR(36) PRIMARY KEY,
        item_id VARCHAR(36) NOT NULL,
        unit_id VARCHAR(36) NOT NULL,
        cipher_locator TEXT NOT NULL,
        created BIGINT NOT NULL,
        signature VARCHAR(64) NOT NULL,
        UNIQUE INDEX idx_item_unit_pair (item_id, unit_id),
        INDEX idx_item_unit_unit (unit_id),
        FOREIGN KEY (item_id) REFERENCES item (id),
        FOREIGN KEY (unit_id) REFERENCES storage_unit (id)
    )
    "#,
];

/// Shared connection pool plus dialect flag.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    is_sqlite: bool,
}

impl Database {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema if missing.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let mut options = AnyPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300));
        if is_sqlite {
            // Per connection, not per database
            options = options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            });
        }

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            options
                .clone()
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let db = Self { pool, is_sqlite };

        if is_sqlite {
            db.enable_wal_mode().await?;
        }

        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }
}

/// Read a text column, tolerating MySQL TEXT-as-BLOB through the Any driver.
pub(crate) fn get_string(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map_err(|e| StorageError::Backend(e.to_string()))
                .and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|e| StorageError::Integrity(format!("column {} is not utf-8: {}", column, e)))
                })
        })
}

pub(crate) fn get_i64(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::Backend(format!("column {}: {}", column, e)))
}

/// Map a sqlx error onto the storage taxonomy.
pub(crate) fn map_sqlx(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::AlreadyExists(db.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    /// A fresh SQLite database in its own temp dir. Keep the dir alive for the
    /// duration of the test.
    pub async fn temp_database() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cdn.db").display());
        let db = Database::connect(&url).await.unwrap();
        (db, dir)
    }
}
