use std::path::Path;

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classes::ClassTable;
use crate::composition::PercentageMap;
use crate::config::{DEFAULT_IMAGE_SOURCE, DEFAULT_MODEL_VERSION};
use crate::errors::{Result, WasteSegError};
use crate::traits::HistoryStore;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TABLE: &str = "analysis_history";

/// Columns added after the first schema; older databases get them on open.
const METADATA_COLUMNS: [&str; 3] = ["model_version", "source", "image_hash"];

/// Earlier databases kept the record time in a `datetime` column.
const LEGACY_TIMESTAMP_COLUMN: &str = "datetime";

/// One stored analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub image: String,
    pub image_hash: Option<String>,
    pub source: Option<String>,
    pub model_version: Option<String>,
    pub confidence: f64,
    pub percentages: PercentageMap,
}

/// Tags written alongside every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    pub source: String,
    pub model_version: String,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            source: DEFAULT_IMAGE_SOURCE.to_string(),
            model_version: DEFAULT_MODEL_VERSION.to_string(),
        }
    }
}

/// SQLite-backed history. The connection sits behind a mutex, so all
/// statements, reads included, run one at a time.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    table: ClassTable,
    metadata: StoreMetadata,
}

fn persistence(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> WasteSegError {
    move |source| WasteSegError::Persistence {
        operation: operation.to_string(),
        source,
    }
}

impl SqliteHistoryStore {
    pub fn open(path: &Path, table: ClassTable, metadata: StoreMetadata) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| WasteSegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create database directory".to_string(),
                source: e,
            })?;
        }
        let conn = Connection::open(path).map_err(persistence("open database"))?;
        info!(path = %path.display(), "history database opened");
        Self::from_connection(conn, table, metadata)
    }

    pub fn open_in_memory(table: ClassTable, metadata: StoreMetadata) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(persistence("open database"))?;
        Self::from_connection(conn, table, metadata)
    }

    /// Wrap an existing connection, creating or migrating the schema.
    pub fn from_connection(
        conn: Connection,
        table: ClassTable,
        metadata: StoreMetadata,
    ) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            table,
            metadata,
        };
        store.create_tables()?;
        store.migrate()?;
        store.backfill_metadata()?;
        Ok(store)
    }

    pub fn class_table(&self) -> &ClassTable {
        &self.table
    }

    fn percent_columns(&self) -> Vec<String> {
        self.table.iter().map(|c| c.percent_column()).collect()
    }

    fn create_tables(&self) -> Result<()> {
        let class_columns: String = self
            .percent_columns()
            .iter()
            .map(|c| format!(",\n    {} REAL", c))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT,
    image TEXT,
    image_hash TEXT,
    source TEXT,
    model_version TEXT,
    confidence REAL{class_columns}
)"
        );
        self.conn
            .lock()
            .execute_batch(&sql)
            .map_err(persistence("create tables"))
    }

    /// Add columns missing from databases created by earlier schemas.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let existing: Vec<String> = {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({TABLE})"))
                .map_err(persistence("read table info"))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(persistence("read table info"))?;
            names
                .collect::<rusqlite::Result<_>>()
                .map_err(persistence("read table info"))?
        };

        if !existing.iter().any(|e| e == "timestamp") {
            let sql = if existing.iter().any(|e| e == LEGACY_TIMESTAMP_COLUMN) {
                format!("ALTER TABLE {TABLE} RENAME COLUMN {LEGACY_TIMESTAMP_COLUMN} TO timestamp")
            } else {
                format!("ALTER TABLE {TABLE} ADD COLUMN timestamp TEXT")
            };
            warn!(sql = %sql, "migrating history timestamp column");
            conn.execute(&sql, []).map_err(persistence("migrate timestamp column"))?;
        }

        let wanted = METADATA_COLUMNS
            .iter()
            .map(|c| (c.to_string(), "TEXT"))
            .chain(self.percent_columns().into_iter().map(|c| (c, "REAL")));

        for (column, sql_type) in wanted {
            if existing.iter().any(|e| *e == column) {
                continue;
            }
            warn!(column = %column, "adding missing history column");
            conn.execute(
                &format!("ALTER TABLE {TABLE} ADD COLUMN {column} {sql_type}"),
                [],
            )
            .map_err(persistence("migrate schema"))?;
        }
        Ok(())
    }

    fn backfill_metadata(&self) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .execute(
                &format!(
                    "UPDATE {TABLE} SET source = COALESCE(source, ?1), \
                     model_version = COALESCE(model_version, ?2) \
                     WHERE source IS NULL OR model_version IS NULL"
                ),
                [&self.metadata.source, &self.metadata.model_version],
            )
            .map_err(persistence("backfill metadata"))?;
        if updated > 0 {
            info!(records = updated, "backfilled history metadata");
        }
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn save(
        &self,
        image: &str,
        image_hash: Option<&str>,
        confidence: f32,
        percentages: &PercentageMap,
    ) -> Result<i64> {
        info!(image = %image, "saving analysis result");

        let mut values = vec![
            Value::Text(Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string()),
            Value::Text(image.to_string()),
            image_hash.map_or(Value::Null, |h| Value::Text(h.to_string())),
            Value::Text(self.metadata.source.clone()),
            Value::Text(self.metadata.model_version.clone()),
            Value::Real(confidence as f64),
        ];
        for class in self.table.iter() {
            let share = percentages
                .get(&class.name)
                .ok_or_else(|| WasteSegError::Validation {
                    field: "percentages".to_string(),
                    reason: format!("missing class `{}`", class.name),
                })?;
            values.push(Value::Real(share));
        }

        let columns = self.percent_columns();
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {TABLE} (timestamp, image, image_hash, source, model_version, confidence, {}) \
             VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values))
            .map_err(|e| {
                error!(image = %image, error = %e, "save failed");
                persistence("save record")(e)
            })?;
        Ok(conn.last_insert_rowid())
    }

    fn load_all(&self) -> Result<Vec<HistoryRecord>> {
        let columns = self.percent_columns();
        let names: Vec<String> = self.table.names().map(str::to_string).collect();
        let sql = format!(
            "SELECT id, timestamp, image, image_hash, source, model_version, confidence, {} \
             FROM {TABLE} ORDER BY timestamp ASC, id ASC",
            columns.join(", ")
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(persistence("load history"))?;
        let rows = stmt
            .query_map([], |row| {
                let raw_ts: String = row.get(1)?;
                let timestamp = NaiveDateTime::parse_from_str(&raw_ts, TIMESTAMP_FORMAT)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                    })?;

                let mut shares = Vec::with_capacity(names.len());
                for (offset, name) in names.iter().enumerate() {
                    let share: Option<f64> = row.get(7 + offset)?;
                    shares.push((name.clone(), share.unwrap_or(0.0)));
                }

                Ok(HistoryRecord {
                    id: row.get(0)?,
                    timestamp,
                    image: row.get(2)?,
                    image_hash: row.get(3)?,
                    source: row.get(4)?,
                    model_version: row.get(5)?,
                    confidence: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                    percentages: PercentageMap::from_entries(shares),
                })
            })
            .map_err(persistence("load history"))?;

        let records = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence("load history"))?;
        info!(records = records.len(), "history loaded");
        Ok(records)
    }

    fn delete_latest(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let last_id: Option<i64> = conn
            .query_row(&format!("SELECT MAX(id) FROM {TABLE}"), [], |row| row.get(0))
            .optional()
            .map_err(persistence("find latest record"))?
            .flatten();

        let Some(id) = last_id else {
            warn!("undo requested on empty history");
            return Ok(None);
        };

        conn.execute(&format!("DELETE FROM {TABLE} WHERE id = ?1"), [id])
            .map_err(persistence("delete latest record"))?;
        info!(deleted_id = id, "latest record deleted");
        Ok(Some(id))
    }

    fn delete_all(&self) -> Result<usize> {
        let deleted = self
            .conn
            .lock()
            .execute(&format!("DELETE FROM {TABLE}"), [])
            .map_err(persistence("clear history"))?;
        info!(deleted_records = deleted, "history cleared");
        Ok(deleted)
    }
}
