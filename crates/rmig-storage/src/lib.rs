use chrono::{DateTime, SecondsFormat, Utc};
use rmig_core::{EntityType, InstanceCursor, MappingRecord};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const MAPPING_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("mapping for legacy id {0} already exists")]
    DuplicateKey(String),
    #[error("legacy id {0} has no skipped mapping to update")]
    NotSkipped(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unknown entity type tag: {0}")]
    UnknownEntityType(String),
    #[error("invalid table prefix {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidTablePrefix(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableNames {
    mapping: String,
    schema: String,
    prefix: String,
}

impl TableNames {
    fn new(prefix: &str) -> Result<Self, StorageError> {
        if !prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(StorageError::InvalidTablePrefix(prefix.to_string()));
        }
        Ok(Self {
            mapping: format!("{prefix}migration_mapping"),
            schema: format!("{prefix}schema_migrations"),
            prefix: prefix.to_string(),
        })
    }

    fn render(&self, sql: &str) -> String {
        sql.replace("{prefix}", &self.prefix)
    }
}

/// Durable correspondence between source legacy ids and target keys.
pub struct MappingStore {
    conn: Connection,
    tables: TableNames,
}

impl MappingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_prefix(path, "")
    }

    pub fn open_with_prefix(path: impl AsRef<Path>, prefix: &str) -> Result<Self, StorageError> {
        let tables = TableNames::new(prefix)?;
        let conn = Connection::open(path)?;
        let store = Self { conn, tables };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with_prefix("")
    }

    pub fn open_in_memory_with_prefix(prefix: &str) -> Result<Self, StorageError> {
        let tables = TableNames::new(prefix)?;
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, tables };
        store.migrate()?;
        Ok(store)
    }

    pub fn mapping_table(&self) -> &str {
        &self.tables.mapping
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        if !table_exists(&self.conn, &self.tables.schema)? {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COALESCE(MAX(version), 0) FROM {}",
            self.tables.schema
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL
            )",
            self.tables.schema
        ))?;

        let current = self.schema_version()?;
        if current > MAPPING_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MAPPING_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_migration_mapping.sql");
            self.conn.execute_batch(&self.tables.render(sql))?;
            self.record_schema_version(1)?;
            info!(table = %self.tables.mapping, "created migration mapping table");
        }

        Ok(())
    }

    fn record_schema_version(&self, version: i64) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (version, applied_at) VALUES (?1, ?2)",
            self.tables.schema
        );
        self.conn
            .execute(&sql, params![version, format_timestamp(Utc::now())])
            .map(|_| ())?;
        Ok(())
    }

    pub fn table_exists(&self) -> Result<bool, StorageError> {
        table_exists(&self.conn, &self.tables.mapping)
    }

    /// Drop the mapping table and its schema bookkeeping.
    pub fn drop_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
            self.tables.mapping, self.tables.schema
        ))?;
        info!(table = %self.tables.mapping, "dropped migration mapping table");
        Ok(())
    }

    pub fn exists(&self, legacy_id: &str) -> Result<bool, StorageError> {
        exists(&self.conn, &self.tables, legacy_id)
    }

    pub fn find(&self, legacy_id: &str) -> Result<Option<MappingRecord>, StorageError> {
        let sql = format!(
            "SELECT legacy_id, entity_type, target_key, start_date, skip_reason
             FROM {}
             WHERE legacy_id = ?1",
            self.tables.mapping
        );
        Ok(self
            .conn
            .query_row(&sql, [legacy_id], map_record)
            .optional()?)
    }

    /// Target key of a migrated id; `None` when the id is unknown or skipped.
    pub fn find_target_key(&self, legacy_id: &str) -> Result<Option<i64>, StorageError> {
        let sql = format!(
            "SELECT target_key FROM {} WHERE legacy_id = ?1",
            self.tables.mapping
        );
        let key: Option<Option<i64>> = self
            .conn
            .query_row(&sql, [legacy_id], |row| row.get(0))
            .optional()?;
        Ok(key.flatten())
    }

    pub fn has_target_key(&self, legacy_id: &str) -> Result<bool, StorageError> {
        Ok(self.find_target_key(legacy_id)?.is_some())
    }

    /// Highest `(start_date, legacy_id)` recorded for a type, migrated or skipped.
    pub fn find_latest(
        &self,
        entity_type: EntityType,
    ) -> Result<Option<InstanceCursor>, StorageError> {
        let sql = format!(
            "SELECT legacy_id, start_date
             FROM {}
             WHERE entity_type = ?1
             ORDER BY start_date DESC, legacy_id DESC
             LIMIT 1",
            self.tables.mapping
        );
        let cursor = self
            .conn
            .query_row(&sql, [entity_type.as_str()], |row| {
                let start_date = parse_optional_timestamp_column(row, 1)?;
                Ok(InstanceCursor::new(start_date, row.get::<_, String>(0)?))
            })
            .optional()?;
        Ok(cursor)
    }

    pub fn insert(&self, record: &MappingRecord) -> Result<(), StorageError> {
        insert(&self.conn, &self.tables, record)
    }

    pub fn update_target_key(&self, legacy_id: &str, target_key: i64) -> Result<(), StorageError> {
        update_target_key(&self.conn, &self.tables, legacy_id, target_key)
    }

    pub fn find_skipped(
        &self,
        entity_type: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingRecord>, StorageError> {
        self.find_page(entity_type, "skip_reason IS NOT NULL", offset, limit)
    }

    pub fn count_skipped(&self, entity_type: EntityType) -> Result<u64, StorageError> {
        self.count(entity_type, "skip_reason IS NOT NULL")
    }

    pub fn find_migrated(
        &self,
        entity_type: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingRecord>, StorageError> {
        self.find_page(entity_type, "target_key IS NOT NULL", offset, limit)
    }

    pub fn count_migrated(&self, entity_type: EntityType) -> Result<u64, StorageError> {
        self.count(entity_type, "target_key IS NOT NULL")
    }

    fn find_page(
        &self,
        entity_type: EntityType,
        filter: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MappingRecord>, StorageError> {
        let sql = format!(
            "SELECT legacy_id, entity_type, target_key, start_date, skip_reason
             FROM {}
             WHERE entity_type = ?1 AND {filter}
             ORDER BY start_date ASC, legacy_id ASC
             LIMIT ?2 OFFSET ?3",
            self.tables.mapping
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(
            params![entity_type.as_str(), limit as i64, offset as i64],
            map_record,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn count(&self, entity_type: EntityType, filter: &str) -> Result<u64, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE entity_type = ?1 AND {filter}",
            self.tables.mapping
        );
        let count: i64 = self
            .conn
            .query_row(&sql, [entity_type.as_str()], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Open a transaction spanning the mapping write for one instance. Dropping the returned
    /// handle without calling [`MappingTransaction::commit`] rolls it back.
    pub fn begin(&mut self) -> Result<MappingTransaction<'_>, StorageError> {
        let tx = self.conn.transaction()?;
        Ok(MappingTransaction {
            tx,
            tables: &self.tables,
        })
    }
}

pub struct MappingTransaction<'a> {
    tx: Transaction<'a>,
    tables: &'a TableNames,
}

impl MappingTransaction<'_> {
    pub fn exists(&self, legacy_id: &str) -> Result<bool, StorageError> {
        exists(&self.tx, self.tables, legacy_id)
    }

    pub fn insert(&self, record: &MappingRecord) -> Result<(), StorageError> {
        insert(&self.tx, self.tables, record)
    }

    pub fn update_target_key(&self, legacy_id: &str, target_key: i64) -> Result<(), StorageError> {
        update_target_key(&self.tx, self.tables, legacy_id, target_key)
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.commit()?;
        Ok(())
    }
}

fn exists(conn: &Connection, tables: &TableNames, legacy_id: &str) -> Result<bool, StorageError> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE legacy_id = ?1 LIMIT 1",
        tables.mapping
    );
    let found: Option<i64> = conn
        .query_row(&sql, [legacy_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn insert(
    conn: &Connection,
    tables: &TableNames,
    record: &MappingRecord,
) -> Result<(), StorageError> {
    let sql = format!(
        "INSERT INTO {} (legacy_id, entity_type, target_key, start_date, skip_reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        tables.mapping
    );
    let result = conn.execute(
        &sql,
        params![
            record.legacy_id,
            record.entity_type.as_str(),
            record.target_key,
            record.start_date.map(format_timestamp),
            record.skip_reason,
            format_timestamp(Utc::now()),
        ],
    );

    match result {
        Ok(_) => {
            debug!(
                legacy_id = %record.legacy_id,
                skipped = record.is_skipped(),
                "inserted mapping"
            );
            Ok(())
        }
        Err(err) if is_primary_key_violation(&err) => {
            Err(StorageError::DuplicateKey(record.legacy_id.clone()))
        }
        Err(err) => Err(err.into()),
    }
}

fn update_target_key(
    conn: &Connection,
    tables: &TableNames,
    legacy_id: &str,
    target_key: i64,
) -> Result<(), StorageError> {
    let sql = format!(
        "UPDATE {}
         SET target_key = ?2, skip_reason = NULL
         WHERE legacy_id = ?1 AND skip_reason IS NOT NULL",
        tables.mapping
    );
    let updated = conn.execute(&sql, params![legacy_id, target_key])?;
    if updated == 0 {
        return Err(StorageError::NotSkipped(legacy_id.to_string()));
    }
    debug!(legacy_id, target_key, "flipped skipped mapping to migrated");
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<MappingRecord> {
    let entity_type: String = row.get(1)?;
    let entity_type = EntityType::parse(&entity_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(StorageError::UnknownEntityType(entity_type.clone())),
        )
    })?;

    Ok(MappingRecord {
        legacy_id: row.get(0)?,
        entity_type,
        target_key: row.get(2)?,
        start_date: parse_optional_timestamp_column(row, 3)?,
        skip_reason: row.get(4)?,
    })
}

fn parse_optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(index)?;
    value
        .map(|value| {
            parse_timestamp(&value).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    const PI: EntityType = EntityType::RuntimeProcessInstance;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2026, 2, 23, hour, 0, 0).single()
    }

    fn skipped(id: &str, hour: u32) -> MappingRecord {
        MappingRecord::skipped(id, PI, at(hour), format!("reason for {id}"))
    }

    #[test]
    fn migrations_create_mapping_table_once() {
        let store = MappingStore::open_in_memory().expect("open store");
        assert_eq!(store.schema_version().expect("version"), 1);
        assert!(store.table_exists().expect("table exists"));

        store.migrate().expect("second migrate is a no-op");
        assert_eq!(store.schema_version().expect("version"), 1);
    }

    #[test]
    fn insert_rejects_duplicate_legacy_ids() {
        let store = MappingStore::open_in_memory().expect("open store");
        store
            .insert(&MappingRecord::migrated("p1", PI, 10, at(1)))
            .expect("insert");

        let err = store
            .insert(&skipped("p1", 2))
            .expect_err("duplicate must fail");
        assert!(matches!(err, StorageError::DuplicateKey(ref id) if id == "p1"));
        assert!(store.exists("p1").expect("exists"));
        assert!(!store.exists("p2").expect("exists"));
    }

    #[test]
    fn rows_with_both_outcomes_are_rejected() {
        let store = MappingStore::open_in_memory().expect("open store");
        let mut record = MappingRecord::migrated("p1", PI, 10, at(1));
        record.skip_reason = Some("both".to_string());

        let err = store.insert(&record).expect_err("check constraint");
        assert!(matches!(err, StorageError::Sqlite(_)));
        assert!(!store.exists("p1").expect("exists"));
    }

    #[test]
    fn find_latest_orders_by_start_date_then_legacy_id() {
        let store = MappingStore::open_in_memory().expect("open store");
        assert_eq!(store.find_latest(PI).expect("latest"), None);

        store
            .insert(&MappingRecord::migrated("p-b", PI, 1, at(5)))
            .expect("insert");
        store.insert(&skipped("p-a", 5)).expect("insert");
        store
            .insert(&MappingRecord::migrated("p-z", PI, 2, at(3)))
            .expect("insert");
        store
            .insert(&MappingRecord::migrated("p-none", PI, 3, None))
            .expect("insert");

        let latest = store.find_latest(PI).expect("latest").expect("cursor");
        assert_eq!(latest, InstanceCursor::new(at(5), "p-b"));
    }

    #[test]
    fn update_target_key_flips_only_skipped_rows() {
        let store = MappingStore::open_in_memory().expect("open store");
        store.insert(&skipped("p1", 1)).expect("insert");
        store
            .insert(&MappingRecord::migrated("p2", PI, 20, at(2)))
            .expect("insert");

        store.update_target_key("p1", 11).expect("flip");
        let record = store.find("p1").expect("find").expect("record");
        assert_eq!(record.target_key, Some(11));
        assert_eq!(record.skip_reason, None);
        assert_eq!(record.start_date, at(1));

        let err = store
            .update_target_key("p2", 21)
            .expect_err("already migrated");
        assert!(matches!(err, StorageError::NotSkipped(_)));
        let err = store
            .update_target_key("missing", 1)
            .expect_err("unknown id");
        assert!(matches!(err, StorageError::NotSkipped(_)));
        assert_eq!(store.find_target_key("p2").expect("key"), Some(20));
    }

    #[test]
    fn skipped_pages_are_ordered_and_counted() {
        let store = MappingStore::open_in_memory().expect("open store");
        store.insert(&skipped("p3", 3)).expect("insert");
        store.insert(&skipped("p1", 1)).expect("insert");
        store.insert(&skipped("p2", 2)).expect("insert");
        store
            .insert(&MappingRecord::migrated("p0", PI, 5, at(0)))
            .expect("insert");

        assert_eq!(store.count_skipped(PI).expect("count"), 3);
        assert_eq!(store.count_migrated(PI).expect("count"), 1);

        let first = store.find_skipped(PI, 0, 2).expect("page");
        let ids: Vec<&str> = first.iter().map(|r| r.legacy_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert_eq!(first[0].skip_reason.as_deref(), Some("reason for p1"));

        let second = store.find_skipped(PI, 2, 2).expect("page");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].legacy_id, "p3");

        let migrated = store.find_migrated(PI, 0, 10).expect("page");
        assert_eq!(migrated.len(), 1);
        assert!(store.has_target_key("p0").expect("has key"));
        assert!(!store.has_target_key("p1").expect("has key"));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let mut store = MappingStore::open_in_memory().expect("open store");
        {
            let tx = store.begin().expect("begin");
            tx.insert(&MappingRecord::migrated("p1", PI, 1, at(1)))
                .expect("insert");
            assert!(tx.exists("p1").expect("exists in tx"));
        }
        assert!(!store.exists("p1").expect("exists"));

        let tx = store.begin().expect("begin");
        tx.insert(&skipped("p2", 2)).expect("insert");
        tx.update_target_key("p2", 9).expect("flip");
        tx.commit().expect("commit");
        assert_eq!(store.find_target_key("p2").expect("key"), Some(9));
    }

    #[test]
    fn table_prefix_isolates_stores_in_one_database() {
        let file = NamedTempFile::new().expect("temp file");
        let left = MappingStore::open_with_prefix(file.path(), "left_").expect("open left");
        let right = MappingStore::open_with_prefix(file.path(), "right_").expect("open right");

        left.insert(&skipped("p1", 1)).expect("insert");
        assert!(left.exists("p1").expect("exists"));
        assert!(!right.exists("p1").expect("exists"));
        assert_eq!(left.mapping_table(), "left_migration_mapping");

        let err = MappingStore::open_in_memory_with_prefix("bad-prefix;")
            .err()
            .expect("prefix rejected");
        assert!(matches!(err, StorageError::InvalidTablePrefix(_)));
    }

    #[test]
    fn reopening_a_file_keeps_mappings_and_drop_schema_removes_them() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = MappingStore::open(file.path()).expect("open");
            store
                .insert(&MappingRecord::migrated("p1", PI, 1, at(1)))
                .expect("insert");
        }

        let store = MappingStore::open(file.path()).expect("reopen");
        assert_eq!(store.find_target_key("p1").expect("key"), Some(1));

        store.drop_schema().expect("drop");
        assert!(!store.table_exists().expect("table exists"));
        assert_eq!(store.schema_version().expect("version"), 0);
    }

    #[test]
    fn newer_schema_versions_are_refused() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = MappingStore::open(file.path()).expect("open");
            store.record_schema_version(7).expect("bump version");
        }

        let err = MappingStore::open(file.path())
            .err()
            .expect("newer schema refused");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion {
                found: 7,
                supported: 1
            }
        ));
    }
}
