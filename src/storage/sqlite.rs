//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Store trait.

use crate::storage::schema::{dataset_table_sql, initialize_schema, DATASET_TABLE_PREFIX};
use crate::storage::traits::{Store, StorageError, StorageResult, JOBS_DATASET, TARGETS_DATASET};
use crate::storage::{DataRecord, FieldValue, JobRecord, JobStatus, Record, TargetRecord};
use chrono::Utc;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            FieldValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// SQLite storage backend
///
/// The connection is guarded by a mutex so one store can be shared by every job.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates a new SqliteStore instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

/// Maps a dataset name to its quoted table name
fn table_for(dataset: &str) -> StorageResult<String> {
    match dataset {
        JOBS_DATASET | TARGETS_DATASET => Ok(dataset.to_string()),
        name => Ok(quote_ident(&format!(
            "{}{}",
            DATASET_TABLE_PREFIX,
            check_name(name).map_err(|_| StorageError::InvalidDataset(name.to_string()))?
        ))),
    }
}

fn check_name(name: &str) -> Result<&str, ()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(name)
    } else {
        Err(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_for(field: &str) -> StorageResult<String> {
    check_name(field)
        .map(quote_ident)
        .map_err(|_| StorageError::InvalidField(field.to_string()))
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        rule: row.get(2)?,
        status: JobStatus::from_db_string(&row.get::<_, String>(3)?)
            .unwrap_or(JobStatus::Inactive),
        created_at: row.get(4)?,
    })
}

impl Store for SqliteStore {
    // ===== Generic objects =====

    fn insert_object(&self, dataset: &str, record: &Record) -> StorageResult<i64> {
        let table = table_for(dataset)?;
        let now = Utc::now().to_rfc3339();

        let mut columns = Vec::with_capacity(record.len() + 1);
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(record.len() + 1);
        for (field, value) in record {
            columns.push(column_for(field)?);
            values.push(value);
        }

        if !record.contains_key("created_at") {
            columns.push("created_at".to_string());
            values.push(&now);
        }

        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn()?;
        conn.execute(&sql, params_from_iter(values))?;
        Ok(conn.last_insert_rowid())
    }

    fn update_object(&self, dataset: &str, id: i64, record: &Record) -> StorageResult<usize> {
        if record.is_empty() {
            return Ok(0);
        }
        let table = table_for(dataset)?;

        let mut assignments = Vec::with_capacity(record.len());
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(record.len() + 1);
        for (i, (field, value)) in record.iter().enumerate() {
            assignments.push(format!("{} = ?{}", column_for(field)?, i + 1));
            values.push(value);
        }
        values.push(&id);

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            table,
            assignments.join(", "),
            values.len()
        );

        let conn = self.conn()?;
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    fn delete_objects(&self, dataset: &str, ids: &[i64]) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let table = table_for(dataset)?;

        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            table,
            placeholders.join(", ")
        );

        let conn = self.conn()?;
        Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
    }

    // ===== Jobs =====

    fn query_all_jobs(&self) -> StorageResult<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, title, rule, status, created_at FROM jobs ORDER BY id ASC")?;

        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(jobs)
    }

    fn get_job(&self, id: i64) -> StorageResult<JobRecord> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, rule, status, created_at FROM jobs WHERE id = ?1",
            params![id],
            job_from_row,
        )
        .optional()?
        .ok_or(StorageError::JobNotFound(id))
    }

    // ===== Dedup tags =====

    fn get_latest_target(&self, hash: &str) -> StorageResult<Option<TargetRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, hash, mtag, created_at FROM targets
                 WHERE hash = ?1 ORDER BY id DESC LIMIT 1",
                params![hash],
                |row| {
                    Ok(TargetRecord {
                        id: row.get(0)?,
                        hash: row.get(1)?,
                        mtag: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    // ===== Sink datasets =====

    fn create_dataset(&self, name: &str) -> StorageResult<()> {
        if name == JOBS_DATASET || name == TARGETS_DATASET {
            return Err(StorageError::InvalidDataset(name.to_string()));
        }
        let table = table_for(name)?;

        let conn = self.conn()?;
        conn.execute_batch(&dataset_table_sql(&table))?;
        Ok(())
    }

    fn has_dataset(&self, name: &str) -> StorageResult<bool> {
        if check_name(name).is_err() {
            return Ok(false);
        }

        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![format!("{}{}", DATASET_TABLE_PREFIX, name)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn query_all_data_objects(&self, name: &str) -> StorageResult<Vec<DataRecord>> {
        let table = table_for(name)?;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, record_id, url, hash, data, file_path, file, created_at
             FROM {} ORDER BY id ASC",
            table
        ))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(DataRecord {
                    id: row.get(0)?,
                    record_id: row.get(1)?,
                    url: row.get(2)?,
                    hash: row.get(3)?,
                    data: row.get(4)?,
                    file_path: row.get(5)?,
                    file: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> SqliteStore {
        SqliteStore::new_in_memory().unwrap()
    }

    #[test]
    fn test_open_file_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("botsbox.db");

        let id = {
            let store = SqliteStore::new(&path).unwrap();
            store.insert_job("books", "{}", JobStatus::Active).unwrap()
        };

        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.get_job(id).unwrap().title, "books");
    }

    #[test]
    fn test_job_lifecycle() {
        let store = create_test_store();

        let id = store.insert_job("books", "{\"a\":1}", JobStatus::Active).unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.title, "books");
        assert_eq!(job.rule, "{\"a\":1}");
        assert_eq!(job.status, JobStatus::Active);

        store.set_job_status(id, JobStatus::Inactive).unwrap();
        assert_eq!(store.get_job(id).unwrap().status, JobStatus::Inactive);

        store.insert_job("news", "{}", JobStatus::Active).unwrap();
        assert_eq!(store.query_all_jobs().unwrap().len(), 2);

        assert_eq!(store.delete_objects(JOBS_DATASET, &[id]).unwrap(), 1);
        assert!(matches!(store.get_job(id), Err(StorageError::JobNotFound(_))));
        assert!(matches!(
            store.set_job_status(id, JobStatus::Active),
            Err(StorageError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_latest_target_wins() {
        let store = create_test_store();

        assert!(store.get_latest_target("h1").unwrap().is_none());

        store.record_target("h1", "old").unwrap();
        store.record_target("h2", "other").unwrap();
        store.record_target("h1", "new").unwrap();

        let latest = store.get_latest_target("h1").unwrap().unwrap();
        assert_eq!(latest.mtag, "new");
        assert_eq!(latest.hash, "h1");
    }

    #[test]
    fn test_dataset_roundtrip() {
        let store = create_test_store();

        assert!(!store.has_dataset("book").unwrap());
        store.create_dataset("book").unwrap();
        assert!(store.has_dataset("book").unwrap());

        let mut record = Record::new();
        record.insert("record_id".to_string(), FieldValue::from("b1"));
        record.insert("url".to_string(), FieldValue::from("https://abc.com/b1"));
        record.insert("hash".to_string(), FieldValue::from("h"));
        record.insert("data".to_string(), FieldValue::from("{\"title\":\"B1\"}"));
        let id = store.insert_object("book", &record).unwrap();

        let rows = store.query_all_data_objects("book").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].record_id, "b1");
        assert!(rows[0].file.is_none());

        let mut update = Record::new();
        update.insert("record_id".to_string(), FieldValue::from("b2"));
        assert_eq!(store.update_object("book", id, &update).unwrap(), 1);
        assert_eq!(store.query_all_data_objects("book").unwrap()[0].record_id, "b2");
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let store = create_test_store();

        assert!(matches!(
            store.create_dataset("book; DROP TABLE jobs"),
            Err(StorageError::InvalidDataset(_))
        ));
        assert!(matches!(
            store.create_dataset("jobs"),
            Err(StorageError::InvalidDataset(_))
        ));

        let mut record = Record::new();
        record.insert("bad name".to_string(), FieldValue::Null);
        assert!(matches!(
            store.insert_object(JOBS_DATASET, &record),
            Err(StorageError::InvalidField(_))
        ));
    }
}
