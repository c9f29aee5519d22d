//! Storage module for persisting jobs, dedup tags and extracted records
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Job persistence for the hub
//! - Dedup tags keyed by fetch fingerprint
//! - Sink datasets, one table per output name

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{Store, StorageError, StorageResult, JOBS_DATASET, TARGETS_DATASET};

use std::collections::BTreeMap;
use std::path::Path;

/// Opens or creates a store database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStore)` - Successfully opened store
/// * `Err(StorageError)` - Failed to open or initialize the database
pub fn open_store(path: &Path) -> StorageResult<SqliteStore> {
    SqliteStore::new(path)
}

/// A single field value written to a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Blob(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Field name to value mapping for one row
pub type Record = BTreeMap<String, FieldValue>;

/// Represents a registered job
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub title: String,
    /// The rule document
    pub rule: String,
    pub status: JobStatus,
    pub created_at: String,
}

/// Whether a job is registered with the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Active,
    Inactive,
}

impl JobStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// The dedup tag stored for a fetch fingerprint
#[derive(Debug, Clone)]
pub struct TargetRecord {
    pub id: i64,
    pub hash: String,
    pub mtag: String,
    pub created_at: String,
}

/// One row of a sink dataset
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub id: i64,
    pub record_id: String,
    pub url: String,
    pub hash: String,
    /// Extracted fields as a JSON object
    pub data: String,
    pub file_path: Option<String>,
    pub file: Option<Vec<u8>>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in &[JobStatus::Active, JobStatus::Inactive] {
            let db_str = status.to_db_string();
            let parsed = JobStatus::from_db_string(db_str);
            assert_eq!(Some(*status), parsed);
        }
    }

    #[test]
    fn test_job_status_invalid() {
        assert_eq!(JobStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_field_value_from_option() {
        assert_eq!(FieldValue::from(None::<String>), FieldValue::Null);
        assert_eq!(
            FieldValue::from(Some("x")),
            FieldValue::Text("x".to_string())
        );
    }
}
