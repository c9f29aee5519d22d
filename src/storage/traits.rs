//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::storage::{DataRecord, FieldValue, JobRecord, JobStatus, Record, TargetRecord};
use thiserror::Error;

/// Dataset holding registered jobs
pub const JOBS_DATASET: &str = "jobs";

/// Dataset holding dedup tags per fetch fingerprint
pub const TARGETS_DATASET: &str = "targets";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Invalid dataset name: '{0}'")]
    InvalidDataset(String),

    #[error("Invalid field name: '{0}'")]
    InvalidField(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Implementations must be safe to share between jobs running concurrently; every
/// method takes `&self`.
pub trait Store: Send + Sync {
    // ===== Generic objects =====

    /// Inserts a row into a dataset
    ///
    /// # Arguments
    ///
    /// * `dataset` - The dataset name (`jobs`, `targets`, or a sink dataset)
    /// * `record` - Field values; `created_at` is filled in when absent
    ///
    /// # Returns
    ///
    /// The ID of the newly inserted row
    fn insert_object(&self, dataset: &str, record: &Record) -> StorageResult<i64>;

    /// Updates the given fields of one row, returning the number of rows changed
    fn update_object(&self, dataset: &str, id: i64, record: &Record) -> StorageResult<usize>;

    /// Deletes rows by ID, returning the number of rows removed
    fn delete_objects(&self, dataset: &str, ids: &[i64]) -> StorageResult<usize>;

    // ===== Jobs =====

    /// Gets all registered jobs, oldest first
    fn query_all_jobs(&self) -> StorageResult<Vec<JobRecord>>;

    /// Gets a job by ID
    fn get_job(&self, id: i64) -> StorageResult<JobRecord>;

    // ===== Dedup tags =====

    /// Gets the most recent dedup tag stored for a fetch fingerprint
    fn get_latest_target(&self, hash: &str) -> StorageResult<Option<TargetRecord>>;

    // ===== Sink datasets =====

    /// Creates a sink dataset if it does not exist yet
    fn create_dataset(&self, name: &str) -> StorageResult<()>;

    /// Returns true if a sink dataset exists
    fn has_dataset(&self, name: &str) -> StorageResult<bool>;

    /// Gets every row of a sink dataset, oldest first
    fn query_all_data_objects(&self, name: &str) -> StorageResult<Vec<DataRecord>>;

    // ===== Typed helpers =====

    /// Registers a job
    fn insert_job(&self, title: &str, rule: &str, status: JobStatus) -> StorageResult<i64> {
        let mut record = Record::new();
        record.insert("title".to_string(), FieldValue::from(title));
        record.insert("rule".to_string(), FieldValue::from(rule));
        record.insert("status".to_string(), FieldValue::from(status.to_db_string()));
        self.insert_object(JOBS_DATASET, &record)
    }

    /// Changes the status of a job
    fn set_job_status(&self, id: i64, status: JobStatus) -> StorageResult<()> {
        let mut record = Record::new();
        record.insert("status".to_string(), FieldValue::from(status.to_db_string()));
        match self.update_object(JOBS_DATASET, id, &record)? {
            0 => Err(StorageError::JobNotFound(id)),
            _ => Ok(()),
        }
    }

    /// Stores the dedup tag observed for a fetch fingerprint
    fn record_target(&self, hash: &str, mtag: &str) -> StorageResult<i64> {
        let mut record = Record::new();
        record.insert("hash".to_string(), FieldValue::from(hash));
        record.insert("mtag".to_string(), FieldValue::from(mtag));
        self.insert_object(TARGETS_DATASET, &record)
    }
}
