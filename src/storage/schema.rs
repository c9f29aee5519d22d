//! Database schema definitions
//!
//! This module contains the SQL schema for the fixed Botsbox tables and the
//! template used for the per-output dataset tables created by the sink.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Registered crawl jobs
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    rule TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Dedup tags per fetch fingerprint
CREATE TABLE IF NOT EXISTS targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL,
    mtag TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_targets_hash ON targets(hash);
"#;

/// Prefix of the tables holding sink datasets
pub const DATASET_TABLE_PREFIX: &str = "ds_";

/// Builds the `CREATE TABLE` statement for a sink dataset table
///
/// `table` must already be quoted.
pub fn dataset_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL,
            url TEXT NOT NULL,
            hash TEXT NOT NULL,
            data TEXT NOT NULL,
            file_path TEXT,
            file BLOB,
            created_at TEXT NOT NULL
        )"
    )
}

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
