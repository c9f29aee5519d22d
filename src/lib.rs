//! Botsbox: a rule-driven web crawling engine
//!
//! A crawl is described by a declarative JSON rule: seed entries, named target
//! templates, and extraction pipelines evaluated against HTML, XML, JSON or binary
//! payloads. Jobs compiled from rules are registered with a recurring scheduler and
//! feed their extracted records into a sink backed by SQLite.

pub mod analyzer;
pub mod config;
pub mod crawler;
pub mod hub;
pub mod rule;
pub mod schedule;
pub mod sink;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Botsbox operations
#[derive(Debug, Error)]
pub enum BotsboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Failed to register job '{0}' with the scheduler")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Errors in a rule document
///
/// Any of these aborts compilation of the whole rule.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid rule JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Expected an object for {0}")]
    NotAnObject(String),

    #[error("Invalid duration for {directive}: '{value}'")]
    InvalidDuration { directive: String, value: String },

    #[error("Invalid $startDay: '{0}'")]
    InvalidStartDay(String),

    #[error("Invalid $startDayTime: '{0}'")]
    InvalidStartTime(String),

    #[error("Invalid $var[{name}]: {value}")]
    InvalidVar { name: String, value: String },

    #[error("Invalid {directive}: {message}")]
    InvalidDirective { directive: String, message: String },

    #[error("Unknown content type: '{0}'")]
    UnknownContentType(String),

    #[error("Invalid pipeline expression: '{0}'")]
    InvalidPipeline(String),

    #[error("Entry refers to unknown target template '{0}'")]
    UnknownTemplate(String),
}

/// Result type alias for Botsbox operations
pub type Result<T> = std::result::Result<T, BotsboxError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for rule compilation
pub type RuleResult<T> = std::result::Result<T, RuleError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Job, RunOutcome, Target};
pub use hub::Hub;
pub use rule::Rule;
pub use sink::{Sink, SinkPack};
