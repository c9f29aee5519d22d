//! Configuration module for Botsbox
//!
//! This module handles loading, parsing, and validating the TOML application
//! configuration: store location, sink buffering, scheduler cadence, fetch client
//! settings and the jobs registered at startup.
//!
//! # Example
//!
//! ```no_run
//! use botsbox::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("botsbox.toml")).unwrap();
//! println!("Database: {}", config.store.database_path);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{Config, FetchConfig, JobEntry, ScheduleConfig, SinkConfig, StoreConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
