use serde::Deserialize;

/// Main configuration structure for Botsbox
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// Persistent store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: "./botsbox.db".to_string(),
        }
    }
}

/// Output sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Capacity of the record channel
    #[serde(default = "default_sink_buffer")]
    pub buffer: usize,

    /// Directory for file records; stored in the database when absent
    #[serde(rename = "files-dir", default)]
    pub files_dir: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer: default_sink_buffer(),
            files_dir: None,
        }
    }
}

/// Recurring scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Dispatch cadence in milliseconds
    #[serde(rename = "tick-ms", default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

/// Fetch client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Pool each job picks its agent from; `user-agent` is used when empty
    #[serde(rename = "user-agents", default)]
    pub user_agents: Vec<String>,

    /// Default per-request timeout in seconds
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Rendering service used by templates with `$client: "browser"`
    #[serde(rename = "browser-endpoint", default)]
    pub browser_endpoint: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            user_agents: Vec::new(),
            timeout_secs: default_timeout_secs(),
            browser_endpoint: None,
        }
    }
}

/// A job to register at startup
#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub title: String,

    /// Path to the JSON rule document
    pub rule: String,
}

fn default_sink_buffer() -> usize {
    1000
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!("botsbox/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    120
}
