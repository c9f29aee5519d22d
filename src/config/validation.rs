use crate::config::types::{Config, FetchConfig, JobEntry, ScheduleConfig, SinkConfig, StoreConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_store_config(&config.store)?;
    validate_sink_config(&config.sink)?;
    validate_schedule_config(&config.schedule)?;
    validate_fetch_config(&config.fetch)?;
    validate_jobs(&config.jobs)?;
    Ok(())
}

fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_sink_config(config: &SinkConfig) -> Result<(), ConfigError> {
    if config.buffer < 1 {
        return Err(ConfigError::Validation(format!(
            "sink buffer must be >= 1, got {}",
            config.buffer
        )));
    }

    if matches!(&config.files_dir, Some(dir) if dir.is_empty()) {
        return Err(ConfigError::Validation(
            "files_dir cannot be empty when set".to_string(),
        ));
    }
    Ok(())
}

fn validate_schedule_config(config: &ScheduleConfig) -> Result<(), ConfigError> {
    if config.tick_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "tick_ms must be >= 10ms, got {}ms",
            config.tick_ms
        )));
    }
    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if let Some(index) = config.user_agents.iter().position(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(format!(
            "user_agents[{}] cannot be empty",
            index
        )));
    }

    if config.timeout_secs < 1 {
        return Err(ConfigError::Validation(format!(
            "timeout_secs must be >= 1, got {}",
            config.timeout_secs
        )));
    }

    if let Some(endpoint) = &config.browser_endpoint {
        let url = Url::parse(endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid browser_endpoint '{}': {}", endpoint, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "browser_endpoint must use http or https: {}",
                endpoint
            )));
        }
    }
    Ok(())
}

fn validate_jobs(jobs: &[JobEntry]) -> Result<(), ConfigError> {
    for job in jobs {
        if job.title.trim().is_empty() {
            return Err(ConfigError::Validation(
                "job title cannot be empty".to_string(),
            ));
        }
        if job.rule.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "job '{}' must name a rule file",
                job.title
            )));
        }
    }

    let mut titles: Vec<&str> = jobs.iter().map(|j| j.title.as_str()).collect();
    titles.sort_unstable();
    if let Some(pair) = titles.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(ConfigError::Validation(format!(
            "duplicate job title '{}'",
            pair[0]
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            jobs: vec![JobEntry {
                title: "books".to_string(),
                rule: "./rules/books.json".to_string(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_database_path() {
        let mut config = valid_config();
        config.store.database_path = String::new();
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_buffer() {
        let mut config = valid_config();
        config.sink.buffer = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_tick_too_small() {
        let mut config = valid_config();
        config.schedule.tick_ms = 5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = valid_config();
        config.fetch.timeout_secs = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_browser_endpoint() {
        let mut config = valid_config();
        config.fetch.browser_endpoint = Some("not a url".to_string());
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl(_))));

        config.fetch.browser_endpoint = Some("ftp://render.local/".to_string());
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl(_))));

        config.fetch.browser_endpoint = Some("http://127.0.0.1:9222/render".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_job_without_rule() {
        let mut config = valid_config();
        config.jobs[0].rule = " ".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_job_titles() {
        let mut config = valid_config();
        config.jobs.push(config.jobs[0].clone());
        assert!(validate(&config).is_err());
    }
}
