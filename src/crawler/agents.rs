//! User agent pool
//!
//! Every job presents one agent picked from the pool when the job is built. Templates
//! with `$agents: "random"` draw a fresh one for every request instead.

use crate::config::FetchConfig;
use rand::{thread_rng, Rng};
use std::sync::Arc;

/// Agents to impersonate; an empty pool leaves the client's own agent in place
#[derive(Debug, Clone, Default)]
pub struct UserAgents {
    pool: Arc<Vec<String>>,
}

impl UserAgents {
    /// Builds a pool, dropping blank entries
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool: Vec<String> = agents
            .into_iter()
            .map(|agent| agent.as_ref().trim().to_string())
            .filter(|agent| !agent.is_empty())
            .collect();
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(&config.user_agents)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// A uniformly random agent, or `None` for an empty pool
    pub fn pick(&self) -> Option<String> {
        if self.pool.is_empty() {
            return None;
        }
        let mut rng = thread_rng();
        Some(self.pool[rng.gen_range(0..self.pool.len())].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_picks_nothing() {
        assert!(UserAgents::default().pick().is_none());
        assert!(UserAgents::new(["", "   "]).is_empty());
    }

    #[test]
    fn test_pick_comes_from_pool() {
        let agents = UserAgents::new(["Agent/1", " Agent/2 ", ""]);
        assert_eq!(agents.len(), 2);
        for _ in 0..50 {
            let agent = agents.pick().unwrap();
            assert!(agent == "Agent/1" || agent == "Agent/2");
        }
    }

    #[test]
    fn test_from_config() {
        let config = FetchConfig {
            user_agents: vec!["Mozilla/5.0 (X11; Linux x86_64)".to_string()],
            ..FetchConfig::default()
        };
        let agents = UserAgents::from_config(&config);
        assert_eq!(agents.pick().as_deref(), Some("Mozilla/5.0 (X11; Linux x86_64)"));
    }
}
