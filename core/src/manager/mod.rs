//! Multiplexing of trees per conversation and users per process
//!
//! A [`TreeManager`] owns the trees of one user, keyed by conversation id. A
//! [`UserManager`] owns one tree manager per user together with that user's
//! settings and vector-database client. Both evict idle entries after a timeout;
//! [`spawn_timeout_checks`] runs that eviction periodically.

pub mod scheduler;
pub mod tree_manager;
pub mod user_manager;

pub use scheduler::{spawn_timeout_checks, TimeoutScheduler};
pub use tree_manager::{TreeManager, TreeOptions};
pub use user_manager::{LocalUser, UserManager};

use crate::error::{ConfigError, Result};
use std::time::Duration;

const DEFAULT_TREE_TIMEOUT_MINUTES: u64 = 10;
const DEFAULT_USER_TIMEOUT_MINUTES: u64 = 20;
const DEFAULT_MAX_REQUESTS_PER_DAY: u32 = 5;

/// Timeouts and request limits shared by the managers
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Idle time after which a conversation's tree is evicted
    pub tree_timeout: Duration,
    /// Idle time after which a user is evicted
    pub user_timeout: Duration,
    pub max_requests_per_day: u32,
    pub rate_limiting: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tree_timeout: Duration::from_secs(DEFAULT_TREE_TIMEOUT_MINUTES * 60),
            user_timeout: Duration::from_secs(DEFAULT_USER_TIMEOUT_MINUTES * 60),
            max_requests_per_day: DEFAULT_MAX_REQUESTS_PER_DAY,
            rate_limiting: false,
        }
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: String) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value,
        }
        .into()
    })
}

impl ManagerConfig {
    /// Read `USER_TREE_TIMEOUT`, `USER_TIMEOUT` (minutes), `MAX_USER_REQUESTS_PER_DAY`
    /// and `ENABLE_RATE_LIMITING` (`"1"` enables) from the environment
    pub fn from_env() -> Result<Self> {
        let layered = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| ConfigError::InvalidFormat {
                message: e.to_string(),
            })?;
        let get = |key: &str| layered.get_string(key).ok().filter(|v| !v.is_empty());

        let mut manager_config = Self::default();
        if let Some(minutes) = get("user_tree_timeout") {
            let minutes: u64 = parse_number("user_tree_timeout", minutes)?;
            manager_config.tree_timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(minutes) = get("user_timeout") {
            let minutes: u64 = parse_number("user_timeout", minutes)?;
            manager_config.user_timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(max) = get("max_user_requests_per_day") {
            manager_config.max_requests_per_day = parse_number("max_user_requests_per_day", max)?;
        }
        manager_config.rate_limiting = get("enable_rate_limiting").as_deref() == Some("1");
        Ok(manager_config)
    }

    pub fn with_tree_timeout(mut self, tree_timeout: Duration) -> Self {
        self.tree_timeout = tree_timeout;
        self
    }

    pub fn with_user_timeout(mut self, user_timeout: Duration) -> Self {
        self.user_timeout = user_timeout;
        self
    }

    pub fn with_rate_limit(mut self, max_requests_per_day: u32) -> Self {
        self.max_requests_per_day = max_requests_per_day;
        self.rate_limiting = true;
        self
    }
}
