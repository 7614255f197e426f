//! Connection configuration
//!
//! `Config` deserializes from whatever format the host application keeps
//! its settings in, or can be read from the environment with
//! [`Config::from_env`]:
//!
//! | Variable             | Default                                  |
//! |----------------------|------------------------------------------|
//! | `DATABASE_URL`       | `postgres://postgres@localhost/postgres` |
//! | `DB_MAX_CONNECTIONS` | `5`                                      |
//! | `TX_MAX_ATTEMPTS`    | unbounded                                |
//! | `TX_DEADLINE_MS`     | unbounded                                |

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost/postgres";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub url: String,
    pub max_connections: u32,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let max_connections =
            parse_var(&lookup, "DB_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let retry = RetryPolicy {
            max_attempts: parse_var(&lookup, "TX_MAX_ATTEMPTS")?,
            deadline_ms: parse_var(&lookup, "TX_DEADLINE_MS")?,
        };

        let config = Self {
            url,
            max_connections,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw:?}"))),
    }
}

/// Limits on how long a transaction keeps retrying.
///
/// The default has no limits: a transaction that keeps conflicting is
/// retried until it commits or fails some other way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget across all attempts, in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl RetryPolicy {
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            deadline_ms: None,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Whether another attempt may start after `attempts` have run for
    /// `elapsed`.
    pub fn allows_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return false;
        }
        if self.deadline().is_some_and(|deadline| elapsed >= deadline) {
            return false;
        }
        true
    }
}
