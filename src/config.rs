//! Kill side-channel configuration
//!
//! The configuration is built once per connector and shared read-only by every
//! connection it produces.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Default number of administrative kill connections
pub const DEFAULT_KILL_POOL_SIZE: usize = 1;

/// Default time allowed for one kill command
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// DSN query parameter carrying the kill pool size
pub const DSN_KILL_POOL_SIZE: &str = "kill_pool_size";

/// DSN query parameter carrying the kill timeout
pub const DSN_KILL_TIMEOUT: &str = "kill_timeout";

/// What the kill command terminates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillMode {
    /// Terminate the whole server session (the connection dies)
    #[default]
    TerminateSession,
    /// Abort only the running statement; the session survives
    CancelStatement,
}

impl std::fmt::Display for KillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TerminateSession => write!(f, "terminate_session"),
            Self::CancelStatement => write!(f, "cancel_statement"),
        }
    }
}

/// Kill side-channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KillConfig {
    /// Concurrent administrative connections (at least 1)
    pub kill_pool_size: usize,
    /// Maximum time for one kill, including waiting for a pool slot
    #[serde(rename = "kill_timeout_ms", deserialize_with = "deserialize_millis")]
    pub kill_timeout: Duration,
    /// What the kill command terminates
    pub kill_mode: KillMode,
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            kill_pool_size: DEFAULT_KILL_POOL_SIZE,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            kill_mode: KillMode::default(),
        }
    }
}

impl KillConfig {
    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```
    /// use cancellable_sql::KillConfig;
    /// use std::time::Duration;
    ///
    /// let config = KillConfig::builder()
    ///     .kill_pool_size(2)
    ///     .kill_timeout(Duration::from_secs(2))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.kill_pool_size, 2);
    /// ```
    pub fn builder() -> KillConfigBuilder {
        KillConfigBuilder {
            config: KillConfig::default(),
        }
    }

    /// Reject values the kill pool cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.kill_pool_size == 0 {
            return Err(Error::Config("kill_pool_size must be at least 1".into()));
        }
        if self.kill_timeout.is_zero() {
            return Err(Error::Config("kill_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Split kill options out of a DSN
    ///
    /// Returns the DSN with `kill_pool_size` / `kill_timeout` removed and the
    /// configuration they describe (defaults for absent options). Other query
    /// parameters are kept in their original order.
    pub fn extract_from_dsn(dsn: &str) -> Result<(String, KillConfig)> {
        let mut config = KillConfig::default();

        let (base, query) = match dsn.split_once('?') {
            Some((base, query)) => (base, query),
            None => return Ok((dsn.to_string(), config)),
        };

        let mut kept = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                DSN_KILL_POOL_SIZE => {
                    config.kill_pool_size = value.parse().map_err(|_| {
                        Error::Config(format!("invalid {}: {:?}", DSN_KILL_POOL_SIZE, value))
                    })?;
                }
                DSN_KILL_TIMEOUT => {
                    config.kill_timeout = parse_duration(value).ok_or_else(|| {
                        Error::Config(format!("invalid {}: {:?}", DSN_KILL_TIMEOUT, value))
                    })?;
                }
                _ => kept.push(pair),
            }
        }

        config.validate()?;

        let dsn = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        };
        Ok((dsn, config))
    }
}

/// Builder for [`KillConfig`]
#[derive(Debug, Clone)]
pub struct KillConfigBuilder {
    config: KillConfig,
}

impl KillConfigBuilder {
    /// Set the number of administrative kill connections
    ///
    /// Default: 1
    pub fn kill_pool_size(mut self, size: usize) -> Self {
        self.config.kill_pool_size = size;
        self
    }

    /// Set the time allowed for one kill command
    ///
    /// Default: 5 seconds
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.config.kill_timeout = timeout;
        self
    }

    /// Set what the kill command terminates
    pub fn kill_mode(mut self, mode: KillMode) -> Self {
        self.config.kill_mode = mode;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<KillConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse `500ms`, `5s`, `1m` or bare milliseconds
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    s.parse().ok().map(Duration::from_millis)
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
