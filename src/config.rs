use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

pub const LOCK_PATH_ENV: &str = "MULTIPROC_METRICS_LOCK_PATH";
pub const SOCKET_PATH_ENV: &str = "MULTIPROC_METRICS_SOCK_PATH";

const DEFAULT_LOCK_PATH: &str = "/tmp/multiproc_metrics.lock";
const DEFAULT_SOCKET_PATH: &str = "/tmp/multiproc_metrics.sock";

/// Settings shared by every process that should see the same metrics.
///
/// All cooperating processes must agree on `lock_path` and `socket_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub(crate) namespace: Option<String>,
    pub(crate) lock_path: PathBuf,
    pub(crate) socket_path: PathBuf,
    pub(crate) ready_timeout: Option<Duration>,
    pub(crate) poll_interval: Duration,
    pub(crate) connect_attempts: u32,
    pub(crate) connect_backoff: Duration,
    pub(crate) connect_backoff_cap: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            lock_path: DEFAULT_LOCK_PATH.into(),
            socket_path: DEFAULT_SOCKET_PATH.into(),
            ready_timeout: None,
            poll_interval: Duration::from_millis(100),
            connect_attempts: 6,
            connect_backoff: Duration::from_millis(125),
            connect_backoff_cap: Duration::from_secs(2),
        }
    }
}

impl CollectorConfig {
    /// Defaults, with the lock and socket paths taken from `MULTIPROC_METRICS_LOCK_PATH` and
    /// `MULTIPROC_METRICS_SOCK_PATH` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(LOCK_PATH_ENV) {
            config.lock_path = path.into();
        }
        if let Some(path) = std::env::var_os(SOCKET_PATH_ENV) {
            config.socket_path = path.into();
        }
        config
    }

    /// Prefixes every counter name with `<namespace>_`.
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Sets the path of the advisory lock file used to elect the leader.
    #[must_use]
    pub fn lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    /// Sets the path of the Unix socket the leader listens on.
    #[must_use]
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Bounds how long public operations wait for the collector to become ready.
    /// `None` waits forever.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// How often background loops wake up to check for a stop request.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Connection retry policy for followers: `attempts` tries, sleeping `backoff` doubled
    /// after each failure, capped at `cap`.
    #[must_use]
    pub const fn connect_retry(mut self, attempts: u32, backoff: Duration, cap: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_backoff = backoff;
        self.connect_backoff_cap = cap;
        self
    }

    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.connect_backoff
            .checked_mul(1 << attempt.min(16))
            .map_or(self.connect_backoff_cap, |d| d.min(self.connect_backoff_cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = CollectorConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_millis(125));
        assert_eq!(config.backoff_for(1), Duration::from_millis(250));
        assert_eq!(config.backoff_for(3), Duration::from_secs(1));
        assert_eq!(config.backoff_for(4), Duration::from_secs(2));
        assert_eq!(config.backoff_for(40), Duration::from_secs(2));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = CollectorConfig::default()
            .namespace("app")
            .lock_path("/run/app.lock")
            .socket_path("/run/app.sock")
            .ready_timeout(Some(Duration::from_secs(1)));
        assert_eq!(config.namespace.as_deref(), Some("app"));
        assert_eq!(config.lock_path, PathBuf::from("/run/app.lock"));
        assert_eq!(config.socket_path, PathBuf::from("/run/app.sock"));
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(1)));
    }
}
