//! Engine configuration
//!
//! Every field has a sensible default, so an [`EngineConfig`] can be built
//! with `EngineConfig::default()` and adjusted with the `with_*` setters, or
//! deserialized from a partial JSON document (durations are whole seconds).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of rows in one result page
pub const DEFAULT_ROW_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Page size of the query executor
    pub row_limit: usize,

    /// Ceiling on physical connections per open profile
    pub max_connections_per_profile: u32,

    /// How long an acquire may wait on a saturated pool
    #[serde(with = "seconds")]
    pub acquire_timeout: Duration,

    /// Bound on the initial dial of a database or SSH server
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,

    #[serde(with = "seconds")]
    pub ssh_keepalive_interval: Duration,

    /// Unanswered keepalives before the SSH session is dropped
    pub ssh_keepalive_max: usize,

    /// Trust-on-first-use known_hosts file, `<config dir>/sqldesk/known_hosts`
    /// unless set
    pub known_hosts_path: Option<PathBuf>,

    /// Skip host key verification entirely
    pub accept_any_host_key: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            max_connections_per_profile: 5,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            ssh_keepalive_interval: Duration::from_secs(30),
            ssh_keepalive_max: 3,
            known_hosts_path: default_known_hosts_path(),
            accept_any_host_key: false,
        }
    }
}

impl EngineConfig {
    pub fn with_row_limit(mut self, row_limit: usize) -> Self {
        self.row_limit = row_limit.max(1);
        self
    }

    pub fn with_max_connections_per_profile(mut self, max_connections: u32) -> Self {
        self.max_connections_per_profile = max_connections.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ssh_keepalive(mut self, interval: Duration, max_missed: usize) -> Self {
        self.ssh_keepalive_interval = interval;
        self.ssh_keepalive_max = max_missed;
        self
    }

    pub fn with_known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Accept every SSH host key without recording it
    pub fn with_any_host_key(mut self) -> Self {
        self.accept_any_host_key = true;
        self
    }

    /// How SSH tunnels verify the server's host key
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        if self.accept_any_host_key {
            return HostKeyPolicy::AcceptAny;
        }
        match &self.known_hosts_path {
            Some(path) => HostKeyPolicy::TrustOnFirstUse(path.clone()),
            None => HostKeyPolicy::Reject,
        }
    }
}

/// SSH host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Record unknown hosts in the file, reject changed keys
    TrustOnFirstUse(PathBuf),
    AcceptAny,
    /// No known_hosts file could be located
    Reject,
}

fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sqldesk").join("known_hosts"))
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
