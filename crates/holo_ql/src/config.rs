//! Configuration for clusters, clients and sessions.
//!
//! Every knob has a default and can be overridden from `HOLO_QL_*`
//! environment variables. Values that fail to parse fall back to the default
//! with a warning rather than aborting startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default bound on a single flush or synchronous apply.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// When buffered operations are sent to tablets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// `apply` executes the op and waits for its response.
    #[default]
    AutoFlushSync,
    /// `apply` only buffers; `flush` or `flush_async` sends the batch.
    ManualFlush,
}

impl FromStr for FlushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "auto_flush_sync" => Ok(FlushMode::AutoFlushSync),
            "manual" | "manual_flush" => Ok(FlushMode::ManualFlush),
            other => Err(format!("unknown flush mode {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for one flush (or one synchronous apply).
    pub timeout: Duration,
    /// Flush mode a new session starts in.
    pub flush_mode: FlushMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SESSION_TIMEOUT,
            flush_mode: FlushMode::AutoFlushSync,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: read_env_duration("HOLO_QL_SESSION_TIMEOUT", defaults.timeout),
            flush_mode: read_env_parsed("HOLO_QL_FLUSH_MODE", defaults.flush_mode),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long `open_table` keeps retrying a table that does not exist yet.
    pub open_table_timeout: Duration,
    /// First retry delay for `open_table`; doubles up to `open_table_max_backoff`.
    pub open_table_backoff: Duration,
    pub open_table_max_backoff: Duration,
    /// Defaults handed to every new session.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            open_table_timeout: Duration::from_secs(10),
            open_table_backoff: Duration::from_millis(10),
            open_table_max_backoff: Duration::from_secs(1),
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            open_table_timeout: read_env_duration(
                "HOLO_QL_OPEN_TABLE_TIMEOUT",
                defaults.open_table_timeout,
            ),
            open_table_backoff: read_env_duration(
                "HOLO_QL_OPEN_TABLE_BACKOFF",
                defaults.open_table_backoff,
            ),
            open_table_max_backoff: read_env_duration(
                "HOLO_QL_OPEN_TABLE_MAX_BACKOFF",
                defaults.open_table_max_backoff,
            ),
            session: SessionConfig::from_env(),
        }
    }
}

/// Where tablet rows live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// Rows vanish with the process.
    Memory,
    /// One fjall keyspace per tablet server under `data_dir`, plus the
    /// persisted catalog.
    Fjall { data_dir: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    pub tablet_servers: usize,
    /// Tablets created for a table when the caller asks for zero.
    pub default_tablets_per_table: usize,
    pub storage: StorageBackend,
    /// Artificial delay before a tablet server handles a batch.
    pub handler_delay: Duration,
    pub client: ClientConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            tablet_servers: 3,
            default_tablets_per_table: 3,
            storage: StorageBackend::Memory,
            handler_delay: Duration::ZERO,
            client: ClientConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// In-memory cluster with `tablet_servers` servers.
    pub fn in_memory(tablet_servers: usize) -> Self {
        Self {
            tablet_servers: tablet_servers.max(1),
            ..Self::default()
        }
    }

    /// Fjall-backed cluster rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>, tablet_servers: usize) -> Self {
        Self {
            tablet_servers: tablet_servers.max(1),
            storage: StorageBackend::Fjall {
                data_dir: data_dir.into(),
            },
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let storage = match env::var("HOLO_QL_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => StorageBackend::Fjall {
                data_dir: PathBuf::from(dir),
            },
            _ => defaults.storage,
        };
        Self {
            tablet_servers: read_env_usize("HOLO_QL_TABLET_SERVERS", defaults.tablet_servers)
                .max(1),
            default_tablets_per_table: read_env_usize(
                "HOLO_QL_TABLETS_PER_TABLE",
                defaults.default_tablets_per_table,
            )
            .max(1),
            storage,
            handler_delay: read_env_duration("HOLO_QL_HANDLER_DELAY", defaults.handler_delay),
            client: ClientConfig::from_env(),
        }
    }
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    read_env_parsed(name, default)
}

/// Read an env var as a humantime duration ("250ms", "1m") with a default.
fn read_env_duration(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(raw) => match humantime::parse_duration(raw.trim()) {
            Ok(value) => value,
            Err(err) => {
                warn!(var = name, value = %raw, error = %err, "ignoring invalid duration");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_env_parsed<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(err) => {
                warn!(var = name, value = %raw, error = %err, "ignoring invalid setting");
                default
            }
        },
        Err(_) => default,
    }
}
