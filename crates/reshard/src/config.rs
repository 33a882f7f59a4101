//! Process-wide orchestrator defaults.

use std::time::Duration;

/// Default wait for destinations to apply up to the gathered source
/// positions during primary cutover.
pub const DEFAULT_FILTERED_REPLICATION_WAIT: Duration = Duration::from_secs(30);

/// Tunable defaults, overridable per process through `RESHARD_*` env vars.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub filtered_replication_wait: Duration,
    /// Sleep before shutting query service on old RDONLY tablets after a
    /// non-primary migration.
    pub drain_sleep_rdonly: Duration,
    /// Same, for old REPLICA tablets.
    pub drain_sleep_replica: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filtered_replication_wait: DEFAULT_FILTERED_REPLICATION_WAIT,
            drain_sleep_rdonly: Duration::from_secs(5),
            drain_sleep_replica: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Defaults with `RESHARD_FILTERED_REPLICATION_WAIT_MS`,
    /// `RESHARD_DRAIN_SLEEP_RDONLY_MS` and `RESHARD_DRAIN_SLEEP_REPLICA_MS`
    /// applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filtered_replication_wait: env_duration_ms(
                "RESHARD_FILTERED_REPLICATION_WAIT_MS",
                defaults.filtered_replication_wait,
            ),
            drain_sleep_rdonly: env_duration_ms(
                "RESHARD_DRAIN_SLEEP_RDONLY_MS",
                defaults.drain_sleep_rdonly,
            ),
            drain_sleep_replica: env_duration_ms(
                "RESHARD_DRAIN_SLEEP_REPLICA_MS",
                defaults.drain_sleep_replica,
            ),
        }
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                tracing::warn!(env = name, value = %raw, "ignoring unparseable duration override");
                default
            }
        },
        Err(_) => default,
    }
}
