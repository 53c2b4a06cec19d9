//! Typed runtime settings for the channel runtime, read from `COURIER_*` env vars.

use std::time::Duration;

/// Knobs for the channel runtime. Every field has a default; `from_env`
/// overrides from the environment and warns (keeping the default) on values
/// that do not parse.
///
/// | Field | Env var | Default |
/// |---|---|---|
/// | `inbound_queue_capacity` | `COURIER_INBOUND_QUEUE_CAPACITY` | 256 |
/// | `inbound_workers` | `COURIER_INBOUND_WORKERS` | 4 |
/// | `refresh_interval` | `COURIER_REFRESH_INTERVAL_SECS` | 30 s |
/// | `token_ttl` | `COURIER_TOKEN_TTL_SECS` | 300 s |
/// | `status_notify_timeout` | `COURIER_STATUS_NOTIFY_TIMEOUT_SECS` | 60 s |
/// | `command_prefix` | `COURIER_COMMAND_PREFIX` | `/` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Bounded inbound queue capacity; a full queue is backpressure to the adapter.
    pub inbound_queue_capacity: usize,
    /// Number of inbound worker tasks.
    pub inbound_workers: usize,
    /// Interval between config refresh sweeps.
    pub refresh_interval: Duration,
    /// Lifetime of minted chat tokens.
    pub token_ttl: Duration,
    /// Deadline for processing-status adapter callbacks.
    pub status_notify_timeout: Duration,
    /// Default command prefix for the reply trigger test.
    pub command_prefix: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: 256,
            inbound_workers: 4,
            refresh_interval: Duration::from_secs(30),
            token_ttl: Duration::from_secs(300),
            status_notify_timeout: Duration::from_secs(60),
            command_prefix: "/".to_string(),
        }
    }
}

fn parsed_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparsable setting, keeping default");
                default
            }
        },
        Err(_) => default,
    }
}

impl RuntimeSettings {
    /// Reads settings from the environment (typically after
    /// [`load_and_apply`](crate::load_and_apply)).
    pub fn from_env() -> Self {
        let d = Self::default();
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parsed_or_default(key, default.as_secs()))
        };
        Self {
            inbound_queue_capacity: parsed_or_default(
                "COURIER_INBOUND_QUEUE_CAPACITY",
                d.inbound_queue_capacity,
            ),
            inbound_workers: parsed_or_default("COURIER_INBOUND_WORKERS", d.inbound_workers),
            refresh_interval: secs("COURIER_REFRESH_INTERVAL_SECS", d.refresh_interval),
            token_ttl: secs("COURIER_TOKEN_TTL_SECS", d.token_ttl),
            status_notify_timeout: secs(
                "COURIER_STATUS_NOTIFY_TIMEOUT_SECS",
                d.status_notify_timeout,
            ),
            command_prefix: std::env::var("COURIER_COMMAND_PREFIX")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(d.command_prefix),
        }
    }
}
