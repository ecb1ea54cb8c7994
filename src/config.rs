// ⚙️ Configuration - environment-driven settings

use chrono::Duration;
use std::env;
use std::time::Duration as StdDuration;
use tracing::warn;

pub const DEFAULT_SETTLEMENT_WINDOW_HOURS: i64 = 48;
pub const DEFAULT_DB_PATH: &str = "reconciler.db";

/// Knobs for a reconciliation run
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationConfig {
    /// Max delay between capture and settlement before it is flagged missing
    pub settlement_window: Duration,

    /// How long a run waits for another run to release the lock
    pub lock_timeout: StdDuration,

    /// Lock rows older than this belong to a dead run and are taken over
    pub stale_lock_after: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        ReconciliationConfig {
            settlement_window: Duration::hours(DEFAULT_SETTLEMENT_WINDOW_HOURS),
            lock_timeout: StdDuration::from_secs(30),
            stale_lock_after: Duration::minutes(10),
        }
    }
}

impl ReconciliationConfig {
    pub fn with_window_hours(hours: i64) -> Self {
        ReconciliationConfig {
            settlement_window: Duration::hours(hours),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: String,
    pub reconciliation: ReconciliationConfig,
}

impl Config {
    /// Reads `RECONCILER_DB_PATH` and `SETTLEMENT_WINDOW_HOURS`
    pub fn from_env() -> Self {
        let database_path =
            env::var("RECONCILER_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let window_hours = parse_window_hours(env::var("SETTLEMENT_WINDOW_HOURS").ok().as_deref());

        Config {
            database_path,
            reconciliation: ReconciliationConfig::with_window_hours(window_hours),
        }
    }
}

/// Positive integer hours, anything else falls back to the default
fn parse_window_hours(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return DEFAULT_SETTLEMENT_WINDOW_HOURS;
    };

    match raw.trim().parse::<i64>() {
        Ok(hours) if hours > 0 => hours,
        _ => {
            warn!(
                value = raw,
                default = DEFAULT_SETTLEMENT_WINDOW_HOURS,
                "ignoring invalid SETTLEMENT_WINDOW_HOURS"
            );
            DEFAULT_SETTLEMENT_WINDOW_HOURS
        }
    }
}
