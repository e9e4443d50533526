// Library-level tuning knobs and per-call overrides.
use std::time::Duration;

pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(50_000);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_INITIALIZING_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_CHILD_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Node-wide defaults for connection managers and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    // Period between connected-client samples.
    pub idle_check_interval: Duration,
    // Upper bound on a forwarded connect call.
    pub rpc_timeout: Duration,
    // Pause before retrying a tenant whose owner is still initializing.
    pub initializing_backoff: Duration,
    // Grace period for each child (and the database handle) on shutdown.
    pub child_shutdown_grace: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            initializing_backoff: DEFAULT_INITIALIZING_BACKOFF,
            child_shutdown_grace: DEFAULT_CHILD_SHUTDOWN_GRACE,
        }
    }
}

/// Per-call overrides for `lookup_or_start_connection`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub rpc_timeout: Option<Duration>,
    pub idle_check_interval: Option<Duration>,
}

impl ConnectOptions {
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = Some(interval);
        self
    }

    pub(crate) fn rpc_timeout_or(&self, settings: &ConnectSettings) -> Duration {
        self.rpc_timeout.unwrap_or(settings.rpc_timeout)
    }

    pub(crate) fn idle_check_interval_or(&self, settings: &ConnectSettings) -> Duration {
        self.idle_check_interval
            .unwrap_or(settings.idle_check_interval)
    }
}
