use std::collections::HashMap;
use std::time::Duration;

use localfaas_core::manifest::DEFAULT_TIMEOUT_SECS;

/// Environment variable that marks the process as running under a debugger.
pub const DEBUGGER_ENV: &str = "LOCALFAAS_DEBUGGER";

/// Emulator-level configuration for function invocation and event sources.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Region used in generated ARNs.
    pub region: String,
    /// Idle time after which a mounted runner is unmounted.
    pub idle_eviction: Duration,
    /// When false, invocations never time out (interactive debugging).
    pub timeouts_enabled: bool,
    /// Concurrent invocations per function before load shedding.
    pub max_concurrent_invocations: u32,
    /// Timeout for functions that declare none.
    pub default_timeout_secs: u64,
    /// Interpreter binary per runtime family (`python`, `ruby`).
    pub interpreter_overrides: HashMap<String, String>,
    /// Respawn subprocess runners when their handler source changes.
    pub watch_sources: bool,
    pub queue: QueueDefaults,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            idle_eviction: Duration::from_secs(18 * 60),
            timeouts_enabled: !debugger_attached(),
            max_concurrent_invocations: 1000,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            interpreter_overrides: HashMap::new(),
            watch_sources: true,
            queue: QueueDefaults::default(),
        }
    }
}

/// Polling and batching defaults for queue event sources.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    /// Poll interval after a non-empty receive.
    pub min_poll_interval: Duration,
    /// Ceiling the poll interval grows to while the queue stays empty.
    pub max_poll_interval: Duration,
    /// Growth per empty poll.
    pub poll_backoff_step: Duration,
    /// Messages requested per receive call.
    pub receive_batch: usize,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_millis(350),
            max_poll_interval: Duration::from_secs(20),
            poll_backoff_step: Duration::from_millis(200),
            receive_batch: 10,
        }
    }
}

/// Returns `true` when `LOCALFAAS_DEBUGGER` is set to a truthy value.
#[must_use]
pub fn debugger_attached() -> bool {
    std::env::var(DEBUGGER_ENV).is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_config_defaults() {
        let config = EmulatorConfig::default();
        assert_eq!(config.idle_eviction, Duration::from_secs(1080));
        assert_eq!(config.max_concurrent_invocations, 1000);
        assert_eq!(config.default_timeout_secs, 6);
        assert!(config.watch_sources);
        assert_eq!(config.region, "us-east-1");
    }

    #[test]
    fn queue_defaults() {
        let q = QueueDefaults::default();
        assert_eq!(q.min_poll_interval, Duration::from_millis(350));
        assert_eq!(q.max_poll_interval, Duration::from_secs(20));
        assert!(q.poll_backoff_step < q.min_poll_interval);
    }
}
