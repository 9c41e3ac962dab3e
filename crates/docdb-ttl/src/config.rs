use std::time::Duration;

use serde::Deserialize;

/// Purger knobs. Durations are milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TtlConfig {
    /// Most documents one subtransaction deletes.
    pub batch_size: usize,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    /// Time one shard table may spend draining before the purger moves on.
    pub single_task_budget_ms: u64,
    /// Hard stop for a whole purge task.
    pub max_task_runtime_ms: u64,
    /// Keep deleting from a table until a batch comes back short.
    pub repeat_purge_until_drained: bool,
    /// Pause between background runs. `u64::MAX` disables the background
    /// thread.
    pub sweep_interval_ms: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        TtlConfig {
            batch_size: 10_000,
            statement_timeout_ms: 60_000,
            lock_timeout_ms: 10_000,
            single_task_budget_ms: 20_000,
            max_task_runtime_ms: 60_000,
            repeat_purge_until_drained: true,
            sweep_interval_ms: 10_000,
        }
    }
}

impl TtlConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn single_task_budget(&self) -> Duration {
        Duration::from_millis(self.single_task_budget_ms)
    }

    pub fn max_task_runtime(&self) -> Duration {
        Duration::from_millis(self.max_task_runtime_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms != u64::MAX).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TtlConfig::default();
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.single_task_budget(), Duration::from_secs(20));
        assert!(config.repeat_purge_until_drained);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn max_interval_disables_sweeps() {
        let config = TtlConfig {
            sweep_interval_ms: u64::MAX,
            ..TtlConfig::default()
        };
        assert_eq!(config.sweep_interval(), None);
    }
}
