use crate::registry::RegistryBuilder;
use crate::retry::RetryPolicy;
use crate::tracker::DuplicatePolicy;
use relay_core::{RelayError, RelayResult};
use relay_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agents: Vec<AgentOverride>,
}

impl RelayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> RelayResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| RelayError::Config(format!("Invalid relay config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: &Path) -> RelayResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.coordinator.task_timeout_secs == 0 {
            return Err(RelayError::Config(
                "coordinator.task_timeout_secs must be positive".into(),
            ));
        }
        if self.watchdog.enabled && self.watchdog.reclaim_interval_ms == 0 {
            return Err(RelayError::Config(
                "watchdog.reclaim_interval_ms must be positive".into(),
            ));
        }
        if self.watchdog.enabled && self.watchdog.interval_ms == 0 {
            return Err(RelayError::Config(
                "watchdog.interval_ms must be positive".into(),
            ));
        }
        for agent in &self.agents {
            if agent.max_concurrency == Some(0) {
                return Err(RelayError::Config(format!(
                    "agents.{}.max_concurrency must be at least 1",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    /// Apply `[[agents]]` entries to registrations made in code.
    pub fn apply_agent_overrides(&self, builder: &mut RegistryBuilder) -> RelayResult<()> {
        for agent in &self.agents {
            if let Some(max) = agent.max_concurrency {
                builder.set_max_concurrency(&agent.name, max)?;
            }
            if let Some(policy) = agent.retry {
                builder.set_retry(&agent.name, policy)?;
            }
        }
        Ok(())
    }
}

/// What to do when every slot of an agent is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Wait in FIFO order, up to `max_queue_depth` waiters.
    #[default]
    Queue,
    /// Fail with `Backpressure` immediately.
    Reject,
}

/// `[coordinator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub overflow: OverflowMode,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Processing ceiling per task, retries and backoff included.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Extra attempts for bookkeeping writes when the store is unavailable.
    #[serde(default = "default_tracking_retries")]
    pub tracking_retries: u32,
    #[serde(default = "default_tracking_retry_delay_ms")]
    pub tracking_retry_delay_ms: u64,
    /// Lifetime of terminal task records. Unset keeps them forever.
    #[serde(default)]
    pub record_ttl_secs: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            overflow: OverflowMode::default(),
            max_queue_depth: default_max_queue_depth(),
            task_timeout_secs: default_task_timeout_secs(),
            tracking_retries: default_tracking_retries(),
            tracking_retry_delay_ms: default_tracking_retry_delay_ms(),
            record_ttl_secs: None,
        }
    }
}

impl CoordinatorConfig {
    /// Per-task processing ceiling.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Base delay between bookkeeping write retries.
    pub fn tracking_retry_delay(&self) -> Duration {
        Duration::from_millis(self.tracking_retry_delay_ms)
    }

    /// Lifetime of terminal records; `None` keeps them forever.
    pub fn record_ttl(&self) -> Option<Duration> {
        self.record_ttl_secs.map(Duration::from_secs)
    }

    /// Waiters allowed per agent once every slot is busy.
    pub fn queue_limit(&self) -> usize {
        match self.overflow {
            OverflowMode::Queue => self.max_queue_depth,
            OverflowMode::Reject => 0,
        }
    }
}

/// `[watchdog]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_interval_ms")]
    pub interval_ms: u64,
    /// Defaults to twice the task timeout.
    #[serde(default)]
    pub stuck_after_secs: Option<u64>,
    /// Time between storage reclaim passes (expired keys, evicted history).
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_watchdog_interval_ms(),
            stuck_after_secs: None,
            reclaim_interval_ms: default_reclaim_interval_ms(),
        }
    }
}

impl WatchdogConfig {
    /// Time between watchdog sweeps.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Time between storage reclaim passes.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Processing age after which a task counts as stuck.
    pub fn stuck_after(&self, task_timeout: Duration) -> Duration {
        self.stuck_after_secs
            .map(Duration::from_secs)
            .unwrap_or(task_timeout.saturating_mul(2))
    }
}

/// `[logging]` section, read by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOverride {
    /// Registered agent to adjust.
    pub name: String,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_max_queue_depth() -> usize {
    64
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_tracking_retries() -> u32 {
    5
}
fn default_tracking_retry_delay_ms() -> u64 {
    100
}
fn default_reclaim_interval_ms() -> u64 {
    60_000
}

fn default_watchdog_interval_ms() -> u64 {
    1_000
}
fn default_log_filter() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{handler_fn, AgentDescriptor, WorkerRegistry};
    use relay_store::BackendKind;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.coordinator.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.coordinator.queue_limit(), 64);
        assert_eq!(config.coordinator.task_timeout(), Duration::from_secs(300));
        assert_eq!(config.store.kind, BackendKind::Memory);
        assert!(config.watchdog.enabled);
        assert_eq!(
            config.watchdog.stuck_after(config.coordinator.task_timeout()),
            Duration::from_secs(600)
        );
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = RelayConfig::from_toml_str(
            r#"
            [coordinator]
            duplicate_policy = "overwrite"
            overflow = "reject"
            task_timeout_secs = 30
            record_ttl_secs = 3600

            [retry]
            max_retries = 5
            base_delay_ms = 200

            [store]
            kind = "file"
            path = "data/relay.jsonl"

            [watchdog]
            interval_ms = 500
            stuck_after_secs = 90
            reclaim_interval_ms = 2000

            [logging]
            json = true

            [[agents]]
            name = "coder"
            max_concurrency = 2

            [[agents]]
            name = "researcher"
            retry = { max_retries = 1 }
            "#,
        )
        .unwrap();

        assert_eq!(config.coordinator.duplicate_policy, DuplicatePolicy::Overwrite);
        assert_eq!(config.coordinator.queue_limit(), 0);
        assert_eq!(config.coordinator.record_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.store.kind, BackendKind::File);
        assert_eq!(config.watchdog.stuck_after(Duration::ZERO), Duration::from_secs(90));
        assert_eq!(config.watchdog.reclaim_interval(), Duration::from_secs(2));
        assert!(config.logging.json);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(
            config.agents[1].retry.map(|r| (r.max_retries, r.base_delay_ms)),
            Some((1, 1_000))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RelayConfig::from_toml_str("[coordinator]\ntask_timeout_secs = 0").is_err());
        assert!(RelayConfig::from_toml_str("[[agents]]\nname = \"a\"\nmax_concurrency = 0").is_err());
        assert!(RelayConfig::from_toml_str("[retry]\nmax_retries = \"many\"").is_err());
    }

    #[test]
    fn test_apply_agent_overrides() {
        let config = RelayConfig::from_toml_str(
            "[[agents]]\nname = \"coder\"\nmax_concurrency = 1\nretry = { max_retries = 7 }",
        )
        .unwrap();
        let mut builder = WorkerRegistry::builder();
        builder
            .register(AgentDescriptor::new(
                "coder",
                4,
                handler_fn(|t: relay_core::Task, _| async move { Ok(t.payload) }),
            ))
            .unwrap();
        config.apply_agent_overrides(&mut builder).unwrap();

        let coder = builder.freeze().resolve("coder").unwrap();
        assert_eq!(coder.max_concurrency, 1);
        assert_eq!(coder.retry.map(|r| r.max_retries), Some(7));
    }

    #[test]
    fn test_override_for_unknown_agent_fails() {
        let config =
            RelayConfig::from_toml_str("[[agents]]\nname = \"ghost\"\nmax_concurrency = 2").unwrap();
        let mut builder = WorkerRegistry::builder();
        assert!(config.apply_agent_overrides(&mut builder).is_err());
    }
}
