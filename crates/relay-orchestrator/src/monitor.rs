use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Current status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    /// Idle, but the last task it ran failed.
    Error,
}

/// Cumulative counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks that ended Completed.
    pub completed: u64,
    /// Tasks that ended Failed.
    pub failed: u64,
    /// Handler invocations, including retries.
    pub attempts: u64,
    /// Invocations beyond the first of each task.
    pub retries: u64,
    /// Total processing time.
    pub duration_ms: u64,
}

/// Snapshot of one agent's activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent name.
    pub name: String,
    /// Derived from in-flight work and the last outcome.
    pub status: WorkerStatus,
    /// Tasks currently processing.
    pub in_flight: usize,
    /// Most recently started task.
    pub last_task: Option<String>,
    /// Cumulative counters.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn idle(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: WorkerStatus::Idle,
            in_flight: 0,
            last_task: None,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks state and metrics for every registered agent.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<String, AgentState>>>,
}

impl AgentMonitor {
    /// Idle state for each named agent.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let states = names
            .into_iter()
            .map(|n| (n.as_ref().to_string(), AgentState::idle(n.as_ref())))
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark an agent as working on a task.
    pub async fn start_task(&self, name: &str, task_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.in_flight += 1;
            state.last_task = Some(task_id.to_string());
            state.status = WorkerStatus::Working;
        }
    }

    /// Record the outcome of a finished task.
    pub async fn finish_task(&self, name: &str, succeeded: bool, attempts: u32, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(name) {
            state.in_flight = state.in_flight.saturating_sub(1);
            if succeeded {
                state.metrics.completed += 1;
            } else {
                state.metrics.failed += 1;
            }
            state.metrics.attempts += u64::from(attempts);
            state.metrics.retries += u64::from(attempts.saturating_sub(1));
            state.metrics.duration_ms += duration_ms;
            state.status = match (state.in_flight, succeeded) {
                (0, true) => WorkerStatus::Idle,
                (0, false) => WorkerStatus::Error,
                _ => WorkerStatus::Working,
            };
        }
    }

    /// All agent states, sorted by name.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut all: Vec<AgentState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// State of one agent, if registered.
    pub async fn get_state(&self, name: &str) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(name).cloned()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.attempts += state.metrics.attempts;
            total.retries += state.metrics.retries;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON for status output.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> AgentMonitor {
        AgentMonitor::new(["researcher", "coder"])
    }

    #[tokio::test]
    async fn test_initial_state() {
        let states = monitor().snapshot().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].name, "coder");
        for state in &states {
            assert_eq!(state.status, WorkerStatus::Idle);
            assert!(state.last_task.is_none());
        }
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = monitor();
        monitor.start_task("coder", "coder-0-abc").await;
        monitor.start_task("coder", "coder-1-def").await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.in_flight, 2);
        assert_eq!(state.last_task.as_deref(), Some("coder-1-def"));

        monitor.finish_task("coder", true, 1, 10).await;
        assert_eq!(
            monitor.get_state("coder").await.unwrap().status,
            WorkerStatus::Working
        );
        monitor.finish_task("coder", true, 3, 30).await;
        let state = monitor.get_state("coder").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!(state.metrics.completed, 2);
        assert_eq!(state.metrics.attempts, 4);
        assert_eq!(state.metrics.retries, 2);
        assert_eq!(state.metrics.duration_ms, 40);
    }

    #[tokio::test]
    async fn test_failure_sets_error_status() {
        let monitor = monitor();
        monitor.start_task("researcher", "r").await;
        monitor.finish_task("researcher", false, 3, 5).await;
        let state = monitor.get_state("researcher").await.unwrap();
        assert_eq!(state.status, WorkerStatus::Error);
        assert_eq!(state.metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_ignored() {
        let monitor = monitor();
        monitor.start_task("ghost", "g").await;
        assert!(monitor.get_state("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = monitor();
        monitor.start_task("coder", "c").await;
        monitor.finish_task("coder", true, 1, 7).await;
        monitor.start_task("researcher", "r").await;
        monitor.finish_task("researcher", false, 2, 3).await;

        let agg = monitor.aggregate_metrics().await;
        assert_eq!(agg.completed, 1);
        assert_eq!(agg.failed, 1);
        assert_eq!(agg.retries, 1);
        assert_eq!(agg.duration_ms, 10);

        let json = monitor.to_json().await;
        assert!(json["agents"].is_array());
        assert_eq!(json["aggregate"]["attempts"], 3);
    }
}
