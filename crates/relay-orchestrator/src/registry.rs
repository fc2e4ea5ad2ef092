use crate::retry::RetryPolicy;
use async_trait::async_trait;
use relay_core::{HandlerError, RelayError, RelayResult, Task};
use relay_store::ContextStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Business logic of one agent.
///
/// Handlers may be invoked several times for the same task, so they must be
/// idempotent or leave no side effects behind when they fail.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Run one attempt of `task`. A retryable error asks for another attempt.
    async fn execute(
        &self,
        task: &Task,
        context: &ContextStore,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter turning an async closure into an [`AgentHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> AgentHandler for FnHandler<F>
where
    F: Fn(Task, ContextStore) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn execute(
        &self,
        task: &Task,
        context: &ContextStore,
    ) -> Result<serde_json::Value, HandlerError> {
        (self.f)(task.clone(), context.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn AgentHandler>
where
    F: Fn(Task, ContextStore) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Capability descriptor of a registered agent.
#[derive(Clone)]
pub struct AgentDescriptor {
    /// Unique agent name.
    pub name: String,
    /// Maximum tasks this agent runs at once (≥ 1).
    pub max_concurrency: usize,
    /// Business logic run for each attempt.
    pub handler: Arc<dyn AgentHandler>,
    /// Overrides the coordinator-wide retry policy for this agent.
    pub retry: Option<RetryPolicy>,
}

impl AgentDescriptor {
    /// Descriptor using the coordinator-wide retry policy.
    pub fn new(
        name: impl Into<String>,
        max_concurrency: usize,
        handler: Arc<dyn AgentHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            max_concurrency,
            handler,
            retry: None,
        }
    }

    /// Give this agent its own retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl std::fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Collects agent registrations at startup.
#[derive(Default)]
pub struct RegistryBuilder {
    agents: HashMap<String, Arc<AgentDescriptor>>,
}

impl RegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Names are unique and the concurrency limit must be
    /// at least one.
    pub fn register(&mut self, descriptor: AgentDescriptor) -> RelayResult<&mut Self> {
        if descriptor.max_concurrency == 0 {
            return Err(RelayError::Config(format!(
                "Agent '{}' must allow at least one concurrent task",
                descriptor.name
            )));
        }
        if self.agents.contains_key(&descriptor.name) {
            return Err(RelayError::Config(format!(
                "Agent '{}' is already registered",
                descriptor.name
            )));
        }
        info!(
            agent = %descriptor.name,
            max_concurrency = descriptor.max_concurrency,
            "Registered agent"
        );
        self.agents
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(self)
    }

    /// Lower the concurrency limit of a registered agent, e.g. from config.
    pub fn set_max_concurrency(&mut self, name: &str, max: usize) -> RelayResult<()> {
        if max == 0 {
            return Err(RelayError::Config(format!(
                "Agent '{name}' must allow at least one concurrent task"
            )));
        }
        let current = self
            .agents
            .get(name)
            .ok_or_else(|| RelayError::AgentNotFound(name.to_string()))?;
        let mut updated = AgentDescriptor::clone(current);
        updated.max_concurrency = max;
        self.agents.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    /// Replace the retry policy of a registered agent.
    pub fn set_retry(&mut self, name: &str, policy: RetryPolicy) -> RelayResult<()> {
        let current = self
            .agents
            .get(name)
            .ok_or_else(|| RelayError::AgentNotFound(name.to_string()))?;
        let updated = AgentDescriptor::clone(current).with_retry(policy);
        self.agents.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    /// Freeze the registrations into an immutable registry.
    pub fn freeze(self) -> WorkerRegistry {
        WorkerRegistry {
            agents: self.agents,
        }
    }
}

/// Immutable map from agent name to descriptor.
///
/// Built once by [`RegistryBuilder::freeze`]; lookups need no locking.
#[derive(Debug)]
pub struct WorkerRegistry {
    agents: HashMap<String, Arc<AgentDescriptor>>,
}

impl WorkerRegistry {
    /// Start registering agents.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Descriptor of `name`, or `AgentNotFound`.
    pub fn resolve(&self, name: &str) -> RelayResult<Arc<AgentDescriptor>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::AgentNotFound(name.to_string()))
    }

    /// Registered agent names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<Arc<AgentDescriptor>> {
        let mut all: Vec<Arc<AgentDescriptor>> = self.agents.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
