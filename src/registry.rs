use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherOptions, LimiterStatus, DEFAULT_IDLE_DELAY};
use crate::error::{LimitError, PacerResult};
use crate::limiter_config::{EndpointConfigs, LimiterConfig};
use crate::persistence::StateStore;
use crate::priority::Priority;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Endpoint name to dispatcher, each with its own budget
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<Dispatcher>>>,
    rules: EndpointConfigs,
    state_dir: Option<PathBuf>,
    idle_delay: Duration,
}

impl LimiterRegistry {
    /// Create a registry without persistence
    pub fn new(rules: EndpointConfigs) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            rules,
            state_dir: None,
            idle_delay: DEFAULT_IDLE_DELAY,
        }
    }

    /// Create a registry from process settings, loading endpoint rules if configured
    pub fn from_config(config: &Config) -> PacerResult<Self> {
        let rules = match config.endpoints_file() {
            Some(path) => EndpointConfigs::from_json_file(path)?,
            None => EndpointConfigs::default(),
        };

        let mut registry = Self::new(rules).with_idle_delay(config.idle_delay());
        if let Some(dir) = config.state_dir() {
            registry = registry.with_state_dir(dir);
        }
        Ok(registry)
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn rules(&self) -> &EndpointConfigs {
        &self.rules
    }

    /// Dispatcher for `endpoint`, built and started with `config` on first use
    pub fn get_or_create(&self, endpoint: &str, config: &LimiterConfig) -> PacerResult<Arc<Dispatcher>> {
        if let Some(existing) = self.limiters.read().get(endpoint) {
            return Ok(existing.clone());
        }

        let mut limiters = self.limiters.write();
        if let Some(existing) = limiters.get(endpoint) {
            return Ok(existing.clone());
        }

        let options = DispatcherOptions {
            idle_delay: self.idle_delay,
            state_store: self
                .state_dir
                .as_deref()
                .map(|dir| StateStore::for_endpoint(dir, endpoint)),
        };
        let dispatcher = Arc::new(Dispatcher::new(endpoint, config.clone(), options)?);
        dispatcher.start()?;
        limiters.insert(endpoint.to_string(), dispatcher.clone());

        info!(endpoint, rate = dispatcher.current_rate(), "registered limiter");
        Ok(dispatcher)
    }

    /// Dispatcher for `endpoint` using its configured rule
    pub fn limiter(&self, endpoint: &str) -> PacerResult<Arc<Dispatcher>> {
        self.get_or_create(endpoint, self.rules.get_rule(endpoint))
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<Dispatcher>> {
        self.limiters.read().get(endpoint).cloned()
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn statuses(&self) -> Vec<LimiterStatus> {
        let limiters: Vec<Arc<Dispatcher>> = self.limiters.read().values().cloned().collect();
        let mut statuses: Vec<LimiterStatus> = limiters.iter().map(|d| d.get_status()).collect();
        statuses.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        statuses
    }

    /// Stop and persist every dispatcher; the registry is empty afterwards
    pub async fn shutdown_all(&self) {
        let limiters: Vec<Arc<Dispatcher>> = self.limiters.write().drain().map(|(_, d)| d).collect();
        let count = limiters.len();
        for dispatcher in limiters {
            dispatcher.stop().await;
        }
        info!(count, "all limiters stopped");
    }

    /// See [`crate::wrapper::run_with_limit`]
    pub async fn run_with_limit<F, Fut, T, E>(
        &self,
        endpoint: &str,
        priority: Priority,
        deadline: Option<Instant>,
        operation: F,
    ) -> Result<T, LimitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        crate::wrapper::run_with_limit(self, endpoint, priority, deadline, operation).await
    }
}
