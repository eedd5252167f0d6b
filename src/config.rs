//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workflow::retry::RetryPolicy;

/// Job registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of jobs retained; older ones are evicted after each create.
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Heuristic progress curve used by the executor.
///
/// Progress after `n` steps is `min(baseline + n * increment, upper_bound)`.
/// The step count of a polling workflow is not known up front, so this is an
/// estimate rather than a fraction of remaining work.
#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    /// Progress written when a job is picked up.
    pub baseline: f64,
    /// Progress added per completed step.
    pub increment: f64,
    /// Cap while the job is still running.
    pub upper_bound: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            baseline: 0.1,
            increment: 0.15,
            upper_bound: 0.9,
        }
    }
}

impl ProgressConfig {
    /// Progress estimate after `steps_completed` steps.
    pub fn after(&self, steps_completed: usize) -> f64 {
        (self.baseline + steps_completed as f64 * self.increment).min(self.upper_bound)
    }
}

/// Background executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of workflows running at once. Extra jobs wait as PENDING.
    pub max_concurrent_jobs: usize,
    /// How long `shutdown` waits for cancelled jobs to wind down.
    pub shutdown_grace: Duration,
    /// Progress curve.
    pub progress: ProgressConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 32,
            shutdown_grace: Duration::from_secs(5),
            progress: ProgressConfig::default(),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on handler delegations within a single turn.
    pub max_delegations: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { max_delegations: 3 }
    }
}

/// Defaults for analysis requests arriving as free text.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Account used when the utterance does not name one.
    pub default_account: String,
    /// Stock universe submitted to the batch service.
    pub default_stocks: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_account: "ACC12345".to_string(),
            default_stocks: ["AAPL", "GOOG", "MSFT", "NVDA", "TSLA"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    /// Polling budget for the batch monitor loop.
    pub polling: RetryPolicy,
    pub supervisor: SupervisorConfig,
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Build configuration from defaults overlaid with `PORTFOLIO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "PORTFOLIO_REGISTRY_CAPACITY")? {
            config.registry.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "PORTFOLIO_MAX_CONCURRENT_JOBS")? {
            config.executor.max_concurrent_jobs = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PORTFOLIO_POLL_INTERVAL_MS")? {
            config.polling.initial_delay = Duration::from_millis(ms);
            config.polling.max_delay = config.polling.max_delay.max(config.polling.initial_delay);
        }
        if let Some(v) = parse_var(&lookup, "PORTFOLIO_POLL_MAX_ATTEMPTS")? {
            config.polling.max_attempts = v;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PORTFOLIO_POLL_DEADLINE_SECS")? {
            config.polling.deadline = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, "PORTFOLIO_MAX_DELEGATIONS")? {
            config.supervisor.max_delegations = v;
        }
        if let Some(account) = lookup("PORTFOLIO_DEFAULT_ACCOUNT") {
            config.analysis.default_account = account.trim().to_string();
        }
        if let Some(stocks) = lookup("PORTFOLIO_DEFAULT_STOCKS") {
            config.analysis.default_stocks = stocks
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.capacity == 0 {
            return Err(invalid("registry.capacity", "must be at least 1"));
        }
        if self.executor.max_concurrent_jobs == 0 {
            return Err(invalid("executor.max_concurrent_jobs", "must be at least 1"));
        }
        let p = &self.executor.progress;
        for (key, value) in [
            ("progress.baseline", p.baseline),
            ("progress.increment", p.increment),
            ("progress.upper_bound", p.upper_bound),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, "must be within [0, 1]"));
            }
        }
        if p.baseline > p.upper_bound {
            return Err(invalid("progress.baseline", "must not exceed progress.upper_bound"));
        }
        if self.polling.max_attempts == 0 {
            return Err(invalid("polling.max_attempts", "must be at least 1"));
        }
        if self.polling.backoff_factor < 1.0 {
            return Err(invalid("polling.backoff_factor", "must be >= 1.0"));
        }
        if self.supervisor.max_delegations == 0 {
            return Err(invalid("supervisor.max_delegations", "must be at least 1"));
        }
        if self.analysis.default_stocks.is_empty() {
            return Err(invalid("analysis.default_stocks", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}
