//! Runtime and native-bridge configuration
//!
//! Both configs deserialize from TOML with every key optional, and can be
//! overlaid from `WEFT_*` environment variables.
//!
//! ```toml
//! [runtime]
//! executors = 4
//! max_planned_tasks = 10000
//!
//! [bridge]
//! max_dispatch_threads = 8
//! ```

use crate::defaults::*;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment variable held a value of the wrong type
    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global executor threads (0 = number of CPUs)
    pub executors: usize,

    /// Maximum constructed-but-not-started tasks (0 = unlimited)
    pub max_planned_tasks: usize,

    /// Fiber stack reservation in bytes
    pub stack_size: usize,

    /// Idle stack segments kept for reuse
    pub stack_cache: usize,

    /// Release the pages of stacks returned to the cache
    pub shrink_idle_stacks: bool,

    /// Execution quantum for normal priority, in milliseconds
    pub base_quantum_ms: u64,

    /// Hot-queue backlog per executor before new work is routed cold
    pub hot_backlog_per_executor: usize,

    /// Timed entries in the hot timed structure before routing cold
    pub timed_hot_capacity: usize,

    /// Longest timer-controller sleep, in milliseconds
    pub timer_poll_ms: u64,

    /// Worker cap for elastic bound pools (0 = number of CPUs)
    pub max_elastic_executors: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executors: 0,
            max_planned_tasks: 0,
            stack_size: DEFAULT_STACK_SIZE,
            stack_cache: DEFAULT_STACK_CACHE,
            shrink_idle_stacks: false,
            base_quantum_ms: DEFAULT_BASE_QUANTUM_MS,
            hot_backlog_per_executor: DEFAULT_HOT_BACKLOG_PER_EXECUTOR,
            timed_hot_capacity: DEFAULT_TIMED_HOT_CAPACITY,
            timer_poll_ms: DEFAULT_TIMER_POLL_MS,
            max_elastic_executors: 0,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `WEFT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Parse the `[runtime]` table of a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ConfigFile::from_toml_str(source)?.runtime)
    }

    /// Overlay values produced by `lookup` (an environment accessor)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        overlay(&lookup, "WEFT_EXECUTORS", &mut self.executors)?;
        overlay(&lookup, "WEFT_MAX_PLANNED_TASKS", &mut self.max_planned_tasks)?;
        overlay(&lookup, "WEFT_STACK_SIZE", &mut self.stack_size)?;
        overlay(&lookup, "WEFT_STACK_CACHE", &mut self.stack_cache)?;
        overlay(&lookup, "WEFT_SHRINK_IDLE_STACKS", &mut self.shrink_idle_stacks)?;
        overlay(&lookup, "WEFT_BASE_QUANTUM_MS", &mut self.base_quantum_ms)?;
        overlay(&lookup, "WEFT_HOT_BACKLOG_PER_EXECUTOR", &mut self.hot_backlog_per_executor)?;
        overlay(&lookup, "WEFT_TIMED_HOT_CAPACITY", &mut self.timed_hot_capacity)?;
        overlay(&lookup, "WEFT_TIMER_POLL_MS", &mut self.timer_poll_ms)?;
        overlay(&lookup, "WEFT_MAX_ELASTIC_EXECUTORS", &mut self.max_elastic_executors)?;
        Ok(())
    }

    /// Builder-style executor count
    pub fn with_executors(mut self, executors: usize) -> Self {
        self.executors = executors;
        self
    }

    /// Builder-style admission limit
    pub fn with_max_planned_tasks(mut self, max: usize) -> Self {
        self.max_planned_tasks = max;
        self
    }

    /// Builder-style stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Resolved executor count
    pub fn executor_count(&self) -> usize {
        if self.executors == 0 {
            num_cpus::get()
        } else {
            self.executors
        }
    }

    /// Resolved elastic pool cap
    pub fn elastic_cap(&self) -> usize {
        if self.max_elastic_executors == 0 {
            num_cpus::get()
        } else {
            self.max_elastic_executors
        }
    }

    /// Resolved stack size, clamped to the minimum
    pub fn effective_stack_size(&self) -> usize {
        self.stack_size.max(MIN_STACK_SIZE)
    }

    /// Quantum for normal priority
    pub fn base_quantum(&self) -> Duration {
        Duration::from_millis(self.base_quantum_ms.max(1))
    }

    /// Longest timer-controller sleep
    pub fn timer_poll(&self) -> Duration {
        Duration::from_millis(self.timer_poll_ms.max(1))
    }
}

/// Native async bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Lower bound of the dispatch pool
    pub min_dispatch_threads: usize,

    /// Upper bound of the dispatch pool (0 = number of CPUs)
    pub max_dispatch_threads: usize,

    /// Hill-climbing sample interval, in milliseconds
    pub sample_interval_ms: u64,

    /// io_uring submission queue entries
    pub ring_entries: u32,

    /// Skip io_uring and use the portable reactor
    pub force_portable: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_dispatch_threads: DEFAULT_MIN_DISPATCH_THREADS,
            max_dispatch_threads: 0,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            ring_entries: DEFAULT_RING_ENTRIES,
            force_portable: false,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `WEFT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Parse the `[bridge]` table of a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ConfigFile::from_toml_str(source)?.bridge)
    }

    /// Overlay values produced by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        overlay(&lookup, "WEFT_MIN_DISPATCH_THREADS", &mut self.min_dispatch_threads)?;
        overlay(&lookup, "WEFT_MAX_DISPATCH_THREADS", &mut self.max_dispatch_threads)?;
        overlay(&lookup, "WEFT_SAMPLE_INTERVAL_MS", &mut self.sample_interval_ms)?;
        overlay(&lookup, "WEFT_RING_ENTRIES", &mut self.ring_entries)?;
        overlay(&lookup, "WEFT_FORCE_PORTABLE", &mut self.force_portable)?;
        Ok(())
    }

    /// Resolved (min, max) dispatch thread bounds
    pub fn dispatch_bounds(&self) -> (usize, usize) {
        let min = self.min_dispatch_threads.max(1);
        let max = if self.max_dispatch_threads == 0 {
            num_cpus::get()
        } else {
            self.max_dispatch_threads
        };
        (min, max.max(min))
    }

    /// Hill-climbing sample interval
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

/// A whole configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// `[runtime]` table
    pub runtime: RuntimeConfig,
    /// `[bridge]` table
    pub bridge: BridgeConfig,
}

impl ConfigFile {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }
}

fn overlay<T, F>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_planned_tasks, 0);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.executor_count() >= 1);
    }

    #[test]
    fn test_from_toml() {
        let source = r#"
            [runtime]
            executors = 3
            max_planned_tasks = 17

            [bridge]
            max_dispatch_threads = 6
            force_portable = true
        "#;
        let file = ConfigFile::from_toml_str(source).unwrap();
        assert_eq!(file.runtime.executors, 3);
        assert_eq!(file.runtime.max_planned_tasks, 17);
        assert_eq!(file.runtime.timer_poll_ms, DEFAULT_TIMER_POLL_MS);
        assert_eq!(file.bridge.dispatch_bounds(), (1, 6));
        assert!(file.bridge.force_portable);
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = RuntimeConfig::from_toml_str("[runtime]\nexecutors = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> =
            [("WEFT_EXECUTORS", "2"), ("WEFT_SHRINK_IDLE_STACKS", "true")].into();
        let mut config = RuntimeConfig::default();
        config
            .apply_env(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.executors, 2);
        assert!(config.shrink_idle_stacks);
    }

    #[test]
    fn test_env_overlay_queue_and_pool_keys() {
        let vars: HashMap<&str, &str> = [
            ("WEFT_HOT_BACKLOG_PER_EXECUTOR", "8"),
            ("WEFT_TIMED_HOT_CAPACITY", "32"),
            ("WEFT_MAX_ELASTIC_EXECUTORS", "3"),
        ]
        .into();
        let mut config = RuntimeConfig::default();
        config
            .apply_env(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.hot_backlog_per_executor, 8);
        assert_eq!(config.timed_hot_capacity, 32);
        assert_eq!(config.max_elastic_executors, 3);
        assert_eq!(config.elastic_cap(), 3);
    }

    #[test]
    fn test_env_overlay_invalid() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env(|var| (var == "WEFT_RING_ENTRIES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "WEFT_RING_ENTRIES",
                ..
            }
        ));
    }

    #[test]
    fn test_stack_size_clamped() {
        let config = RuntimeConfig::default().with_stack_size(1);
        assert_eq!(config.effective_stack_size(), MIN_STACK_SIZE);
    }
}
