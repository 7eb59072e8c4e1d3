//! Executor configuration.
//!
//! The core itself is configuration-free; this type is what an embedding
//! scheduler validates before sizing its pool, workers, and fiber stacks.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stack;

/// Default usable fiber stack size (256 KiB).
///
/// Large enough for recursive-descent workloads, small enough that a few
/// thousand suspended fibers stay affordable.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;

/// Default task pool capacity. Must stay a power of two.
pub const DEFAULT_TASK_POOL_CAPACITY: usize = 4096;

/// Validated knobs for an executor built on this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Worker threads multiplexing the fiber population.
    pub worker_count: usize,
    /// Usable bytes per fiber stack.
    pub fiber_stack_size: usize,
    /// Task pool slot count; must be a power of two.
    pub task_pool_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            task_pool_capacity: DEFAULT_TASK_POOL_CAPACITY,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("worker count must be nonzero")]
    NoWorkers,
    #[error("fiber stack size {requested} is below the platform minimum {minimum}")]
    StackTooSmall { requested: usize, minimum: usize },
    #[error("task pool capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),
}

impl ExecutorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_fiber_stack_size(mut self, fiber_stack_size: usize) -> Self {
        self.fiber_stack_size = fiber_stack_size;
        self
    }

    pub fn with_task_pool_capacity(mut self, task_pool_capacity: usize) -> Self {
        self.task_pool_capacity = task_pool_capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let minimum = stack::min_stack_size();
        if self.fiber_stack_size < minimum {
            return Err(ConfigError::StackTooSmall {
                requested: self.fiber_stack_size,
                minimum,
            });
        }
        if !self.task_pool_capacity.is_power_of_two() {
            return Err(ConfigError::CapacityNotPowerOfTwo(self.task_pool_capacity));
        }
        Ok(())
    }

    /// Reads overrides from `STRAND_WORKER_COUNT`, `STRAND_FIBER_STACK_SIZE`
    /// and `STRAND_TASK_POOL_CAPACITY`; unparsable values fall back to the
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_usize("STRAND_WORKER_COUNT") {
            config.worker_count = value;
        }
        if let Some(value) = env_usize("STRAND_FIBER_STACK_SIZE") {
            config.fiber_stack_size = value;
        }
        if let Some(value) = env_usize("STRAND_TASK_POOL_CAPACITY") {
            config.task_pool_capacity = value;
        }
        debug!(?config, "resolved executor configuration");
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}
