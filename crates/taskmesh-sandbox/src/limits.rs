//! Resource budgets for task execution.

use serde::{Deserialize, Serialize};

use taskmesh_core::constants::{DEFAULT_CPU_MS, DEFAULT_MAX_MEMORY_BYTES, DEFAULT_WALL_CLOCK_MS};

/// Limits applied to a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_clock_ms: u64,
    pub cpu_ms: u64,
    pub max_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_ms: DEFAULT_WALL_CLOCK_MS,
            cpu_ms: DEFAULT_CPU_MS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
        }
    }
}

impl ResourceLimits {
    /// Effective wall-clock budget. CPU time cannot exceed wall time in a
    /// single-threaded runner, so the tighter of the two bounds applies.
    pub fn effective_wall_ms(&self) -> u64 {
        self.wall_clock_ms.min(self.cpu_ms)
    }
}
