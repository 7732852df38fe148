//! Configuration for the policy sandbox.

use serde::{Deserialize, Serialize};
use thermo_core::config::SandboxSection;

/// Size of one wasm linear-memory page
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Resource budgets for one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    /// Linear memory the module may occupy, initial plus growth
    pub memory_bytes: u64,
    /// Wasm call-stack budget. Engine-wide, so every instance of a bridge
    /// must request exactly the bridge's value
    pub stack_bytes: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024,
            stack_bytes: 64 * 1024,
        }
    }
}

/// Configuration for the sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default budgets handed to each instance
    pub budgets: Budgets,

    /// Largest memory budget the host will grant
    pub memory_ceiling: u64,

    /// Instructions allowed between capability calls
    pub fuel_per_slice: u64,

    /// Largest accepted module image
    pub max_image_bytes: usize,

    /// Longest forwarded `log` message
    pub max_log_bytes: usize,

    /// Exported zero-argument entry point
    pub entry_point: String,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            memory_ceiling: 16 * 1024 * 1024,
            fuel_per_slice: 10_000_000,
            max_image_bytes: 1024 * 1024,
            max_log_bytes: 256,
            entry_point: "main".to_string(),
            optimization_level: 2,
        }
    }
}

impl SandboxConfig {
    /// Tight budgets for constrained targets and tests
    pub fn minimal() -> Self {
        Self {
            budgets: Budgets {
                memory_bytes: WASM_PAGE_SIZE,
                stack_bytes: 32 * 1024,
            },
            memory_ceiling: 1024 * 1024,
            fuel_per_slice: 1_000_000,
            max_image_bytes: 64 * 1024,
            ..Default::default()
        }
    }

    /// Faster compilation, generous budgets
    pub fn development() -> Self {
        Self {
            budgets: Budgets {
                memory_bytes: 1024 * 1024,
                stack_bytes: 256 * 1024,
            },
            optimization_level: 0,
            ..Default::default()
        }
    }

    /// Builder: set the memory budget
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.budgets.memory_bytes = bytes;
        self
    }

    /// Builder: set the stack budget
    pub fn stack_budget(mut self, bytes: usize) -> Self {
        self.budgets.stack_bytes = bytes;
        self
    }

    /// Builder: set the memory ceiling
    pub fn memory_ceiling(mut self, bytes: u64) -> Self {
        self.memory_ceiling = bytes;
        self
    }

    /// Builder: set fuel per slice
    pub fn fuel_per_slice(mut self, fuel: u64) -> Self {
        self.fuel_per_slice = fuel.max(1);
        self
    }

    /// Builder: set the entry point
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = name.into();
        self
    }

    /// Builder: set the maximum log message length
    pub fn max_log_bytes(mut self, bytes: usize) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Builder: set the optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }
}

impl From<&SandboxSection> for SandboxConfig {
    fn from(section: &SandboxSection) -> Self {
        Self {
            budgets: Budgets {
                memory_bytes: section.memory_budget_bytes,
                stack_bytes: section.stack_budget_bytes,
            },
            memory_ceiling: section.memory_ceiling_bytes,
            fuel_per_slice: section.fuel_per_slice.max(1),
            max_image_bytes: section.max_image_bytes,
            max_log_bytes: section.max_log_bytes,
            entry_point: section.entry_point.clone(),
            ..Default::default()
        }
    }
}
