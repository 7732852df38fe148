//! # Thermo Sandbox
//!
//! Runs an untrusted thermal control policy inside a WebAssembly sandbox.
//!
//! The policy sees four capabilities and nothing else:
//!
//! | Import | Signature | Effect |
//! |--------|-----------|--------|
//! | `env.get_sensor` | `() -> f32` | Latest plant temperature |
//! | `env.set_actuator` | `(f32)` or `(i32)` | Clamped, quantized heater command |
//! | `env.sleep` | `(i32)` | Suspend for milliseconds, interruptible by shutdown |
//! | `env.log` | `(i32 ptr, i32 len)` | UTF-8 message forwarded to host logging |
//!
//! A run moves through `load → instantiate → bind → run → teardown` and ends
//! in exactly one [`RunOutcome`]. The [`Supervisor`] repeats runs on a
//! dedicated thread and applies the actuator [`FaultPolicy`](thermo_core::FaultPolicy)
//! after a faulted run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use thermo_sandbox::{Capabilities, FileImageSource, HostBridge, SandboxConfig, Supervisor, SupervisorConfig};
//!
//! let bridge = HostBridge::new(SandboxConfig::from(&config.sandbox))?;
//! let source = FileImageSource::new("controller.wasm", bridge.config().max_image_bytes);
//! let supervisor = Supervisor::new(bridge, Box::new(source), capabilities, SupervisorConfig::from_node_config(&config));
//! let handle = supervisor.spawn()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod capabilities;
pub mod error;
pub mod image;
pub mod outcome;
pub mod supervisor;
pub mod wasm;

// Re-export main types
pub use capabilities::{
    Capabilities, CapabilityFault, CapabilityStats, HostRejection, POLICY_LOG_TARGET,
};
pub use error::{ImageSourceError, InstantiationError, LoadError, Result, SandboxError};
pub use image::{FileImageSource, ImageSource, MemoryImageSource};
pub use outcome::{RunOutcome, TerminationCause, TrapReason};
pub use supervisor::{Attempt, Supervisor, SupervisorConfig, SupervisorStats};
pub use wasm::{
    Budgets, CapabilitySignature, CapabilityTable, HostBridge, ModuleHandle, RunStats,
    SandboxConfig, SandboxInstance, Stage,
};
