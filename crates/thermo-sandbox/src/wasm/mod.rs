//! WebAssembly host bridge for control policies.
//!
//! Policies are wasm32 modules that import a fixed capability table from the
//! `env` namespace and export a zero-argument entry point. They run under
//! wasmtime with no WASI and no ambient authority.
//!
//! ## Security Model
//!
//! - **Memory isolation**: each run gets its own store and linear memory,
//!   capped by the memory budget
//! - **Capability-based**: the only imports are `get_sensor`, `set_actuator`,
//!   `sleep` and `log`; anything else fails instantiation
//! - **Contained faults**: traps, stack overflow and fuel exhaustion end the
//!   run, never the host
//!
//! ## Usage
//!
//! ```rust,ignore
//! use thermo_sandbox::wasm::{HostBridge, SandboxConfig, CapabilityTable};
//!
//! let bridge = HostBridge::new(SandboxConfig::default())?;
//! let module = bridge.load(&image)?;
//! let mut instance = bridge.instantiate(&module, bridge.config().budgets)?;
//! instance.bind_capabilities(&CapabilityTable::new(capabilities))?;
//! let outcome = instance.run()?;
//! instance.teardown();
//! ```

mod config;
mod host_functions;
mod runtime;

pub use config::{Budgets, SandboxConfig, WASM_PAGE_SIZE};
pub use host_functions::{
    describe_func_type, AbiType, CapabilityBinding, CapabilitySignature, CapabilityTable,
    SignatureParseError, CAPABILITY_NAMES, GET_SENSOR, IMPORT_MODULE, LOG, SET_ACTUATOR, SLEEP,
};
pub use runtime::{HostBridge, ModuleHandle, RunStats, SandboxInstance, Stage};

pub(crate) use runtime::image_hash;

#[cfg(test)]
mod tests;
