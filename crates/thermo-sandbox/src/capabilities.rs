//! The four host capabilities, independent of the wasm runtime.
//!
//! [`Capabilities`] is the host side of `get_sensor`, `set_actuator`,
//! `sleep` and `log`. It closes over the shared process state, the scheduler
//! and the shutdown signal, so every capability can be exercised directly in
//! tests without a sandbox. The wasm layer only marshals arguments.
//!
//! Every call checks the shutdown signal before doing any work. A call made
//! after shutdown fails with [`CapabilityFault::Shutdown`], which unwinds the
//! module to the sandbox boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thermo_core::{ActuatorSpec, Scheduler, SharedProcessState, ShutdownSignal, SleepOutcome};
use thiserror::Error;

/// Log target for messages emitted by the policy module
pub const POLICY_LOG_TARGET: &str = "thermo::policy";

/// A capability call the host refused to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRejection {
    /// `sleep` with a negative duration
    NegativeSleep(i32),
    /// `log` pointing outside linear memory
    OutOfBounds {
        /// Guest pointer
        ptr: i32,
        /// Guest length
        len: i32,
    },
    /// `log` from a module that exports no memory
    NoMemory,
    /// Capability invoked before being bound
    Unbound(&'static str),
}

impl fmt::Display for HostRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRejection::NegativeSleep(ms) => write!(f, "negative sleep duration {} ms", ms),
            HostRejection::OutOfBounds { ptr, len } => {
                write!(f, "buffer {}+{} outside linear memory", ptr, len)
            }
            HostRejection::NoMemory => write!(f, "module exports no memory"),
            HostRejection::Unbound(name) => write!(f, "capability `{}` not bound", name),
        }
    }
}

/// Why a capability call did not return to the module.
///
/// Travels through the runtime as a typed error and is recovered by
/// downcasting when the run outcome is classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityFault {
    /// Shutdown requested; the run ends at this call
    #[error("shutdown requested")]
    Shutdown,

    /// The call itself was invalid
    #[error("capability call rejected: {0}")]
    Rejected(HostRejection),
}

/// Per-run capability call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityStats {
    /// `get_sensor` calls
    pub sensor_reads: u64,
    /// `set_actuator` calls
    pub actuator_writes: u64,
    /// `sleep` calls
    pub sleeps: u64,
    /// `log` calls
    pub logs: u64,
}

impl CapabilityStats {
    /// Total capability calls
    pub fn total(&self) -> u64 {
        self.sensor_reads + self.actuator_writes + self.sleeps + self.logs
    }
}

#[derive(Debug, Default)]
struct Counters {
    sensor_reads: AtomicU64,
    actuator_writes: AtomicU64,
    sleeps: AtomicU64,
    logs: AtomicU64,
}

/// Host side of the capability ABI. Cheap to clone.
#[derive(Clone)]
pub struct Capabilities {
    state: Arc<SharedProcessState>,
    actuator: ActuatorSpec,
    scheduler: Arc<dyn Scheduler>,
    shutdown: ShutdownSignal,
    module_name: Arc<str>,
    max_log_bytes: usize,
    counters: Arc<Counters>,
}

impl Capabilities {
    /// Bind capabilities to `state`, writing commands through `actuator`.
    pub fn new(
        state: Arc<SharedProcessState>,
        actuator: ActuatorSpec,
        scheduler: Arc<dyn Scheduler>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            state,
            actuator,
            scheduler,
            shutdown,
            module_name: Arc::from("module"),
            max_log_bytes: 256,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Name prefixed to log messages
    pub fn with_module_name(mut self, name: &str) -> Self {
        self.module_name = Arc::from(name);
        self
    }

    /// Longest log message forwarded; longer ones are truncated
    pub fn with_max_log_bytes(mut self, max: usize) -> Self {
        self.max_log_bytes = max;
        self
    }

    /// Actuator description used by `set_actuator`
    pub fn actuator(&self) -> &ActuatorSpec {
        &self.actuator
    }

    /// Shared state the capabilities operate on
    pub fn state(&self) -> &Arc<SharedProcessState> {
        &self.state
    }

    /// Shutdown signal checked by every call
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Maximum forwarded log length
    pub fn max_log_bytes(&self) -> usize {
        self.max_log_bytes
    }

    /// Call counters since creation or the last [`reset_stats`](Self::reset_stats)
    pub fn stats(&self) -> CapabilityStats {
        CapabilityStats {
            sensor_reads: self.counters.sensor_reads.load(Ordering::Relaxed),
            actuator_writes: self.counters.actuator_writes.load(Ordering::Relaxed),
            sleeps: self.counters.sleeps.load(Ordering::Relaxed),
            logs: self.counters.logs.load(Ordering::Relaxed),
        }
    }

    /// Zero the call counters
    pub fn reset_stats(&self) {
        self.counters.sensor_reads.store(0, Ordering::Relaxed);
        self.counters.actuator_writes.store(0, Ordering::Relaxed);
        self.counters.sleeps.store(0, Ordering::Relaxed);
        self.counters.logs.store(0, Ordering::Relaxed);
    }

    fn check_shutdown(&self) -> Result<(), CapabilityFault> {
        if self.shutdown.is_triggered() {
            Err(CapabilityFault::Shutdown)
        } else {
            Ok(())
        }
    }

    /// `get_sensor() -> f32`
    pub fn get_sensor(&self) -> Result<f32, CapabilityFault> {
        self.check_shutdown()?;
        self.counters.sensor_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.state.read_sensor())
    }

    /// `set_actuator(f32)`. Returns the command actually stored.
    ///
    /// The value is clamped and quantized, never rejected. If the state lock
    /// times out the previous command stays in effect.
    pub fn set_actuator(&self, requested: f32) -> Result<f32, CapabilityFault> {
        self.check_shutdown()?;
        self.counters.actuator_writes.fetch_add(1, Ordering::Relaxed);

        let command = self.actuator.apply(requested);
        match self.state.write_actuator(command, &self.actuator.range) {
            Ok(stored) => {
                if stored != requested {
                    tracing::trace!(requested, stored, "actuator command clamped");
                }
                Ok(stored)
            }
            Err(_) => Ok(self.state.read_actuator()),
        }
    }

    /// `set_actuator(i32)` for on/off deployments
    pub fn set_actuator_int(&self, requested: i32) -> Result<f32, CapabilityFault> {
        self.set_actuator(requested as f32)
    }

    /// `sleep(ms)`. Suspends only the calling thread and ends early on
    /// shutdown.
    pub fn sleep(&self, duration_ms: i32) -> Result<(), CapabilityFault> {
        self.check_shutdown()?;
        if duration_ms < 0 {
            return Err(CapabilityFault::Rejected(HostRejection::NegativeSleep(
                duration_ms,
            )));
        }
        self.counters.sleeps.fetch_add(1, Ordering::Relaxed);

        let duration = Duration::from_millis(duration_ms as u64);
        match self.scheduler.sleep(duration, &self.shutdown) {
            SleepOutcome::Elapsed => Ok(()),
            SleepOutcome::Interrupted => Err(CapabilityFault::Shutdown),
        }
    }

    /// `log(message)`. Invalid UTF-8 is replaced, overlong messages are
    /// truncated.
    pub fn log(&self, message: &[u8]) -> Result<(), CapabilityFault> {
        self.check_shutdown()?;
        self.counters.logs.fetch_add(1, Ordering::Relaxed);

        let truncated = message.len() > self.max_log_bytes;
        let bytes = &message[..message.len().min(self.max_log_bytes)];
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches(['\n', '\0']);

        tracing::info!(
            target: POLICY_LOG_TARGET,
            module = %self.module_name,
            truncated,
            "{}",
            text
        );
        Ok(())
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("module_name", &self.module_name)
            .field("actuator", &self.actuator)
            .field("max_log_bytes", &self.max_log_bytes)
            .finish()
    }
}
