//! Run supervisor: the controller node's sandbox task.
//!
//! Repeats read → load → instantiate → bind → run → teardown on a dedicated
//! thread with an enlarged stack until shutdown. Every failure before the
//! sandbox exists is logged and retried after a fixed backoff, never crash
//! looped. Image bytes that failed `load` are remembered by hash and not
//! loaded again until the file changes.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thermo_core::{FaultPolicy, NodeConfig};

use crate::capabilities::Capabilities;
use crate::error::{InstantiationError, LoadError, SandboxError};
use crate::image::ImageSource;
use crate::outcome::RunOutcome;
use crate::wasm::{image_hash, Budgets, CapabilityTable, HostBridge};

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Budgets for every instance
    pub budgets: Budgets,
    /// Wait between attempts
    pub retry_backoff: Duration,
    /// Start a new run when the entry point returns
    pub restart_on_completion: bool,
    /// Actuator handling after a faulted run
    pub fault_policy: FaultPolicy,
    /// Command written under [`FaultPolicy::SafeValue`]
    pub safe_value: f32,
    /// Native stack of the sandbox thread
    pub thread_stack_bytes: usize,
    /// Stop after this many attempts
    pub max_attempts: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            retry_backoff: Duration::from_secs(5),
            restart_on_completion: true,
            fault_policy: FaultPolicy::HoldLast,
            safe_value: 0.0,
            thread_stack_bytes: 8 * 1024 * 1024,
            max_attempts: None,
        }
    }
}

impl SupervisorConfig {
    /// Settings from a node configuration
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            budgets: Budgets {
                memory_bytes: config.sandbox.memory_budget_bytes,
                stack_bytes: config.sandbox.stack_budget_bytes,
            },
            retry_backoff: Duration::from_millis(config.sandbox.retry_backoff_ms),
            restart_on_completion: config.sandbox.restart_on_completion,
            fault_policy: config.actuator.fault_policy,
            safe_value: config.actuator.safe_value(),
            thread_stack_bytes: config.sandbox.thread_stack_bytes,
            max_attempts: None,
        }
    }
}

/// Result of one supervised attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    /// Module ran; how it ended
    Ran(RunOutcome),
    /// Image could not be read
    SourceFailed(String),
    /// Image rejected by `load`
    LoadRejected(LoadError),
    /// Same bytes as a previously rejected image
    SkippedRejected,
    /// Sandbox could not be created or bound
    InstantiationFailed(InstantiationError),
}

/// Counters over the supervisor's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Attempts started
    pub attempts: u64,
    /// Runs that reached the entry point
    pub runs: u64,
    /// Runs whose entry point returned
    pub completed: u64,
    /// Runs that trapped, aborted or were rejected
    pub faults: u64,
    /// Attempts that failed before a sandbox existed
    pub startup_failures: u64,
}

/// Owns the bridge and drives runs until shutdown.
pub struct Supervisor {
    bridge: HostBridge,
    source: Box<dyn ImageSource>,
    capabilities: Capabilities,
    config: SupervisorConfig,
    rejected_hash: Option<u64>,
    stats: SupervisorStats,
}

impl Supervisor {
    /// Create a supervisor
    pub fn new(
        bridge: HostBridge,
        source: Box<dyn ImageSource>,
        capabilities: Capabilities,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            bridge,
            source,
            capabilities,
            config,
            rejected_hash: None,
            stats: SupervisorStats::default(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// The bridge used for every run
    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    /// One full attempt. The sandbox is torn down before this returns.
    pub fn attempt(&mut self) -> Attempt {
        self.stats.attempts += 1;

        let image = match self.source.read() {
            Ok(image) => image,
            Err(e) => {
                self.stats.startup_failures += 1;
                tracing::error!(source = %self.source.describe(), error = %e, "cannot read module image");
                return Attempt::SourceFailed(e.to_string());
            }
        };

        let hash = image_hash(&image);
        if self.rejected_hash == Some(hash) {
            self.stats.startup_failures += 1;
            tracing::debug!("module image unchanged since it was rejected, skipping");
            return Attempt::SkippedRejected;
        }

        let name = self.source.describe();
        let handle = match self.bridge.load_named(&name, &image) {
            Ok(handle) => handle,
            Err(e) => {
                self.stats.startup_failures += 1;
                self.rejected_hash = Some(hash);
                tracing::error!(module = %name, error = %e, "module image rejected");
                return Attempt::LoadRejected(e);
            }
        };
        self.rejected_hash = None;
        drop(image);

        let mut instance = match self.bridge.instantiate(&handle, self.config.budgets) {
            Ok(instance) => instance,
            Err(e) => {
                self.stats.startup_failures += 1;
                tracing::error!(module = %name, error = %e, "instantiation failed");
                return Attempt::InstantiationFailed(e);
            }
        };

        let table = CapabilityTable::new(self.capabilities.clone());
        let outcome = instance
            .bind_capabilities(&table)
            .and_then(|()| instance.run());
        let run_stats = instance.stats().clone();
        instance.teardown();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.startup_failures += 1;
                tracing::error!(module = %name, error = %e, "capability binding failed");
                return Attempt::InstantiationFailed(match e {
                    SandboxError::Instantiation(e) => e,
                    other => InstantiationError::Link(other.to_string()),
                });
            }
        };

        self.stats.runs += 1;
        if matches!(outcome, RunOutcome::Completed { .. }) {
            self.stats.completed += 1;
        }
        if outcome.is_fault() {
            self.stats.faults += 1;
            self.apply_fault_policy();
        }

        tracing::info!(
            module = %name,
            outcome = outcome.label(),
            elapsed_us = run_stats.execution_time_us,
            calls = run_stats.capability_calls.total(),
            "run finished"
        );
        Attempt::Ran(outcome)
    }

    fn apply_fault_policy(&self) {
        let state = self.capabilities.state();
        match self.config.fault_policy {
            FaultPolicy::HoldLast => {
                tracing::info!(actuator = state.read_actuator(), "holding last actuator command");
            }
            FaultPolicy::SafeValue => {
                let range = self.capabilities.actuator().range;
                match state.write_actuator(self.config.safe_value, &range) {
                    Ok(value) => tracing::warn!(actuator = value, "actuator forced to safe value"),
                    Err(e) => tracing::error!(error = %e, "could not force safe actuator value"),
                }
            }
        }
    }

    /// Attempt runs until shutdown, completion (if not restarting) or the
    /// attempt limit.
    pub fn run(mut self) -> SupervisorStats {
        let shutdown = self.capabilities.shutdown().clone();
        tracing::info!(source = %self.source.describe(), "supervisor started");

        while !shutdown.is_triggered() {
            if let Some(max) = self.config.max_attempts {
                if self.stats.attempts >= max {
                    break;
                }
            }

            match self.attempt() {
                Attempt::Ran(outcome) if outcome.is_shutdown() => break,
                Attempt::Ran(RunOutcome::Completed { .. }) if !self.config.restart_on_completion => {
                    tracing::info!("entry point returned, not restarting");
                    break;
                }
                _ => {}
            }

            if shutdown.wait_timeout(self.config.retry_backoff) {
                break;
            }
        }

        tracing::info!(
            attempts = self.stats.attempts,
            runs = self.stats.runs,
            faults = self.stats.faults,
            "supervisor stopped"
        );
        self.stats
    }

    /// Run on a dedicated thread with the configured stack size.
    pub fn spawn(self) -> io::Result<JoinHandle<SupervisorStats>> {
        thread::Builder::new()
            .name("thermo-sandbox".to_string())
            .stack_size(self.config.thread_stack_bytes)
            .spawn(move || self.run())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("source", &self.source.describe())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
