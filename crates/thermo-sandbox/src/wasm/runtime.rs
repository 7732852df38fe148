//! Host bridge implementation using wasmtime.
//!
//! One run walks a fixed path and never goes back:
//!
//! ```text
//! Unloaded → Loaded → Instantiated → Running → {Completed | Trapped | Terminated | HostRejected} → TornDown
//! ```
//!
//! `load` and `instantiate` only inspect the module. No module code runs
//! until `run`, which creates the wasm instance from a pre-linked template,
//! so a start function cannot execute before the run is observed.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use wasmtime::{
    Config, Engine, ExternType, InstancePre, Linker, Module, OptLevel, Store, StoreLimits,
    StoreLimitsBuilder, ValType,
};

use super::config::{Budgets, SandboxConfig, WASM_PAGE_SIZE};
use super::host_functions::{check_import_name, describe_func_type, CapabilityTable};
use crate::capabilities::{Capabilities, CapabilityStats};
use crate::error::{InstantiationError, LoadError, Result, SandboxError};
use crate::outcome::{RunOutcome, TerminationCause};

/// Store data for one sandbox instance.
pub struct HostState {
    pub(crate) capabilities: Option<Capabilities>,
    pub(crate) fuel_per_slice: u64,
    limits: StoreLimits,
}

/// Position of an instance in the run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No image yet
    Unloaded,
    /// Image validated and compiled
    Loaded,
    /// Budgets reserved, imports checked
    Instantiated,
    /// Entry point executing
    Running,
    /// Entry point returned
    Completed,
    /// Fault contained at the boundary
    Trapped,
    /// Module abort or shutdown
    Terminated,
    /// Capability misuse
    HostRejected,
    /// Sandbox memory released
    TornDown,
}

impl Stage {
    fn after(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed { .. } => Stage::Completed,
            RunOutcome::Trapped(_) => Stage::Trapped,
            RunOutcome::Terminated(_) => Stage::Terminated,
            RunOutcome::HostRejected(_) => Stage::HostRejected,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Unloaded => "unloaded",
            Stage::Loaded => "loaded",
            Stage::Instantiated => "instantiated",
            Stage::Running => "running",
            Stage::Completed => "completed",
            Stage::Trapped => "trapped",
            Stage::Terminated => "terminated",
            Stage::HostRejected => "host-rejected",
            Stage::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// How the entry point reports completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// `() -> ()`
    Unit,
    /// `() -> i32`
    ExitCode,
}

/// Loads, instantiates and runs policy modules.
pub struct HostBridge {
    engine: Engine,
    config: SandboxConfig,
    live: Arc<AtomicUsize>,
}

/// A validated, compiled module image.
#[derive(Clone)]
pub struct ModuleHandle {
    module: Module,
    name: String,
    image_hash: u64,
    entry: EntryKind,
}

/// Timing and call statistics of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Wall time spent inside `run`
    pub execution_time_us: u64,
    /// Capability calls made by the module
    pub capability_calls: CapabilityStats,
    /// Fuel left in the last slice
    pub fuel_remaining: Option<u64>,
}

/// One isolated execution context. Created per run, torn down exactly once.
pub struct SandboxInstance {
    name: String,
    module: Module,
    entry: EntryKind,
    entry_point: String,
    budgets: Budgets,
    store: Option<Store<HostState>>,
    pre: Option<InstancePre<HostState>>,
    stage: Stage,
    stats: RunStats,
    live: Arc<AtomicUsize>,
}

impl HostBridge {
    /// Create a bridge with the given configuration.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });

        // Runaway loops between capability calls end as traps
        engine_config.consume_fuel(true);

        // Engine-wide; every instance runs with exactly this stack
        if config.budgets.stack_bytes == 0 {
            return Err(SandboxError::Config("stack budget must be non-zero".to_string()));
        }
        engine_config.max_wasm_stack(config.budgets.stack_bytes);

        // Policy modules are plain wasm32 MVP-style code
        engine_config.wasm_threads(false);
        engine_config.wasm_memory64(false);

        if config.budgets.memory_bytes > config.memory_ceiling {
            return Err(SandboxError::Config(format!(
                "memory budget {} exceeds ceiling {}",
                config.budgets.memory_bytes, config.memory_ceiling
            )));
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| SandboxError::Engine(format!("{:#}", e)))?;

        Ok(Self {
            engine,
            config,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Instances created and not yet torn down
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Validate and compile a module image. Runs nothing.
    pub fn load(&self, image: &[u8]) -> std::result::Result<ModuleHandle, LoadError> {
        self.load_named("module", image)
    }

    /// Like [`load`](Self::load), with a name used in logs.
    pub fn load_named(
        &self,
        name: &str,
        image: &[u8],
    ) -> std::result::Result<ModuleHandle, LoadError> {
        if image.len() > self.config.max_image_bytes {
            return Err(LoadError::TooLarge {
                size: image.len(),
                max: self.config.max_image_bytes,
            });
        }
        if image.len() < 8 || &image[0..4] != b"\0asm" {
            return Err(LoadError::BadMagic);
        }
        let version = u32::from_le_bytes([image[4], image[5], image[6], image[7]]);
        if version != 1 {
            return Err(LoadError::UnsupportedVersion(version));
        }

        let module = Module::new(&self.engine, image)
            .map_err(|e| LoadError::Invalid(format!("{:#}", e)))?;

        let entry_point = &self.config.entry_point;
        let entry = match module.get_export(entry_point) {
            Some(ExternType::Func(ty)) => {
                let results: Vec<ValType> = ty.results().collect();
                match (ty.params().len(), results.as_slice()) {
                    (0, []) => EntryKind::Unit,
                    (0, [ValType::I32]) => EntryKind::ExitCode,
                    _ => {
                        return Err(LoadError::EntryPointSignature {
                            name: entry_point.clone(),
                            found: describe_func_type(&ty),
                        })
                    }
                }
            }
            _ => return Err(LoadError::MissingEntryPoint(entry_point.clone())),
        };

        let image_hash = image_hash(image);
        tracing::debug!(
            module = name,
            bytes = image.len(),
            hash = %format!("{:016x}", image_hash),
            "module loaded"
        );

        Ok(ModuleHandle {
            module,
            name: name.to_string(),
            image_hash,
            entry,
        })
    }

    /// Reserve budgets and check imports. Runs nothing.
    pub fn instantiate(
        &self,
        handle: &ModuleHandle,
        budgets: Budgets,
    ) -> std::result::Result<SandboxInstance, InstantiationError> {
        if budgets.memory_bytes > self.config.memory_ceiling {
            return Err(InstantiationError::InsufficientMemory {
                budget: budgets.memory_bytes,
                ceiling: self.config.memory_ceiling,
            });
        }
        if budgets.stack_bytes != self.config.budgets.stack_bytes {
            return Err(InstantiationError::StackBudget {
                requested: budgets.stack_bytes,
                limit: self.config.budgets.stack_bytes,
            });
        }

        for import in handle.module.imports() {
            check_import_name(&import)?;
        }

        let resources = handle.module.resources_required();
        if resources.num_memories > 1 {
            return Err(InstantiationError::TooManyResources(format!(
                "{} memories",
                resources.num_memories
            )));
        }
        if resources.num_tables > 1 {
            return Err(InstantiationError::TooManyResources(format!(
                "{} tables",
                resources.num_tables
            )));
        }

        // Covers hidden memories too; imports are already restricted to `env` functions
        if let Some(pages) = resources.max_initial_memory_size {
            let requested = pages.saturating_mul(WASM_PAGE_SIZE);
            if requested > budgets.memory_bytes {
                return Err(InstantiationError::MemoryBudget {
                    requested,
                    budget: budgets.memory_bytes,
                });
            }
        }

        let memory_limit = usize::try_from(budgets.memory_bytes).unwrap_or(usize::MAX);
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit)
            .memories(1)
            .tables(1)
            .instances(1)
            .build();

        let mut store = Store::new(
            &self.engine,
            HostState {
                capabilities: None,
                fuel_per_slice: self.config.fuel_per_slice,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);

        self.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            module = %handle.name,
            memory = budgets.memory_bytes,
            stack = budgets.stack_bytes,
            "sandbox instantiated"
        );

        Ok(SandboxInstance {
            name: handle.name.clone(),
            module: handle.module.clone(),
            entry: handle.entry,
            entry_point: self.config.entry_point.clone(),
            budgets,
            store: Some(store),
            pre: None,
            stage: Stage::Instantiated,
            stats: RunStats::default(),
            live: self.live.clone(),
        })
    }
}

impl fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBridge")
            .field("config", &self.config)
            .field("live_instances", &self.live_instances())
            .finish()
    }
}

impl ModuleHandle {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the image bytes this module was compiled from
    pub fn image_hash(&self) -> u64 {
        self.image_hash
    }

    /// Always [`Stage::Loaded`]
    pub fn stage(&self) -> Stage {
        Stage::Loaded
    }

    /// Whether the entry point returns an exit code
    pub fn returns_exit_code(&self) -> bool {
        self.entry == EntryKind::ExitCode
    }

    /// `module.name` of every import
    pub fn imports(&self) -> Vec<String> {
        self.module
            .imports()
            .map(|i| format!("{}.{}", i.module(), i.name()))
            .collect()
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("image_hash", &format_args!("{:016x}", self.image_hash))
            .field("entry", &self.entry)
            .finish()
    }
}

impl SandboxInstance {
    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Budgets granted to this instance
    pub fn budgets(&self) -> Budgets {
        self.budgets
    }

    /// Statistics of the completed run
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Install the capability table.
    ///
    /// Every import is checked against the table's signatures; a mismatch
    /// fails here, before any module code runs.
    pub fn bind_capabilities(&mut self, table: &CapabilityTable) -> Result<()> {
        if self.stage != Stage::Instantiated || self.pre.is_some() {
            return Err(SandboxError::InvalidStage {
                operation: "bind_capabilities",
                stage: self.stage,
            });
        }
        let store = self.store.as_mut().ok_or(SandboxError::InvalidStage {
            operation: "bind_capabilities",
            stage: Stage::TornDown,
        })?;

        for import in self.module.imports() {
            table.check_import(&import)?;
        }

        let mut linker: Linker<HostState> = Linker::new(store.engine());
        table.register(&mut linker)?;

        let pre = linker
            .instantiate_pre(&self.module)
            .map_err(|e| InstantiationError::Link(format!("{:#}", e)))?;

        let capabilities = table
            .capabilities()
            .clone()
            .with_module_name(&self.name);
        store.data_mut().capabilities = Some(capabilities);
        self.pre = Some(pre);
        Ok(())
    }

    /// Invoke the entry point and classify how it ended.
    ///
    /// Faults inside the module come back as the returned outcome; an `Err`
    /// only means the instance was not ready to run.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let (Some(store), Some(pre)) = (self.store.as_mut(), self.pre.as_ref()) else {
            return Err(SandboxError::InvalidStage {
                operation: "run",
                stage: self.stage,
            });
        };
        if self.stage != Stage::Instantiated {
            return Err(SandboxError::InvalidStage {
                operation: "run",
                stage: self.stage,
            });
        }

        self.stage = Stage::Running;
        if let Some(caps) = &store.data().capabilities {
            caps.reset_stats();
        }
        let slice = store.data().fuel_per_slice;
        let start = Instant::now();

        let result = store.set_fuel(slice).and_then(|()| {
            let instance = pre.instantiate(&mut *store)?;
            match self.entry {
                EntryKind::Unit => {
                    let main = instance.get_typed_func::<(), ()>(&mut *store, &self.entry_point)?;
                    main.call(&mut *store, ())?;
                    Ok(None)
                }
                EntryKind::ExitCode => {
                    let main = instance.get_typed_func::<(), i32>(&mut *store, &self.entry_point)?;
                    Ok(Some(main.call(&mut *store, ())?))
                }
            }
        });

        let outcome = match result {
            Ok(exit_code) => RunOutcome::Completed { exit_code },
            Err(e) => RunOutcome::from_error(&e),
        };

        self.stats = RunStats {
            execution_time_us: start.elapsed().as_micros() as u64,
            capability_calls: store
                .data()
                .capabilities
                .as_ref()
                .map(|c| c.stats())
                .unwrap_or_default(),
            fuel_remaining: store.get_fuel().ok(),
        };
        self.stage = Stage::after(&outcome);

        match &outcome {
            RunOutcome::Completed { .. } => tracing::warn!(
                module = %self.name,
                %outcome,
                "policy entry point returned"
            ),
            RunOutcome::Terminated(TerminationCause::Shutdown) => tracing::info!(
                module = %self.name,
                "policy stopped for shutdown"
            ),
            _ => tracing::error!(
                module = %self.name,
                %outcome,
                calls = self.stats.capability_calls.total(),
                "policy run faulted"
            ),
        }

        Ok(outcome)
    }

    /// Release the sandbox. Idempotent; also runs on drop.
    pub fn teardown(&mut self) {
        if self.stage == Stage::TornDown {
            return;
        }
        self.pre = None;
        self.store = None;
        self.stage = Stage::TornDown;
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(module = %self.name, "sandbox torn down");
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("name", &self.name)
            .field("stage", &self.stage)
            .field("budgets", &self.budgets)
            .finish()
    }
}

pub(crate) fn image_hash(image: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    image.hash(&mut hasher);
    hasher.finish()
}
