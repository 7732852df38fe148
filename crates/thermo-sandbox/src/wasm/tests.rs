//! Tests for the wasm host bridge.

use super::*;
use crate::capabilities::{Capabilities, HostRejection};
use crate::error::{InstantiationError, LoadError, SandboxError};
use crate::outcome::{RunOutcome, TerminationCause, TrapReason};

use std::sync::Arc;
use thermo_core::{ActuatorSpec, SharedProcessState, ShutdownSignal, ThreadScheduler};

fn bridge() -> HostBridge {
    HostBridge::new(SandboxConfig::minimal().optimize(0)).unwrap()
}

fn capabilities(actuator: ActuatorSpec) -> Capabilities {
    Capabilities::new(
        Arc::new(SharedProcessState::new(25.0, 0.0)),
        actuator,
        Arc::new(ThreadScheduler::new()),
        ShutdownSignal::new(),
    )
}

/// Load, instantiate, bind and run one WAT module.
fn run_wat(bridge: &HostBridge, caps: &Capabilities, source: &str) -> RunOutcome {
    let image = wat::parse_str(source).unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    instance
        .bind_capabilities(&CapabilityTable::new(caps.clone()))
        .unwrap();
    let outcome = instance.run().unwrap();
    instance.teardown();
    outcome
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_sandbox_config_default() {
    let config = SandboxConfig::default();
    assert_eq!(config.budgets.memory_bytes, 64 * 1024);
    assert_eq!(config.memory_ceiling, 16 * 1024 * 1024);
    assert_eq!(config.entry_point, "main");
    assert_eq!(config.optimization_level, 2);
}

#[test]
fn test_sandbox_config_presets() {
    let minimal = SandboxConfig::minimal();
    assert_eq!(minimal.budgets.memory_bytes, WASM_PAGE_SIZE);
    assert!(minimal.fuel_per_slice < SandboxConfig::default().fuel_per_slice);

    let dev = SandboxConfig::development();
    assert_eq!(dev.optimization_level, 0);
    assert!(dev.budgets.memory_bytes > minimal.budgets.memory_bytes);
}

#[test]
fn test_sandbox_config_builder() {
    let config = SandboxConfig::default()
        .memory_budget(128 * 1024)
        .stack_budget(32 * 1024)
        .fuel_per_slice(0)
        .entry_point("run")
        .optimize(9);

    assert_eq!(config.budgets.memory_bytes, 128 * 1024);
    assert_eq!(config.budgets.stack_bytes, 32 * 1024);
    assert_eq!(config.fuel_per_slice, 1);
    assert_eq!(config.entry_point, "run");
    assert_eq!(config.optimization_level, 2);
}

#[test]
fn test_bridge_rejects_budget_above_ceiling() {
    let config = SandboxConfig::default()
        .memory_ceiling(64 * 1024)
        .memory_budget(128 * 1024);
    assert!(matches!(HostBridge::new(config), Err(SandboxError::Config(_))));
}

// ============================================================================
// Load
// ============================================================================

#[test]
fn test_load_rejects_bad_magic() {
    let bridge = bridge();
    assert_eq!(bridge.load(b"not a module").unwrap_err(), LoadError::BadMagic);
    assert_eq!(bridge.load(b"\0as").unwrap_err(), LoadError::BadMagic);
}

#[test]
fn test_load_rejects_version() {
    let bridge = bridge();
    let image = [0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00];
    assert_eq!(
        bridge.load(&image).unwrap_err(),
        LoadError::UnsupportedVersion(2)
    );
}

#[test]
fn test_load_rejects_oversized_image() {
    let bridge = HostBridge::new(SandboxConfig {
        max_image_bytes: 16,
        ..SandboxConfig::minimal()
    })
    .unwrap();
    let image = vec![0u8; 17];
    assert!(matches!(
        bridge.load(&image),
        Err(LoadError::TooLarge { size: 17, max: 16 })
    ));
}

#[test]
fn test_load_rejects_truncated_module() {
    let bridge = bridge();
    let mut image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    image.truncate(image.len() - 2);
    assert!(matches!(bridge.load(&image), Err(LoadError::Invalid(_))));
}

#[test]
fn test_load_requires_entry_point() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (func (export "start")))"#).unwrap();
    assert_eq!(
        bridge.load(&image).unwrap_err(),
        LoadError::MissingEntryPoint("main".to_string())
    );

    let image = wat::parse_str(r#"(module (func (export "main") (param i32)))"#).unwrap();
    assert!(matches!(
        bridge.load(&image),
        Err(LoadError::EntryPointSignature { .. })
    ));
}

#[test]
fn test_load_reports_module_shape() {
    let bridge = bridge();
    let image = wat::parse_str(
        r#"(module
            (import "env" "get_sensor" (func (result f32)))
            (func (export "main") (result i32) (i32.const 0)))"#,
    )
    .unwrap();
    let module = bridge.load_named("probe", &image).unwrap();

    assert_eq!(module.name(), "probe");
    assert_eq!(module.stage(), Stage::Loaded);
    assert!(module.returns_exit_code());
    assert_eq!(module.imports(), vec!["env.get_sensor".to_string()]);
    assert_eq!(module.exports().collect::<Vec<_>>(), vec!["main"]);
    assert_eq!(bridge.live_instances(), 0);
}

// ============================================================================
// Instantiate and bind
// ============================================================================

#[test]
fn test_unknown_import_rejected() {
    let bridge = bridge();
    let image = wat::parse_str(
        r#"(module
            (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
            (func (export "main")))"#,
    )
    .unwrap();
    let module = bridge.load(&image).unwrap();
    let err = bridge
        .instantiate(&module, bridge.config().budgets)
        .unwrap_err();
    assert_eq!(
        err,
        InstantiationError::UnknownImport {
            module: "wasi_snapshot_preview1".to_string(),
            name: "fd_write".to_string(),
        }
    );
    assert_eq!(bridge.live_instances(), 0);
}

#[test]
fn test_signature_mismatch_rejected_before_run() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let image = wat::parse_str(
        r#"(module
            (import "env" "set_actuator" (func $set (param i32)))
            (func (export "main") (call $set (i32.const 1))))"#,
    )
    .unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();

    let err = instance
        .bind_capabilities(&CapabilityTable::new(caps.clone()))
        .unwrap_err();
    assert!(matches!(
        err,
        SandboxError::Instantiation(InstantiationError::SignatureMismatch { .. })
    ));
    assert_eq!(caps.state().read_actuator(), 0.0);
    assert!(matches!(instance.run(), Err(SandboxError::InvalidStage { .. })));
}

#[test]
fn test_binary_actuator_binds_integer_signature() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::binary());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "set_actuator" (func $set (param i32)))
            (func (export "main") (call $set (i32.const 7))))"#,
    );
    assert_eq!(outcome, RunOutcome::Completed { exit_code: None });
    assert_eq!(caps.state().read_actuator(), 1.0);
}

#[test]
fn test_memory_budget_enforced() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (memory (export "memory") 2) (func (export "main")))"#)
        .unwrap();
    let module = bridge.load(&image).unwrap();

    let err = bridge
        .instantiate(&module, bridge.config().budgets)
        .unwrap_err();
    assert_eq!(
        err,
        InstantiationError::MemoryBudget {
            requested: 2 * WASM_PAGE_SIZE,
            budget: WASM_PAGE_SIZE,
        }
    );

    let granted = Budgets {
        memory_bytes: 2 * WASM_PAGE_SIZE,
        ..bridge.config().budgets
    };
    assert!(bridge.instantiate(&module, granted).is_ok());
}

#[test]
fn test_unexported_memory_checked_at_instantiate() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (memory 8) (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();

    assert_eq!(
        bridge
            .instantiate(&module, bridge.config().budgets)
            .unwrap_err(),
        InstantiationError::MemoryBudget {
            requested: 8 * WASM_PAGE_SIZE,
            budget: WASM_PAGE_SIZE,
        }
    );
    assert_eq!(bridge.live_instances(), 0);
}

#[test]
fn test_insufficient_memory() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();
    let budgets = Budgets {
        memory_bytes: bridge.config().memory_ceiling + 1,
        ..bridge.config().budgets
    };
    assert!(matches!(
        bridge.instantiate(&module, budgets),
        Err(InstantiationError::InsufficientMemory { .. })
    ));
}

#[test]
fn test_stack_budget_must_match_engine() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();
    let budgets = Budgets {
        stack_bytes: bridge.config().budgets.stack_bytes * 2,
        ..bridge.config().budgets
    };
    assert!(matches!(
        bridge.instantiate(&module, budgets),
        Err(InstantiationError::StackBudget { .. })
    ));

    let zero = Budgets {
        stack_bytes: 0,
        ..bridge.config().budgets
    };
    assert!(matches!(
        bridge.instantiate(&module, zero),
        Err(InstantiationError::StackBudget { requested: 0, .. })
    ));

    // Smaller than the engine stack would not be enforced
    let smaller = Budgets {
        stack_bytes: 2048,
        ..bridge.config().budgets
    };
    assert_eq!(
        bridge.instantiate(&module, smaller).err(),
        Some(InstantiationError::StackBudget {
            requested: 2048,
            limit: bridge.config().budgets.stack_bytes,
        })
    );
}

#[test]
fn test_zero_stack_bridge_rejected() {
    let result = HostBridge::new(SandboxConfig::minimal().stack_budget(0));
    assert!(matches!(result, Err(SandboxError::Config(_))));
}

// ============================================================================
// Run outcomes
// ============================================================================

#[test]
fn test_completed_with_exit_code() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module (func (export "main") (result i32) (i32.const 3)))"#,
    );
    assert_eq!(outcome, RunOutcome::Completed { exit_code: Some(3) });
    assert!(!outcome.is_fault());
}

#[test]
fn test_memory_growth_past_budget_fails_softly() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (memory (export "memory") 1)
            (func (export "main") (result i32) (memory.grow (i32.const 4))))"#,
    );
    assert_eq!(outcome, RunOutcome::Completed { exit_code: Some(-1) });
}

#[test]
fn test_out_of_bounds_access_traps() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (memory (export "memory") 1)
            (func (export "main") (drop (i32.load (i32.const 70000)))))"#,
    );
    assert_eq!(outcome, RunOutcome::Trapped(TrapReason::MemoryAccess));
}

#[test]
fn test_unbounded_recursion_traps() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (func $recurse (param i32) (result i32)
                (call $recurse (i32.add (local.get 0) (i32.const 1))))
            (func (export "main") (drop (call $recurse (i32.const 0)))))"#,
    );
    assert_eq!(outcome, RunOutcome::Trapped(TrapReason::StackOverflow));
}

const BOUNDED_RECURSION: &str = r#"(module
    (func $r (param i32)
        (if (i32.gt_s (local.get 0) (i32.const 0))
            (then (call $r (i32.sub (local.get 0) (i32.const 1))))))
    (func (export "main") (call $r (i32.const 100))))"#;

#[test]
fn test_stack_budget_bounds_recursion_depth() {
    let caps = capabilities(ActuatorSpec::proportional());

    let tight = HostBridge::new(SandboxConfig::minimal().stack_budget(1024).optimize(0)).unwrap();
    assert_eq!(
        run_wat(&tight, &caps, BOUNDED_RECURSION),
        RunOutcome::Trapped(TrapReason::StackOverflow)
    );

    let roomy =
        HostBridge::new(SandboxConfig::minimal().stack_budget(256 * 1024).optimize(0)).unwrap();
    assert_eq!(
        run_wat(&roomy, &caps, BOUNDED_RECURSION),
        RunOutcome::Completed { exit_code: None }
    );
}

#[test]
fn test_busy_loop_exhausts_fuel() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module (func (export "main") (loop $spin (br $spin))))"#,
    );
    assert_eq!(outcome, RunOutcome::Trapped(TrapReason::FuelExhausted));
}

#[test]
fn test_division_by_zero_traps() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module (func (export "main") (result i32) (i32.div_s (i32.const 1) (i32.const 0))))"#,
    );
    assert_eq!(outcome, RunOutcome::Trapped(TrapReason::Arithmetic));
}

#[test]
fn test_unreachable_is_abort() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(&bridge, &caps, r#"(module (func (export "main") unreachable))"#);
    assert_eq!(outcome, RunOutcome::Terminated(TerminationCause::Abort));
    assert!(outcome.is_fault());
}

#[test]
fn test_start_function_runs_inside_run() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let image = wat::parse_str(
        r#"(module
            (func $init unreachable)
            (start $init)
            (func (export "main")))"#,
    )
    .unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    instance
        .bind_capabilities(&CapabilityTable::new(caps))
        .unwrap();
    assert_eq!(instance.stage(), Stage::Instantiated);

    let outcome = instance.run().unwrap();
    assert_eq!(outcome, RunOutcome::Terminated(TerminationCause::Abort));
    assert_eq!(instance.stage(), Stage::Terminated);
}

#[test]
fn test_capabilities_round_trip_through_sandbox() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    caps.state().write_sensor(47.5).unwrap();

    // Heater on full when below 49, then report the temperature as exit code
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "get_sensor" (func $get (result f32)))
            (import "env" "set_actuator" (func $set (param f32)))
            (func (export "main") (result i32)
                (if (f32.lt (call $get) (f32.const 49))
                    (then (call $set (f32.const 1.0))))
                (i32.trunc_f32_s (call $get))))"#,
    );
    assert_eq!(outcome, RunOutcome::Completed { exit_code: Some(47) });
    assert_eq!(caps.state().read_actuator(), 1.0);
}

#[test]
fn test_set_actuator_clamped_in_sandbox() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "set_actuator" (func $set (param f32)))
            (func (export "main") (call $set (f32.const 250.0))))"#,
    );
    assert_eq!(caps.state().read_actuator(), 1.0);

    run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "set_actuator" (func $set (param f32)))
            (func (export "main") (call $set (f32.const -3.0))))"#,
    );
    assert_eq!(caps.state().read_actuator(), 0.0);
}

#[test]
fn test_log_reads_linear_memory() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "heater on")
            (func (export "main") (call $log (i32.const 16) (i32.const 9))))"#,
    );
    assert_eq!(outcome, RunOutcome::Completed { exit_code: None });
}

#[test]
fn test_log_out_of_bounds_rejected() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "main") (call $log (i32.const 65530) (i32.const 100))))"#,
    );
    assert_eq!(
        outcome,
        RunOutcome::HostRejected(HostRejection::OutOfBounds {
            ptr: 65530,
            len: 100
        })
    );
}

#[test]
fn test_log_without_memory_rejected() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "log" (func $log (param i32 i32)))
            (func (export "main") (call $log (i32.const 0) (i32.const 4))))"#,
    );
    assert_eq!(outcome, RunOutcome::HostRejected(HostRejection::NoMemory));
}

#[test]
fn test_negative_sleep_rejected_in_sandbox() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "sleep" (func $sleep (param i32)))
            (func (export "main") (call $sleep (i32.const -1))))"#,
    );
    assert_eq!(outcome, RunOutcome::HostRejected(HostRejection::NegativeSleep(-1)));
}

#[test]
fn test_shutdown_before_call_terminates() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    caps.shutdown().trigger();
    let outcome = run_wat(
        &bridge,
        &caps,
        r#"(module
            (import "env" "get_sensor" (func $get (result f32)))
            (func (export "main") (drop (call $get))))"#,
    );
    assert_eq!(outcome, RunOutcome::Terminated(TerminationCause::Shutdown));
    assert!(outcome.is_shutdown());
    assert!(!outcome.is_fault());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_run_twice_is_invalid() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    instance
        .bind_capabilities(&CapabilityTable::new(caps))
        .unwrap();

    assert!(instance.run().is_ok());
    assert_eq!(instance.stage(), Stage::Completed);
    assert!(matches!(
        instance.run(),
        Err(SandboxError::InvalidStage {
            operation: "run",
            stage: Stage::Completed
        })
    ));
}

#[test]
fn test_run_without_bind_is_invalid() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    assert!(matches!(instance.run(), Err(SandboxError::InvalidStage { .. })));
}

#[test]
fn test_teardown_idempotent() {
    let bridge = bridge();
    let image = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
    let module = bridge.load(&image).unwrap();

    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    assert_eq!(bridge.live_instances(), 1);
    instance.teardown();
    instance.teardown();
    assert_eq!(instance.stage(), Stage::TornDown);
    assert_eq!(bridge.live_instances(), 0);

    drop(instance);
    assert_eq!(bridge.live_instances(), 0);

    let instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    assert_eq!(bridge.live_instances(), 1);
    drop(instance);
    assert_eq!(bridge.live_instances(), 0);
}

#[test]
fn test_run_stats_count_calls() {
    let bridge = bridge();
    let caps = capabilities(ActuatorSpec::proportional());
    let image = wat::parse_str(
        r#"(module
            (import "env" "get_sensor" (func $get (result f32)))
            (import "env" "set_actuator" (func $set (param f32)))
            (func (export "main")
                (drop (call $get))
                (drop (call $get))
                (call $set (f32.const 0.5))))"#,
    )
    .unwrap();
    let module = bridge.load(&image).unwrap();
    let mut instance = bridge.instantiate(&module, bridge.config().budgets).unwrap();
    instance
        .bind_capabilities(&CapabilityTable::new(caps))
        .unwrap();
    instance.run().unwrap();

    let stats = instance.stats();
    assert_eq!(stats.capability_calls.sensor_reads, 2);
    assert_eq!(stats.capability_calls.actuator_writes, 1);
    assert_eq!(stats.capability_calls.total(), 3);
    assert!(stats.fuel_remaining.is_some());
}
