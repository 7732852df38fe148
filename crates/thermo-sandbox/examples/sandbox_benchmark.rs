//! Policy sandbox benchmarks
//!
//! Run with: cargo run -p thermo-sandbox --example sandbox_benchmark --release

use std::sync::Arc;
use std::time::{Duration, Instant};

use thermo_core::{ActuatorSpec, SharedProcessState, ShutdownSignal, SteppedScheduler};
use thermo_sandbox::{Capabilities, CapabilityTable, HostBridge, SandboxConfig};

const POLICY: &str = r#"
(module
  (import "env" "get_sensor"   (func $get_sensor (result f32)))
  (import "env" "set_actuator" (func $set_actuator (param f32)))
  (import "env" "sleep"        (func $sleep (param i32)))
  (func (export "main")
    (loop $control
      (call $set_actuator
        (f32.mul (f32.sub (f32.const 50) (call $get_sensor)) (f32.const 0.1)))
      (call $sleep (i32.const 100))
      (br $control))))
"#;

fn main() {
    println!("=== Policy Sandbox Benchmarks ===\n");

    let image = wat::parse_str(POLICY).expect("failed to compile policy");

    bench_load(&image);
    bench_instantiate(&image);
    bench_control_periods(&image);

    println!("\n=== Benchmark Complete ===");
}

fn capabilities(periods: u32) -> Capabilities {
    let state = Arc::new(SharedProcessState::new(45.0, 0.0));
    let mut remaining = periods;
    Capabilities::new(
        state,
        ActuatorSpec::proportional(),
        Arc::new(SteppedScheduler::new(move |_| {
            remaining = remaining.saturating_sub(1);
            remaining > 0
        })),
        ShutdownSignal::new(),
    )
}

fn bench_load(image: &[u8]) {
    println!("## Module Load");

    let bridge = HostBridge::new(SandboxConfig::default()).expect("bridge");
    let _ = bridge.load(image).expect("warm up");

    let mut times = Vec::new();
    for _ in 0..100 {
        let start = Instant::now();
        let _ = bridge.load(image).expect("load");
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("load", &times);
    println!();
}

fn bench_instantiate(image: &[u8]) {
    println!("## Instantiate + Bind + Teardown");

    let bridge = HostBridge::new(SandboxConfig::default()).expect("bridge");
    let module = bridge.load(image).expect("load");
    let table = CapabilityTable::new(capabilities(1));

    let mut times = Vec::new();
    for _ in 0..100 {
        let start = Instant::now();
        let mut instance = bridge
            .instantiate(&module, bridge.config().budgets)
            .expect("instantiate");
        instance.bind_capabilities(&table).expect("bind");
        instance.teardown();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("instantiate", &times);
    println!("  live instances after: {}", bridge.live_instances());
    println!();
}

fn bench_control_periods(image: &[u8]) {
    println!("## Control Periods (virtual time)");

    let bridge = HostBridge::new(SandboxConfig::default()).expect("bridge");
    let module = bridge.load(image).expect("load");

    for periods in [10u32, 1_000, 100_000] {
        let mut instance = bridge
            .instantiate(&module, bridge.config().budgets)
            .expect("instantiate");
        instance
            .bind_capabilities(&CapabilityTable::new(capabilities(periods)))
            .expect("bind");

        let outcome = instance.run().expect("run");
        let stats = instance.stats().clone();
        instance.teardown();

        let per_period =
            Duration::from_micros(stats.execution_time_us) / periods;
        println!(
            "  {:>7} periods: {} in {}us ({:?}/period, {} calls)",
            periods,
            outcome,
            stats.execution_time_us,
            per_period,
            stats.capability_calls.total()
        );
    }
}

fn print_stats(name: &str, times: &[u64]) {
    if times.is_empty() {
        println!("  {}: no samples", name);
        return;
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[(sorted.len() * 99) / 100];

    println!("  {}: n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
             name, times.len(), min, mean, p50, p99, max);
}
