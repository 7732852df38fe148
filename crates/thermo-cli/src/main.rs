//! Thermal Control Node Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running the controller node (sandboxed policy + radio link)
//! - Running the simulated plant node
//! - Checking a policy module without running it
//! - Simulating a policy against the plant model faster than real time

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thermo_core::tasks::{spawn_task, TaskStats};
use thermo_core::{
    NodeConfig, PacketTransport, PlantTask, ReceiveTask, SharedProcessState, ShutdownSignal,
    StateSlot, SteppedScheduler, ThermalPlant, ThreadScheduler, TransmitTask, UdpTransport,
};
use thermo_sandbox::{
    Capabilities, CapabilityTable, FileImageSource, HostBridge, ImageSource, RunOutcome,
    SandboxConfig, Supervisor, SupervisorConfig,
};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "thermo")]
#[command(author, version, about = "Sandboxed thermal control node", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Deployment configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller node: policy sandbox, sensor receive, actuator transmit
    Controller {
        /// Policy module (overrides sandbox.module_path)
        #[arg(short, long)]
        module: Option<PathBuf>,

        /// Local UDP address (overrides transport.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Plant UDP address (overrides transport.peer)
        #[arg(long)]
        peer: Option<String>,
    },

    /// Run the simulated plant node
    Plant {
        /// Local UDP address (overrides transport.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Controller UDP address (overrides transport.peer)
        #[arg(long)]
        peer: Option<String>,

        /// Noise seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Load and instantiate a policy module without running it
    Check {
        /// Policy module
        module: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a policy against the plant model in virtual time
    Simulate {
        /// Policy module
        module: PathBuf,

        /// Number of policy sleeps to simulate
        #[arg(short, long, default_value = "600")]
        steps: u32,

        /// Initial plant temperature (defaults to ambient)
        #[arg(long)]
        initial: Option<f32>,

        /// Noise seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Print every Nth step
        #[arg(long, default_value = "10")]
        every: u32,

        /// Print the trace as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

fn install_ctrlc(shutdown: &ShutdownSignal) -> Result<()> {
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        signal.trigger();
    })
    .context("Failed to set Ctrl+C handler")
}

fn join<R>(name: &str, handle: JoinHandle<R>) -> Result<R> {
    handle
        .join()
        .map_err(|_| anyhow!("{} task panicked", name))
}

fn print_link_stats(rx: &TaskStats, tx: &TaskStats) {
    println!("Link:");
    println!("  received:  {} accepted, {} rejected, {} lost", rx.accepted, rx.rejected, rx.lost);
    println!("  sent:      {} packets, {} errors", tx.sent, tx.send_errors);
}

fn cmd_controller(
    mut config: NodeConfig,
    module: Option<PathBuf>,
    bind: Option<String>,
    peer: Option<String>,
) -> Result<()> {
    if let Some(module) = module {
        config.sandbox.module_path = module;
    }
    if let Some(bind) = bind {
        config.transport.bind = bind;
    }
    if let Some(peer) = peer {
        config.transport.peer = peer;
    }

    let shutdown = ShutdownSignal::new();
    install_ctrlc(&shutdown)?;

    let actuator = config.actuator.spec();
    let state = Arc::new(SharedProcessState::with_timeout(
        config.control.initial_sensor,
        config.actuator.safe_value(),
        config.control.lock_timeout(),
    ));

    let transport: Arc<dyn PacketTransport> = Arc::new(
        UdpTransport::bind(&config.transport.bind, &config.transport.peer)
            .context("Failed to open radio link")?,
    );

    let bridge = HostBridge::new(SandboxConfig::from(&config.sandbox))
        .context("Failed to create policy sandbox")?;
    let capabilities = Capabilities::new(
        state.clone(),
        actuator,
        Arc::new(ThreadScheduler::new()),
        shutdown.clone(),
    )
    .with_max_log_bytes(config.sandbox.max_log_bytes);
    let source = FileImageSource::new(&config.sandbox.module_path, config.sandbox.max_image_bytes);

    println!("Thermal Controller");
    println!("==================");
    println!("Device:   {} (peer {})", config.node.device(), config.node.peer_device());
    println!("Link:     {} -> {}", config.transport.bind, config.transport.peer);
    println!("Module:   {}", config.sandbox.module_path.display());
    println!("Period:   {} ms", config.control.period_ms);
    println!();
    println!("Running... (Press Ctrl+C to stop)\n");

    let receive = ReceiveTask::new(
        transport.clone(),
        state.clone(),
        config.node.peer_device(),
        StateSlot::Sensor,
        config.control.sensor_range,
    );
    let transmit = TransmitTask::new(
        transport,
        state.clone(),
        config.node.device(),
        StateSlot::Actuator,
        config.control.period(),
    );

    let rx_shutdown = shutdown.clone();
    let rx = spawn_task("thermo-rx", move || receive.run(&rx_shutdown))
        .context("Failed to start receive task")?;
    let tx_shutdown = shutdown.clone();
    let tx = spawn_task("thermo-tx", move || transmit.run(&tx_shutdown))
        .context("Failed to start transmit task")?;

    let supervisor = Supervisor::new(
        bridge,
        Box::new(source),
        capabilities,
        SupervisorConfig::from_node_config(&config),
    )
    .spawn()
    .context("Failed to start sandbox task")?;

    let runs = join("sandbox", supervisor)?;
    // Supervisor only returns on its own when restarts are disabled
    shutdown.trigger();
    let rx_stats = join("receive", rx)?;
    let tx_stats = join("transmit", tx)?;

    println!("\nController stopped");
    println!("Policy:");
    println!("  attempts:  {}", runs.attempts);
    println!("  runs:      {} ({} completed, {} faulted)", runs.runs, runs.completed, runs.faults);
    println!("  startup failures: {}", runs.startup_failures);
    print_link_stats(&rx_stats, &tx_stats);

    let state_stats = state.stats();
    if state_stats.stale_reads > 0 || state_stats.dropped_writes > 0 {
        warn!(
            stale_reads = state_stats.stale_reads,
            dropped_writes = state_stats.dropped_writes,
            "state lock contention"
        );
    }
    Ok(())
}

fn cmd_plant(
    mut config: NodeConfig,
    bind: Option<String>,
    peer: Option<String>,
    seed: Option<u64>,
) -> Result<()> {
    if let Some(bind) = bind {
        config.transport.bind = bind;
    }
    if let Some(peer) = peer {
        config.transport.peer = peer;
    }

    let shutdown = ShutdownSignal::new();
    install_ctrlc(&shutdown)?;

    let plant = ThermalPlant::new(config.plant);
    let actuator = config.actuator.spec();
    let state = Arc::new(SharedProcessState::with_timeout(
        plant.temperature(),
        actuator.range.min,
        config.control.lock_timeout(),
    ));

    let transport: Arc<dyn PacketTransport> = Arc::new(
        UdpTransport::bind(&config.transport.bind, &config.transport.peer)
            .context("Failed to open radio link")?,
    );

    println!("Thermal Plant Simulator");
    println!("=======================");
    println!("Device:   {} (peer {})", config.node.device(), config.node.peer_device());
    println!("Link:     {} -> {}", config.transport.bind, config.transport.peer);
    println!("Ambient:  {:.1} C, max {:.1} C", config.plant.ambient, config.plant.max_temp);
    println!();
    println!("Running... (Press Ctrl+C to stop)\n");

    let receive = ReceiveTask::new(
        transport.clone(),
        state.clone(),
        config.node.peer_device(),
        StateSlot::Actuator,
        actuator.range,
    );
    let transmit = TransmitTask::new(
        transport,
        state.clone(),
        config.node.device(),
        StateSlot::Sensor,
        config.control.period(),
    );
    let mut plant_task = PlantTask::new(plant, state);
    if let Some(seed) = seed {
        plant_task = plant_task.with_seed(seed);
    }

    let rx_shutdown = shutdown.clone();
    let rx = spawn_task("thermo-rx", move || receive.run(&rx_shutdown))
        .context("Failed to start receive task")?;
    let tx_shutdown = shutdown.clone();
    let tx = spawn_task("thermo-tx", move || transmit.run(&tx_shutdown))
        .context("Failed to start transmit task")?;
    let sim_shutdown = shutdown.clone();
    let sim = spawn_task("thermo-plant", move || plant_task.run(&sim_shutdown))
        .context("Failed to start plant task")?;

    let plant = join("plant", sim)?;
    let rx_stats = join("receive", rx)?;
    let tx_stats = join("transmit", tx)?;

    println!("\nPlant stopped after {} ticks at {:.2} C", plant.ticks(), plant.temperature());
    print_link_stats(&rx_stats, &tx_stats);
    Ok(())
}

#[derive(Serialize)]
struct CheckReport {
    module: String,
    bytes: usize,
    hash: String,
    entry_point: String,
    exit_code: bool,
    imports: Vec<String>,
    exports: Vec<String>,
    memory_budget: u64,
    stack_budget: usize,
}

fn cmd_check(config: NodeConfig, module: PathBuf, json: bool) -> Result<()> {
    let sandbox_config = SandboxConfig::from(&config.sandbox);
    let bridge = HostBridge::new(sandbox_config).context("Failed to create policy sandbox")?;

    let source = FileImageSource::new(&module, config.sandbox.max_image_bytes);
    let image = source.read().context("Failed to read module")?;
    let handle = bridge
        .load_named(&source.describe(), &image)
        .context("Module rejected")?;

    let budgets = bridge.config().budgets;
    let mut instance = bridge
        .instantiate(&handle, budgets)
        .context("Module cannot be instantiated")?;

    let capabilities = Capabilities::new(
        Arc::new(SharedProcessState::default()),
        config.actuator.spec(),
        Arc::new(ThreadScheduler::new()),
        ShutdownSignal::new(),
    );
    instance
        .bind_capabilities(&CapabilityTable::new(capabilities))
        .context("Capability binding failed")?;
    instance.teardown();

    let report = CheckReport {
        module: handle.name().to_string(),
        bytes: image.len(),
        hash: format!("{:016x}", handle.image_hash()),
        entry_point: bridge.config().entry_point.clone(),
        exit_code: handle.returns_exit_code(),
        imports: handle.imports(),
        exports: handle.exports().map(str::to_string).collect(),
        memory_budget: budgets.memory_bytes,
        stack_budget: budgets.stack_bytes,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Module Check ===\n");
    println!("Module:        {}", report.module);
    println!("Size:          {} bytes", report.bytes);
    println!("Hash:          {}", report.hash);
    println!(
        "Entry point:   {}{}",
        report.entry_point,
        if report.exit_code { " -> i32" } else { "" }
    );
    println!("Imports:");
    for import in &report.imports {
        println!("  {}", import);
    }
    println!("Exports:");
    for export in &report.exports {
        println!("  {}", export);
    }
    println!("Budgets:       {} bytes memory, {} bytes stack", report.memory_budget, report.stack_budget);
    println!("\nOK: module can be instantiated and bound");
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize)]
struct TraceRow {
    step: u32,
    time_ms: u64,
    temperature: f32,
    measured: f32,
    actuator: f32,
}

fn cmd_simulate(
    config: NodeConfig,
    module: PathBuf,
    steps: u32,
    initial: Option<f32>,
    seed: u64,
    every: u32,
    json: bool,
) -> Result<()> {
    let bridge = HostBridge::new(SandboxConfig::from(&config.sandbox))
        .context("Failed to create policy sandbox")?;
    let source = FileImageSource::new(&module, config.sandbox.max_image_bytes);
    let image = source.read().context("Failed to read module")?;
    let handle = bridge
        .load_named(&source.describe(), &image)
        .context("Module rejected")?;

    let mut plant = match initial {
        Some(t) => ThermalPlant::with_temperature(config.plant, t),
        None => ThermalPlant::new(config.plant),
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let actuator = config.actuator.spec();
    let state = Arc::new(SharedProcessState::with_timeout(
        plant.measure(&mut rng),
        config.actuator.safe_value(),
        config.control.lock_timeout(),
    ));

    let (trace_tx, trace_rx) = mpsc::channel();
    let hook_state = state.clone();
    let mut step = 0u32;
    let mut clock_ms = 0u64;
    let scheduler = SteppedScheduler::new(move |elapsed| {
        let elapsed_ms = elapsed.as_millis() as u64;
        let power = hook_state.read_actuator();
        let temperature = plant.advance(elapsed_ms, power);
        let measured = plant.measure(&mut rng);
        let _ = hook_state.write_sensor(measured);

        step += 1;
        clock_ms += elapsed_ms;
        let _ = trace_tx.send(TraceRow {
            step,
            time_ms: clock_ms,
            temperature,
            measured,
            actuator: power,
        });
        step < steps
    });

    let capabilities = Capabilities::new(
        state.clone(),
        actuator,
        Arc::new(scheduler),
        ShutdownSignal::new(),
    )
    .with_max_log_bytes(config.sandbox.max_log_bytes);

    let mut instance = bridge
        .instantiate(&handle, bridge.config().budgets)
        .context("Module cannot be instantiated")?;
    instance
        .bind_capabilities(&CapabilityTable::new(capabilities))
        .context("Capability binding failed")?;

    let start = Instant::now();
    let outcome = instance.run().context("Run failed")?;
    let run_stats = instance.stats().clone();
    instance.teardown();
    let wall = start.elapsed();

    let trace: Vec<TraceRow> = trace_rx.try_iter().collect();

    if json {
        for row in &trace {
            println!("{}", serde_json::to_string(row)?);
        }
    } else {
        println!("=== Policy Simulation ===\n");
        println!("{:>6} {:>9} {:>8} {:>8} {:>8}", "step", "time_s", "temp", "meas", "heater");
        for row in trace.iter().filter(|r| every <= 1 || r.step % every == 0) {
            println!(
                "{:>6} {:>9.1} {:>8.2} {:>8.2} {:>8.2}",
                row.step,
                row.time_ms as f64 / 1000.0,
                row.temperature,
                row.measured,
                row.actuator
            );
        }
    }

    let switches = trace
        .windows(2)
        .filter(|w| w[0].actuator != w[1].actuator)
        .count();
    let settled = &trace[trace.len() / 2..];
    let (low, high) = settled.iter().fold((f32::MAX, f32::MIN), |(lo, hi), r| {
        (lo.min(r.temperature), hi.max(r.temperature))
    });

    let summary = format!(
        "Outcome: {}\nSimulated {} steps ({:.1} s virtual) in {:?}\nCapability calls: {}\nActuator changes: {}",
        outcome,
        trace.len(),
        trace.last().map(|r| r.time_ms as f64 / 1000.0).unwrap_or(0.0),
        wall,
        run_stats.capability_calls.total(),
        switches
    );
    if json {
        eprintln!("{}", summary);
    } else {
        println!("\n{}", summary);
        if !settled.is_empty() {
            println!("Second half range: {:.2} .. {:.2} C", low, high);
        }
    }

    match outcome {
        RunOutcome::Completed { .. } => Ok(()),
        outcome if outcome.is_shutdown() => Ok(()),
        outcome => Err(anyhow!("policy {}", outcome)),
    }
}

fn cmd_config(config: NodeConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Setup logging; RUST_LOG wins over -v and the config file
    let log_level = match cli.verbose {
        0 if cli.config.is_some() => config.node.log_level.as_tracing(),
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(log_level).into()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(role = ?config.node.role, "configuration loaded");

    match cli.command {
        Commands::Controller { module, bind, peer } => cmd_controller(config, module, bind, peer),
        Commands::Plant { bind, peer, seed } => cmd_plant(config, bind, peer, seed),
        Commands::Check { module, json } => cmd_check(config, module, json),
        Commands::Simulate {
            module,
            steps,
            initial,
            seed,
            every,
            json,
        } => cmd_simulate(config, module, steps, initial, seed, every, json),
        Commands::Config => cmd_config(config),
    }
}
