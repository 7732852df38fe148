//! Bang-bang heater policy with hysteresis.
//!
//! Holds the plant at 50 C: heater full on below 49 C, off above 51 C,
//! unchanged in between. Runs one control step every 100 ms and never
//! returns.
//!
//! Build from this directory so `.cargo/config.toml` applies; it shrinks the
//! shadow stack so the module starts with one 64 KiB page, the default
//! sandbox memory budget:
//!
//! ```text
//! cargo build --release
//! thermo check target/wasm32-unknown-unknown/release/thermo_policy_hysteresis.wasm
//! ```

// =============================================================================
// Host Capabilities
// =============================================================================

#[link(wasm_import_module = "env")]
extern "C" {
    /// Latest plant temperature
    fn get_sensor() -> f32;

    /// Heater command, clamped by the host
    fn set_actuator(value: f32);

    /// Suspend for `ms` milliseconds
    fn sleep(ms: i32);

    /// UTF-8 message at `ptr`, `len` bytes
    fn log(ptr: i32, len: i32);
}

const TARGET: f32 = 50.0;
const BAND: f32 = 1.0;
const PERIOD_MS: i32 = 100;

const HEATER_ON: f32 = 1.0;
const HEATER_OFF: f32 = 0.0;

fn log_str(message: &str) {
    unsafe { log(message.as_ptr() as i32, message.len() as i32) };
}

/// Next heater command, or `None` to leave it unchanged.
pub fn decide(temperature: f32) -> Option<f32> {
    if temperature < TARGET - BAND {
        Some(HEATER_ON)
    } else if temperature > TARGET + BAND {
        Some(HEATER_OFF)
    } else {
        None
    }
}

/// Control loop entry point.
#[export_name = "main"]
pub extern "C" fn run() {
    log_str("hysteresis policy started");

    let mut heater = HEATER_OFF;
    loop {
        let temperature = unsafe { get_sensor() };

        if let Some(command) = decide(temperature) {
            unsafe { set_actuator(command) };
            if command != heater {
                heater = command;
                log_str(if heater == HEATER_ON { "heater on" } else { "heater off" });
            }
        }

        unsafe { sleep(PERIOD_MS) };
    }
}

