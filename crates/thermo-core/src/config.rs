//! Deployment configuration
//!
//! One TOML file per node, fixed at deployment time. Every section and field
//! has a default, so an empty file describes a controller with a proportional
//! heater.
//!
//! ```toml
//! [node]
//! role = "controller"
//! log_level = "debug"
//!
//! [control]
//! period_ms = 100
//! sensor_range = { min = 0.0, max = 100.0 }
//!
//! [actuator]
//! max = 1.0
//! quantization = "binary"
//! encoding = "integer"
//! fault_policy = "safe_value"
//!
//! [sandbox]
//! module_path = "/spiffs/controller.wasm"
//! memory_budget_bytes = 65536
//!
//! [transport]
//! bind = "0.0.0.0:47100"
//! peer = "192.168.4.1:47101"
//! ```

use crate::actuator::{ActuatorEncoding, ActuatorSpec, FaultPolicy, Quantization, ValueRange};
use crate::packet::DeviceId;
use crate::plant::PlantParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read configuration {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// TOML parsing failed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Which side of the link this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the sandboxed policy
    #[default]
    Controller,
    /// Simulates the thermal process
    Plant,
}

/// Log verbosity when neither `-v` nor `RUST_LOG` is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Matching `tracing` level
    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// `[node]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub role: NodeRole,
    /// Device id stamped on outgoing packets; defaults from the role
    pub device_id: Option<u8>,
    /// Device id accepted on incoming packets; defaults from the role
    pub peer_device_id: Option<u8>,
    pub log_level: LogLevel,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            role: NodeRole::Controller,
            device_id: None,
            peer_device_id: None,
            log_level: LogLevel::Info,
        }
    }
}

impl NodeSection {
    /// Own device id
    pub fn device(&self) -> DeviceId {
        match (self.device_id, self.role) {
            (Some(id), _) => DeviceId::new(id),
            (None, NodeRole::Controller) => DeviceId::CONTROLLER,
            (None, NodeRole::Plant) => DeviceId::PLANT,
        }
    }

    /// Device id of the other node
    pub fn peer_device(&self) -> DeviceId {
        match (self.peer_device_id, self.role) {
            (Some(id), _) => DeviceId::new(id),
            (None, NodeRole::Controller) => DeviceId::PLANT,
            (None, NodeRole::Plant) => DeviceId::CONTROLLER,
        }
    }
}

/// `[control]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    /// Transmit and control period
    pub period_ms: u64,
    /// Bounded wait on the shared state lock
    pub state_lock_timeout_ms: u64,
    /// Valid sensor values; received readings are clamped into it
    pub sensor_range: ValueRange,
    /// Sensor value before the first packet arrives
    pub initial_sensor: f32,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            period_ms: 100,
            state_lock_timeout_ms: 10,
            sensor_range: ValueRange::new(0.0, 100.0),
            initial_sensor: 25.0,
        }
    }
}

impl ControlSection {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.state_lock_timeout_ms)
    }
}

/// `[actuator]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSection {
    pub min: f32,
    pub max: f32,
    pub quantization: Quantization,
    pub encoding: ActuatorEncoding,
    pub fault_policy: FaultPolicy,
    /// Command forced by [`FaultPolicy::SafeValue`]; defaults to `min`
    pub safe_value: Option<f32>,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            quantization: Quantization::Continuous,
            encoding: ActuatorEncoding::Float,
            fault_policy: FaultPolicy::HoldLast,
            safe_value: None,
        }
    }
}

impl ActuatorSection {
    /// Actuator description used by the write path
    pub fn spec(&self) -> ActuatorSpec {
        ActuatorSpec {
            range: ValueRange::new(self.min, self.max),
            quantization: self.quantization,
            encoding: self.encoding,
        }
    }

    /// Safe value, clamped into range
    pub fn safe_value(&self) -> f32 {
        let range = ValueRange::new(self.min, self.max);
        range.clamp(self.safe_value.unwrap_or(range.min))
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Module image on the mounted filesystem
    pub module_path: PathBuf,
    /// Exported zero-argument entry point
    pub entry_point: String,
    /// Linear memory the module may use
    pub memory_budget_bytes: u64,
    /// Memory the host can grant in total; instantiation fails above it
    pub memory_ceiling_bytes: u64,
    /// Wasm call-stack budget
    pub stack_budget_bytes: usize,
    /// Instructions allowed between capability calls
    pub fuel_per_slice: u64,
    /// Largest accepted image
    pub max_image_bytes: usize,
    /// Longest accepted `log` message
    pub max_log_bytes: usize,
    /// Wait between failed run attempts
    pub retry_backoff_ms: u64,
    /// Native stack of the sandbox thread
    pub thread_stack_bytes: usize,
    /// Start a fresh run when the entry point returns
    pub restart_on_completion: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from("/spiffs/controller.wasm"),
            entry_point: "main".to_string(),
            memory_budget_bytes: 64 * 1024,
            memory_ceiling_bytes: 16 * 1024 * 1024,
            stack_budget_bytes: 64 * 1024,
            fuel_per_slice: 10_000_000,
            max_image_bytes: 1024 * 1024,
            max_log_bytes: 256,
            retry_backoff_ms: 5_000,
            thread_stack_bytes: 8 * 1024 * 1024,
            restart_on_completion: true,
        }
    }
}

/// `[transport]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub bind: String,
    pub peer: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:47100".to_string(),
            peer: "127.0.0.1:47101".to_string(),
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub control: ControlSection,
    pub actuator: ActuatorSection,
    pub sandbox: SandboxSection,
    pub transport: TransportSection,
    pub plant: PlantParams,
}

impl NodeConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.control.period_ms == 0 {
            return invalid("control.period_ms must be positive".into());
        }
        if !self.control.sensor_range.is_valid() {
            return invalid("control.sensor_range must be finite".into());
        }
        let actuator = ValueRange {
            min: self.actuator.min,
            max: self.actuator.max,
        };
        if !actuator.is_valid() {
            return invalid(format!(
                "actuator range [{}, {}] must be finite and ordered",
                self.actuator.min, self.actuator.max
            ));
        }
        if let Some(safe) = self.actuator.safe_value {
            if !actuator.contains(safe) {
                return invalid(format!("actuator.safe_value {} is outside the range", safe));
            }
        }
        if let Quantization::Steps(n) = self.actuator.quantization {
            if n < 2 {
                return invalid("actuator quantization needs at least 2 steps".into());
            }
        }
        if self.sandbox.entry_point.is_empty() {
            return invalid("sandbox.entry_point cannot be empty".into());
        }
        if self.sandbox.memory_budget_bytes > self.sandbox.memory_ceiling_bytes {
            return invalid(format!(
                "sandbox.memory_budget_bytes {} exceeds memory_ceiling_bytes {}",
                self.sandbox.memory_budget_bytes, self.sandbox.memory_ceiling_bytes
            ));
        }
        if self.sandbox.stack_budget_bytes == 0 || self.sandbox.fuel_per_slice == 0 {
            return invalid("sandbox stack and fuel budgets must be positive".into());
        }
        if self.node.device() == self.node.peer_device() {
            return invalid("node.device_id and node.peer_device_id must differ".into());
        }
        if !self.plant.envelope().is_valid() {
            return invalid(format!(
                "plant.ambient {} and plant.max_temp {} must be finite with ambient <= max_temp",
                self.plant.ambient, self.plant.max_temp
            ));
        }
        if self.plant.tick_ms == 0 || !(0.0..1.0).contains(&self.plant.thermal_mass) {
            return invalid("plant.tick_ms must be positive and thermal_mass in [0, 1)".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_valid_controller() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.node.role, NodeRole::Controller);
        assert_eq!(config.node.device(), DeviceId::CONTROLLER);
        assert_eq!(config.node.peer_device(), DeviceId::PLANT);
        assert_eq!(config.control.period(), Duration::from_millis(100));
        assert_eq!(config.control.lock_timeout(), Duration::from_millis(10));
        assert_eq!(config.sandbox.memory_budget_bytes, 64 * 1024);
        assert_eq!(config.sandbox.entry_point, "main");
        assert_eq!(config.actuator.safe_value(), 0.0);
    }

    #[test]
    fn test_load_binary_deployment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
role = "plant"

[actuator]
quantization = "binary"
encoding = "integer"
fault_policy = "safe_value"

[sandbox]
module_path = "/tmp/policy.wasm"
fuel_per_slice = 5000
"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node.device(), DeviceId::PLANT);
        assert_eq!(config.actuator.spec(), ActuatorSpec::binary());
        assert_eq!(config.actuator.fault_policy, FaultPolicy::SafeValue);
        assert_eq!(config.sandbox.module_path, PathBuf::from("/tmp/policy.wasm"));
        assert_eq!(config.sandbox.fuel_per_slice, 5000);
        assert_eq!(config.sandbox.max_log_bytes, 256);
    }

    #[test]
    fn test_step_quantization_table() {
        let config = NodeConfig::from_toml("[actuator]\nquantization = { steps = 4 }\n").unwrap();
        assert_eq!(config.actuator.quantization, Quantization::Steps(4));
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            NodeConfig::from_toml("[control]\nperiod_ms = 0\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[actuator]\nsafe_value = 3.0\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[sandbox]\nmemory_budget_bytes = 1000000000\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[node]\ndevice_id = 0\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_plant_envelope_validated() {
        assert!(matches!(
            NodeConfig::from_toml("[plant]\nambient = 80.0\nmax_temp = 40.0\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[plant]\nmax_temp = nan\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            NodeConfig::from_toml("[plant]\nambient = -inf\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(NodeConfig::from_toml("[plant]\nambient = 40.0\nmax_temp = 40.0\n").is_ok());
    }

    #[test]
    fn test_parse_error_and_missing_file() {
        assert!(matches!(
            NodeConfig::from_toml("[control\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::load(Path::new("/nonexistent/thermo.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_keeps_defaults() {
        let config = NodeConfig::default();
        let text = config.to_toml().unwrap();
        let back = NodeConfig::from_toml(&text).unwrap();
        assert_eq!(back.sandbox.fuel_per_slice, config.sandbox.fuel_per_slice);
        assert_eq!(back.transport.peer, config.transport.peer);
    }
}
