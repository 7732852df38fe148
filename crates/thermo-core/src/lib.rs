//! # Thermo Core
//!
//! Everything on a thermal control node except the sandbox: the radio packet
//! format, the datagram transport boundary, the shared process state, the
//! periodic sensor/actuator tasks, the simulated plant and the deployment
//! configuration.
//!
//! ## Data Flow
//!
//! ```text
//! plant node:      ThermalPlant → sensor slot → TransmitTask ──radio──┐
//!                  actuator slot ← ReceiveTask ←──────radio───────┐   │
//!                                                                 │   │
//! controller node: sensor slot ← ReceiveTask ←────────────────────┼───┘
//!                  sandbox: get_sensor / set_actuator             │
//!                  actuator slot → TransmitTask ──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use thermo_core::{SharedProcessState, ValueRange};
//!
//! let state = SharedProcessState::new(25.0, 0.0);
//! state.write_sensor(48.0).unwrap();
//! let stored = state.write_actuator(3.0, &ValueRange::unit()).unwrap();
//! assert_eq!(stored, 1.0);
//! assert_eq!(state.read_sensor(), 48.0);
//! ```

pub mod actuator;
pub mod config;
pub mod packet;
pub mod plant;
pub mod rt;
pub mod state;
pub mod tasks;
pub mod transport;

pub use actuator::{ActuatorEncoding, ActuatorSpec, FaultPolicy, Quantization, ValueRange};
pub use config::{ConfigError, NodeConfig, NodeRole};
pub use packet::{ChannelId, DeviceId, PacketError, RadioPacket, SequenceTracker};
pub use plant::{PlantParams, ThermalPlant};
pub use rt::{PeriodicTimer, Scheduler, ShutdownSignal, SleepOutcome, SteppedScheduler, ThreadScheduler};
pub use state::{SensorReading, SharedProcessState, StateTimeout};
pub use tasks::{PlantTask, ReceiveTask, StateSlot, TransmitTask};
pub use transport::{LoopbackLink, PacketTransport, TransportError, UdpTransport};
