//! Sensor/actuator tasks
//!
//! Each node runs independent periodic activities around the shared state:
//!
//! | Node       | Receive (arrival driven)        | Transmit (timer driven)   | Local            |
//! |------------|---------------------------------|---------------------------|------------------|
//! | controller | plant temperature → sensor slot | actuator slot → packet    | sandbox (policy) |
//! | plant      | heater command → actuator slot  | sensor slot → packet      | plant simulation |
//!
//! Receive and transmit are not paired. The link has no acknowledgment and
//! either side may vanish for a while without blocking the other.

use crate::actuator::ValueRange;
use crate::packet::{ChannelId, DeviceId, RadioPacket, SequenceTracker};
use crate::plant::ThermalPlant;
use crate::rt::{PeriodicTimer, ShutdownSignal};
use crate::state::SharedProcessState;
use crate::transport::{PacketTransport, TransportResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Which cell of the shared state a task reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSlot {
    Sensor,
    Actuator,
}

/// What happened to one received datagram
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// Written to the state (value after clamping)
    Accepted(f32),
    /// Not a 10-byte datagram
    WrongLength(usize),
    /// Valid packet from an unexpected device or channel
    Foreign(DeviceId, ChannelId),
    /// Accepted by the decoder but the state lock timed out
    Dropped,
}

/// Counters reported when a task exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub accepted: u64,
    pub rejected: u64,
    pub sent: u64,
    pub send_errors: u64,
    pub lost: u64,
}

/// Writes incoming packets from one peer into one state slot.
pub struct ReceiveTask {
    transport: Arc<dyn PacketTransport>,
    state: Arc<SharedProcessState>,
    from: DeviceId,
    channel: ChannelId,
    slot: StateSlot,
    range: ValueRange,
    poll: Duration,
    tracker: SequenceTracker,
    stats: TaskStats,
}

impl ReceiveTask {
    /// Accept packets sent by `from` on the thermal channel into `slot`,
    /// clamped into `range`.
    pub fn new(
        transport: Arc<dyn PacketTransport>,
        state: Arc<SharedProcessState>,
        from: DeviceId,
        slot: StateSlot,
        range: ValueRange,
    ) -> Self {
        Self {
            transport,
            state,
            from,
            channel: ChannelId::THERMAL,
            slot,
            range,
            poll: Duration::from_millis(50),
            tracker: SequenceTracker::new(),
            stats: TaskStats::default(),
        }
    }

    /// How long a single receive waits before re-checking shutdown
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Sequence statistics of the peer
    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Apply one datagram to the state.
    pub fn handle(&mut self, datagram: &[u8]) -> Disposition {
        let packet = match RadioPacket::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.rejected += 1;
                tracing::debug!(len = datagram.len(), "ignoring datagram with bad length");
                return Disposition::WrongLength(datagram.len());
            }
        };
        if !packet.is_from(self.from, self.channel) {
            self.stats.rejected += 1;
            tracing::debug!(
                device = %packet.device_id,
                channel = packet.channel_id.as_u8(),
                "ignoring packet from unexpected sender"
            );
            return Disposition::Foreign(packet.device_id, packet.channel_id);
        }

        self.tracker.observe(packet.sequence);
        let result = match self.slot {
            StateSlot::Sensor => {
                let value = self.range.clamp(packet.value);
                self.state.write_sensor(value).map(|_| value)
            }
            StateSlot::Actuator => self.state.write_actuator(packet.value, &self.range),
        };

        match result {
            Ok(value) => {
                self.stats.accepted += 1;
                tracing::trace!(seq = packet.sequence, value, "packet applied");
                Disposition::Accepted(value)
            }
            Err(_) => Disposition::Dropped,
        }
    }

    /// Receive until shutdown.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> TaskStats {
        while !shutdown.is_triggered() {
            match self.transport.recv_timeout(self.poll) {
                Ok(Some(datagram)) => {
                    self.handle(&datagram);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed, skipping");
                    if shutdown.wait_timeout(self.poll) {
                        break;
                    }
                }
            }
        }
        self.stats.lost = self.tracker.dropped();
        tracing::info!(
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            lost = self.stats.lost,
            "receive task stopped"
        );
        self.stats
    }
}

/// Sends one state slot to the peer at a fixed rate.
pub struct TransmitTask {
    transport: Arc<dyn PacketTransport>,
    state: Arc<SharedProcessState>,
    device: DeviceId,
    slot: StateSlot,
    period: Duration,
    sequence: u32,
    stats: TaskStats,
}

impl TransmitTask {
    pub fn new(
        transport: Arc<dyn PacketTransport>,
        state: Arc<SharedProcessState>,
        device: DeviceId,
        slot: StateSlot,
        period: Duration,
    ) -> Self {
        Self {
            transport,
            state,
            device,
            slot,
            period,
            sequence: 0,
            stats: TaskStats::default(),
        }
    }

    /// Read the slot and send one packet.
    pub fn transmit_once(&mut self) -> TransportResult<RadioPacket> {
        let value = match self.slot {
            StateSlot::Sensor => self.state.read_sensor(),
            StateSlot::Actuator => self.state.read_actuator(),
        };
        let packet = RadioPacket::new(self.device, ChannelId::THERMAL, value, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        self.transport.send(&packet.to_bytes())?;
        Ok(packet)
    }

    /// Transmit every period until shutdown.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> TaskStats {
        let mut timer = PeriodicTimer::new(self.period);
        while timer.wait(shutdown) {
            match self.transmit_once() {
                Ok(packet) => {
                    self.stats.sent += 1;
                    tracing::trace!(seq = packet.sequence, value = packet.value, "sent");
                }
                Err(e) => {
                    self.stats.send_errors += 1;
                    tracing::warn!(error = %e, "send failed, skipping cycle");
                }
            }
        }
        if timer.overruns() > 0 {
            tracing::debug!(overruns = timer.overruns(), "transmit task ran late");
        }
        tracing::info!(sent = self.stats.sent, errors = self.stats.send_errors, "transmit task stopped");
        self.stats
    }
}

/// Steps the simulated plant from the actuator slot and publishes the
/// measured temperature to the sensor slot.
pub struct PlantTask {
    plant: ThermalPlant,
    state: Arc<SharedProcessState>,
    rng: StdRng,
}

impl PlantTask {
    pub fn new(plant: ThermalPlant, state: Arc<SharedProcessState>) -> Self {
        Self {
            plant,
            state,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed noise seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// One simulation tick. Returns the measured temperature.
    pub fn tick(&mut self) -> f32 {
        let power = self.state.read_actuator();
        self.plant.step(power);
        let measured = self.plant.measure(&mut self.rng);
        // A dropped write is retried implicitly on the next tick
        let _ = self.state.write_sensor(measured);
        measured
    }

    /// Simulate until shutdown.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> ThermalPlant {
        let mut timer = PeriodicTimer::new(Duration::from_millis(self.plant.params().tick_ms));
        while timer.wait(shutdown) {
            let measured = self.tick();
            if self.plant.ticks() % 20 == 0 {
                tracing::info!(
                    temp = %format!("{:.2}", measured),
                    power = self.state.read_actuator(),
                    "plant"
                );
            }
        }
        self.plant
    }
}

/// Run `f` on a named thread.
pub fn spawn_task<F, R>(name: &str, f: F) -> io::Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::PlantParams;
    use crate::transport::LoopbackLink;

    fn state() -> Arc<SharedProcessState> {
        Arc::new(SharedProcessState::new(25.0, 0.0))
    }

    fn controller_rx(state: Arc<SharedProcessState>) -> (ReceiveTask, LoopbackLink) {
        let (local, remote) = LoopbackLink::pair();
        let task = ReceiveTask::new(
            Arc::new(local),
            state,
            DeviceId::PLANT,
            StateSlot::Sensor,
            ValueRange::new(0.0, 100.0),
        );
        (task, remote)
    }

    #[test]
    fn test_wrong_length_does_not_mutate_state() {
        let state = state();
        let (mut task, _remote) = controller_rx(state.clone());

        for len in [0usize, 1, 9, 11, 64] {
            let datagram = vec![0x42u8; len];
            assert_eq!(task.handle(&datagram), Disposition::WrongLength(len));
        }
        assert_eq!(state.read_sensor(), 25.0);
        assert_eq!(state.read_actuator(), 0.0);
    }

    #[test]
    fn test_foreign_sender_ignored() {
        let state = state();
        let (mut task, _remote) = controller_rx(state.clone());

        let own_echo = RadioPacket::new(DeviceId::CONTROLLER, ChannelId::THERMAL, 90.0, 1);
        let other_channel = RadioPacket::new(DeviceId::PLANT, ChannelId::new(7), 90.0, 2);
        assert!(matches!(task.handle(&own_echo.to_bytes()), Disposition::Foreign(..)));
        assert!(matches!(task.handle(&other_channel.to_bytes()), Disposition::Foreign(..)));
        assert_eq!(state.read_sensor(), 25.0);
    }

    #[test]
    fn test_sensor_packet_clamped_into_range() {
        let state = state();
        let (mut task, _remote) = controller_rx(state.clone());

        let ok = RadioPacket::new(DeviceId::PLANT, ChannelId::THERMAL, 48.0, 1);
        assert_eq!(task.handle(&ok.to_bytes()), Disposition::Accepted(48.0));
        assert_eq!(state.read_sensor(), 48.0);

        let hot = RadioPacket::new(DeviceId::PLANT, ChannelId::THERMAL, 300.0, 4);
        assert_eq!(task.handle(&hot.to_bytes()), Disposition::Accepted(100.0));
        assert_eq!(task.tracker().dropped(), 2);
    }

    #[test]
    fn test_plant_receives_clamped_command() {
        let state = state();
        let (local, _remote) = LoopbackLink::pair();
        let mut task = ReceiveTask::new(
            Arc::new(local),
            state.clone(),
            DeviceId::CONTROLLER,
            StateSlot::Actuator,
            ValueRange::unit(),
        );
        let packet = RadioPacket::new(DeviceId::CONTROLLER, ChannelId::THERMAL, 4.0, 0);
        assert_eq!(task.handle(&packet.to_bytes()), Disposition::Accepted(1.0));
        assert_eq!(state.read_actuator(), 1.0);
    }

    #[test]
    fn test_transmit_sequence_increments() {
        let state = state();
        state.write_actuator(0.75, &ValueRange::unit()).unwrap();
        let (local, remote) = LoopbackLink::pair();
        let mut task = TransmitTask::new(
            Arc::new(local),
            state,
            DeviceId::CONTROLLER,
            StateSlot::Actuator,
            Duration::from_millis(100),
        );

        task.transmit_once().unwrap();
        task.transmit_once().unwrap();

        let first = remote.recv_timeout(Duration::from_millis(50)).unwrap().unwrap();
        let second = remote.recv_timeout(Duration::from_millis(50)).unwrap().unwrap();
        let first = RadioPacket::from_bytes(&first).unwrap();
        let second = RadioPacket::from_bytes(&second).unwrap();
        assert_eq!(first.value, 0.75);
        assert_eq!(first.device_id, DeviceId::CONTROLLER);
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[test]
    fn test_controller_and_plant_exchange_over_link() {
        let shutdown = ShutdownSignal::new();
        let (controller_link, plant_link) = LoopbackLink::pair();
        let controller_link: Arc<dyn PacketTransport> = Arc::new(controller_link);
        let plant_link: Arc<dyn PacketTransport> = Arc::new(plant_link);

        let controller_state = Arc::new(SharedProcessState::new(0.0, 0.0));
        let plant_state = Arc::new(SharedProcessState::new(61.0, 0.0));
        controller_state
            .write_actuator(1.0, &ValueRange::unit())
            .unwrap();

        let period = Duration::from_millis(5);
        let tasks = vec![
            {
                let task = TransmitTask::new(
                    controller_link.clone(),
                    controller_state.clone(),
                    DeviceId::CONTROLLER,
                    StateSlot::Actuator,
                    period,
                );
                let shutdown = shutdown.clone();
                spawn_task("ctl-tx", move || task.run(&shutdown)).unwrap()
            },
            {
                let task = ReceiveTask::new(
                    controller_link,
                    controller_state.clone(),
                    DeviceId::PLANT,
                    StateSlot::Sensor,
                    ValueRange::new(0.0, 100.0),
                )
                .with_poll_interval(period);
                let shutdown = shutdown.clone();
                spawn_task("ctl-rx", move || task.run(&shutdown)).unwrap()
            },
            {
                let task = TransmitTask::new(
                    plant_link.clone(),
                    plant_state.clone(),
                    DeviceId::PLANT,
                    StateSlot::Sensor,
                    period,
                );
                let shutdown = shutdown.clone();
                spawn_task("plant-tx", move || task.run(&shutdown)).unwrap()
            },
            {
                let task = ReceiveTask::new(
                    plant_link,
                    plant_state.clone(),
                    DeviceId::CONTROLLER,
                    StateSlot::Actuator,
                    ValueRange::unit(),
                )
                .with_poll_interval(period);
                let shutdown = shutdown.clone();
                spawn_task("plant-rx", move || task.run(&shutdown)).unwrap()
            },
        ];

        thread::sleep(Duration::from_millis(150));
        shutdown.trigger();
        for task in tasks {
            task.join().unwrap();
        }

        assert_eq!(controller_state.read_sensor(), 61.0);
        assert_eq!(plant_state.read_actuator(), 1.0);
    }

    #[test]
    fn test_plant_task_heats_with_command() {
        let state = state();
        state.write_actuator(1.0, &ValueRange::unit()).unwrap();
        let params = PlantParams {
            noise: 0.0,
            ..PlantParams::default()
        };
        let mut task = PlantTask::new(ThermalPlant::new(params), state.clone()).with_seed(1);
        for _ in 0..100 {
            task.tick();
        }
        assert!(state.read_sensor() > 26.0);
    }
}
