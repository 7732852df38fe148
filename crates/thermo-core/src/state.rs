//! Shared process state
//!
//! The only data touched by more than one task: the latest sensor reading and
//! the current actuator command. Both live in one block behind one lock, and
//! every access goes through the four operations below.
//!
//! Lock acquisition is bounded. When the wait times out, reads fall back to
//! the last value this handle observed (stale but valid) and writes are
//! dropped and reported, so no control loop ever stalls on contention. The
//! guard is never held while acquiring anything else.

use crate::actuator::ValueRange;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bounded wait for the state lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// The state lock could not be acquired within the bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shared state lock not acquired within {0:?}")]
pub struct StateTimeout(pub Duration);

/// Latest measurement with the time it was written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Temperature in °C
    pub value: f32,
    /// When the value was last written
    pub updated_at: Instant,
}

impl SensorReading {
    /// Time since the reading was written
    pub fn age(&self) -> Duration {
        self.updated_at.elapsed()
    }
}

#[derive(Debug)]
struct StateBlock {
    sensor: SensorReading,
    actuator: f32,
}

/// Counters describing lock contention
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    /// Reads answered from the fallback cell
    pub stale_reads: u64,
    /// Writes dropped on timeout
    pub dropped_writes: u64,
}

/// Latest-value cells for sensor and actuator, guarded together.
#[derive(Debug)]
pub struct SharedProcessState {
    block: Mutex<StateBlock>,
    lock_timeout: Duration,
    // Last values seen through this handle. The sensor cell keeps its
    // timestamp and is only locked briefly, never while `block` is held.
    last_sensor: Mutex<SensorReading>,
    last_actuator: AtomicU32,
    stale_reads: AtomicU64,
    dropped_writes: AtomicU64,
}

impl SharedProcessState {
    /// Create a state block with initial values and the default timeout.
    pub fn new(initial_sensor: f32, initial_actuator: f32) -> Self {
        Self::with_timeout(initial_sensor, initial_actuator, DEFAULT_LOCK_TIMEOUT)
    }

    /// Create a state block with an explicit lock timeout.
    pub fn with_timeout(initial_sensor: f32, initial_actuator: f32, lock_timeout: Duration) -> Self {
        let sensor = SensorReading {
            value: initial_sensor,
            updated_at: Instant::now(),
        };
        Self {
            block: Mutex::new(StateBlock {
                sensor,
                actuator: initial_actuator,
            }),
            lock_timeout,
            last_sensor: Mutex::new(sensor),
            last_actuator: AtomicU32::new(initial_actuator.to_bits()),
            stale_reads: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Bounded wait used for every operation
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Latest sensor value, or the last observed one if the lock is busy.
    pub fn read_sensor(&self) -> f32 {
        self.sensor_reading().value
    }

    /// Latest sensor reading with its timestamp.
    ///
    /// On timeout the last observed reading is returned with the time it was
    /// originally written.
    pub fn sensor_reading(&self) -> SensorReading {
        match self.block.try_lock_for(self.lock_timeout) {
            Some(block) => {
                let reading = block.sensor;
                drop(block);
                *self.last_sensor.lock() = reading;
                reading
            }
            None => {
                self.stale_reads.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("sensor read timed out, using last observed value");
                *self.last_sensor.lock()
            }
        }
    }

    /// Replace the sensor value.
    pub fn write_sensor(&self, value: f32) -> Result<(), StateTimeout> {
        let Some(mut block) = self.block.try_lock_for(self.lock_timeout) else {
            return Err(self.drop_write("sensor"));
        };
        let reading = SensorReading {
            value,
            updated_at: Instant::now(),
        };
        block.sensor = reading;
        drop(block);
        *self.last_sensor.lock() = reading;
        Ok(())
    }

    /// Current actuator command, or the last observed one if the lock is busy.
    pub fn read_actuator(&self) -> f32 {
        match self.block.try_lock_for(self.lock_timeout) {
            Some(block) => {
                let value = block.actuator;
                drop(block);
                self.last_actuator.store(value.to_bits(), Ordering::Relaxed);
                value
            }
            None => {
                self.stale_reads.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("actuator read timed out, using last observed value");
                f32::from_bits(self.last_actuator.load(Ordering::Relaxed))
            }
        }
    }

    /// Store `clamp(value, range)` as the actuator command.
    ///
    /// Out-of-range values are clamped, never rejected; NaN maps to
    /// `range.min`. Returns the value actually stored.
    pub fn write_actuator(&self, value: f32, range: &ValueRange) -> Result<f32, StateTimeout> {
        let clamped = range.clamp(value);
        let Some(mut block) = self.block.try_lock_for(self.lock_timeout) else {
            return Err(self.drop_write("actuator"));
        };
        block.actuator = clamped;
        drop(block);
        self.last_actuator.store(clamped.to_bits(), Ordering::Relaxed);
        Ok(clamped)
    }

    /// Contention counters
    pub fn stats(&self) -> StateStats {
        StateStats {
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }

    fn drop_write(&self, field: &'static str) -> StateTimeout {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(field, timeout = ?self.lock_timeout, "state write dropped, lock busy");
        StateTimeout(self.lock_timeout)
    }

    #[cfg(test)]
    fn hold_lock_for(&self, duration: Duration) {
        let _guard = self.block.lock();
        std::thread::sleep(duration);
    }
}

impl Default for SharedProcessState {
    fn default() -> Self {
        Self::new(25.0, 0.0)
    }
}
