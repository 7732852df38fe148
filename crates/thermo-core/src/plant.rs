//! Simulated thermal plant
//!
//! A heated thermal mass losing heat to ambient (Newton cooling), smoothed by
//! a first-order lag. The bridge node runs this in place of real hardware.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::actuator::ValueRange;

/// Physical parameters of the simulated plant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantParams {
    /// Ambient temperature and lower clamp (°C)
    pub ambient: f32,
    /// Upper clamp (°C)
    pub max_temp: f32,
    /// Degrees gained per tick at full heater power
    pub heating_rate: f32,
    /// Fraction of the excess over ambient lost per tick
    pub cooling_rate: f32,
    /// Weight of the previous temperature in the lag filter (0..1)
    pub thermal_mass: f32,
    /// Peak amplitude of uniform measurement noise (°C)
    pub noise: f32,
    /// Simulation tick in milliseconds
    pub tick_ms: u64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            ambient: 25.0,
            max_temp: 100.0,
            heating_rate: 0.8,
            cooling_rate: 0.02,
            thermal_mass: 0.95,
            noise: 0.3,
            tick_ms: 50,
        }
    }
}

impl PlantParams {
    /// Temperature envelope `[ambient, max_temp]`
    pub fn envelope(&self) -> ValueRange {
        ValueRange {
            min: self.ambient,
            max: self.max_temp,
        }
    }

    /// Keep `t` inside the envelope. Never panics, even on a reversed envelope.
    fn confine(&self, t: f32) -> f32 {
        t.max(self.ambient).min(self.max_temp)
    }
}

/// State of the simulated plant
#[derive(Debug, Clone)]
pub struct ThermalPlant {
    params: PlantParams,
    temperature: f32,
    ticks: u64,
}

impl ThermalPlant {
    /// Start at ambient temperature
    pub fn new(params: PlantParams) -> Self {
        Self {
            temperature: params.ambient,
            params,
            ticks: 0,
        }
    }

    /// Start at a given temperature
    pub fn with_temperature(params: PlantParams, temperature: f32) -> Self {
        let mut plant = Self::new(params);
        plant.temperature = params.confine(temperature);
        plant
    }

    /// Parameters in use
    pub fn params(&self) -> &PlantParams {
        &self.params
    }

    /// True (noise-free) temperature
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Ticks simulated so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance one tick with heater power `power` (0.0 to 1.0).
    pub fn step(&mut self, power: f32) -> f32 {
        let p = &self.params;
        let power = if power.is_nan() { 0.0 } else { power.clamp(0.0, 1.0) };
        let t = self.temperature;

        let next = t + power * p.heating_rate - (t - p.ambient) * p.cooling_rate;
        let lagged = t * p.thermal_mass + next * (1.0 - p.thermal_mass);

        self.temperature = p.confine(lagged);
        self.ticks += 1;
        self.temperature
    }

    /// Advance as many ticks as fit in `elapsed_ms`.
    pub fn advance(&mut self, elapsed_ms: u64, power: f32) -> f32 {
        let ticks = (elapsed_ms / self.params.tick_ms.max(1)).max(1);
        for _ in 0..ticks {
            self.step(power);
        }
        self.temperature
    }

    /// Temperature as a sensor would report it, with noise.
    pub fn measure<R: Rng>(&self, rng: &mut R) -> f32 {
        if self.params.noise <= 0.0 {
            return self.temperature;
        }
        self.temperature + rng.gen_range(-self.params.noise..=self.params.noise)
    }
}
