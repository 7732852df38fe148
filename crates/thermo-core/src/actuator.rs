//! Actuator envelope: valid range, quantization and wire encoding.
//!
//! One description covers both the binary heater (`{0, 1}`, integer
//! encoding) and the proportional heater (`[0.0, 1.0]`, float encoding), so
//! there is a single write path regardless of deployment.

use serde::{Deserialize, Serialize};

/// A closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound (inclusive)
    pub min: f32,
    /// Upper bound (inclusive)
    pub max: f32,
}

impl ValueRange {
    /// Create a range. Bounds are swapped if given in the wrong order.
    pub fn new(min: f32, max: f32) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// The proportional actuator range `[0.0, 1.0]`
    pub const fn unit() -> Self {
        Self { min: 0.0, max: 1.0 }
    }

    /// Clamp `value` to the nearest bound. NaN maps to `min`.
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        }
    }

    /// Whether `value` lies inside the range
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    /// Whether both bounds are finite and ordered
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::unit()
    }
}

/// How a clamped command is snapped to the values the hardware can apply.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    /// Any value in range (PWM duty cycle)
    #[default]
    Continuous,
    /// Only `min` or `max`; values at or above the midpoint select `max`
    Binary,
    /// `n` evenly spaced levels including both bounds
    Steps(u32),
}

/// How the module passes the command across the capability ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorEncoding {
    /// `set_actuator(f32)`
    #[default]
    Float,
    /// `set_actuator(i32)`, on/off style
    Integer,
}

/// Full description of the deployment's actuator.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSpec {
    /// Valid command envelope
    pub range: ValueRange,
    /// Snapping applied after clamping
    pub quantization: Quantization,
    /// ABI encoding of the command
    pub encoding: ActuatorEncoding,
}

impl ActuatorSpec {
    /// Binary on/off heater with integer encoding
    pub fn binary() -> Self {
        Self {
            range: ValueRange::unit(),
            quantization: Quantization::Binary,
            encoding: ActuatorEncoding::Integer,
        }
    }

    /// Proportional heater with float encoding
    pub fn proportional() -> Self {
        Self::default()
    }

    /// Clamp then quantize a requested command.
    ///
    /// The result always lies inside `range`.
    pub fn apply(&self, requested: f32) -> f32 {
        let clamped = self.range.clamp(requested);
        let span = self.range.max - self.range.min;
        if span <= 0.0 {
            return self.range.min;
        }

        let snapped = match self.quantization {
            Quantization::Continuous => clamped,
            Quantization::Binary => {
                if clamped >= self.range.min + span / 2.0 {
                    self.range.max
                } else {
                    self.range.min
                }
            }
            Quantization::Steps(levels) if levels >= 2 => {
                let step = span / (levels - 1) as f32;
                let index = ((clamped - self.range.min) / step).round();
                self.range.min + index * step
            }
            Quantization::Steps(_) => self.range.min,
        };

        self.range.clamp(snapped)
    }
}

/// What the host does to the actuator after a run ends in a fault.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Keep the last command written before the fault
    #[default]
    HoldLast,
    /// Force the deployment's safe value (typically heater off)
    SafeValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_to_nearest_bound() {
        let range = ValueRange::new(0.0, 1.0);
        assert_eq!(range.clamp(-3.0), 0.0);
        assert_eq!(range.clamp(7.5), 1.0);
        assert_eq!(range.clamp(0.25), 0.25);
        assert_eq!(range.clamp(f32::NAN), 0.0);
        assert_eq!(range.clamp(f32::INFINITY), 1.0);
    }

    #[test]
    fn test_range_swaps_bounds() {
        let range = ValueRange::new(100.0, 0.0);
        assert_eq!(range.min, 0.0);
        assert_eq!(range.max, 100.0);
        assert!(range.is_valid());
        assert!(!ValueRange { min: f32::NAN, max: 1.0 }.is_valid());
    }

    #[test]
    fn test_binary_quantization() {
        let spec = ActuatorSpec::binary();
        assert_eq!(spec.apply(0.49), 0.0);
        assert_eq!(spec.apply(0.5), 1.0);
        assert_eq!(spec.apply(12.0), 1.0);
        assert_eq!(spec.apply(-1.0), 0.0);
    }

    #[test]
    fn test_step_quantization() {
        let spec = ActuatorSpec {
            quantization: Quantization::Steps(5),
            ..ActuatorSpec::proportional()
        };
        assert_eq!(spec.apply(0.3), 0.25);
        assert_eq!(spec.apply(0.9), 1.0);
        assert_eq!(spec.apply(2.0), 1.0);
    }

    #[test]
    fn test_continuous_is_plain_clamp() {
        let spec = ActuatorSpec {
            range: ValueRange::new(-5.0, 5.0),
            ..ActuatorSpec::proportional()
        };
        for v in [-100.0f32, -5.0, -0.1, 0.0, 3.3, 5.0, 1e9] {
            assert_eq!(spec.apply(v), v.clamp(-5.0, 5.0));
        }
    }
}
