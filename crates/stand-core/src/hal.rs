use crate::calibration::CalibrationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PwmLimitsError {
    #[error("pulse width range {min_us}..={max_us} us is inverted")]
    Inverted { min_us: u16, max_us: u16 },
    #[error("neutral pulse width {neutral_us} us lies outside {min_us}..={max_us} us")]
    NeutralOutOfRange {
        min_us: u16,
        max_us: u16,
        neutral_us: u16,
    },
}

/// Device-valid ESC pulse widths in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmLimits {
    pub min_us: u16,
    pub max_us: u16,
    /// Output forced by the interlock; motor stopped.
    pub neutral_us: u16,
}

impl PwmLimits {
    /// Requires `min_us <= neutral_us <= max_us`.
    pub fn validate(&self) -> Result<(), PwmLimitsError> {
        if self.min_us > self.max_us {
            return Err(PwmLimitsError::Inverted {
                min_us: self.min_us,
                max_us: self.max_us,
            });
        }
        if !(self.min_us..=self.max_us).contains(&self.neutral_us) {
            return Err(PwmLimitsError::NeutralOutOfRange {
                min_us: self.min_us,
                max_us: self.max_us,
                neutral_us: self.neutral_us,
            });
        }
        Ok(())
    }

    /// Total even for inverted limits, where `max_us` wins.
    pub fn clamp(&self, requested_us: i64) -> u16 {
        requested_us
            .max(self.min_us as i64)
            .min(self.max_us as i64) as u16
    }

    /// Fraction of the usable range, 0.0 at `min_us`, 1.0 at `max_us`.
    pub fn throttle(&self, pulse_us: u16) -> f64 {
        let span = self.max_us.saturating_sub(self.min_us);
        if span == 0 {
            return 0.0;
        }
        (pulse_us.saturating_sub(self.min_us) as f64 / span as f64).clamp(0.0, 1.0)
    }
}

impl Default for PwmLimits {
    fn default() -> Self {
        Self {
            min_us: 1_000,
            max_us: 2_000,
            neutral_us: 1_000,
        }
    }
}

/// Physical collaborators of the control loop: three analog-ish sensors,
/// their calibration hooks and the ESC output.
///
/// Reads must be bounded-latency. `read_load` is the one exception: load
/// cell bridges block until a conversion is ready, and implementations are
/// expected to cap that wait with a device-level timeout and return the
/// previous value when it expires.
pub trait StandIO: Send {
    /// Called once per loop iteration before any channel ticks.
    fn advance(&mut self, _now_ms: u64) {}

    /// Thrust in grams.
    fn read_load(&mut self) -> f64;
    /// Motor current in amps.
    fn read_current(&mut self) -> f64;
    /// Pack voltage in volts.
    fn read_voltage(&mut self) -> f64;

    fn tare_load(&mut self);
    fn set_load_scale(&mut self, scale: f64) -> Result<(), CalibrationError>;
    /// Re-zero the current sensor; returns the new zero in raw counts.
    fn calibrate_current_zero(&mut self) -> Result<f64, CalibrationError>;
    /// Derive the voltage scale from a known pack voltage; returns volts per count.
    fn calibrate_voltage(&mut self, reference_volts: f64) -> Result<f64, CalibrationError>;

    /// Drive the ESC. Callers clamp to [`PwmLimits`] first.
    fn write_pulse_width(&mut self, pulse_us: u16);
    fn pulse_width(&self) -> u16;

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_to_device_range() {
        let limits = PwmLimits::default();
        assert_eq!(limits.clamp(0), 1_000);
        assert_eq!(limits.clamp(-40), 1_000);
        assert_eq!(limits.clamp(1_500), 1_500);
        assert_eq!(limits.clamp(9_999_999), 2_000);
    }

    #[test]
    fn throttle_fraction() {
        let limits = PwmLimits::default();
        assert_eq!(limits.throttle(1_000), 0.0);
        assert_eq!(limits.throttle(1_500), 0.5);
        assert_eq!(limits.throttle(2_500), 1.0);
        assert_eq!(limits.throttle(900), 0.0);
    }

    #[test]
    fn inverted_limits_are_rejected_and_clamp_stays_total() {
        let inverted = PwmLimits {
            min_us: 2_000,
            max_us: 1_000,
            neutral_us: 1_000,
        };
        assert_eq!(
            inverted.validate(),
            Err(PwmLimitsError::Inverted {
                min_us: 2_000,
                max_us: 1_000
            })
        );
        assert_eq!(inverted.clamp(1_500), 1_000);
        assert_eq!(inverted.clamp(-1), 1_000);
    }

    #[test]
    fn neutral_must_sit_inside_range() {
        let limits = PwmLimits {
            min_us: 1_100,
            max_us: 1_900,
            neutral_us: 1_000,
        };
        assert!(matches!(
            limits.validate(),
            Err(PwmLimitsError::NeutralOutOfRange { neutral_us: 1_000, .. })
        ));
        assert_eq!(PwmLimits::default().validate(), Ok(()));
    }
}
