//! Raw-count to engineering-unit conversion for the stand's analog sensors.
//!
//! These are plain values owned by a [`crate::hal::StandIO`] implementation;
//! the calibration commands only ever mutate them through the methods here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw reads averaged when re-zeroing the current sensor.
pub const CURRENT_ZERO_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CalibrationError {
    #[error("no samples supplied")]
    NoSamples,
    #[error("scale factor must be finite and non-zero, got {0}")]
    InvalidScale(f64),
    #[error("reference reading must be finite and non-zero (reference {reference}, raw {raw})")]
    InvalidReference { reference: f64, raw: f64 },
}

/// Hall-effect current sensor: amps = (raw - zero) / counts_per_amp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentCalibration {
    pub zero_raw: f64,
    pub counts_per_amp: f64,
}

impl CurrentCalibration {
    pub fn amps(&self, raw: f64) -> f64 {
        (raw - self.zero_raw) / self.counts_per_amp
    }

    /// Re-zero from raw reads taken with no load current flowing.
    pub fn calibrate_zero<I>(&mut self, samples: I) -> Result<f64, CalibrationError>
    where
        I: IntoIterator<Item = f64>,
    {
        let (sum, n) = samples
            .into_iter()
            .fold((0.0, 0usize), |(sum, n), raw| (sum + raw, n + 1));
        if n == 0 {
            return Err(CalibrationError::NoSamples);
        }
        self.zero_raw = sum / n as f64;
        Ok(self.zero_raw)
    }
}

impl Default for CurrentCalibration {
    /// 10-bit ADC at 5 V with a 66 mV/A sensor centred at mid-rail.
    fn default() -> Self {
        Self {
            zero_raw: 512.0,
            counts_per_amp: 0.066 * 1023.0 / 5.0,
        }
    }
}

/// Resistive divider on the pack voltage: volts = raw * volts_per_count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageCalibration {
    pub volts_per_count: f64,
}

impl VoltageCalibration {
    pub fn volts(&self, raw: f64) -> f64 {
        raw * self.volts_per_count
    }

    /// Derive the scale from a raw reading taken while the pack measures
    /// `reference_volts` on an external meter. The previous scale is kept on
    /// error.
    pub fn calibrate(&mut self, reference_volts: f64, raw: f64) -> Result<f64, CalibrationError> {
        if !reference_volts.is_finite() || !raw.is_finite() || raw == 0.0 || reference_volts == 0.0
        {
            return Err(CalibrationError::InvalidReference {
                reference: reference_volts,
                raw,
            });
        }
        self.volts_per_count = reference_volts / raw;
        Ok(self.volts_per_count)
    }
}

impl Default for VoltageCalibration {
    /// 10-bit ADC at 5 V behind an 11:1 divider.
    fn default() -> Self {
        Self {
            volts_per_count: 5.0 / 1023.0 * 11.0,
        }
    }
}

/// Load cell bridge: grams = (raw - offset) / scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadCalibration {
    pub offset: f64,
    pub scale: f64,
}

impl LoadCalibration {
    pub fn grams(&self, raw: f64) -> f64 {
        (raw - self.offset) / self.scale
    }

    pub fn tare(&mut self, raw: f64) {
        self.offset = raw;
    }

    pub fn set_scale(&mut self, scale: f64) -> Result<(), CalibrationError> {
        if !scale.is_finite() || scale == 0.0 {
            return Err(CalibrationError::InvalidScale(scale));
        }
        self.scale = scale;
        Ok(())
    }
}

impl Default for LoadCalibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 420.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_zero_is_mean_of_samples() {
        let mut cal = CurrentCalibration::default();
        let zero = cal
            .calibrate_zero((0..CURRENT_ZERO_SAMPLES).map(|i| 500.0 + (i % 2) as f64))
            .unwrap();
        assert_eq!(zero, 500.5);
        assert_eq!(cal.amps(500.5), 0.0);
    }

    #[test]
    fn current_zero_rejects_empty_input() {
        let mut cal = CurrentCalibration::default();
        assert_eq!(
            cal.calibrate_zero(std::iter::empty()),
            Err(CalibrationError::NoSamples)
        );
        assert_eq!(cal, CurrentCalibration::default());
    }

    #[test]
    fn voltage_scale_from_reference() {
        let mut cal = VoltageCalibration::default();
        cal.calibrate(12.0, 240.0).unwrap();
        assert_eq!(cal.volts(240.0), 12.0);
        assert!(cal.calibrate(12.0, 0.0).is_err());
        assert_eq!(cal.volts_per_count, 0.05);
    }

    #[test]
    fn load_tare_and_scale() {
        let mut cal = LoadCalibration::default();
        cal.tare(1_000.0);
        cal.set_scale(2.0).unwrap();
        assert_eq!(cal.grams(1_200.0), 100.0);
        assert!(cal.set_scale(0.0).is_err());
        assert!(cal.set_scale(f64::NAN).is_err());
        assert_eq!(cal.scale, 2.0);
    }
}
