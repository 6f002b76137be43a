use crate::calibration::{
    CalibrationError, CurrentCalibration, LoadCalibration, VoltageCalibration,
    CURRENT_ZERO_SAMPLES,
};
use crate::hal::{PwmLimits, StandIO};
use crate::pulse::EdgeHandle;
use crate::timebase::Clock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ADC_MAX: f64 = 1023.0;
const VOLTAGE_CAL_SAMPLES: usize = 16;
/// Longest uninterrupted sleep of [`TachometerSim::run`].
pub const TACH_SLICE: Duration = Duration::from_millis(5);

/// Shaft speed shared from the simulated rig to the simulated tachometer.
#[derive(Debug, Clone, Default)]
pub struct ShaftProbe {
    rpm_bits: Arc<AtomicU64>,
}

impl ShaftProbe {
    pub fn rpm(&self) -> f64 {
        f64::from_bits(self.rpm_bits.load(Ordering::Relaxed))
    }

    fn set(&self, rpm: f64) {
        self.rpm_bits.store(rpm.to_bits(), Ordering::Relaxed);
    }
}

/// Physical constants of the simulated propeller and pack.
#[derive(Debug, Clone, Copy)]
pub struct PropModel {
    pub max_rpm: f64,
    pub spin_time_constant_s: f64,
    pub thrust_at_max_g: f64,
    pub current_at_max_a: f64,
    pub pack_full_v: f64,
    pub pack_empty_v: f64,
    pub pack_capacity_mah: f64,
    pub pack_resistance_ohm: f64,
}

impl Default for PropModel {
    fn default() -> Self {
        Self {
            max_rpm: 12_000.0,
            spin_time_constant_s: 0.25,
            thrust_at_max_g: 1_500.0,
            current_at_max_a: 30.0,
            pack_full_v: 12.6,
            pack_empty_v: 9.6,
            pack_capacity_mah: 2_200.0,
            pack_resistance_ohm: 0.05,
        }
    }
}

/// True sensor transfer functions of the rig. They differ from the
/// calibration defaults until the stand is calibrated.
#[derive(Debug, Clone, Copy)]
struct TrueSensors {
    current_zero_raw: f64,
    current_counts_per_amp: f64,
    volts_per_count: f64,
    load_offset_raw: f64,
    load_counts_per_gram: f64,
}

impl Default for TrueSensors {
    fn default() -> Self {
        Self {
            current_zero_raw: 508.0,
            current_counts_per_amp: 0.066 * ADC_MAX / 5.0,
            volts_per_count: 5.0 / ADC_MAX * 11.2,
            load_offset_raw: 84_000.0,
            load_counts_per_gram: 420.0,
        }
    }
}

/// Simulated propeller test rig.
#[derive(Debug)]
pub struct SimulatedStand {
    model: PropModel,
    sensors: TrueSensors,
    limits: PwmLimits,
    pulse_us: u16,
    shaft_rpm: f64,
    used_mah: f64,
    last_ms: Option<u64>,

    load_cal: LoadCalibration,
    current_cal: CurrentCalibration,
    voltage_cal: VoltageCalibration,

    noise: u64,
    probe: ShaftProbe,
}

impl SimulatedStand {
    pub fn new(limits: PwmLimits) -> Self {
        Self::with_model(limits, PropModel::default())
    }

    pub fn with_model(limits: PwmLimits, model: PropModel) -> Self {
        Self {
            model,
            sensors: TrueSensors::default(),
            limits,
            pulse_us: limits.neutral_us,
            shaft_rpm: 0.0,
            used_mah: 0.0,
            last_ms: None,
            load_cal: LoadCalibration::default(),
            current_cal: CurrentCalibration::default(),
            voltage_cal: VoltageCalibration::default(),
            noise: 0x2545_F491_4F6C_DD1D,
            probe: ShaftProbe::default(),
        }
    }

    pub fn probe(&self) -> ShaftProbe {
        self.probe.clone()
    }

    pub fn shaft_rpm(&self) -> f64 {
        self.shaft_rpm
    }

    fn thrust_g(&self) -> f64 {
        let r = self.shaft_rpm / self.model.max_rpm;
        self.model.thrust_at_max_g * r * r
    }

    fn current_a(&self) -> f64 {
        let r = self.shaft_rpm / self.model.max_rpm;
        self.model.current_at_max_a * r * r * r
    }

    fn pack_v(&self) -> f64 {
        let used = (self.used_mah / self.model.pack_capacity_mah).clamp(0.0, 1.0);
        let open = self.model.pack_full_v - (self.model.pack_full_v - self.model.pack_empty_v) * used;
        open - self.current_a() * self.model.pack_resistance_ohm
    }

    /// Uniform noise in [-1, 1] (xorshift64).
    fn jitter(&mut self) -> f64 {
        let mut x = self.noise;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.noise = x;
        (x >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    }

    fn adc(value: f64) -> f64 {
        value.round().clamp(0.0, ADC_MAX)
    }

    fn raw_current(&mut self) -> f64 {
        let raw = self.sensors.current_zero_raw
            + self.current_a() * self.sensors.current_counts_per_amp
            + self.jitter() * 1.5;
        Self::adc(raw)
    }

    fn raw_voltage(&mut self) -> f64 {
        let raw = self.pack_v() / self.sensors.volts_per_count + self.jitter() * 0.5;
        Self::adc(raw)
    }

    fn raw_load(&mut self) -> f64 {
        self.sensors.load_offset_raw
            + self.thrust_g() * self.sensors.load_counts_per_gram
            + self.jitter() * 200.0
    }
}

impl StandIO for SimulatedStand {
    fn advance(&mut self, now_ms: u64) {
        let dt_s = match self.last_ms {
            Some(last) => now_ms.saturating_sub(last) as f64 / 1_000.0,
            None => 0.0,
        };
        self.last_ms = Some(now_ms);

        let target = self.limits.throttle(self.pulse_us) * self.model.max_rpm;
        let alpha = 1.0 - (-dt_s / self.model.spin_time_constant_s).exp();
        self.shaft_rpm += (target - self.shaft_rpm) * alpha;
        self.used_mah += self.current_a() * dt_s * 1_000.0 / 3_600.0;
        self.probe.set(self.shaft_rpm);
    }

    fn read_load(&mut self) -> f64 {
        let raw = self.raw_load();
        self.load_cal.grams(raw)
    }

    fn read_current(&mut self) -> f64 {
        let raw = self.raw_current();
        self.current_cal.amps(raw)
    }

    fn read_voltage(&mut self) -> f64 {
        let raw = self.raw_voltage();
        self.voltage_cal.volts(raw)
    }

    fn tare_load(&mut self) {
        let raw = self.raw_load();
        self.load_cal.tare(raw);
    }

    fn set_load_scale(&mut self, scale: f64) -> Result<(), CalibrationError> {
        self.load_cal.set_scale(scale)
    }

    fn calibrate_current_zero(&mut self) -> Result<f64, CalibrationError> {
        let samples: Vec<f64> = (0..CURRENT_ZERO_SAMPLES).map(|_| self.raw_current()).collect();
        self.current_cal.calibrate_zero(samples)
    }

    fn calibrate_voltage(&mut self, reference_volts: f64) -> Result<f64, CalibrationError> {
        let raw = (0..VOLTAGE_CAL_SAMPLES)
            .map(|_| self.raw_voltage())
            .sum::<f64>()
            / VOLTAGE_CAL_SAMPLES as f64;
        self.voltage_cal.calibrate(reference_volts, raw)
    }

    fn write_pulse_width(&mut self, pulse_us: u16) {
        self.pulse_us = pulse_us;
    }

    fn pulse_width(&self) -> u16 {
        self.pulse_us
    }

    fn is_healthy(&self) -> bool {
        self.shaft_rpm.is_finite() && self.shaft_rpm >= 0.0
    }
}

/// Edge generator standing in for the optical tachometer's interrupt.
///
/// Runs on its own thread and only ever touches its [`EdgeHandle`].
#[derive(Debug, Clone)]
pub struct TachometerSim {
    probe: ShaftProbe,
    pulses_per_rev: u32,
    /// Every n-th pulse is followed by a contact bounce; 0 disables it.
    bounce_every: u32,
}

impl TachometerSim {
    pub fn new(probe: ShaftProbe, pulses_per_rev: u32) -> Self {
        Self {
            probe,
            pulses_per_rev: pulses_per_rev.max(1),
            bounce_every: 7,
        }
    }

    pub fn with_bounce_every(mut self, n: u32) -> Self {
        self.bounce_every = n;
        self
    }

    /// Shaft speed as edges per microsecond; 0 below one revolution per minute.
    fn pulses_per_us(&self) -> f64 {
        let rpm = self.probe.rpm();
        if !rpm.is_finite() || rpm < 1.0 {
            return 0.0;
        }
        rpm * self.pulses_per_rev as f64 / 60_000_000.0
    }

    /// Emits edges at the probe's current speed until `stop` is raised.
    ///
    /// Time is spent in slices of at most [`TACH_SLICE`], so speed changes
    /// and `stop` are seen within one slice even when a pulse period is long.
    pub fn run<C: Clock>(&self, edge: &EdgeHandle, clock: &C, stop: &AtomicBool) {
        let mut pulses: u32 = 0;
        // Fraction of the current pulse period already elapsed.
        let mut phase = 0.0_f64;
        let mut last = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            let rate_per_us = self.pulses_per_us();
            let wait = if rate_per_us > 0.0 {
                let remaining_us = ((1.0 - phase) / rate_per_us).max(0.0);
                Duration::from_micros(remaining_us as u64).min(TACH_SLICE)
            } else {
                TACH_SLICE
            };
            thread::sleep(wait);

            let now = Instant::now();
            let elapsed_us = now.duration_since(last).as_micros() as f64;
            last = now;

            let rate_per_us = self.pulses_per_us();
            if rate_per_us == 0.0 {
                phase = 0.0;
                continue;
            }
            phase += elapsed_us * rate_per_us;
            if phase < 1.0 {
                continue;
            }
            // One edge per wake; an oversleep is not paid back as a burst.
            phase -= 1.0;
            if phase >= 1.0 {
                phase = 0.0;
            }
            edge.on_edge(clock.now_us());

            pulses = pulses.wrapping_add(1);
            if self.bounce_every != 0 && pulses % self.bounce_every == 0 {
                thread::sleep(Duration::from_micros(150));
                edge.on_edge(clock.now_us());
            }
        }
    }
}
