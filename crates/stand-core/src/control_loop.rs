use crate::cadence::CadenceGate;
use crate::calibration::CalibrationError;
use crate::channel::SampledChannel;
use crate::command::Command;
use crate::hal::{PwmLimits, PwmLimitsError, StandIO};
use crate::interlock::{InterlockTrip, SafetyInterlock};
use crate::pulse::{PulseCounter, RpmChannel, DEFAULT_DEBOUNCE_US};
use crate::sync::{StandSnapshot, TelemetryExchange};
use crate::telemetry::TelemetryRecord;
use crate::timebase::Clock;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

pub const LOAD_WINDOW: usize = 3;
pub const CURRENT_WINDOW: usize = 5;
pub const VOLTAGE_WINDOW: usize = 3;
pub const RPM_WINDOW: usize = 8;

pub const DEFAULT_BLADES: u32 = 2;

/// Pulses per revolution for a requested blade count; 0 selects the default.
pub fn resolve_blades(requested: u32) -> u32 {
    if requested == 0 {
        DEFAULT_BLADES
    } else {
        requested
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub load_interval_ms: u64,
    pub current_interval_ms: u64,
    pub voltage_interval_ms: u64,
    pub rpm_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub debounce_us: u64,
    pub blades: u32,
    pub pwm: PwmLimits,
    /// Append a sequence counter to every telemetry record.
    pub emit_sequence: bool,
    /// Pause between iterations in [`ControlLoop::run`].
    pub idle_us: u64,
    pub tach_pin: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            load_interval_ms: 100,
            current_interval_ms: 20,
            voltage_interval_ms: 20,
            rpm_interval_ms: 250,
            telemetry_interval_ms: 100,
            debounce_us: DEFAULT_DEBOUNCE_US,
            blades: DEFAULT_BLADES,
            pwm: PwmLimits::default(),
            emit_sequence: false,
            idle_us: 500,
            tach_pin: 2,
        }
    }
}

impl ControlConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), PwmLimitsError> {
        self.pwm.validate()
    }
}

#[derive(Clone, Default, Debug, Serialize)]
pub struct ExecutionStats {
    pub iterations: u64,
    pub load_samples: u64,
    pub current_samples: u64,
    pub voltage_samples: u64,
    pub rpm_samples: u64,
    pub telemetry_emitted: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub interlock_trips: u64,
    pub max_iteration_us: u64,
}

/// Something the loop did that observers may want to audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    CommandApplied { command: Command, reply: String },
    CommandRejected { line: String, error: String },
    InterlockTripped { voltage: f64, threshold: f64, pulse_width_us: u16 },
}

/// Non-blocking supply of raw command lines.
pub trait CommandSource {
    fn poll_line(&mut self) -> Option<String>;
}

impl CommandSource for Receiver<String> {
    fn poll_line(&mut self) -> Option<String> {
        self.try_recv().ok()
    }
}

impl CommandSource for VecDeque<String> {
    fn poll_line(&mut self) -> Option<String> {
        self.pop_front()
    }
}

/// Destination for telemetry records and command replies.
pub trait TelemetrySink {
    fn record(&mut self, record: &TelemetryRecord);
    fn reply(&mut self, line: &str);
    fn event(&mut self, _event: &LoopEvent) {}
}

/// Collects the serial output verbatim.
impl TelemetrySink for Vec<String> {
    fn record(&mut self, record: &TelemetryRecord) {
        self.push(record.to_string());
    }

    fn reply(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

pub struct ControlLoop<IO: StandIO, C: Clock> {
    io: IO,
    clock: C,
    config: ControlConfig,
    load: SampledChannel<LOAD_WINDOW>,
    current: SampledChannel<CURRENT_WINDOW>,
    voltage: SampledChannel<VOLTAGE_WINDOW>,
    rpm: RpmChannel<RPM_WINDOW>,
    telemetry_gate: CadenceGate,
    interlock: SafetyInterlock,
    blades: u32,
    sequence: u64,
    stats: ExecutionStats,
    exchange: Option<Arc<TelemetryExchange>>,
}

impl<IO: StandIO, C: Clock> ControlLoop<IO, C> {
    pub fn new(io: IO, clock: C, config: ControlConfig, pulses: Arc<PulseCounter>) -> Self {
        let blades = resolve_blades(config.blades);
        Self {
            load: SampledChannel::new(config.load_interval_ms),
            current: SampledChannel::new(config.current_interval_ms),
            voltage: SampledChannel::new(config.voltage_interval_ms),
            rpm: RpmChannel::new(config.rpm_interval_ms, pulses),
            telemetry_gate: CadenceGate::new(config.telemetry_interval_ms),
            interlock: SafetyInterlock::new(),
            blades,
            sequence: 0,
            stats: ExecutionStats::default(),
            exchange: None,
            io,
            clock,
            config,
        }
    }

    /// Publish a snapshot to `exchange` after every iteration.
    pub fn with_exchange(mut self, exchange: Arc<TelemetryExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Repeat [`step`](Self::step) until `stop` is raised.
    pub fn run<S, T>(&mut self, commands: &mut S, sink: &mut T, stop: &AtomicBool)
    where
        S: CommandSource,
        T: TelemetrySink,
    {
        let idle = Duration::from_micros(self.config.idle_us);
        while !stop.load(Ordering::Relaxed) {
            self.step(commands, sink);
            if !idle.is_zero() {
                std::thread::sleep(idle);
            }
        }
        self.emergency_stop();
    }

    /// One cooperative iteration. Returns the telemetry record if one was
    /// emitted.
    pub fn step<S, T>(&mut self, commands: &mut S, sink: &mut T) -> Option<TelemetryRecord>
    where
        S: CommandSource,
        T: TelemetrySink,
    {
        let start_us = self.clock.now_us();
        let now_ms = start_us / 1_000;
        self.io.advance(now_ms);

        if let Some(line) = commands.poll_line() {
            self.handle_line(&line, sink);
        }

        // Fixed order: load, current, voltage, rpm.
        let io = &mut self.io;
        if self.load.tick(now_ms, || io.read_load()) {
            self.stats.load_samples += 1;
        }
        if self.current.tick(now_ms, || io.read_current()) {
            self.stats.current_samples += 1;
        }
        if self.voltage.tick(now_ms, || io.read_voltage()) {
            self.stats.voltage_samples += 1;
        }
        if self.rpm.tick(now_ms) {
            self.stats.rpm_samples += 1;
        }

        if let Some(trip) = self.check_interlock() {
            self.on_trip(trip, sink);
        }

        let emitted = if self.telemetry_gate.ready(now_ms) {
            let record = self.record_at(now_ms);
            if record.sequence.is_some() {
                self.sequence += 1;
            }
            sink.record(&record);
            self.stats.telemetry_emitted += 1;
            Some(record)
        } else {
            None
        };

        self.stats.iterations += 1;
        let elapsed_us = self.clock.now_us().saturating_sub(start_us);
        self.stats.max_iteration_us = self.stats.max_iteration_us.max(elapsed_us);

        if let Some(exchange) = &self.exchange {
            exchange.publish(self.snapshot(now_ms, elapsed_us));
        }
        emitted
    }

    fn check_interlock(&mut self) -> Option<InterlockTrip> {
        // A zero-padded window reads low; wait for real samples.
        if !self.voltage.is_warm() {
            return None;
        }
        self.interlock.check(self.voltage.read())
    }

    fn on_trip<T: TelemetrySink>(&mut self, trip: InterlockTrip, sink: &mut T) {
        let neutral = self.config.pwm.neutral_us;
        self.io.write_pulse_width(neutral);
        self.stats.interlock_trips += 1;
        warn!(
            "voltage cutoff: {:.3} V <= {:.3} V, output forced to {} us",
            trip.voltage, trip.threshold, neutral
        );
        sink.reply(&format!(
            "Voltage cutoff at {:.3} V (threshold {:.3} V), PWM {}",
            trip.voltage, trip.threshold, neutral
        ));
        sink.event(&LoopEvent::InterlockTripped {
            voltage: trip.voltage,
            threshold: trip.threshold,
            pulse_width_us: neutral,
        });
    }

    fn handle_line<T: TelemetrySink>(&mut self, line: &str, sink: &mut T) {
        let outcome = line
            .parse::<Command>()
            .map_err(|e| e.to_string())
            .and_then(|cmd| {
                self.apply(cmd)
                    .map(|reply| (cmd, reply))
                    .map_err(|e| e.to_string())
            });

        match outcome {
            Ok((command, reply)) => {
                info!("command {} -> {}", command, reply);
                self.stats.commands_applied += 1;
                sink.reply(&reply);
                sink.event(&LoopEvent::CommandApplied { command, reply });
            }
            Err(error) => {
                warn!("rejected command {:?}: {}", line.trim(), error);
                self.stats.commands_rejected += 1;
                sink.reply(&format!("ERR {}", error));
                sink.event(&LoopEvent::CommandRejected {
                    line: line.trim().to_string(),
                    error,
                });
            }
        }
    }

    /// Apply a parsed command and produce its reply text.
    pub fn apply(&mut self, command: Command) -> Result<String, CalibrationError> {
        match command {
            Command::CalibrateCurrentZero => {
                let zero = self.io.calibrate_current_zero()?;
                Ok(format!("Current zero calibrated: {:.1}", zero))
            }
            Command::Tare => {
                self.io.tare_load();
                Ok("Tare done".to_string())
            }
            Command::SetLoadScale(scale) => {
                self.io.set_load_scale(scale)?;
                Ok(format!("Load scale set to {}", scale))
            }
            Command::SetBladeCount(n) => {
                self.blades = resolve_blades(n);
                Ok(format!("Blades set to {}", self.blades))
            }
            Command::CalibrateVoltage(reference) => {
                let per_count = self.io.calibrate_voltage(reference)?;
                Ok(format!("Voltage scale set to {:.6} V/count", per_count))
            }
            Command::ArmInterlock(threshold) => {
                self.interlock.arm(threshold);
                Ok(format!("Low-voltage limit armed at {:.3} V", threshold))
            }
            Command::SetPulseWidth(requested) => {
                let applied = self.config.pwm.clamp(requested);
                self.io.write_pulse_width(applied);
                Ok(applied.to_string())
            }
        }
    }

    fn record_at(&self, now_ms: u64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp_ms: now_ms,
            load_g: self.load.read(),
            current_a: self.current.read(),
            voltage_v: self.voltage.read(),
            rpm: self.rpm.rpm(self.blades),
            sequence: self.config.emit_sequence.then_some(self.sequence),
        }
    }

    fn snapshot(&self, now_ms: u64, iteration_us: u64) -> StandSnapshot {
        StandSnapshot {
            iteration: self.stats.iterations,
            iteration_us,
            record: self.record_at(now_ms),
            pulse_width_us: self.io.pulse_width(),
            blades: self.blades,
            interlock: self.interlock.state(),
            interlock_trips: self.interlock.trips(),
        }
    }

    fn emergency_stop(&mut self) {
        self.io.write_pulse_width(self.config.pwm.neutral_us);
    }

    /// Current averaged values, timestamped now.
    pub fn current_record(&self) -> TelemetryRecord {
        self.record_at(self.clock.now_ms())
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn interlock(&self) -> &SafetyInterlock {
        &self.interlock
    }

    pub fn blades(&self) -> u32 {
        self.blades
    }

    pub fn pulse_width(&self) -> u16 {
        self.io.pulse_width()
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Retune the telemetry cadence at runtime.
    pub fn set_telemetry_interval(&mut self, interval_ms: u64) {
        self.telemetry_gate.set_interval(interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulse::{EdgeHandle, PulseRegistry};
    use crate::timebase::ManualClock;

    /// Scripted sensors: each read pops the next queued value, then repeats
    /// the last one.
    #[derive(Default)]
    struct ScriptedStand {
        loads: VecDeque<f64>,
        voltages: VecDeque<f64>,
        last_voltage: f64,
        pulse_us: u16,
        load_reads: usize,
        tares: usize,
    }

    impl StandIO for ScriptedStand {
        fn read_load(&mut self) -> f64 {
            self.load_reads += 1;
            self.loads.pop_front().unwrap_or(0.0)
        }

        fn read_current(&mut self) -> f64 {
            1.5
        }

        fn read_voltage(&mut self) -> f64 {
            if let Some(v) = self.voltages.pop_front() {
                self.last_voltage = v;
            }
            self.last_voltage
        }

        fn tare_load(&mut self) {
            self.tares += 1;
        }

        fn set_load_scale(&mut self, scale: f64) -> Result<(), CalibrationError> {
            if scale == 0.0 {
                return Err(CalibrationError::InvalidScale(scale));
            }
            Ok(())
        }

        fn calibrate_current_zero(&mut self) -> Result<f64, CalibrationError> {
            Ok(511.0)
        }

        fn calibrate_voltage(&mut self, reference_volts: f64) -> Result<f64, CalibrationError> {
            Ok(reference_volts / 250.0)
        }

        fn write_pulse_width(&mut self, pulse_us: u16) {
            self.pulse_us = pulse_us;
        }

        fn pulse_width(&self) -> u16 {
            self.pulse_us
        }
    }

    fn config() -> ControlConfig {
        ControlConfig {
            load_interval_ms: 10,
            current_interval_ms: 10,
            voltage_interval_ms: 10,
            rpm_interval_ms: 100,
            telemetry_interval_ms: 20,
            idle_us: 0,
            ..ControlConfig::default()
        }
    }

    fn stand_loop(
        stand: ScriptedStand,
    ) -> (ControlLoop<ScriptedStand, ManualClock>, ManualClock, EdgeHandle) {
        let clock = ManualClock::new();
        let mut registry = PulseRegistry::<1>::new();
        let edge = registry.register(2, 0).unwrap();
        let pulses = registry.counter(2).unwrap();
        let lp = ControlLoop::new(stand, clock.clone(), config(), pulses);
        (lp, clock, edge)
    }

    fn queue(lines: &[&str]) -> VecDeque<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn interlock_forces_neutral_exactly_once() {
        let stand = ScriptedStand {
            voltages: VecDeque::from(vec![9.5, 9.5, 9.5, 8.0, 8.0]),
            ..Default::default()
        };
        let (mut lp, clock, _) = stand_loop(stand);
        let mut commands = queue(&["P 1500", "L 9.0"]);
        let mut out = Vec::new();

        // t=0: P 1500, t=10: L 9.0, t=20: third 9.5 sample, window warm.
        for _ in 0..3 {
            lp.step(&mut commands, &mut out);
            clock.advance_ms(10);
        }
        assert_eq!(lp.pulse_width(), 1_500);
        assert_eq!(lp.stats().interlock_trips, 0);

        // t=30: 8.0 pulls the average to exactly 9.0.
        lp.step(&mut commands, &mut out);
        clock.advance_ms(10);
        assert_eq!(lp.pulse_width(), 1_000);
        assert_eq!(lp.interlock().threshold(), None);
        assert!(out.iter().any(|l| l.starts_with("Voltage cutoff")));

        // t=40: operator throttles up again; 8.0 again must not re-trip.
        commands.push_back("P 1600".to_string());
        lp.step(&mut commands, &mut out);
        assert_eq!(lp.pulse_width(), 1_600);
        assert_eq!(lp.stats().interlock_trips, 1);
    }

    #[test]
    fn cold_voltage_window_does_not_trip() {
        let stand = ScriptedStand {
            voltages: VecDeque::from(vec![12.0]),
            ..Default::default()
        };
        let (mut lp, clock, _) = stand_loop(stand);
        let mut commands = queue(&["P 1400"]);
        let mut out = Vec::new();
        lp.interlock.arm(11.0);

        // One real sample plus two zero slots averages 4.0 V.
        lp.step(&mut commands, &mut out);
        assert_eq!(lp.pulse_width(), 1_400);
        clock.advance_ms(10);
        lp.step(&mut commands, &mut out);
        clock.advance_ms(10);
        lp.step(&mut commands, &mut out);
        assert_eq!(lp.pulse_width(), 1_400);
        assert_eq!(lp.interlock().threshold(), Some(11.0));
    }

    #[test]
    fn load_window_averages_three_samples() {
        let stand = ScriptedStand {
            loads: VecDeque::from(vec![100.0, 102.0, 98.0]),
            ..Default::default()
        };
        let (mut lp, clock, _) = stand_loop(stand);
        let mut commands = VecDeque::new();
        let mut out = Vec::new();
        for _ in 0..3 {
            lp.step(&mut commands, &mut out);
            clock.advance_ms(10);
        }
        assert_eq!(lp.current_record().load_g, 100.0);
        assert_eq!(lp.io().load_reads, 3);
    }

    #[test]
    fn channels_sample_only_on_their_cadence() {
        let (mut lp, clock, _) = stand_loop(ScriptedStand::default());
        let mut commands = VecDeque::new();
        let mut out = Vec::new();
        for _ in 0..100 {
            lp.step(&mut commands, &mut out);
            clock.advance_ms(1);
        }
        // 0..=99 ms at a 10 ms cadence.
        assert_eq!(lp.stats().load_samples, 10);
        assert_eq!(lp.stats().rpm_samples, 1);
        assert_eq!(lp.stats().telemetry_emitted, 5);
        assert_eq!(lp.stats().iterations, 100);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn telemetry_reports_rpm_per_blade() {
        let (mut lp, clock, edge) = stand_loop(ScriptedStand::default());
        let mut commands = queue(&["N 4"]);
        let mut out = Vec::new();

        lp.step(&mut commands, &mut out);
        for t in 0..100 {
            edge.on_edge(t * 1_000);
        }
        clock.advance_ms(100);
        lp.step(&mut commands, &mut out);

        // 100 pulses in 100 ms is 60 000 pulses/min, one slot of eight.
        assert_eq!(lp.blades(), 4);
        assert_eq!(lp.current_record().rpm, 60_000.0 / 8.0 / 4.0);
    }

    #[test]
    fn bad_commands_are_rejected_and_loop_continues() {
        let (mut lp, clock, _) = stand_loop(ScriptedStand::default());
        let mut commands = queue(&["X 1500", "S 0", "N 0", "99999"]);
        let mut out = Vec::new();
        for _ in 0..4 {
            lp.step(&mut commands, &mut out);
            clock.advance_ms(1);
        }
        assert!(out.contains(&"ERR unknown directive 'X'".to_string()));
        assert!(out.iter().any(|l| l.starts_with("ERR scale factor")));
        assert!(out.contains(&"Blades set to 2".to_string()));
        assert!(out.contains(&"2000".to_string()));
        assert_eq!(lp.stats().commands_rejected, 2);
        assert_eq!(lp.stats().commands_applied, 2);
    }

    #[test]
    fn calibration_commands_reach_the_stand() {
        let (mut lp, _, _) = stand_loop(ScriptedStand::default());
        assert_eq!(lp.apply(Command::Tare).unwrap(), "Tare done");
        assert_eq!(lp.io().tares, 1);
        assert_eq!(
            lp.apply(Command::CalibrateCurrentZero).unwrap(),
            "Current zero calibrated: 511.0"
        );
        assert_eq!(
            lp.apply(Command::CalibrateVoltage(12.5)).unwrap(),
            "Voltage scale set to 0.050000 V/count"
        );
        assert_eq!(
            lp.apply(Command::ArmInterlock(10.5)).unwrap(),
            "Low-voltage limit armed at 10.500 V"
        );
    }

    #[test]
    fn sequence_counter_increments_per_record() {
        let clock = ManualClock::new();
        let cfg = ControlConfig {
            emit_sequence: true,
            ..config()
        };
        let mut lp = ControlLoop::new(
            ScriptedStand::default(),
            clock.clone(),
            cfg,
            Arc::new(PulseCounter::new(0)),
        );
        let mut commands = VecDeque::new();
        let mut out = Vec::new();
        for _ in 0..3 {
            lp.step(&mut commands, &mut out);
            clock.advance_ms(20);
        }
        let seqs: Vec<&str> = out.iter().map(|l| l.rsplit(',').next().unwrap()).collect();
        assert_eq!(seqs, ["0", "1", "2"]);
    }

    #[test]
    fn config_from_partial_json() {
        let cfg = ControlConfig::from_json(r#"{"blades": 3, "pwm": {"min_us": 1100, "max_us": 1900, "neutral_us": 1100}}"#)
            .unwrap();
        assert_eq!(cfg.blades, 3);
        assert_eq!(cfg.pwm.min_us, 1_100);
        assert_eq!(cfg.telemetry_interval_ms, 100);
    }

    #[test]
    fn stop_flag_ends_run_at_neutral() {
        let (mut lp, _, _) = stand_loop(ScriptedStand::default());
        lp.apply(Command::SetPulseWidth(1_800)).unwrap();
        let stop = AtomicBool::new(true);
        lp.run(&mut VecDeque::new(), &mut Vec::new(), &stop);
        assert_eq!(lp.pulse_width(), 1_000);
    }

    #[test]
    fn inverted_pwm_config_is_rejected_and_never_panics() {
        let cfg = ControlConfig::from_json(
            r#"{"pwm": {"min_us": 2000, "max_us": 1000, "neutral_us": 1000}}"#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(PwmLimitsError::Inverted { .. })));

        let clock = ManualClock::new();
        let mut registry = PulseRegistry::<1>::new();
        registry.register(2, 0).unwrap();
        let pulses = registry.counter(2).unwrap();
        let mut lp = ControlLoop::new(ScriptedStand::default(), clock, cfg, pulses);
        let mut out = Vec::new();
        lp.step(&mut queue(&["P 1500"]), &mut out);
        assert_eq!(lp.pulse_width(), 1_000);
    }

    #[test]
    fn zero_blades_resolves_to_default() {
        assert_eq!(resolve_blades(0), DEFAULT_BLADES);
        assert_eq!(resolve_blades(3), 3);
    }
}
