//! Stepped pulse-width sweep driven from the host side of the link.

use crate::protocol::{LinkLine, LineFramer, MAX_LINE_LEN};
use serde::Serialize;
use stand_core::{PowerSample, TelemetryRecord};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

pub const SWEEP_MIN_US: u16 = 1_000;
pub const SWEEP_MAX_US: u16 = 2_000;

/// Lines read while looking for the first record after a step.
const MAX_LINES_PER_STEP: usize = 32;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("pulse width {0} us is outside {SWEEP_MIN_US}..={SWEEP_MAX_US}")]
    OutOfRange(u16),
    #[error("start {start} us is above end {end} us")]
    Reversed { start: u16, end: u16 },
    #[error("increment must be non-zero")]
    ZeroIncrement,
    #[error("link error: {0}")]
    Link(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    pub start_us: u16,
    pub end_us: u16,
    pub increment_us: u16,
    /// Wait after each step before sampling.
    pub settle: Duration,
    /// Wait after the tare before the first step.
    pub tare_settle: Duration,
}

impl SweepPlan {
    pub fn new(start_us: u16, end_us: u16, increment_us: u16) -> Result<Self, SweepError> {
        for pwm in [start_us, end_us] {
            if !(SWEEP_MIN_US..=SWEEP_MAX_US).contains(&pwm) {
                return Err(SweepError::OutOfRange(pwm));
            }
        }
        if start_us > end_us {
            return Err(SweepError::Reversed {
                start: start_us,
                end: end_us,
            });
        }
        if increment_us == 0 {
            return Err(SweepError::ZeroIncrement);
        }
        Ok(Self {
            start_us,
            end_us,
            increment_us,
            settle: Duration::from_millis(500),
            tare_settle: Duration::from_secs(2),
        })
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_tare_settle(mut self, tare_settle: Duration) -> Self {
        self.tare_settle = tare_settle;
        self
    }

    /// Pulse widths in order, `end_us` included when the increment lands on it.
    pub fn steps(&self) -> impl Iterator<Item = u16> {
        (self.start_us..=self.end_us).step_by(self.increment_us as usize)
    }
}

/// Host end of a line-oriented link.
pub trait LinkPort {
    fn send_line(&mut self, line: &str) -> io::Result<()>;
    /// Throw away anything received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
    /// Next complete line, or `None` on timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// [`LinkPort`] over the stand's TCP bridge.
pub struct TcpLink {
    stream: TcpStream,
    framer: LineFramer,
    pending: std::collections::VecDeque<String>,
    read_timeout: Duration,
}

impl TcpLink {
    pub fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            framer: LineFramer::new(MAX_LINE_LEN),
            pending: Default::default(),
            read_timeout,
        })
    }
}

impl LinkPort for TcpLink {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.framer.clear();
        self.stream.set_nonblocking(true)?;
        let mut temp = [0u8; 1024];
        let result = loop {
            match self.stream.read(&mut temp) {
                Ok(0) => break Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let deadline = Instant::now() + self.read_timeout;
        let mut temp = [0u8; 1024];
        while self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut temp) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.pending.extend(self.framer.push(&temp[..n])),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.pending.pop_front())
    }
}

/// One measured operating point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub pulse_width_us: u16,
    pub record: TelemetryRecord,
    pub power: PowerSample,
}

impl SweepPoint {
    pub const CSV_HEADER: &'static str =
        "pwm_us,timestamp_ms,thrust_g,current_a,voltage_v,rpm,power_w,efficiency_g_per_w";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{:.1},{:.3},{:.3},{:.3},{:.3},{:.3}",
            self.pulse_width_us,
            self.record.timestamp_ms,
            self.record.load_g,
            self.record.current_a,
            self.record.voltage_v,
            self.record.rpm,
            self.power.power_w,
            self.power.efficiency_g_per_w
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub points: Vec<SweepPoint>,
    /// Steps where no record arrived in time.
    pub skipped: Vec<u16>,
}

impl SweepReport {
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "{}", SweepPoint::CSV_HEADER)?;
        for point in &self.points {
            writeln!(out, "{}", point.csv_row())?;
        }
        out.flush()
    }
}

/// Tare, step through the plan, then command the output back to neutral.
///
/// `P 0` is sent even when a step fails; the stand clamps it to its minimum.
pub fn run_sweep<P: LinkPort>(plan: &SweepPlan, port: &mut P) -> Result<SweepReport, SweepError> {
    let result = sweep_steps(plan, port);
    if let Err(err) = port.send_line("P 0") {
        warn!(error = %err, "Failed to return output to neutral");
    }
    result
}

fn sweep_steps<P: LinkPort>(plan: &SweepPlan, port: &mut P) -> Result<SweepReport, SweepError> {
    port.send_line("T")?;
    std::thread::sleep(plan.tare_settle);

    let mut report = SweepReport::default();
    for pwm in plan.steps() {
        port.send_line(&format!("P {}", pwm))?;
        std::thread::sleep(plan.settle);
        port.discard_input()?;

        match next_record(port)? {
            Some(record) => {
                let power = PowerSample::from_record(&record);
                info!(
                    pwm,
                    thrust_g = record.load_g,
                    rpm = record.rpm,
                    power_w = power.power_w,
                    "Sweep point"
                );
                report.points.push(SweepPoint {
                    pulse_width_us: pwm,
                    record,
                    power,
                });
            }
            None => {
                warn!(pwm, "No telemetry after step, skipping");
                report.skipped.push(pwm);
            }
        }
    }
    Ok(report)
}

fn next_record<P: LinkPort>(port: &mut P) -> io::Result<Option<TelemetryRecord>> {
    for _ in 0..MAX_LINES_PER_STEP {
        let Some(line) = port.read_line()? else {
            return Ok(None);
        };
        if let Some(LinkLine::Telemetry(record)) = LinkLine::classify(&line) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}
