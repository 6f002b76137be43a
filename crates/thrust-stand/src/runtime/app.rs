use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::{ConfigError, RuntimeConfig, SweepArgs};
use crate::runtime::logging::{init_tracing, LINK_TARGET};
use crate::runtime::telemetry;
use stand_core::{
    resolve_blades, Clock, ControlLoop, ExecutionStats, LoopEvent, PulseRegistry, RegistryError,
    SimulatedStand, StandIO, TachometerSim, TelemetryExchange, TelemetryRecord, TelemetrySink,
    TimeBase,
};
use stand_io::metrics::{COMMANDS_APPLIED, COMMANDS_REJECTED, TELEMETRY_RECORDS};
use stand_io::{run_sweep, BridgeConfig, BridgeError, SerialBridge, SweepError, TcpLink};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Sender};
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Tachometer pins the host can bind.
const PULSE_SLOTS: usize = 4;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("tachometer setup failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sweep failed: {0}")]
    Sweep(#[from] SweepError),
    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}\n\nRun with --help for usage.", e);
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::Config(e)) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "thrust-stand failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    match &config.sweep {
        Some(sweep) => run_host_sweep(sweep),
        None => run_stand(&config),
    }
}

fn run_host_sweep(sweep: &SweepArgs) -> Result<(), AppError> {
    info!(
        addr = %sweep.connect,
        start_us = sweep.plan.start_us,
        end_us = sweep.plan.end_us,
        increment_us = sweep.plan.increment_us,
        "Starting PWM sweep"
    );
    let read_timeout = sweep.plan.settle.max(Duration::from_secs(1));
    let mut link = TcpLink::connect(&sweep.connect, read_timeout)?;
    let report = run_sweep(&sweep.plan, &mut link)?;

    match &sweep.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            report.write_csv(io::BufWriter::new(std::fs::File::create(path)?))?;
            info!(path = %path.display(), points = report.points.len(), "Sweep saved");
        }
        None => report.write_csv(io::stdout().lock())?,
    }
    if !report.skipped.is_empty() {
        warn!(skipped = ?report.skipped, "Some steps produced no telemetry");
    }
    Ok(())
}

/// Routes loop output to the link, metrics and the audit trail.
struct LinkSink {
    outbound: Option<Sender<String>>,
    echo_stdout: bool,
    audit: Option<Arc<AuditLogger>>,
    timebase: TimeBase,
}

impl LinkSink {
    fn write_line(&mut self, line: String) {
        debug!(target: LINK_TARGET, line = %line, "tx");
        if self.echo_stdout {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
        if let Some(tx) = &self.outbound {
            if tx.send(line).is_err() {
                warn!("Link output closed");
                self.outbound = None;
            }
        }
    }
}

impl TelemetrySink for LinkSink {
    fn record(&mut self, record: &TelemetryRecord) {
        TELEMETRY_RECORDS.inc();
        self.write_line(record.to_string());
    }

    fn reply(&mut self, line: &str) {
        self.write_line(line.to_string());
    }

    fn event(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::CommandApplied { .. } => COMMANDS_APPLIED.inc(),
            LoopEvent::CommandRejected { .. } => COMMANDS_REJECTED.inc(),
            LoopEvent::InterlockTripped { .. } => {}
        }
        if let Some(audit) = &self.audit {
            if let Err(e) =
                audit.log_loop_event(self.timebase.now_us(), self.timebase.unix_us(), event)
            {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }
}

fn run_stand(config: &RuntimeConfig) -> Result<(), AppError> {
    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let control = config.control_config()?;
    let exchange = Arc::new(TelemetryExchange::new());
    let timebase = TimeBase::new();
    let stop = Arc::new(AtomicBool::new(false));

    let audit = init_audit_logger(config.audit_path.as_ref())?;
    if let Some(logger) = &audit {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": metrics_enabled,
                "control": &control,
            }),
        );
    }

    // Bind before any thread starts so a taken port fails cleanly.
    let bridge = if config.bridge_enabled {
        let bridge = SerialBridge::bind(BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            ..BridgeConfig::default()
        })?;
        info!(addr = %bridge.local_addr()?, "Starting serial bridge");
        Some(bridge)
    } else {
        None
    };

    let mut registry = PulseRegistry::<PULSE_SLOTS>::new();
    let edge = registry.register(control.tach_pin, control.debounce_us)?;
    let pulses = registry
        .counter(control.tach_pin)
        .ok_or(RegistryError::Full {
            capacity: PULSE_SLOTS,
        })?;

    let stand = SimulatedStand::new(control.pwm);
    let tach = TachometerSim::new(stand.probe(), resolve_blades(control.blades));
    let tach_handle = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || tach.run(&edge, &timebase, &stop))
    };

    let (cmd_tx, cmd_rx) = mpsc::channel::<String>();
    let (out_tx, out_rx) = mpsc::channel::<String>();

    let bridge_handle = match bridge {
        Some(bridge) => {
            let inbound = cmd_tx.clone();
            let stop = Arc::clone(&stop);
            Some(thread::spawn(move || bridge.run(inbound, out_rx, stop)))
        }
        None => {
            info!("Bridge disabled");
            None
        }
    };

    if config.stdin_link {
        spawn_stdin_reader(cmd_tx.clone());
    }
    drop(cmd_tx);

    let updater_handle = telemetry::start_metrics_updater(Arc::clone(&exchange), Arc::clone(&stop));

    info!(
        blades = resolve_blades(control.blades),
        telemetry_interval_ms = control.telemetry_interval_ms,
        debounce_us = control.debounce_us,
        min_us = control.pwm.min_us,
        max_us = control.pwm.max_us,
        "Starting control loop"
    );

    let loop_handle = {
        let stop = Arc::clone(&stop);
        let exchange = Arc::clone(&exchange);
        let mut sink = LinkSink {
            outbound: config.bridge_enabled.then_some(out_tx),
            echo_stdout: config.stdin_link,
            audit: audit.clone(),
            timebase,
        };
        thread::spawn(move || {
            let mut commands = cmd_rx;
            let mut control_loop =
                ControlLoop::new(stand, timebase, control, pulses).with_exchange(exchange);
            control_loop.run(&mut commands, &mut sink, &stop);
            if !control_loop.io().is_healthy() {
                warn!("Stand reported unhealthy at shutdown");
            }
            control_loop.stats().clone()
        })
    };

    info!("Thrust stand running. Connect to the link to send commands.");

    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
        thread::sleep(Duration::from_secs(seconds));
        stop.store(true, Ordering::Relaxed);
    }

    let stats = loop_handle
        .join()
        .map_err(|_| AppError::ThreadPanic("control loop"))?;
    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = bridge_handle {
        if let Ok(bridge_stats) = handle.join() {
            info!(
                sessions = bridge_stats.sessions,
                lines_in = bridge_stats.lines_in,
                lines_out = bridge_stats.lines_out,
                lines_dropped = bridge_stats.lines_dropped,
                "Bridge stopped"
            );
        }
    }
    let _ = tach_handle.join();
    let _ = updater_handle.join();

    log_run_complete(&stats);
    if let Some(logger) = &audit {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemShutdown,
            serde_json::json!({ "stats": stats }),
        );
    }
    Ok(())
}

fn log_run_complete(stats: &ExecutionStats) {
    info!(
        iterations = stats.iterations,
        telemetry_emitted = stats.telemetry_emitted,
        commands_applied = stats.commands_applied,
        commands_rejected = stats.commands_rejected,
        interlock_trips = stats.interlock_trips,
        max_iteration_us = stats.max_iteration_us,
        "Run complete"
    );
}

/// Blocking stdin reader; never joined, it ends with the process.
fn spawn_stdin_reader(commands: Sender<String>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            debug!(target: LINK_TARGET, line = %line, "rx");
            if commands.send(line).is_err() {
                break;
            }
        }
    });
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = audit_path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}
