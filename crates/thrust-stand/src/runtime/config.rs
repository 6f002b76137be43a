use stand_core::{ControlConfig, PwmLimitsError};
use stand_io::{SweepError, SweepPlan};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("option {0} needs a value")]
    MissingValue(&'static str),
    #[error("option {flag} cannot use '{raw}'")]
    InvalidValue { flag: &'static str, raw: String },
    #[error("unknown option '{0}'")]
    UnknownFlag(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid control config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid pwm limits: {0}")]
    PwmLimits(#[from] PwmLimitsError),
    #[error(transparent)]
    Sweep(#[from] SweepError),
}

/// Host-side sweep against a running stand.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepArgs {
    pub connect: String,
    pub plan: SweepPlan,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    /// Read commands from standard input and print replies to standard output.
    pub stdin_link: bool,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub control_path: Option<PathBuf>,
    pub blades: Option<u32>,
    pub emit_sequence: bool,
    pub telemetry_interval_ms: Option<u64>,
    pub sweep: Option<SweepArgs>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            stdin_link: false,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            control_path: None,
            blades: None,
            emit_sequence: false,
            telemetry_interval_ms: None,
            sweep: None,
        }
    }
}

fn value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &'static str,
) -> Result<&'a str, ConfigError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or(ConfigError::MissingValue(flag))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &'static str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag,
        raw: raw.to_string(),
    })
}

/// `START:END:STEP` in microseconds.
fn sweep_range(raw: &str) -> Result<(u16, u16, u16), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        flag: "--sweep",
        raw: raw.to_string(),
    };
    let parts: Vec<&str> = raw.split(':').collect();
    let [start, end, step] = parts.as_slice() else {
        return Err(invalid());
    };
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());
    Ok((parse(*start)?, parse(*end)?, parse(*step)?))
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut sweep_range_arg: Option<(u16, u16, u16)> = None;
        let mut connect: Option<String> = None;
        let mut settle_ms: Option<u64> = None;
        let mut sweep_out: Option<PathBuf> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--run-seconds" => {
                    let flag = "--run-seconds";
                    cfg.run_seconds = Some(number(value(args, &mut i, flag)?, flag)?);
                }
                "--bind" => {
                    cfg.bind_addr = value(args, &mut i, "--bind")?.to_string();
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--stdin" => {
                    cfg.stdin_link = true;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, &mut i, "--log-dir")?));
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, &mut i, "--metrics-addr")?.to_string());
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, &mut i, "--audit-log")?));
                }
                "--config" => {
                    cfg.control_path = Some(PathBuf::from(value(args, &mut i, "--config")?));
                }
                "--blades" => {
                    cfg.blades = Some(number(value(args, &mut i, "--blades")?, "--blades")?);
                }
                "--sequence" => {
                    cfg.emit_sequence = true;
                }
                "--telemetry-interval-ms" => {
                    let flag = "--telemetry-interval-ms";
                    cfg.telemetry_interval_ms = Some(number(value(args, &mut i, flag)?, flag)?);
                }
                "--sweep" => {
                    sweep_range_arg = Some(sweep_range(value(args, &mut i, "--sweep")?)?);
                }
                "--connect" => {
                    connect = Some(value(args, &mut i, "--connect")?.to_string());
                }
                "--settle-ms" => {
                    settle_ms = Some(number(value(args, &mut i, "--settle-ms")?, "--settle-ms")?);
                }
                "--sweep-out" => {
                    sweep_out = Some(PathBuf::from(value(args, &mut i, "--sweep-out")?));
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
            i += 1;
        }

        if let Some((start, end, step)) = sweep_range_arg {
            let mut plan = SweepPlan::new(start, end, step)?;
            if let Some(ms) = settle_ms {
                plan = plan.with_settle(Duration::from_millis(ms));
            }
            cfg.sweep = Some(SweepArgs {
                connect: connect.unwrap_or_else(|| cfg.bind_addr.clone()),
                plan,
                output: sweep_out,
            });
        }
        Ok(cfg)
    }

    /// Loop configuration: the `--config` file if given, then CLI overrides.
    pub fn control_config(&self) -> Result<ControlConfig, ConfigError> {
        let mut control = match &self.control_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                ControlConfig::from_json(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => ControlConfig::default(),
        };
        if let Some(blades) = self.blades {
            control.blades = blades;
        }
        if self.emit_sequence {
            control.emit_sequence = true;
        }
        if let Some(ms) = self.telemetry_interval_ms {
            control.telemetry_interval_ms = ms;
        }
        control.validate()?;
        Ok(control)
    }

    pub fn print_help() {
        println!(
            r#"thrust-stand - propeller thrust stand controller

USAGE:
    thrust-stand [OPTIONS]
    thrust-stand --sweep <START:END:STEP> [--connect <ADDR>] [--settle-ms <MS>] [--sweep-out <PATH>]

OPTIONS:
    --bind <ADDR>                 Serial link TCP bind address [default: 127.0.0.1:7000]
    --no-bridge                   Disable the TCP link (standalone simulation)
    --stdin                       Read commands from stdin, write link output to stdout
    --run-seconds <SECS>          Run for a fixed duration then exit
    --json-logs                   Output logs in JSON format
    --log-dir <PATH>              Also write a daily-rolling session log to this directory
    --metrics-addr <ADDR>         Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>            Enable audit logging to specified JSONL file
    --config <PATH>               Control loop settings (JSON; missing fields use defaults)
    --blades <N>                  Tachometer pulses per revolution [default: 2]
    --sequence                    Append a sequence counter to every telemetry record
    --telemetry-interval-ms <MS>  Telemetry record interval [default: 100]
    -h, --help                    Print this help message

SWEEP (host mode, talks to a running stand):
    --sweep <START:END:STEP>      Pulse widths in microseconds, within 1000..=2000
    --connect <ADDR>              Stand link address [default: the --bind address]
    --settle-ms <MS>              Wait after each step before sampling [default: 500]
    --sweep-out <PATH>            Write the measured points as CSV

ENVIRONMENT VARIABLES:
    RUST_LOG                      Set log filter (e.g., RUST_LOG=debug,stand_core=trace)

EXAMPLES:
    # Simulated stand with metrics and an audit trail
    thrust-stand --metrics-addr 0.0.0.0:9090 --audit-log logs/audit.jsonl

    # Drive the stand by hand
    thrust-stand --no-bridge --stdin

    # Sweep a running stand and save the curve
    thrust-stand --sweep 1000:2000:100 --sweep-out sweep.csv
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("thrust-stand")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[])).unwrap();
        assert!(cfg.bridge_enabled);
        assert_eq!(cfg.bind_addr, "127.0.0.1:7000");
        assert!(cfg.sweep.is_none());
        assert_eq!(cfg.control_config().unwrap(), ControlConfig::default());
    }

    #[test]
    fn overrides_reach_control_config() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--blades",
            "3",
            "--sequence",
            "--telemetry-interval-ms",
            "50",
            "--no-bridge",
            "--stdin",
        ]))
        .unwrap();
        assert!(!cfg.bridge_enabled);
        assert!(cfg.stdin_link);
        let control = cfg.control_config().unwrap();
        assert_eq!(control.blades, 3);
        assert!(control.emit_sequence);
        assert_eq!(control.telemetry_interval_ms, 50);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--bind"])),
            Err(ConfigError::MissingValue("--bind"))
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--blades", "two"])),
            Err(ConfigError::InvalidValue { flag: "--blades", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--frobnicate"])),
            Err(ConfigError::UnknownFlag(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--sweep", "900:2000:100"])),
            Err(ConfigError::Sweep(SweepError::OutOfRange(900)))
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--sweep", "1000-2000"])),
            Err(ConfigError::InvalidValue { flag: "--sweep", .. })
        ));
    }

    #[test]
    fn sweep_connects_to_bind_address_by_default() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:7100",
            "--sweep",
            "1000:1400:200",
            "--settle-ms",
            "50",
        ]))
        .unwrap();
        let sweep = cfg.sweep.unwrap();
        assert_eq!(sweep.connect, "127.0.0.1:7100");
        assert_eq!(sweep.plan.settle, Duration::from_millis(50));
        assert_eq!(sweep.plan.steps().count(), 3);
    }

    #[test]
    fn control_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, r#"{"rpm_interval_ms": 500, "blades": 4}"#).unwrap();
        let cfg = RuntimeConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--blades",
            "6",
        ]))
        .unwrap();
        let control = cfg.control_config().unwrap();
        assert_eq!(control.rpm_interval_ms, 500);
        assert_eq!(control.blades, 6);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            cfg.control_config(),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn inverted_pwm_limits_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(
            &path,
            r#"{"pwm": {"min_us": 2000, "max_us": 1000, "neutral_us": 1000}}"#,
        )
        .unwrap();
        let cfg = RuntimeConfig::from_args(&args(&["--config", path.to_str().unwrap()])).unwrap();
        assert!(matches!(
            cfg.control_config(),
            Err(ConfigError::PwmLimits(PwmLimitsError::Inverted { .. }))
        ));
    }
}
