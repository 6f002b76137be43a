//! Audit trail for operator actions and interlock events.
//!
//! One JSON object per line: start and shutdown, every command the loop
//! applied or rejected, interlock arming and trips.

use serde::{Deserialize, Serialize};
use stand_core::{Command, LoopEvent};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// Pulse width or blade count changed
    CommandApplied,
    CommandRejected,
    /// Tare, scale, current zero or voltage reference
    CalibrationChanged,
    InterlockArmed,
    /// Output forced to neutral on low voltage
    InterlockTripped,
}

impl AuditEventType {
    pub fn for_loop_event(event: &LoopEvent) -> Self {
        match event {
            LoopEvent::CommandApplied { command, .. } => match command {
                Command::ArmInterlock(_) => AuditEventType::InterlockArmed,
                Command::CalibrateCurrentZero
                | Command::Tare
                | Command::SetLoadScale(_)
                | Command::CalibrateVoltage(_) => AuditEventType::CalibrationChanged,
                Command::SetBladeCount(_) | Command::SetPulseWidth(_) => {
                    AuditEventType::CommandApplied
                }
            },
            LoopEvent::CommandRejected { .. } => AuditEventType::CommandRejected,
            LoopEvent::InterlockTripped { .. } => AuditEventType::InterlockTripped,
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` for appending, creating parent directories.
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("audit writer poisoned"))?;
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }

    pub fn log_loop_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event: &LoopEvent,
    ) -> io::Result<()> {
        let details = serde_json::to_value(event)?;
        self.log_event(
            timestamp_us,
            unix_us,
            AuditEventType::for_loop_event(event),
            details,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                1000,
                1704067200000000,
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        logger
            .log_loop_event(
                2000,
                1704067201000000,
                &LoopEvent::InterlockTripped {
                    voltage: 8.9,
                    threshold: 9.0,
                    pulse_width_us: 1000,
                },
            )
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::SystemStart);

        let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.timestamp_us, 2000);
        assert_eq!(second.event_type, AuditEventType::InterlockTripped);
        assert_eq!(second.details["event"], "interlock_tripped");
        assert_eq!(second.details["pulse_width_us"], 1000);
    }

    #[test]
    fn commands_map_to_event_types() {
        let applied = |command| LoopEvent::CommandApplied {
            command,
            reply: String::new(),
        };
        assert_eq!(
            AuditEventType::for_loop_event(&applied(Command::ArmInterlock(9.0))),
            AuditEventType::InterlockArmed
        );
        assert_eq!(
            AuditEventType::for_loop_event(&applied(Command::Tare)),
            AuditEventType::CalibrationChanged
        );
        assert_eq!(
            AuditEventType::for_loop_event(&applied(Command::SetPulseWidth(1500))),
            AuditEventType::CommandApplied
        );
        assert_eq!(
            AuditEventType::for_loop_event(&LoopEvent::CommandRejected {
                line: "Q".into(),
                error: "unknown directive 'Q'".into(),
            }),
            AuditEventType::CommandRejected
        );
    }

    #[test]
    fn appends_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        for ts in [1, 2] {
            let logger = AuditLogger::new(&path).unwrap();
            logger
                .log_event(ts, 0, AuditEventType::SystemShutdown, serde_json::json!({}))
                .unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}
