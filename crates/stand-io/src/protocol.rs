//! Line protocol spoken over the serial link.
//!
//! The stand writes three kinds of lines: telemetry records, command
//! replies and interlock notices. Hosts tell them apart by shape only.

use serde::Serialize;
use stand_core::TelemetryRecord;

/// Longest line either side will buffer before discarding it.
pub const MAX_LINE_LEN: usize = 256;

pub const ERROR_PREFIX: &str = "ERR ";
pub const CUTOFF_PREFIX: &str = "Voltage cutoff";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum LinkLine {
    Telemetry(TelemetryRecord),
    Error(String),
    Cutoff(String),
    Reply(String),
}

impl LinkLine {
    /// Returns `None` for blank lines.
    pub fn classify(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
            return Some(LinkLine::Error(rest.to_string()));
        }
        if line.starts_with(CUTOFF_PREFIX) {
            return Some(LinkLine::Cutoff(line.to_string()));
        }
        // Replies never carry four separators; a record always does.
        if line.matches(',').count() >= 4 {
            if let Ok(record) = line.parse() {
                return Some(LinkLine::Telemetry(record));
            }
        }
        Some(LinkLine::Reply(line.to_string()))
    }

    pub fn telemetry(&self) -> Option<&TelemetryRecord> {
        match self {
            LinkLine::Telemetry(record) => Some(record),
            _ => None,
        }
    }
}

/// Splits a byte stream into newline-terminated lines.
///
/// Carriage returns are stripped and invalid UTF-8 is replaced. A line that
/// grows past `max_len` without a terminator is dropped up to its next
/// newline.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
    overflows: u64,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(4096)),
            max_len,
            discarding: false,
            overflows: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if !self.discarding {
                    let text = String::from_utf8_lossy(&self.buf);
                    let text = text.trim_end_matches('\r');
                    if !text.is_empty() {
                        lines.push(text.to_string());
                    }
                }
                self.buf.clear();
                self.discarding = false;
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.buf.len() >= self.max_len {
                self.buf.clear();
                self.discarding = true;
                self.overflows += 1;
                continue;
            }
            self.buf.push(b);
        }
        lines
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_LINE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_joins_partial_reads() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"P 15").is_empty());
        assert_eq!(framer.push(b"00\r\nT\n\n"), vec!["P 1500", "T"]);
    }

    #[test]
    fn framer_drops_oversized_line() {
        let mut framer = LineFramer::new(4);
        assert!(framer.push(b"123456789").is_empty());
        assert_eq!(framer.push(b"xx\nA\n"), vec!["A"]);
        assert_eq!(framer.overflows(), 1);
    }

    #[test]
    fn classify_shapes() {
        assert_eq!(LinkLine::classify("  \r\n"), None);
        assert_eq!(
            LinkLine::classify("ERR unknown directive 'Q'"),
            Some(LinkLine::Error("unknown directive 'Q'".into()))
        );
        assert_eq!(
            LinkLine::classify("1500"),
            Some(LinkLine::Reply("1500".into()))
        );
        assert!(matches!(
            LinkLine::classify("Voltage cutoff at 8.900 V (threshold 9.000 V), PWM 1000"),
            Some(LinkLine::Cutoff(_))
        ));
        let line = LinkLine::classify("1200,512.3,4.100,11.800,6000.000").unwrap();
        assert_eq!(line.telemetry().map(|r| r.timestamp_ms), Some(1_200));
    }
}
