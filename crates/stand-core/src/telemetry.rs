use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One periodic emission of every averaged channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp_ms: u64,
    pub load_g: f64,
    pub current_a: f64,
    pub voltage_v: f64,
    /// Averaged pulse rate divided by the blade count.
    pub rpm: f64,
    pub sequence: Option<u64>,
}

/// CSV line: `timestamp_ms,load,current,voltage,rpm[,sequence]`.
impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.1},{:.3},{:.3},{:.3}",
            self.timestamp_ms, self.load_g, self.current_a, self.voltage_v, self.rpm
        )?;
        if let Some(seq) = self.sequence {
            write!(f, ",{}", seq)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryParseError {
    #[error("expected at least 5 fields, found {0}")]
    TooFewFields(usize),
    #[error("field {field} is not numeric: '{raw}'")]
    InvalidField { field: &'static str, raw: String },
}

const FIELD_NAMES: [&str; 6] = ["timestamp_ms", "load", "current", "voltage", "rpm", "sequence"];

impl FromStr for TelemetryRecord {
    type Err = TelemetryParseError;

    /// Lenient in the same way the bench monitor is: characters other than
    /// digits, separators, signs and spaces are dropped, and only the first
    /// token of each field is read, so unit suffixes are tolerated.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let cleaned: String = line
            .chars()
            .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-' | ' '))
            .collect();
        let fields: Vec<&str> = cleaned.split(',').collect();
        if fields.len() < 5 {
            return Err(TelemetryParseError::TooFewFields(fields.len()));
        }

        let timestamp_ms = parse_field(fields[0], 0)?;
        let load_g = parse_field(fields[1], 1)?;
        let current_a = parse_field(fields[2], 2)?;
        let voltage_v = parse_field(fields[3], 3)?;
        let rpm = parse_field(fields[4], 4)?;
        let sequence = match fields.get(5) {
            Some(raw) if !raw.trim().is_empty() => Some(parse_field(raw, 5)?),
            _ => None,
        };

        Ok(Self {
            timestamp_ms,
            load_g,
            current_a,
            voltage_v,
            rpm,
            sequence,
        })
    }
}

fn parse_field<T: FromStr>(raw: &str, index: usize) -> Result<T, TelemetryParseError> {
    let token = raw.split_whitespace().next().unwrap_or("");
    token.parse().map_err(|_| TelemetryParseError::InvalidField {
        field: FIELD_NAMES[index],
        raw: raw.trim().to_string(),
    })
}

/// Electrical power and propulsive efficiency derived from one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PowerSample {
    pub power_w: f64,
    /// Grams of thrust per watt.
    pub efficiency_g_per_w: f64,
}

impl PowerSample {
    const MIN_CURRENT_A: f64 = 0.001;
    const MIN_POWER_W: f64 = 0.001;

    pub fn from_record(record: &TelemetryRecord) -> Self {
        let power_w = if record.current_a >= Self::MIN_CURRENT_A {
            record.voltage_v * record.current_a
        } else {
            0.0
        };
        let efficiency_g_per_w = if power_w >= Self::MIN_POWER_W {
            record.load_g / power_w
        } else {
            0.0
        };
        Self {
            power_w,
            efficiency_g_per_w,
        }
    }
}
