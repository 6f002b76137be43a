//! Serial command directives.
//!
//! A command is one directive character, an optional numeric parameter and a
//! line terminator. The transport hands over whole lines, so whatever follows
//! the parameter is discarded with the terminator.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "directive", content = "value", rename_all = "snake_case")]
pub enum Command {
    /// `A`: re-zero the current sensor.
    CalibrateCurrentZero,
    /// `T`: tare the load cell.
    Tare,
    /// `S <float>`
    SetLoadScale(f64),
    /// `N <int>`: pulses per revolution; 0 selects the default.
    SetBladeCount(u32),
    /// `V <float>`: known pack voltage for deriving the ADC scale.
    CalibrateVoltage(f64),
    /// `L <float>`
    ArmInterlock(f64),
    /// `P <int>` or a bare integer. Clamped by the loop, not here.
    SetPulseWidth(i64),
}

impl Command {
    pub fn directive(&self) -> char {
        match self {
            Command::CalibrateCurrentZero => 'A',
            Command::Tare => 'T',
            Command::SetLoadScale(_) => 'S',
            Command::SetBladeCount(_) => 'N',
            Command::CalibrateVoltage(_) => 'V',
            Command::ArmInterlock(_) => 'L',
            Command::SetPulseWidth(_) => 'P',
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CalibrateCurrentZero | Command::Tare => write!(f, "{}", self.directive()),
            Command::SetLoadScale(v) | Command::CalibrateVoltage(v) | Command::ArmInterlock(v) => {
                write!(f, "{} {}", self.directive(), v)
            }
            Command::SetBladeCount(n) => write!(f, "N {}", n),
            Command::SetPulseWidth(us) => write!(f, "P {}", us),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown directive '{0}'")]
    UnknownDirective(char),
    #[error("directive '{0}' needs a numeric parameter")]
    MissingParameter(char),
    #[error("directive '{directive}' cannot use parameter '{raw}'")]
    InvalidParameter { directive: char, raw: String },
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut chars = line.chars();
        let directive = chars.next().ok_or(CommandError::Empty)?;

        // Bare numbers keep working as pulse widths.
        if directive.is_ascii_digit() || directive == '-' || directive == '+' {
            return parse_param(directive, line).map(Command::SetPulseWidth);
        }

        let rest = chars.as_str();
        match directive {
            'A' => Ok(Command::CalibrateCurrentZero),
            'T' => Ok(Command::Tare),
            'S' => parse_finite(directive, rest).map(Command::SetLoadScale),
            'N' => parse_param(directive, rest).map(Command::SetBladeCount),
            'V' => parse_finite(directive, rest).map(Command::CalibrateVoltage),
            'L' => parse_finite(directive, rest).map(Command::ArmInterlock),
            'P' => parse_param(directive, rest).map(Command::SetPulseWidth),
            other => Err(CommandError::UnknownDirective(other)),
        }
    }
}

/// Parses the first whitespace-separated token after the directive.
fn parse_param<T: FromStr>(directive: char, rest: &str) -> Result<T, CommandError> {
    let token = rest
        .split_whitespace()
        .next()
        .ok_or(CommandError::MissingParameter(directive))?;
    token.parse().map_err(|_| CommandError::InvalidParameter {
        directive,
        raw: token.to_string(),
    })
}

fn parse_finite(directive: char, rest: &str) -> Result<f64, CommandError> {
    let value: f64 = parse_param(directive, rest)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CommandError::InvalidParameter {
            directive,
            raw: value.to_string(),
        })
    }
}
