use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockState {
    #[default]
    Disarmed,
    Armed,
}

impl InterlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterlockState::Disarmed => "disarmed",
            InterlockState::Armed => "armed",
        }
    }
}

/// Emitted once when the interlock fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InterlockTrip {
    pub voltage: f64,
    pub threshold: f64,
}

/// One-shot low-voltage latch.
///
/// Once the voltage average falls to or below the armed threshold the caller
/// is told to force the actuator to neutral and the latch disarms itself. It
/// stays quiet until re-armed.
///
/// `ControlLoop` only consults the latch once its voltage window holds
/// `VOLTAGE_WINDOW` real samples, so after boot a trip can land up to one
/// window of voltage samples late.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyInterlock {
    threshold: Option<f64>,
    trips: u64,
}

impl SafetyInterlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, threshold_volts: f64) {
        self.threshold = threshold_volts.is_finite().then_some(threshold_volts);
    }

    pub fn disarm(&mut self) {
        self.threshold = None;
    }

    pub fn state(&self) -> InterlockState {
        if self.threshold.is_some() {
            InterlockState::Armed
        } else {
            InterlockState::Disarmed
        }
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn check(&mut self, voltage: f64) -> Option<InterlockTrip> {
        let threshold = self.threshold?;
        if voltage <= threshold {
            self.threshold = None;
            self.trips += 1;
            Some(InterlockTrip { voltage, threshold })
        } else {
            None
        }
    }
}
