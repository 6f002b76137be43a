//! Sampling and control core of a propeller thrust stand.
//!
//! Everything here is single-threaded and cooperative except the pulse
//! counter, which is shared with an edge context.

pub mod averager;
pub mod cadence;
pub mod calibration;
pub mod channel;
pub mod command;
pub mod control_loop;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod interlock;
pub mod pulse;
mod sampling_proptest;
pub mod sync;
pub mod telemetry;
pub mod timebase;

pub use averager::BoundedAverager;
pub use cadence::CadenceGate;
pub use calibration::{CalibrationError, CurrentCalibration, LoadCalibration, VoltageCalibration};
pub use channel::SampledChannel;
pub use command::{Command, CommandError};
pub use control_loop::{
    resolve_blades, CommandSource, ControlConfig, ControlLoop, ExecutionStats, LoopEvent,
    TelemetrySink, DEFAULT_BLADES,
};
pub use hal::{PwmLimits, PwmLimitsError, StandIO};
#[cfg(feature = "simulation")]
pub use hal_sim::{PropModel, ShaftProbe, SimulatedStand, TachometerSim};
pub use interlock::{InterlockState, InterlockTrip, SafetyInterlock};
pub use pulse::{EdgeHandle, PulseCounter, PulseRegistry, RegistryError, RpmChannel};
pub use sync::{StandSnapshot, TelemetryExchange};
pub use telemetry::{PowerSample, TelemetryParseError, TelemetryRecord};
pub use timebase::{Clock, ManualClock, TimeBase};
