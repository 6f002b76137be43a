use crate::averager::BoundedAverager;
use crate::cadence::CadenceGate;

/// One periodically sampled quantity: a cadence gate feeding an averager.
///
/// The channel does not own its sensor. `tick` is handed a reading closure
/// and calls it only when the gate opens, so readers of `read()` never cause
/// extra sensor traffic.
#[derive(Debug, Clone, Copy)]
pub struct SampledChannel<const N: usize> {
    gate: CadenceGate,
    averager: BoundedAverager<N>,
    samples: u64,
}

impl<const N: usize> SampledChannel<N> {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            gate: CadenceGate::new(interval_ms),
            averager: BoundedAverager::new(),
            samples: 0,
        }
    }

    /// Returns true when a fresh sample was taken.
    pub fn tick<F>(&mut self, now_ms: u64, read: F) -> bool
    where
        F: FnOnce() -> f64,
    {
        if !self.gate.ready(now_ms) {
            return false;
        }
        self.averager.add_sample(read());
        self.samples += 1;
        true
    }

    pub fn read(&self) -> f64 {
        self.averager.value()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn interval_ms(&self) -> u64 {
        self.gate.interval_ms()
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.gate.set_interval(interval_ms);
    }

    /// True once the averager window holds only real samples.
    pub fn is_warm(&self) -> bool {
        self.averager.is_warm()
    }
}
