//! Tachometer pulse counting.
//!
//! Two contexts share a [`PulseCounter`]: the edge context calls
//! [`EdgeHandle::on_edge`] for every signal transition and the control loop
//! drains the count with [`PulseCounter::take`]. The edge path is a debounce
//! comparison plus one atomic increment; no logging, no allocation, no
//! floating point.
//!
//! The debounce period is also a ceiling on what can be measured: edges
//! closer together than `debounce_us` are discarded, so the highest
//! observable pulse rate is `1_000_000 / debounce_us` per second. At the
//! default 2 ms that is 500 Hz, or 15 000 RPM with two pulses per revolution.

use crate::averager::BoundedAverager;
use crate::cadence::CadenceGate;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_DEBOUNCE_US: u64 = 2_000;

const NO_EDGE: u64 = u64::MAX;

#[derive(Debug)]
pub struct PulseCounter {
    count: AtomicU32,
    rejected: AtomicU32,
    last_edge_us: AtomicU64,
    debounce_us: u64,
}

impl PulseCounter {
    pub fn new(debounce_us: u64) -> Self {
        Self {
            count: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            last_edge_us: AtomicU64::new(NO_EDGE),
            debounce_us,
        }
    }

    /// Edge context entry point. Returns false when the edge was debounced.
    ///
    /// Only one edge context may drive a counter; `last_edge_us` is written
    /// without a compare-exchange.
    fn record_edge(&self, now_us: u64) -> bool {
        let last = self.last_edge_us.load(Ordering::Relaxed);
        if last != NO_EDGE && now_us.wrapping_sub(last) < self.debounce_us {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.last_edge_us.store(now_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Read and clear in one atomic step.
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Pending count without clearing it.
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Total edges discarded by the debounce since construction.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn debounce_us(&self) -> u64 {
        self.debounce_us
    }
}

impl Default for PulseCounter {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_US)
    }
}

/// Capability to feed edges into one registered counter.
///
/// Handed to whatever runs the edge context; it is the only way to
/// increment the counter it wraps.
#[derive(Debug, Clone)]
pub struct EdgeHandle {
    pin: u8,
    counter: Arc<PulseCounter>,
}

impl EdgeHandle {
    pub fn on_edge(&self, now_us: u64) -> bool {
        self.counter.record_edge(now_us)
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pin {0} already has a pulse counter")]
    PinInUse(u8),
    #[error("pulse registry is full ({capacity} slots)")]
    Full { capacity: usize },
}

/// Fixed table binding hardware pins to pulse counters.
#[derive(Debug)]
pub struct PulseRegistry<const SLOTS: usize> {
    slots: [Option<(u8, Arc<PulseCounter>)>; SLOTS],
}

impl<const SLOTS: usize> PulseRegistry<SLOTS> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn register(&mut self, pin: u8, debounce_us: u64) -> Result<EdgeHandle, RegistryError> {
        if self.counter(pin).is_some() {
            return Err(RegistryError::PinInUse(pin));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(RegistryError::Full { capacity: SLOTS })?;
        let counter = Arc::new(PulseCounter::new(debounce_us));
        *slot = Some((pin, Arc::clone(&counter)));
        Ok(EdgeHandle { pin, counter })
    }

    /// Loop-side view of the counter bound to `pin`.
    pub fn counter(&self, pin: u8) -> Option<Arc<PulseCounter>> {
        self.slots
            .iter()
            .flatten()
            .find(|(p, _)| *p == pin)
            .map(|(_, counter)| Arc::clone(counter))
    }

    /// Shared edge trampoline: routes an edge on `pin` to its counter.
    /// Edges on unregistered pins are ignored.
    pub fn dispatch(&self, pin: u8, now_us: u64) -> bool {
        self.slots
            .iter()
            .flatten()
            .find(|(p, _)| *p == pin)
            .is_some_and(|(_, counter)| counter.record_edge(now_us))
    }
}

impl<const SLOTS: usize> Default for PulseRegistry<SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulses per minute from a count observed over `elapsed_ms`.
///
/// A zero-length interval yields zero rather than dividing by zero.
pub fn pulse_rate_per_minute(count: u32, elapsed_ms: u64) -> f64 {
    if elapsed_ms == 0 {
        return 0.0;
    }
    60.0 * count as f64 * (1000.0 / elapsed_ms as f64)
}

/// Rotation-rate channel fed by a [`PulseCounter`].
///
/// The averager holds pulses per minute; dividing by the blade count happens
/// on read so a blade-count change applies to the whole window at once.
#[derive(Debug)]
pub struct RpmChannel<const N: usize> {
    gate: CadenceGate,
    averager: BoundedAverager<N>,
    counter: Arc<PulseCounter>,
    last_count: u32,
    last_elapsed_ms: u64,
}

impl<const N: usize> RpmChannel<N> {
    pub fn new(interval_ms: u64, counter: Arc<PulseCounter>) -> Self {
        Self {
            gate: CadenceGate::new(interval_ms),
            averager: BoundedAverager::new(),
            counter,
            last_count: 0,
            last_elapsed_ms: 0,
        }
    }

    /// Drain the counter when due. Uses the observed elapsed time, not the
    /// configured interval, so loop jitter does not skew the rate.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        let Some(elapsed_ms) = self.gate.poll(now_ms) else {
            return false;
        };
        let count = self.counter.take();
        self.last_count = count;
        self.last_elapsed_ms = elapsed_ms;
        self.averager.add_sample(pulse_rate_per_minute(count, elapsed_ms));
        true
    }

    /// Averaged pulses per minute.
    pub fn pulse_rate(&self) -> f64 {
        self.averager.value()
    }

    /// Averaged shaft speed for a rig producing `pulses_per_rev` pulses.
    pub fn rpm(&self, pulses_per_rev: u32) -> f64 {
        if pulses_per_rev == 0 {
            return 0.0;
        }
        self.pulse_rate() / pulses_per_rev as f64
    }

    pub fn last_count(&self) -> u32 {
        self.last_count
    }

    pub fn last_elapsed_ms(&self) -> u64 {
        self.last_elapsed_ms
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.gate.set_interval(interval_ms);
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }
}
