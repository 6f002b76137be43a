use crate::interlock::InterlockState;
use crate::telemetry::TelemetryRecord;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Latest loop state as seen by observers outside the control loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandSnapshot {
    pub iteration: u64,
    /// Wall time of the iteration that produced this snapshot.
    pub iteration_us: u64,
    pub record: TelemetryRecord,
    pub pulse_width_us: u16,
    pub blades: u32,
    pub interlock: InterlockState,
    pub interlock_trips: u64,
}

const DIRTY: usize = 0b100;

/// Single-producer single-consumer triple buffer.
///
/// The writer and the reader each own one slot; the third is exchanged
/// through `back`. Neither side ever touches the slot the other owns.
struct TripleBuffer<T: Copy + Default> {
    slots: [UnsafeCell<T>; 3],
    back: AtomicUsize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

unsafe impl<T: Copy + Default + Send> Send for TripleBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for TripleBuffer<T> {}

impl<T: Copy + Default> TripleBuffer<T> {
    fn new() -> Self {
        let slots = std::array::from_fn(|_| UnsafeCell::new(T::default()));
        Self {
            slots,
            back: AtomicUsize::new(1),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(2),
        }
    }

    fn write(&self, value: T) {
        let w = self.write_idx.load(Ordering::Relaxed);
        // SAFETY: slot `w` is owned by the single writer until it is swapped
        // into `back` below.
        unsafe {
            *self.slots[w].get() = value;
        }
        let prev = self.back.swap(w | DIRTY, Ordering::AcqRel);
        self.write_idx.store(prev & !DIRTY, Ordering::Relaxed);
    }

    fn read(&self) -> T {
        if self.back.load(Ordering::Relaxed) & DIRTY != 0 {
            let r = self.read_idx.load(Ordering::Relaxed);
            let prev = self.back.swap(r, Ordering::AcqRel);
            self.read_idx.store(prev & !DIRTY, Ordering::Relaxed);
        }
        let r = self.read_idx.load(Ordering::Relaxed);
        // SAFETY: slot `r` is owned by the single reader.
        unsafe { *self.slots[r].get() }
    }
}

/// Hands the loop's latest snapshot to one observer thread without locking.
///
/// Exactly one thread may publish and exactly one may read.
pub struct TelemetryExchange {
    state: TripleBuffer<StandSnapshot>,
}

impl TelemetryExchange {
    pub fn new() -> Self {
        Self {
            state: TripleBuffer::new(),
        }
    }

    /// Called by the control loop (non-blocking).
    pub fn publish(&self, snapshot: StandSnapshot) {
        self.state.write(snapshot);
    }

    /// Called by the observer; returns the newest published snapshot.
    pub fn latest(&self) -> StandSnapshot {
        self.state.read()
    }
}

impl Default for TelemetryExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn snapshot(iteration: u64) -> StandSnapshot {
        StandSnapshot {
            iteration,
            ..Default::default()
        }
    }

    #[test]
    fn reader_sees_latest_write() {
        let exchange = TelemetryExchange::new();
        assert_eq!(exchange.latest().iteration, 0);
        exchange.publish(snapshot(1));
        exchange.publish(snapshot(2));
        assert_eq!(exchange.latest().iteration, 2);
        assert_eq!(exchange.latest().iteration, 2);
        exchange.publish(snapshot(3));
        assert_eq!(exchange.latest().iteration, 3);
    }

    #[test]
    fn concurrent_reader_observes_monotonic_iterations() {
        let exchange = Arc::new(TelemetryExchange::new());
        let writer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                for i in 1..=10_000 {
                    exchange.publish(snapshot(i));
                }
            })
        };

        let mut last = 0;
        while last < 10_000 {
            let seen = exchange.latest().iteration;
            assert!(seen >= last);
            last = seen;
            if writer.is_finished() {
                last = exchange.latest().iteration;
                break;
            }
        }
        writer.join().unwrap();
        assert_eq!(exchange.latest().iteration, 10_000);
        assert!(last <= 10_000);
    }
}
