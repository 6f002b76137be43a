/// Time gate that opens at most once per interval.
///
/// Firing moves `last_fire_ms` to the observed `now`, not to
/// `last_fire_ms + interval`, so a late poll never produces a catch-up burst.
/// Polling mutates the gate: evaluate it once per decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceGate {
    interval_ms: u64,
    last_fire_ms: Option<u64>,
}

impl CadenceGate {
    /// Gate that has never fired; its first poll opens immediately.
    pub const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_fire_ms: None,
        }
    }

    /// Gate that will not fire until a full interval after `now_ms`.
    pub const fn new_fired_at(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            last_fire_ms: Some(now_ms),
        }
    }

    /// Returns the elapsed time since the previous fire when the gate opens.
    ///
    /// The first fire of an unseeded gate reports the time since the epoch.
    pub fn poll(&mut self, now_ms: u64) -> Option<u64> {
        let due = match self.last_fire_ms {
            None => true,
            Some(last) => now_ms >= last && now_ms - last >= self.interval_ms,
        };
        if !due {
            return None;
        }
        let elapsed = now_ms.saturating_sub(self.last_fire_ms.unwrap_or(0));
        self.last_fire_ms = Some(now_ms);
        Some(elapsed)
    }

    pub fn ready(&mut self, now_ms: u64) -> bool {
        self.poll(now_ms).is_some()
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    pub fn last_fire_ms(&self) -> Option<u64> {
        self.last_fire_ms
    }

    /// Forget the previous fire so the next poll opens immediately.
    pub fn reset(&mut self) {
        self.last_fire_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseeded_gate_fires_on_first_poll() {
        let mut gate = CadenceGate::new(100);
        assert_eq!(gate.poll(3), Some(3));
        assert!(!gate.ready(50));
        gate.reset();
        assert!(gate.ready(51));
    }

    #[test]
    fn fires_once_per_interval() {
        let mut gate = CadenceGate::new(100);
        assert_eq!(gate.poll(100), Some(100));
        assert!(!gate.ready(150));
        assert!(!gate.ready(199));
        assert_eq!(gate.poll(200), Some(100));
    }

    #[test]
    fn late_poll_resynchronises_without_catch_up() {
        let mut gate = CadenceGate::new(10);
        assert!(gate.ready(10));
        assert_eq!(gate.poll(55), Some(45));
        assert!(!gate.ready(60));
        assert!(gate.ready(65));
    }

    #[test]
    fn seeded_gate_waits_a_full_interval() {
        let mut gate = CadenceGate::new_fired_at(50, 1_000);
        assert!(!gate.ready(1_049));
        assert!(gate.ready(1_050));
    }

    #[test]
    fn clock_going_backwards_never_fires() {
        let mut gate = CadenceGate::new_fired_at(0, 500);
        assert!(!gate.ready(400));
        assert_eq!(gate.last_fire_ms(), Some(500));
    }

    #[test]
    fn interval_can_be_retuned() {
        let mut gate = CadenceGate::new(1_000);
        assert!(gate.ready(1_000));
        gate.set_interval(10);
        assert!(gate.ready(1_010));
        assert_eq!(gate.interval_ms(), 10);
    }
}
