/// Fixed-capacity ring producing the mean of the last `N` samples.
///
/// Slots start at zero and `value()` always averages all `N` of them, so a
/// new averager reads low until `N` samples have been written.
#[derive(Debug, Clone, Copy)]
pub struct BoundedAverager<const N: usize> {
    slots: [f64; N],
    cursor: usize,
    written: usize,
}

impl<const N: usize> BoundedAverager<N> {
    const NONZERO: () = assert!(N > 0, "BoundedAverager capacity must be at least 1");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NONZERO;
        Self {
            slots: [0.0; N],
            cursor: 0,
            written: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        self.slots[self.cursor] = value;
        self.cursor = (self.cursor + 1) % N;
        if self.written < N {
            self.written += 1;
        }
    }

    pub fn value(&self) -> f64 {
        self.slots.iter().sum::<f64>() / N as f64
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// True once every slot holds a real sample.
    pub fn is_warm(&self) -> bool {
        self.written == N
    }
}

impl<const N: usize> Default for BoundedAverager<N> {
    fn default() -> Self {
        Self::new()
    }
}
