//! Fixed-capacity circular buffer of recent offset-adjusted PPS samples.

#[derive(Debug, Clone)]
pub struct DriftRingBuffer {
    slots: Vec<i64>,
    cursor: usize,
}

impl DriftRingBuffer {
    /// Zero-filled buffer. A zero capacity is bumped to one slot.
    pub fn new(capacity: usize) -> Self {
        DriftRingBuffer {
            slots: vec![0; capacity.max(1)],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next push will overwrite.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn push(&mut self, value: i64) {
        self.slots[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Sum of the `window` most recent entries. Windows larger than the
    /// buffer are clamped to its capacity.
    pub fn windowed_sum(&self, window: usize) -> i64 {
        let window = window.min(self.slots.len());
        if window <= self.cursor {
            self.slots[self.cursor - window..self.cursor].iter().sum()
        } else {
            // Window straddles the start: tail segment + head segment
            let tail_start = self.slots.len() - (window - self.cursor);
            let tail: i64 = self.slots[tail_start..].iter().sum();
            let head: i64 = self.slots[..self.cursor].iter().sum();
            tail + head
        }
    }

    /// Overwrite the next `count` slots with zero so the most recent `count`
    /// entries read as empty.
    pub fn flush_recent(&mut self, count: usize) {
        for _ in 0..count.min(self.slots.len()) {
            self.push(0);
        }
    }
}
