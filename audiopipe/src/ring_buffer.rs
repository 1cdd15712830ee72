//! A single-producer/single-consumer ring buffer of `f32` samples.
//!
//! Capacity is always rounded up to a power of two so index wraparound can be
//! done with a mask instead of a modulo. This backs both [`crate::source::FileSource`]'s
//! decode buffer and the scratch space used while mixing.

/// A fixed-capacity ring buffer of `f32` samples.
///
/// `head` is the next slot to read, `tail` is the next slot to write. Both only
/// ever increase (wrapping around `usize`), so `len()`/`free()` can be computed
/// without a separate "is full" flag.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<f32>,
    mask: usize,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Creates a ring buffer able to hold at least `min_capacity` samples.
    pub fn with_capacity(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(1).next_power_of_two();

        RingBuffer {
            data: vec![0.0; capacity],
            mask: capacity - 1,
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples currently queued for reading.
    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Free space available to write into.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Writes as much of `samples` as fits, returning the number of samples written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.free());

        for &s in &samples[..n] {
            let idx = self.tail & self.mask;
            self.data[idx] = s;
            self.tail = self.tail.wrapping_add(1);
        }

        n
    }

    /// Reads as many samples as are available into `out`, returning the number read.
    /// Remaining slots in `out` are left untouched.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len());

        for slot in out.iter_mut().take(n) {
            let idx = self.head & self.mask;
            *slot = self.data[idx];
            self.head = self.head.wrapping_add(1);
        }

        n
    }

    /// Drops the entire contents without reading them (used on seek/stop).
    pub fn clear(&mut self) {
        self.head = self.tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_power_of_two() {
        let rb = RingBuffer::with_capacity(100);
        assert_eq!(rb.capacity(), 128);
    }

    #[test]
    fn write_read_roundtrip() {
        let mut rb = RingBuffer::with_capacity(4);
        assert_eq!(rb.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(rb.len(), 3);

        let mut out = [0.0; 2];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(rb.len(), 1);
    }

    #[test]
    fn write_saturates_at_capacity() {
        let mut rb = RingBuffer::with_capacity(2);
        assert_eq!(rb.write(&[1.0, 2.0, 3.0, 4.0]), 2);
        assert!(rb.is_full());
        assert_eq!(rb.write(&[5.0]), 0);
    }

    #[test]
    fn wraps_around_correctly() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(&[1.0, 2.0, 3.0]);

        let mut out = [0.0; 2];
        rb.read(&mut out);

        rb.write(&[4.0, 5.0]);

        let mut out = [0.0; 3];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(out, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn clear_drops_unread_samples() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(&[1.0, 2.0]);
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.free(), rb.capacity());
    }
}
