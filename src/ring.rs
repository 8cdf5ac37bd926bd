use crate::error::{Error, Result};

/// Fixed-capacity, overwrite-on-wrap circular store indexed by a monotonic
/// absolute counter (samples for audio, frames for mel).
///
/// Single-writer/multi-reader: the owning component is responsible for
/// concurrency discipline (see design doc §5) — this type itself does no
/// locking.
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    capacity: usize,
    /// Absolute index of the oldest valid element still in the buffer.
    base: u64,
    /// Absolute index one past the most recently written element.
    head: u64,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be nonzero");
        Self {
            buffer: vec![T::default(); capacity],
            capacity,
            base: 0,
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn fill_count(&self) -> u64 {
        self.head - self.base
    }

    /// Append `slice`, advancing `head`. If the write would exceed capacity,
    /// `base` advances so the oldest samples are logically dropped.
    pub fn write(&mut self, slice: &[T]) {
        for &sample in slice {
            let idx = (self.head as usize) % self.capacity;
            self.buffer[idx] = sample;
            self.head += 1;
        }
        if self.head - self.base > self.capacity as u64 {
            self.base = self.head - self.capacity as u64;
        }
    }

    /// Copy the absolute range `[start, end)` into a fresh `Vec`.
    pub fn read(&self, start: u64, end: u64) -> Result<Vec<T>> {
        let mut out = vec![T::default(); 0];
        let n = self.read_into_range(start, end, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Zero-allocation variant: writes into `out_buf` (resized as needed),
    /// returns the number of elements written.
    pub fn read_into(&self, start: u64, end: u64, out_buf: &mut Vec<T>) -> Result<usize> {
        self.read_into_range(start, end, out_buf)
    }

    fn read_into_range(&self, start: u64, end: u64, out_buf: &mut Vec<T>) -> Result<usize> {
        if start < self.base {
            return Err(Error::RangeEvicted {
                start,
                base: self.base,
            });
        }
        if end > self.head || end < start {
            return Err(Error::RangeEvicted {
                start: end,
                base: self.head,
            });
        }
        let n = (end - start) as usize;
        out_buf.resize(n, T::default());
        for i in 0..n {
            let abs = start + i as u64;
            out_buf[i] = self.buffer[(abs as usize) % self.capacity];
        }
        Ok(n)
    }
}

impl RingBuffer<f32> {
    /// Current head position expressed in seconds, given a sample rate.
    pub fn time(&self, sample_rate: usize) -> f32 {
        self.head as f32 / sample_rate as f32
    }
}
