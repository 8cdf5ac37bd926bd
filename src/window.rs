/// A carved inference window, in absolute sample coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start_sample: u64,
    pub end_sample: u64,
}

impl Window {
    pub fn start_sec(&self, sample_rate: u32) -> f32 {
        self.start_sample as f32 / sample_rate as f32
    }

    pub fn duration_sec(&self, sample_rate: u32) -> f32 {
        (self.end_sample - self.start_sample) as f32 / sample_rate as f32
    }

    pub fn end_sec(&self, sample_rate: u32) -> f32 {
        self.end_sample as f32 / sample_rate as f32
    }
}

/// Carves fixed-duration, overlapping inference windows from the audio
/// ring, governed by a monotonic *mature cursor* (spec §4.F).
pub struct WindowBuilder {
    sample_rate: u32,
    window_duration_sec: f32,
    min_window_duration_sec: f32,
    first_window_min_duration_sec: f32,
    max_window_duration_sec: f32,
    safety_margin_sec: f32,
    mature_cursor_sample: u64,
    windows_emitted: u64,
}

impl WindowBuilder {
    pub fn new(
        sample_rate: u32,
        window_duration_sec: f32,
        min_window_duration_sec: f32,
        first_window_min_duration_sec: f32,
        max_window_duration_sec: f32,
        safety_margin_sec: f32,
    ) -> Self {
        Self {
            sample_rate,
            window_duration_sec,
            min_window_duration_sec,
            first_window_min_duration_sec,
            max_window_duration_sec,
            safety_margin_sec,
            mature_cursor_sample: 0,
            windows_emitted: 0,
        }
    }

    pub fn mature_cursor_sample(&self) -> u64 {
        self.mature_cursor_sample
    }

    pub fn mature_cursor_time(&self) -> f32 {
        self.mature_cursor_sample as f32 / self.sample_rate as f32
    }

    /// Pick the next inference window ending at `head_sample`. `None` when
    /// there isn't yet enough audio to satisfy the minimum duration.
    pub fn next_window(&mut self, head_sample: u64) -> Option<Window> {
        let sr = self.sample_rate as u64;
        let window_samples = (self.window_duration_sec * self.sample_rate as f32) as u64;
        let safety_margin_samples = (self.safety_margin_sec * self.sample_rate as f32) as u64;

        let by_cursor = self.mature_cursor_sample.saturating_sub(safety_margin_samples);
        let by_max_window = head_sample.saturating_sub(window_samples);
        let start_sample = by_cursor.max(by_max_window);

        if head_sample <= start_sample {
            return None;
        }

        let min_duration_sec = if self.windows_emitted == 0 {
            self.first_window_min_duration_sec
        } else {
            self.min_window_duration_sec
        };
        let min_samples = (min_duration_sec * self.sample_rate as f32) as u64;
        if head_sample - start_sample < min_samples {
            return None;
        }

        let max_samples = (self.max_window_duration_sec * self.sample_rate as f32) as u64;
        let start_sample = if head_sample - start_sample > max_samples {
            head_sample - max_samples
        } else {
            start_sample
        };

        let _ = sr;
        self.windows_emitted += 1;
        Some(Window {
            start_sample,
            end_sample: head_sample,
        })
    }

    /// Advance the mature cursor to `t` seconds, enforcing monotonicity.
    /// Returns the new cursor sample, which the caller uses to purge audio
    /// at or before it from the ring.
    pub fn advance_mature_cursor_by_time(&mut self, t: f32) -> u64 {
        let candidate = (t * self.sample_rate as f32).round() as u64;
        if candidate > self.mature_cursor_sample {
            self.mature_cursor_sample = candidate;
        }
        self.mature_cursor_sample
    }
}
