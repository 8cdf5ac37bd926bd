use crate::mel::MelEngine;
use ndarray::Array2;
use std::sync::Arc;

/// A `[n_mels x T]` slice of features covering some absolute sample range.
pub struct FeaturesView {
    pub data: Array2<f32>,
    pub t: usize,
    pub n_mels: usize,
}

/// Hop-aligned, append-only store of raw (pre-CMVN) mel frames over
/// absolute sample indices. Decouples normalization from storage: CMVN is
/// applied on read, over whatever range the caller asks for, so two
/// consumers reading different window sizes never invalidate each other's
/// cached raw frames (spec §4.C rationale).
pub struct FeatureStore {
    mel: Arc<MelEngine>,
    n_mels: usize,
    capacity_frames: usize,
    hop_length: usize,
    /// Row-major: frame index major, `data[frame * n_mels + mel]`.
    data: Vec<f32>,
    base_frame: u64,
    head_frame: u64,
}

impl FeatureStore {
    pub fn new(mel: Arc<MelEngine>, capacity_frames: usize) -> Self {
        let n_mels = mel.n_mels();
        let hop_length = mel.hop_length();
        Self {
            mel,
            n_mels,
            capacity_frames,
            hop_length,
            data: vec![0.0; n_mels * capacity_frames],
            base_frame: 0,
            head_frame: 0,
        }
    }

    pub fn base_frame(&self) -> u64 {
        self.base_frame
    }

    pub fn head_frame(&self) -> u64 {
        self.head_frame
    }

    /// Append raw mel frames (`[n_mels x k]`) at the current head. Appending
    /// is the only mutation this store allows — there is no random-access
    /// write.
    pub fn append(&mut self, raw_frames: &Array2<f32>) {
        let k = raw_frames.shape()[1];
        for f in 0..k {
            let idx = ((self.head_frame as usize) + f) % self.capacity_frames;
            for m in 0..self.n_mels {
                self.data[idx * self.n_mels + m] = raw_frames[[m, f]];
            }
        }
        self.head_frame += k as u64;
        if self.head_frame - self.base_frame > self.capacity_frames as u64 {
            self.base_frame = self.head_frame - self.capacity_frames as u64;
        }
    }

    /// Read `[start_sample/HOP, ceil(end_sample/HOP))`, optionally applying
    /// CMVN over the returned range. `None` if the range has been evicted
    /// or extends past what has been written.
    pub fn get_features(
        &self,
        start_sample: u64,
        end_sample: u64,
        normalized: bool,
    ) -> Option<FeaturesView> {
        let hop = self.hop_length as u64;
        let start_frame = start_sample / hop;
        let end_frame = end_sample.div_ceil(hop);

        if start_frame < self.base_frame || end_frame > self.head_frame || end_frame < start_frame
        {
            return None;
        }

        let t = (end_frame - start_frame) as usize;
        let mut raw = Array2::<f32>::zeros((self.n_mels, t));
        for f in 0..t {
            let abs = start_frame + f as u64;
            let idx = (abs as usize) % self.capacity_frames;
            for m in 0..self.n_mels {
                raw[[m, f]] = self.data[idx * self.n_mels + m];
            }
        }

        let data = if normalized { self.mel.normalize(&raw) } else { raw };

        Some(FeaturesView {
            data,
            t,
            n_mels: self.n_mels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreprocessorConfig;

    #[test]
    fn append_then_read_roundtrips_raw() {
        let mel = Arc::new(MelEngine::new(PreprocessorConfig::default()));
        let mut store = FeatureStore::new(mel, 100);
        let mut frames = Array2::<f32>::zeros((128, 5));
        frames.fill(1.0);
        store.append(&frames);

        let view = store
            .get_features(0, 5 * 160, false)
            .expect("range should be present");
        assert_eq!(view.t, 5);
        assert!(view.data.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn evicted_range_returns_none() {
        let mel = Arc::new(MelEngine::new(PreprocessorConfig::default()));
        let mut store = FeatureStore::new(mel, 4);
        let frames = Array2::<f32>::zeros((128, 10));
        store.append(&frames);
        assert!(store.get_features(0, 160, false).is_none());
    }
}
