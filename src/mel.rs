use crate::audio::{apply_preemphasis, create_mel_filterbank, stft};
use crate::config::PreprocessorConfig;
use ndarray::Array2;

/// Output of [`MelEngine::process`]: CMVN-normalized log-mel features,
/// `[n_mels x n_frames]`, plus the frame count the caller should treat as
/// authoritative (`floor(len/HOP)`, which may be one fewer than the array's
/// column count if the STFT emitted a trailing padding frame).
pub struct ProcessOutput {
    pub features: Array2<f32>,
    pub length: usize,
}

/// Output of [`MelEngine::compute_raw_mel`]: pre-CMVN log-mel frames.
/// Columns `< start_frame` are left zeroed — the caller is expected to
/// already hold those values (e.g. in [`crate::feature_store::FeatureStore`])
/// and splice them back in before calling [`MelEngine::normalize`].
pub struct RawMelOutput {
    pub raw_mel: Array2<f32>,
    pub n_frames: usize,
    pub features_len: usize,
}

/// Pure-DSP log-mel spectrogram engine: pre-emphasis -> STFT -> mel -> log
/// -> per-feature CMVN. Deterministic and bit-repeatable for fixed input.
///
/// Supports prefix-reuse: given the frame index below which the caller
/// already has trusted raw mel data, `compute_raw_mel` skips the FFT/mel
/// work for those frames entirely.
pub struct MelEngine {
    config: PreprocessorConfig,
    filterbank: Array2<f32>,
}

impl MelEngine {
    pub fn new(config: PreprocessorConfig) -> Self {
        let filterbank =
            create_mel_filterbank(config.n_fft, config.feature_size, config.sampling_rate);
        Self { config, filterbank }
    }

    pub fn n_mels(&self) -> usize {
        self.config.feature_size
    }

    pub fn hop_length(&self) -> usize {
        self.config.hop_length
    }

    pub fn boundary_frames(&self) -> usize {
        self.config.boundary_frames
    }

    /// Full path: audio -> normalized log-mel features.
    pub fn process(&self, audio: &[f32]) -> ProcessOutput {
        let raw = self.compute_raw_mel(audio, 0);
        let features = self.normalize(&raw.raw_mel);
        ProcessOutput {
            features,
            length: audio.len() / self.config.hop_length,
        }
    }

    /// Compute raw (pre-CMVN) log-mel frames, skipping the DSP work for any
    /// frame index `< start_frame`. Those columns come back zeroed.
    ///
    /// Empty or too-short audio yields zero-length output, never an error.
    pub fn compute_raw_mel(&self, audio: &[f32], start_frame: usize) -> RawMelOutput {
        let n_mels = self.config.feature_size;
        if audio.len() < self.config.hop_length {
            return RawMelOutput {
                raw_mel: Array2::zeros((n_mels, 0)),
                n_frames: 0,
                features_len: audio.len() / self.config.hop_length,
            };
        }

        let pre = apply_preemphasis(audio, self.config.preemphasis);
        let spectrogram = stft(
            &pre,
            self.config.n_fft,
            self.config.hop_length,
            self.config.win_length,
        );
        let n_frames = spectrogram.shape()[1];

        let log_zero_guard: f32 = 2.0f32.powi(-24);
        let mut raw_mel = Array2::<f32>::zeros((n_mels, n_frames));

        let start = start_frame.min(n_frames);
        if start < n_frames {
            let tail = spectrogram.slice(ndarray::s![.., start..]);
            let mel_tail = self.filterbank.dot(&tail);
            let mel_tail = mel_tail.mapv(|x| (x + log_zero_guard).ln());
            raw_mel.slice_mut(ndarray::s![.., start..]).assign(&mel_tail);
        }

        RawMelOutput {
            raw_mel,
            n_frames,
            features_len: audio.len() / self.config.hop_length,
        }
    }

    /// Per-mel-bin CMVN over the full window, Bessel-corrected variance.
    /// Single-frame windows normalize to zero.
    pub fn normalize(&self, raw_mel: &Array2<f32>) -> Array2<f32> {
        let n_mels = raw_mel.shape()[0];
        let n_frames = raw_mel.shape()[1];
        let mut out = raw_mel.clone();

        if n_frames <= 1 {
            out.fill(0.0);
            return out;
        }

        for m in 0..n_mels {
            let mut row = out.row_mut(m);
            let mean: f32 = row.iter().sum::<f32>() / n_frames as f32;
            let variance: f32 =
                row.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / (n_frames as f32 - 1.0);
            let std = variance.sqrt() + 1e-5;
            for v in row.iter_mut() {
                *v = (*v - mean) / std;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MelEngine {
        MelEngine::new(PreprocessorConfig::default())
    }

    #[test]
    fn length_is_floor_len_over_hop() {
        let e = engine();
        let audio = vec![0.0f32; 16_000];
        let out = e.process(&audio);
        assert_eq!(out.length, 16_000 / 160);
    }

    #[test]
    fn silence_normalizes_near_zero() {
        let e = engine();
        let audio = vec![0.0f32; 16_000];
        let out = e.process(&audio);
        for &v in out.features.iter() {
            assert!(v.abs() < 1e-3, "expected near-zero, got {v}");
        }
    }

    #[test]
    fn too_short_audio_yields_zero_frames_not_error() {
        let e = engine();
        let out = e.process(&[0.0f32; 10]);
        assert_eq!(out.features.shape()[1], 0);
    }

    #[test]
    fn prefix_reuse_matches_full_computation() {
        let e = engine();
        let mut audio = vec![0.0f32; 8000];
        for (i, s) in audio.iter_mut().enumerate() {
            *s = (i as f32 * 0.01).sin();
        }

        let full = e.compute_raw_mel(&audio, 0);

        let boundary = e.boundary_frames();
        let prefix_frames = full.n_frames / 2;
        let start = prefix_frames.saturating_sub(boundary);
        let incremental = e.compute_raw_mel(&audio, start);

        for col in start..full.n_frames {
            for row in 0..full.raw_mel.shape()[0] {
                assert_eq!(full.raw_mel[[row, col]], incremental.raw_mel[[row, col]]);
            }
        }
        for col in 0..start {
            for row in 0..incremental.raw_mel.shape()[0] {
                assert_eq!(incremental.raw_mel[[row, col]], 0.0);
            }
        }
    }

    #[test]
    fn single_frame_window_normalizes_to_zero() {
        let e = engine();
        let mut raw = Array2::<f32>::zeros((4, 1));
        raw.fill(3.5);
        let out = e.normalize(&raw);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
