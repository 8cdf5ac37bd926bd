use serde::{Deserialize, Serialize};

/// DSP constants driving [`crate::mel::MelEngine`].
///
/// Defaults match the Parakeet-TDT 0.6B streaming export: 16kHz audio,
/// 128-mel log spectrogram, 10ms hop / 25ms window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    pub sampling_rate: usize,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub feature_size: usize,
    pub preemphasis: f32,
    /// Safety margin of raw mel frames recomputed at the seam of cached vs
    /// new audio to absorb FFT framing effects (see `MelEngine::compute_raw_mel`).
    pub boundary_frames: usize,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 16_000,
            n_fft: 512,
            win_length: 400,
            hop_length: 160,
            feature_size: 128,
            preemphasis: 0.97,
            boundary_frames: 3,
        }
    }
}

/// Static metadata about the installed encoder/joiner pair, supplied
/// out-of-band per spec §6 (not discoverable from the opaque tensor
/// functions themselves).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub n_mels: usize,
    /// Encoder temporal subsampling factor `S` (`T_enc = T / S`).
    pub subsampling: usize,
    pub vocab_size: usize,
    pub blank_id: u32,
    pub pred_hidden: usize,
    pub pred_layers: usize,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            n_mels: 128,
            subsampling: 8,
            vocab_size: 1024,
            blank_id: 1024,
            pred_hidden: 640,
            pred_layers: 2,
        }
    }
}

/// Top-level configuration for [`crate::controller::StreamController::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub preprocessor: PreprocessorConfig,
    pub model: ModelMetadata,
    /// Inference window length, e.g. 5.0-8.0s.
    pub window_duration_sec: f32,
    pub min_window_duration_sec: f32,
    /// Shorter minimum allowed for the very first window only.
    pub first_window_min_duration_sec: f32,
    pub max_window_duration_sec: f32,
    /// Audio kept before the mature cursor so overlapping windows can reach back.
    pub safety_margin_sec: f32,
    /// Controller tick period.
    pub trigger_interval_ms: u64,
    pub silence_flush_threshold_sec: f32,
    pub vad_energy_threshold: f32,
    pub max_tokens_per_step: u32,
    pub prefix_cache_capacity: usize,
    /// Merger anchor minimum contiguous match length `K`.
    pub anchor_min_len: usize,
    pub anchor_time_tolerance_sec: f32,
    pub vignette_sigma_factor: f32,
    pub decoder_temperature: f32,
    pub audio_ring_capacity_sec: f32,
    pub mel_ring_capacity_frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            preprocessor: PreprocessorConfig::default(),
            model: ModelMetadata::default(),
            window_duration_sec: 8.0,
            min_window_duration_sec: 3.0,
            first_window_min_duration_sec: 1.5,
            max_window_duration_sec: 8.0,
            safety_margin_sec: 0.5,
            trigger_interval_ms: 1000,
            silence_flush_threshold_sec: 2.0,
            vad_energy_threshold: 0.01,
            max_tokens_per_step: 10,
            prefix_cache_capacity: 16,
            anchor_min_len: 3,
            anchor_time_tolerance_sec: 0.15,
            vignette_sigma_factor: 0.25,
            decoder_temperature: 1.0,
            audio_ring_capacity_sec: 30.0,
            mel_ring_capacity_frames: 30 * 100,
        }
    }
}

/// Per-call decode knobs (spec §4.D).
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    pub return_frame_indices: bool,
    pub return_log_probs: bool,
    pub return_tdt_steps: bool,
    pub previous_state: Option<crate::decoder::DecoderState>,
    pub time_offset: f32,
    pub incremental: Option<IncrementalOptions>,
}

/// Prefix-cache lookup key and depth for a decode call (spec §4.D.2).
#[derive(Debug, Clone)]
pub struct IncrementalOptions {
    pub cache_key: String,
    pub prefix_seconds: f32,
}
