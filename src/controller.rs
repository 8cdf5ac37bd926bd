use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::s;

use crate::config::{DecodeOptions, IncrementalOptions, StreamConfig};
use crate::decoder::{DecoderCore, Token};
use crate::error::{Error, Result};
use crate::feature_store::{FeatureStore, FeaturesView};
use crate::mel::MelEngine;
use crate::merger::Merger;
use crate::metrics::Metrics;
use crate::model::{Encoder, Joiner, ModelDims};
use crate::ring::RingBuffer;
use crate::vad::CombinedVad;
use crate::vocab::Tokenizer;
use crate::window::WindowBuilder;

/// Snapshot of transcript + housekeeping state, per spec §6.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub confirmed_text: String,
    pub pending_text: String,
    pub mature_cursor_time: f32,
    pub metrics: Metrics,
}

/// What happened on a given `tick()` call. Only `Decoded` and
/// `TimeoutFlush` can grow the transcript; the rest are informational.
#[derive(Debug)]
pub enum TickOutcome {
    /// A decode was already in flight; this tick was dropped, not queued
    /// (spec §4.H back-pressure).
    Dropped,
    /// Not enough audio yet to satisfy `WindowBuilder`'s minimum duration.
    InsufficientAudio,
    /// `set_model` hasn't been called yet; rings keep filling regardless
    /// (spec §4.H model-ready pre-roll).
    ModelNotReady,
    /// Silence held for `silence_flush_threshold_sec`; pending tokens were
    /// committed outright.
    TimeoutFlush,
    /// The window this tick examined has already fallen out of the ring;
    /// the mature cursor was advanced conservatively past it (spec §7).
    RangeEvicted,
    /// The external encoder/joiner session failed; no state was mutated.
    InferenceError(String),
    Decoded {
        tokens_emitted: usize,
        confirmed_grew: bool,
    },
}

/// Cooperative "single in-flight decode" guard (spec §5). Mirrors the
/// teacher's `LoadingGuard`/`try_claim_loading` pattern: a failed
/// compare-exchange means a decode is already running, so this tick is
/// dropped rather than queued or blocked on.
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Top-level orchestrator (spec §4.H): owns the audio/mel rings, the
/// window builder, the merger, and (once installed) the decoder. Exposes
/// the public sink-of-truth surface of spec §6.
///
/// `push_audio` and `tick` are meant to be driven from different call
/// sites (a real-time audio callback and a periodic timer respectively);
/// `decode_in_flight` is the only state shared between them, so audio
/// writes never block on a decode in progress.
pub struct StreamController<E: Encoder, J: Joiner> {
    config: StreamConfig,
    audio_ring: RingBuffer<f32>,
    mel: Arc<MelEngine>,
    feature_store: FeatureStore,
    window_builder: WindowBuilder,
    merger: Merger,
    vad: CombinedVad,
    metrics: Metrics,
    decoder: Option<DecoderCore<E, J>>,
    tokenizer: Option<Arc<Tokenizer>>,
    decode_in_flight: AtomicBool,
    silence_accum_sec: f32,
    last_tick_instant: Option<Instant>,
    last_window_had_tokens: bool,
}

impl<E: Encoder, J: Joiner> StreamController<E, J> {
    pub fn new(config: StreamConfig) -> Self {
        let sr = config.preprocessor.sampling_rate;
        let audio_ring_capacity = (config.audio_ring_capacity_sec * sr as f32) as usize;
        let mel = Arc::new(MelEngine::new(config.preprocessor.clone()));
        let feature_store = FeatureStore::new(mel.clone(), config.mel_ring_capacity_frames);
        let window_builder = WindowBuilder::new(
            sr as u32,
            config.window_duration_sec,
            config.min_window_duration_sec,
            config.first_window_min_duration_sec,
            config.max_window_duration_sec,
            config.safety_margin_sec,
        );
        let merger = Merger::new(
            config.anchor_min_len,
            config.anchor_time_tolerance_sec,
            config.vignette_sigma_factor,
            frame_time_stride(&config),
        );
        let vad = CombinedVad::new(config.vad_energy_threshold);

        log::debug!(
            "StreamController::new: audio_ring={audio_ring_capacity} samples, mel_ring={} frames",
            config.mel_ring_capacity_frames
        );

        Self {
            audio_ring: RingBuffer::new(audio_ring_capacity.max(1)),
            mel,
            feature_store,
            window_builder,
            merger,
            vad,
            metrics: Metrics::default(),
            decoder: None,
            tokenizer: None,
            decode_in_flight: AtomicBool::new(false),
            silence_accum_sec: 0.0,
            last_tick_instant: None,
            last_window_had_tokens: false,
            config,
        }
    }

    /// Install the encoder/joiner pair and vocabulary. May be called at
    /// any time before the first decode; audio/mel ingestion via
    /// `push_audio` doesn't depend on this.
    pub fn set_model(&mut self, encoder: E, joiner: J, tokenizer: Arc<Tokenizer>, dims: ModelDims) {
        let stride = frame_time_stride(&self.config);
        log::debug!("StreamController::set_model: frame_time_stride={stride}");
        self.decoder = Some(DecoderCore::new(
            encoder,
            joiner,
            dims,
            tokenizer.clone(),
            self.config.decoder_temperature,
            self.config.max_tokens_per_step,
            stride,
            self.config.prefix_cache_capacity,
        ));
        self.tokenizer = Some(tokenizer);
    }

    pub fn is_ready(&self) -> bool {
        self.decoder.is_some()
    }

    /// Append samples to the audio ring and extend the mel feature store.
    /// Non-blocking, never fails: old audio/mel frames are evicted
    /// automatically once the rings reach capacity.
    pub fn push_audio(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.audio_ring.write(samples);
        self.extend_mel();
    }

    /// Recompute and append the mel frames that became newly available
    /// since the last call, reusing the prefix-cache trick of
    /// [`MelEngine::compute_raw_mel`]: only the last `boundary_frames`
    /// already-stored columns are recomputed to absorb STFT framing
    /// effects at the seam (spec §4.B).
    fn extend_mel(&mut self) {
        let head_sample = self.audio_ring.head();
        let base_sample = self.audio_ring.base();
        let hop = self.mel.hop_length() as u64;

        let stored_head_frame = self.feature_store.head_frame();
        let recompute_from_frame = stored_head_frame.saturating_sub(self.mel.boundary_frames() as u64);
        let read_start = (recompute_from_frame * hop).max(base_sample);

        if read_start >= head_sample {
            return;
        }
        let audio = match self.audio_ring.read(read_start, head_sample) {
            Ok(a) => a,
            Err(_) => return,
        };
        if audio.len() < self.mel.hop_length() {
            return;
        }

        let slice_base_frame = read_start / hop;
        let start_in_slice = recompute_from_frame.saturating_sub(slice_base_frame) as usize;
        let raw = self.mel.compute_raw_mel(&audio, start_in_slice);

        let new_from = stored_head_frame.saturating_sub(slice_base_frame) as usize;
        if new_from < raw.n_frames {
            let new_cols = raw.raw_mel.slice(s![.., new_from..]).to_owned();
            self.feature_store.append(&new_cols);
        }
    }

    /// Periodic tick (spec §4.H). At most one decode runs at a time;
    /// additional ticks are dropped, not queued.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        self.metrics.record_tick();

        let _guard = match TickGuard::try_acquire(&self.decode_in_flight) {
            Some(g) => g,
            None => {
                self.metrics.record_dropped_tick();
                return Ok(TickOutcome::Dropped);
            }
        };

        let sr = self.config.preprocessor.sampling_rate as u32;
        let head_sample = self.audio_ring.head();

        let window = match self.window_builder.next_window(head_sample) {
            Some(w) => w,
            None => return Ok(TickOutcome::InsufficientAudio),
        };

        if self.decoder.is_none() {
            return Ok(TickOutcome::ModelNotReady);
        }

        let now = Instant::now();
        let dt = self
            .last_tick_instant
            .map(|t| now.duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick_instant = Some(now);

        let mature_sample = self.window_builder.mature_cursor_sample();
        let tail_start = mature_sample.max(self.audio_ring.base());
        let tail = self.audio_ring.read(tail_start, head_sample).unwrap_or_default();
        let is_silent = self.vad.is_silent(&tail, self.last_window_had_tokens);

        if is_silent {
            self.silence_accum_sec += dt.max(0.0);
            if self.silence_accum_sec >= self.config.silence_flush_threshold_sec {
                log::debug!("StreamController::tick: silence timeout flush at {:.2}s", window.end_sec(sr));
                self.merger.flush_pending();
                self.window_builder.advance_mature_cursor_by_time(window.end_sec(sr));
                self.silence_accum_sec = 0.0;
                self.last_window_had_tokens = false;
                return Ok(TickOutcome::TimeoutFlush);
            }
        } else {
            self.silence_accum_sec = 0.0;
        }

        let features = match self.feature_store.get_features(window.start_sample, window.end_sample, true) {
            Some(f) => f,
            None => match self.audio_ring.read(window.start_sample, window.end_sample) {
                Ok(audio) => {
                    let out = self.mel.process(&audio);
                    FeaturesView {
                        data: out.features,
                        t: out.length,
                        n_mels: self.mel.n_mels(),
                    }
                }
                Err(_) => {
                    log::warn!("StreamController::tick: window audio evicted, advancing cursor conservatively");
                    self.window_builder.advance_mature_cursor_by_time(window.end_sec(sr));
                    return Ok(TickOutcome::RangeEvicted);
                }
            },
        };

        let window_start_sec = window.start_sec(sr);
        let mature_cursor_time = self.merger.mature_cursor_time();
        let prefix_seconds = (window_start_sec - mature_cursor_time).max(0.0);

        let options = DecodeOptions {
            time_offset: window_start_sec,
            incremental: Some(IncrementalOptions {
                cache_key: "v4-stream".to_string(),
                prefix_seconds,
            }),
            ..Default::default()
        };

        let decoder = self.decoder.as_mut().expect("checked above");
        let decode_start = Instant::now();
        let result = match decoder.decode(&features, &options) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("StreamController::tick: decode failed: {e}");
                return Ok(TickOutcome::InferenceError(e.to_string()));
            }
        };
        let decode_elapsed = decode_start.elapsed().as_secs_f32();
        self.metrics
            .record_decode(window.duration_sec(sr), decode_elapsed, result.tokens.len() as u64);

        let tokens_emitted = result.tokens.len();
        self.last_window_had_tokens = tokens_emitted > 0;

        let overlap_duration = (mature_cursor_time - window_start_sec).max(0.0);
        let confirmed_before = self.merger.confirmed().len();
        self.merger.process_chunk(&result.tokens, window_start_sec, overlap_duration);
        let confirmed_grew = self.merger.confirmed().len() > confirmed_before;

        let new_cursor = self.merger.mature_cursor_time();
        self.window_builder.advance_mature_cursor_by_time(new_cursor);

        Ok(TickOutcome::Decoded {
            tokens_emitted,
            confirmed_grew,
        })
    }

    fn decode_text(&self, tokens: &[Token]) -> String {
        match &self.tokenizer {
            Some(t) => t.decode(&tokens.iter().map(|tok| tok.id).collect::<Vec<_>>()),
            None => String::new(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            confirmed_text: self.decode_text(self.merger.confirmed()),
            pending_text: self.decode_text(self.merger.pending()),
            mature_cursor_time: self.merger.mature_cursor_time(),
            metrics: self.metrics.clone(),
        }
    }

    /// Purge all state: rings, feature store, window builder, merger,
    /// metrics, and (if installed) the decoder's prefix cache and LSTM
    /// state.
    pub fn reset(&mut self) {
        let audio_capacity = self.audio_ring.capacity();
        self.audio_ring = RingBuffer::new(audio_capacity);
        self.feature_store = FeatureStore::new(self.mel.clone(), self.config.mel_ring_capacity_frames);
        self.window_builder = WindowBuilder::new(
            self.config.preprocessor.sampling_rate as u32,
            self.config.window_duration_sec,
            self.config.min_window_duration_sec,
            self.config.first_window_min_duration_sec,
            self.config.max_window_duration_sec,
            self.config.safety_margin_sec,
        );
        self.merger = Merger::new(
            self.config.anchor_min_len,
            self.config.anchor_time_tolerance_sec,
            self.config.vignette_sigma_factor,
            frame_time_stride(&self.config),
        );
        self.metrics = Metrics::default();
        self.silence_accum_sec = 0.0;
        self.last_tick_instant = None;
        self.last_window_had_tokens = false;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    /// Drain pending tokens into confirmed and return the full transcript.
    pub fn finalize(&mut self) -> String {
        self.merger.flush_pending();
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.decode_text(self.merger.confirmed())
    }
}

fn frame_time_stride(config: &StreamConfig) -> f32 {
    (config.preprocessor.hop_length as f32 * config.model.subsampling as f32) / config.preprocessor.sampling_rate as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Tokenizer;
    use ndarray::{Array1, Array3};
    use std::collections::VecDeque;

    struct StubEncoder {
        d: usize,
    }
    impl Encoder for StubEncoder {
        fn encode(&mut self, features: &Array3<f32>, _length: i64) -> Result<(Array3<f32>, i64)> {
            let t = features.shape()[2];
            Ok((Array3::zeros((1, self.d, t)), t as i64))
        }
        fn reset(&mut self) {}
    }

    struct ScriptedJoiner {
        script: VecDeque<(u32, u32)>,
        vocab_size: usize,
        blank_id: usize,
    }
    impl Joiner for ScriptedJoiner {
        fn step(
            &mut self,
            _frame: &Array3<f32>,
            _prev: i32,
            s1: &Array3<f32>,
            s2: &Array3<f32>,
        ) -> Result<(Array1<f32>, Array3<f32>, Array3<f32>)> {
            let (id, step) = self.script.pop_front().unwrap_or((self.blank_id as u32, 0));
            let mut logits = Array1::<f32>::zeros(self.vocab_size + 1 + 5);
            logits[id as usize] = 10.0;
            logits[self.vocab_size + 1 + step as usize] = 10.0;
            Ok((logits, s1.clone(), s2.clone()))
        }
    }

    fn dims() -> ModelDims {
        ModelDims {
            num_encoder_layers: 1,
            hidden_dim: 4,
            left_context: 1,
            conv_context: 1,
            decoder_lstm_dim: 4,
            decoder_lstm_layers: 1,
            vocab_size: 2,
            blank_id: 2,
            duration_classes: 5,
        }
    }

    fn test_config() -> StreamConfig {
        let mut c = StreamConfig::default();
        c.preprocessor.feature_size = 4;
        c.model.n_mels = 4;
        c.model.subsampling = 1;
        c.window_duration_sec = 2.0;
        c.min_window_duration_sec = 1.0;
        c.first_window_min_duration_sec = 1.0;
        c.max_window_duration_sec = 2.0;
        c.safety_margin_sec = 0.0;
        c.audio_ring_capacity_sec = 10.0;
        c.mel_ring_capacity_frames = 1000;
        c
    }

    #[test]
    fn tick_before_audio_reports_insufficient_audio() {
        let mut ctrl: StreamController<StubEncoder, ScriptedJoiner> = StreamController::new(test_config());
        let outcome = ctrl.tick().unwrap();
        assert!(matches!(outcome, TickOutcome::InsufficientAudio));
    }

    #[test]
    fn tick_without_model_is_a_noop_but_audio_keeps_filling() {
        let mut ctrl: StreamController<StubEncoder, ScriptedJoiner> = StreamController::new(test_config());
        ctrl.push_audio(&vec![0.0f32; 16_000]);
        let outcome = ctrl.tick().unwrap();
        assert!(matches!(outcome, TickOutcome::ModelNotReady));
        assert_eq!(ctrl.audio_ring.head(), 16_000);
    }

    #[test]
    fn decode_with_model_advances_mature_cursor_and_never_regresses() {
        let mut ctrl: StreamController<StubEncoder, ScriptedJoiner> = StreamController::new(test_config());
        let vocab = vec!["A".to_string(), "B".to_string(), "<blk>".to_string()];
        let tokenizer = Arc::new(Tokenizer::from_pieces_for_test(vocab));
        let joiner = ScriptedJoiner {
            script: VecDeque::from(vec![(1u32, 1u32)]),
            vocab_size: 2,
            blank_id: 2,
        };
        ctrl.set_model(StubEncoder { d: 4 }, joiner, tokenizer, dims());

        ctrl.push_audio(&vec![0.1f32; 32_000]);
        let first = ctrl.tick().unwrap();
        assert!(matches!(first, TickOutcome::Decoded { .. }));

        let cursor_after_first = ctrl.snapshot().mature_cursor_time;

        ctrl.push_audio(&vec![0.1f32; 16_000]);
        let _ = ctrl.tick();
        let cursor_after_second = ctrl.snapshot().mature_cursor_time;

        assert!(cursor_after_second >= cursor_after_first);
    }

    #[test]
    fn reset_clears_transcript_and_cursor() {
        let mut ctrl: StreamController<StubEncoder, ScriptedJoiner> = StreamController::new(test_config());
        let vocab = vec!["A".to_string(), "B".to_string(), "<blk>".to_string()];
        let tokenizer = Arc::new(Tokenizer::from_pieces_for_test(vocab));
        let joiner = ScriptedJoiner {
            script: VecDeque::from(vec![(1u32, 1u32)]),
            vocab_size: 2,
            blank_id: 2,
        };
        ctrl.set_model(StubEncoder { d: 4 }, joiner, tokenizer, dims());
        ctrl.push_audio(&vec![0.1f32; 32_000]);
        let _ = ctrl.tick();

        ctrl.reset();
        let snap = ctrl.snapshot();
        assert_eq!(snap.confirmed_text, "");
        assert_eq!(snap.mature_cursor_time, 0.0);
    }
}
