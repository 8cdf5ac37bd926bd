/// Speech-presence query over a sample range of the audio ring. The
/// controller uses this to decide whether a silence-timeout flush is due
/// (spec §4.H); decoding itself never depends on VAD output.
pub trait VoiceActivityDetector: Send {
    /// `true` if speech is judged present anywhere in `samples`.
    fn speech_present(&mut self, samples: &[f32]) -> bool;
}

/// RMS-energy threshold detector: the default, dependency-free
/// implementation. A frame is "speech" if its RMS energy exceeds
/// `threshold`. This resolves the spec's open question of what "speech
/// present" means by combining it with the decoder's own activity: the
/// controller treats audio as silent only when *both* this detector and
/// the decoder (zero non-blank tokens emitted) agree, so a quiet speaker
/// the energy gate alone would miss still keeps the stream open as long
/// as the model is transcribing something.
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn speech_present(&mut self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }
        let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
        let rms = (sum_sq / samples.len() as f32).sqrt();
        rms >= self.threshold
    }
}

/// Combines an energy gate with a decoder-activity signal: silence is
/// only declared when both indicate no speech, matching the "inference
/// AND energy" resolution of the VAD open question (spec §4.H / Open
/// Questions).
pub struct CombinedVad {
    energy: EnergyVad,
}

impl CombinedVad {
    pub fn new(threshold: f32) -> Self {
        Self {
            energy: EnergyVad::new(threshold),
        }
    }

    /// `tokens_emitted_recently` comes from the decoder's last result over
    /// the same window; if the model emitted non-blank tokens, treat the
    /// segment as active speech even if the energy gate alone would not.
    pub fn is_silent(&mut self, samples: &[f32], tokens_emitted_recently: bool) -> bool {
        !self.energy.speech_present(samples) && !tokens_emitted_recently
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_below_threshold() {
        let mut vad = EnergyVad::new(0.01);
        let silence = vec![0.0f32; 1600];
        assert!(!vad.speech_present(&silence));
    }

    #[test]
    fn loud_tone_is_speech() {
        let mut vad = EnergyVad::new(0.01);
        let tone: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        assert!(vad.speech_present(&tone));
    }

    #[test]
    fn empty_samples_are_never_speech() {
        let mut vad = EnergyVad::new(0.01);
        assert!(!vad.speech_present(&[]));
    }

    #[test]
    fn combined_vad_stays_active_on_decoder_activity_despite_quiet_energy() {
        let mut vad = CombinedVad::new(0.5);
        let quiet = vec![0.0001f32; 1600];
        assert!(!vad.is_silent(&quiet, true));
        assert!(vad.is_silent(&quiet, false));
    }
}
