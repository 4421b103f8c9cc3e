//! Energy-based Voice Activity Detection (VAD).

/// A change in detected speech activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    /// The configured silence window elapsed after speech.
    SpeechEnded,
}

/// Voice Activity Detector using an RMS energy threshold on 16-bit PCM.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    /// Consecutive silent frames before speech is declared over.
    min_silent_frames: usize,
    speech_active: bool,
    silent_count: usize,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, min_silent_frames: usize) -> Self {
        Self {
            threshold,
            min_silent_frames: min_silent_frames.max(1),
            speech_active: false,
            silent_count: 0,
        }
    }

    /// Build a detector whose silence window is `silence_ms` of `frame_ms` frames.
    pub fn with_silence_window(threshold: f64, silence_ms: u64, frame_ms: u32) -> Self {
        let frames = silence_ms.div_ceil(u64::from(frame_ms.max(1)));
        Self::new(threshold, frames as usize)
    }

    /// RMS energy of a PCM frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Feed one frame and report a transition, if any.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadTransition> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if is_speech {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadTransition::SpeechStarted);
            }
        } else if self.speech_active {
            self.silent_count += 1;
            if self.silent_count >= self.min_silent_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadTransition::SpeechEnded);
            }
        }

        None
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silent_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_calculation() {
        assert_eq!(VoiceActivityDetector::rms(&[0i16; 320]), 0.0);
        let rms = VoiceActivityDetector::rms(&[100i16; 320]);
        assert!((rms - 100.0).abs() < 0.01);
        assert_eq!(VoiceActivityDetector::rms(&[]), 0.0);
    }

    #[test]
    fn test_vad_transitions() {
        let mut vad = VoiceActivityDetector::new(50.0, 3);
        let silence = vec![0i16; 320];
        let speech = vec![500i16; 320];

        assert_eq!(vad.process_frame(&silence), None);
        assert_eq!(vad.process_frame(&speech), Some(VadTransition::SpeechStarted));
        assert_eq!(vad.process_frame(&speech), None);
        assert_eq!(vad.process_frame(&silence), None);
        assert_eq!(vad.process_frame(&silence), None);
        assert_eq!(vad.process_frame(&silence), Some(VadTransition::SpeechEnded));
        assert!(!vad.is_active());
    }

    #[test]
    fn test_speech_resets_silence_count() {
        let mut vad = VoiceActivityDetector::new(50.0, 2);
        let silence = vec![0i16; 320];
        let speech = vec![500i16; 320];
        vad.process_frame(&speech);
        vad.process_frame(&silence);
        assert_eq!(vad.process_frame(&speech), None);
        assert_eq!(vad.process_frame(&silence), None);
        assert_eq!(vad.process_frame(&silence), Some(VadTransition::SpeechEnded));
    }

    #[test]
    fn test_silence_window_in_frames() {
        let vad = VoiceActivityDetector::with_silence_window(300.0, 1000, 20);
        assert_eq!(vad.min_silent_frames, 50);
        let vad = VoiceActivityDetector::with_silence_window(300.0, 30, 20);
        assert_eq!(vad.min_silent_frames, 2);
    }

    #[test]
    fn test_vad_reset() {
        let mut vad = VoiceActivityDetector::new(50.0, 3);
        vad.process_frame(&[500i16; 320]);
        assert!(vad.is_active());
        vad.reset();
        assert!(!vad.is_active());
    }
}
