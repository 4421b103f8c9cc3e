//! Audio pipeline: capture, VAD, streaming STT, sentence batching and streaming TTS.

pub mod batcher;
pub mod capture;
pub mod deepgram;
pub mod sink;
pub mod stt;
pub mod synthesis;
pub mod transcription;
pub mod tts_stream;
pub mod vad;
pub mod wav;
pub mod whisper;
