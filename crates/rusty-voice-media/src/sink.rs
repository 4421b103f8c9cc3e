//! Audio output seam.

use async_trait::async_trait;

use rusty_voice_core::epoch::Epoch;
use rusty_voice_core::types::AudioChunk;

/// Where synthesized audio goes. Chunks arrive strictly in order.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Hand one chunk to playback.
    async fn play(&self, chunk: AudioChunk) -> anyhow::Result<()>;

    /// Stop playback now and discard anything buffered for `epoch` or earlier.
    async fn stop(&self, epoch: Epoch);
}

/// Discards all audio. Used for text-only sessions.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, _chunk: AudioChunk) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _epoch: Epoch) {}
}

/// Speaker playback via `cpal`. Expects raw little-endian 16-bit mono PCM
/// (configure the synthesis `output_format` as `pcm_<rate>`).
#[cfg(feature = "device")]
pub mod device {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, Stream, StreamConfig};
    use tracing::{debug, error};

    use rusty_voice_core::epoch::Epoch;
    use rusty_voice_core::error::{Result, VoiceError};
    use rusty_voice_core::types::AudioChunk;

    use super::AudioSink;

    /// Output stream fed from a shared sample queue; `stop` clears the queue.
    pub struct SpeakerSink {
        queue: Arc<Mutex<VecDeque<f32>>>,
        // cpal streams are not Send on every platform; the stream is kept
        // alive on a dedicated thread.
        _keepalive: std::sync::mpsc::Sender<()>,
    }

    impl SpeakerSink {
        pub fn open(sample_rate: u32) -> Result<Self> {
            let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
            let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();
            let shared = Arc::clone(&queue);

            std::thread::spawn(move || {
                let stream = match build_stream(shared, sample_rate) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the sink is dropped.
                let _ = keepalive_rx.recv();
                drop(stream);
                debug!("Speaker playback stopped");
            });

            ready_rx
                .recv()
                .map_err(|_| VoiceError::DeviceUnavailable("playback thread exited".into()))??;

            Ok(Self {
                queue,
                _keepalive: keepalive_tx,
            })
        }
    }

    fn build_stream(queue: Arc<Mutex<VecDeque<f32>>>, sample_rate: u32) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("no output device available".into()))?;
        let supported = device
            .supported_output_configs()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
            .find(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| {
                VoiceError::DeviceUnavailable("no output config at requested rate".into())
            })?;
        let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                    for frame in data.chunks_mut(channels) {
                        let sample = queue.pop_front().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| error!(error = %err, "Audio playback error"),
                None,
            )
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
        stream
            .play()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;
        Ok(stream)
    }

    #[async_trait]
    impl AudioSink for SpeakerSink {
        async fn play(&self, chunk: AudioChunk) -> anyhow::Result<()> {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.extend(
                chunk
                    .data
                    .chunks_exact(2)
                    .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
            );
            Ok(())
        }

        async fn stop(&self, _epoch: Epoch) {
            self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}
