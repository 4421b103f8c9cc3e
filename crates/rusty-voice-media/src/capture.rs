//! Audio capture: fixed-size PCM frames on a bounded, drop-oldest queue.
//!
//! The producer never blocks. When the queue is full the oldest unread frame
//! is discarded and counted, so a slow consumer loses stale audio rather than
//! stalling the microphone or the network reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, trace};

use rusty_voice_core::types::AudioFrame;

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<AudioFrame>,
    closed: bool,
}

#[derive(Debug)]
struct FrameQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A poisoned queue still holds valid frames.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Entry point for building a capture pipeline.
pub struct AudioCapture;

impl AudioCapture {
    /// Create a producer/consumer pair. `frame_bytes` is the fixed frame size
    /// (640 for 20 ms of 16 kHz mono 16-bit audio).
    pub fn channel(frame_bytes: usize, capacity: usize) -> (FrameSender, FrameReceiver) {
        let queue = Arc::new(FrameQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        let sender = FrameSender {
            queue: Arc::clone(&queue),
            pending: Vec::with_capacity(frame_bytes),
            frame_bytes: frame_bytes.max(2),
            next_seq: 0,
        };
        (sender, FrameReceiver { queue })
    }
}

/// Producer half. Re-chunks arbitrary PCM into fixed frames.
pub struct FrameSender {
    queue: Arc<FrameQueue>,
    pending: Vec<u8>,
    frame_bytes: usize,
    next_seq: u64,
}

impl FrameSender {
    /// Append raw PCM. Complete frames are queued; the remainder carries
    /// over to the next push. Returns the number of frames queued.
    pub fn push_pcm(&mut self, pcm: &[u8]) -> usize {
        self.pending.extend_from_slice(pcm);
        let mut pushed = 0;
        while self.pending.len() >= self.frame_bytes {
            let rest = self.pending.split_off(self.frame_bytes);
            let frame = std::mem::replace(&mut self.pending, rest);
            self.push_frame(frame);
            pushed += 1;
        }
        pushed
    }

    fn push_frame(&mut self, pcm: Vec<u8>) {
        let frame = AudioFrame {
            seq: self.next_seq,
            pcm,
        };
        self.next_seq += 1;

        {
            let mut state = self.queue.lock();
            if state.closed {
                return;
            }
            if state.frames.len() >= self.queue.capacity {
                if let Some(old) = state.frames.pop_front() {
                    let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(seq = old.seq, dropped, "Frame queue full, dropped oldest frame");
                }
            }
            state.frames.push_back(frame);
        }
        self.queue.notify.notify_one();
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Frames queued so far, including dropped ones.
    pub fn frames_sent(&self) -> u64 {
        self.next_seq
    }

    /// End the frame sequence. Queued frames are still delivered; a trailing
    /// partial frame is discarded.
    pub fn close(&mut self) {
        self.pending.clear();
        self.queue.lock().closed = true;
        self.queue.notify.notify_one();
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half. Not `Clone`: each frame is consumed exactly once.
pub struct FrameReceiver {
    queue: Arc<FrameQueue>,
}

impl FrameReceiver {
    /// Next frame in sequence order, or `None` once the sender has closed and
    /// the queue has drained.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        loop {
            // Register interest before checking, so a push between the check
            // and the await is not missed.
            let notified = self.queue.notify.notified();
            {
                let mut state = self.queue.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    debug!("Frame queue closed and drained");
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Turn the receiver into a stream. The stream cannot be restarted.
    pub fn into_stream(self) -> impl futures::Stream<Item = AudioFrame> + Send {
        futures::stream::unfold(self, |mut rx| async move {
            let frame = rx.recv().await?;
            Some((frame, rx))
        })
    }
}

/// Local microphone capture via `cpal`.
#[cfg(feature = "device")]
pub mod device {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, Stream, StreamConfig};
    use tracing::{debug, error};

    use rusty_voice_core::error::{Result, VoiceError};

    use super::FrameSender;

    /// A running input stream feeding a [`FrameSender`]. Dropping it stops capture.
    pub struct DeviceCapture {
        _stream: Stream,
    }

    impl DeviceCapture {
        /// Open the default input device at `sample_rate` mono.
        ///
        /// Fails immediately with [`VoiceError::DeviceUnavailable`]; there is no retry.
        pub fn start(sender: FrameSender, sample_rate: u32) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| VoiceError::DeviceUnavailable("no input device available".into()))?;

            let supported = device
                .supported_input_configs()
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?
                .find(|c| {
                    c.channels() == 1
                        && c.min_sample_rate() <= SampleRate(sample_rate)
                        && c.max_sample_rate() >= SampleRate(sample_rate)
                })
                .ok_or_else(|| {
                    VoiceError::DeviceUnavailable("no mono input config at requested rate".into())
                })?;
            let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();

            debug!(
                device = device.name().unwrap_or_default(),
                sample_rate,
                "Audio capture initialized"
            );

            let sender = std::sync::Mutex::new(sender);
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let pcm: Vec<u8> = data
                            .iter()
                            .flat_map(|s| ((s * 32767.0).clamp(-32768.0, 32767.0) as i16).to_le_bytes())
                            .collect();
                        if let Ok(mut tx) = sender.lock() {
                            tx.push_pcm(&pcm);
                        }
                    },
                    |err| error!(error = %err, "Audio capture error"),
                    None,
                )
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;

            stream
                .play()
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;

            Ok(Self { _stream: stream })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_rechunks_into_fixed_frames() {
        let (mut tx, mut rx) = AudioCapture::channel(640, 10);
        assert_eq!(tx.push_pcm(&[1u8; 1000]), 1);
        assert_eq!(tx.push_pcm(&[2u8; 300]), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.pcm.len(), 640);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 1);
        assert_eq!(&second.pcm[..360], &[1u8; 360][..]);
        assert_eq!(&second.pcm[360..], &[2u8; 280][..]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let (mut tx, mut rx) = AudioCapture::channel(2, 3);
        tx.push_pcm(&[0u8; 10]);
        assert_eq!(tx.dropped(), 2);
        assert_eq!(rx.dropped(), 2);

        tx.close();
        let mut seqs = Vec::new();
        while let Some(frame) = rx.recv().await {
            seqs.push(frame.seq);
        }
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (mut tx, mut rx) = AudioCapture::channel(4, 8);
        tx.push_pcm(&[0u8; 8]);
        tx.push_pcm(&[0u8; 3]);
        drop(tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (mut tx, mut rx) = AudioCapture::channel(2, 4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.push_pcm(&[7, 7]);
        let frame = handle.await.unwrap().unwrap();
        assert_eq!(frame.pcm, vec![7, 7]);
    }
}
