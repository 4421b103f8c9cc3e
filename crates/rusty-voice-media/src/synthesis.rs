//! SpeechSynthesisStream: fragments in, ordered audio out.
//!
//! Two stages joined by a bounded queue. The synthesis stage batches
//! fragments into speakable units and opens one streaming call per unit; the
//! playback stage re-checks each chunk's epoch before handing it to the sink,
//! so the next unit is synthesized while the current one plays.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rusty_voice_core::config::TtsConfig;
use rusty_voice_core::epoch::{Epoch, EpochReader};
use rusty_voice_core::types::{AudioChunk, TextFragment};

use crate::batcher::SentenceBatcher;
use crate::sink::AudioSink;
use crate::tts_stream::TtsProvider;

const PLAYBACK_QUEUE: usize = 32;

/// What the synthesis stream reports to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// The first chunk of the turn was handed to playback.
    FirstAudio { epoch: Epoch },
    /// Synthesis failed twice for this unit; show the text instead.
    TextOnly { epoch: Epoch, text: String },
    /// Both stages have stopped.
    Finished {
        epoch: Epoch,
        chunks_played: u64,
        stale_discarded: u64,
    },
}

enum Playback {
    Audio(AudioChunk),
    TextOnly(String),
}

#[derive(Clone)]
pub struct SpeechSynthesisStream {
    provider: Arc<dyn TtsProvider>,
    sink: Arc<dyn AudioSink>,
    // Held across the epoch check and `play`, and by `stop`.
    gate: Arc<Mutex<()>>,
    min_batch_chars: usize,
    max_batch_chars: usize,
}

impl SpeechSynthesisStream {
    pub fn new(provider: Arc<dyn TtsProvider>, sink: Arc<dyn AudioSink>, config: &TtsConfig) -> Self {
        Self {
            provider,
            sink,
            gate: Arc::new(Mutex::new(())),
            min_batch_chars: config.min_batch_chars,
            max_batch_chars: config.max_batch_chars,
        }
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.sink
    }

    /// Stop playback of `epoch`. Call after the epoch has been advanced: once
    /// this returns, no chunk of `epoch` can reach the sink.
    pub async fn stop(&self, epoch: Epoch) {
        let _gate = self.gate.lock().await;
        self.sink.stop(epoch).await;
    }

    /// Speak one turn. Fragments not tagged with `epoch` are discarded.
    pub fn spawn<T>(
        &self,
        epoch: Epoch,
        epochs: EpochReader,
        fragments: mpsc::Receiver<TextFragment>,
        out: mpsc::Sender<T>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        T: From<SynthesisEvent> + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(PLAYBACK_QUEUE);

        let synth = SynthesisStage {
            provider: Arc::clone(&self.provider),
            batcher: SentenceBatcher::new(self.min_batch_chars, self.max_batch_chars),
            epoch,
            epochs: epochs.clone(),
            cancel: cancel.clone(),
            queue: queue_tx,
            seq: 0,
            stale: 0,
        };
        let synth_handle = tokio::spawn(synth.run(fragments));

        let sink = Arc::clone(&self.sink);
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            let (chunks_played, played_stale) =
                playback(sink, gate, epoch, &epochs, queue_rx, &out, &cancel).await;
            let synth_stale = synth_handle.await.unwrap_or_default();
            debug!(%epoch, chunks_played, "Synthesis finished");
            let _ = out
                .send(T::from(SynthesisEvent::Finished {
                    epoch,
                    chunks_played,
                    stale_discarded: synth_stale + played_stale,
                }))
                .await;
        })
    }
}

struct SynthesisStage {
    provider: Arc<dyn TtsProvider>,
    batcher: SentenceBatcher,
    epoch: Epoch,
    epochs: EpochReader,
    cancel: CancellationToken,
    queue: mpsc::Sender<Playback>,
    seq: u64,
    stale: u64,
}

impl SynthesisStage {
    fn live(&self) -> bool {
        !self.cancel.is_cancelled() && self.epochs.is_current(self.epoch)
    }

    /// Returns the number of stale fragments discarded.
    async fn run(mut self, mut fragments: mpsc::Receiver<TextFragment>) -> u64 {
        loop {
            let fragment = tokio::select! {
                _ = self.cancel.cancelled() => break,
                f = fragments.recv() => f,
            };
            match fragment {
                Some(fragment) => {
                    if fragment.epoch != self.epoch || !self.epochs.is_current(fragment.epoch) {
                        self.stale += 1;
                        continue;
                    }
                    for unit in self.batcher.push(&fragment.text) {
                        if !self.speak(unit).await {
                            return self.stale;
                        }
                    }
                }
                None => {
                    if let Some(unit) = self.batcher.finish() {
                        self.speak(unit).await;
                    }
                    break;
                }
            }
        }
        self.stale
    }

    /// Synthesize one unit with a single retry. `false` once the turn is over.
    async fn speak(&mut self, unit: String) -> bool {
        let mut last_error = None;

        for attempt in 0..2 {
            if !self.live() {
                return false;
            }
            if attempt > 0 {
                warn!(epoch = %self.epoch, error = ?last_error, "Retrying synthesis");
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                s = self.provider.synthesize(&unit) => s,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            let mut produced = false;
            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    n = stream.next() => n,
                };
                match next {
                    Some(Ok(bytes)) if bytes.is_empty() => {}
                    Some(Ok(bytes)) => {
                        if !self.live() {
                            self.stale += 1;
                            return false;
                        }
                        let chunk = AudioChunk {
                            epoch: self.epoch,
                            seq: self.seq,
                            data: bytes.to_vec(),
                        };
                        self.seq += 1;
                        produced = true;
                        if self.queue.send(Playback::Audio(chunk)).await.is_err() {
                            return false;
                        }
                    }
                    Some(Err(e)) if produced => {
                        // Part of the unit already played; a retry would repeat it.
                        warn!(epoch = %self.epoch, %e, "Synthesis stream broke mid-unit");
                        return true;
                    }
                    Some(Err(e)) => {
                        last_error = Some(e.to_string());
                        break;
                    }
                    None => return true,
                }
            }
        }

        warn!(epoch = %self.epoch, error = ?last_error, "Synthesis failed twice, falling back to text");
        self.live() && self.queue.send(Playback::TextOnly(unit)).await.is_ok()
    }
}

/// Returns `(chunks_played, stale_discarded)`.
async fn playback<T>(
    sink: Arc<dyn AudioSink>,
    gate: Arc<Mutex<()>>,
    epoch: Epoch,
    epochs: &EpochReader,
    mut queue: mpsc::Receiver<Playback>,
    out: &mpsc::Sender<T>,
    cancel: &CancellationToken,
) -> (u64, u64)
where
    T: From<SynthesisEvent> + Send + 'static,
{
    let mut played = 0u64;
    let mut stale = 0u64;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else { break };

        match item {
            Playback::Audio(chunk) => {
                if cancel.is_cancelled() || !epochs.is_current(chunk.epoch) {
                    stale += 1;
                    continue;
                }
                if played == 0 {
                    let _ = out.send(T::from(SynthesisEvent::FirstAudio { epoch })).await;
                }
                let _gate = gate.lock().await;
                if !epochs.is_current(chunk.epoch) {
                    stale += 1;
                    continue;
                }
                if let Err(e) = sink.play(chunk).await {
                    warn!(%epoch, %e, "Audio sink rejected chunk");
                }
                played += 1;
            }
            Playback::TextOnly(text) => {
                if !epochs.is_current(epoch) {
                    stale += 1;
                    continue;
                }
                let _ = out.send(T::from(SynthesisEvent::TextOnly { epoch, text })).await;
            }
        }
    }

    // Anything still queued belongs to a cancelled turn.
    queue.close();
    while let Ok(item) = queue.try_recv() {
        if matches!(item, Playback::Audio(_)) {
            stale += 1;
        }
    }
    (played, stale)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use rusty_voice_core::epoch::EpochCounter;

    use super::*;
    use crate::tts_stream::AudioByteStream;

    /// Yields one chunk per word. Fails the first `fail_first` calls.
    struct WordTts {
        fail_first: AtomicU32,
        calls: AtomicU32,
    }

    impl WordTts {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicU32::new(fail_first),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TtsProvider for WordTts {
        fn id(&self) -> &str {
            "words"
        }

        async fn synthesize(&self, text: &str) -> anyhow::Result<AudioByteStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("synthesis unavailable");
            }
            let chunks: Vec<anyhow::Result<Bytes>> = text
                .split_whitespace()
                .map(|w| Ok(Bytes::from(w.to_string())))
                .collect();
            Ok(Box::pin(tokio_stream::iter(chunks)))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<VecDeque<AudioChunk>>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, chunk: AudioChunk) -> anyhow::Result<()> {
            self.played.lock().unwrap().push_back(chunk);
            Ok(())
        }

        async fn stop(&self, _epoch: Epoch) {}
    }

    fn config() -> TtsConfig {
        TtsConfig {
            min_batch_chars: 5,
            ..TtsConfig::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<SynthesisEvent>) -> Vec<SynthesisEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, SynthesisEvent::Finished { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_plays_chunks_in_order() {
        let counter = EpochCounter::new();
        let epoch = counter.advance();
        let sink = Arc::new(RecordingSink::default());
        let stream = SpeechSynthesisStream::new(WordTts::new(0), sink.clone(), &config());

        let (frag_tx, frag_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        stream.spawn(epoch, counter.reader(), frag_rx, out_tx, CancellationToken::new());

        frag_tx.send(TextFragment::generated(epoch, "It is three. ")).await.unwrap();
        frag_tx.send(TextFragment::generated(epoch, "Good day")).await.unwrap();
        drop(frag_tx);

        let events = collect(out_rx).await;
        assert_eq!(events[0], SynthesisEvent::FirstAudio { epoch });
        assert!(matches!(
            events.last(),
            Some(SynthesisEvent::Finished { chunks_played: 5, stale_discarded: 0, .. })
        ));

        let played = sink.played.lock().unwrap();
        let words: Vec<_> = played.iter().map(|c| String::from_utf8_lossy(&c.data).to_string()).collect();
        assert_eq!(words, vec!["It", "is", "three.", "Good", "day"]);
        assert!(played.iter().enumerate().all(|(i, c)| c.seq == i as u64 && c.epoch == epoch));
    }

    #[tokio::test]
    async fn test_stale_epoch_is_never_played() {
        let counter = EpochCounter::new();
        let epoch = counter.advance();
        let sink = Arc::new(RecordingSink::default());
        let stream = SpeechSynthesisStream::new(WordTts::new(0), sink.clone(), &config());

        let (frag_tx, frag_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        stream.spawn(epoch, counter.reader(), frag_rx, out_tx, CancellationToken::new());

        counter.advance();
        frag_tx.send(TextFragment::generated(epoch, "Too late now. ")).await.unwrap();
        drop(frag_tx);

        let events = collect(out_rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SynthesisEvent::Finished { chunks_played: 0, stale_discarded: 1, .. }
        ));
        assert!(sink.played.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_retry_then_audio() {
        let counter = EpochCounter::new();
        let epoch = counter.advance();
        let tts = WordTts::new(1);
        let sink = Arc::new(RecordingSink::default());
        let stream = SpeechSynthesisStream::new(tts.clone(), sink.clone(), &config());

        let (frag_tx, frag_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        stream.spawn(epoch, counter.reader(), frag_rx, out_tx, CancellationToken::new());
        frag_tx.send(TextFragment::generated(epoch, "Hello there")).await.unwrap();
        drop(frag_tx);

        let events = collect(out_rx).await;
        assert_eq!(events[0], SynthesisEvent::FirstAudio { epoch });
        assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.played.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_failure_falls_back_to_text() {
        let counter = EpochCounter::new();
        let epoch = counter.advance();
        let sink = Arc::new(RecordingSink::default());
        let stream = SpeechSynthesisStream::new(WordTts::new(2), sink.clone(), &config());

        let (frag_tx, frag_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        stream.spawn(epoch, counter.reader(), frag_rx, out_tx, CancellationToken::new());
        frag_tx.send(TextFragment::generated(epoch, "Hello there")).await.unwrap();
        drop(frag_tx);

        let events = collect(out_rx).await;
        assert_eq!(
            events[0],
            SynthesisEvent::TextOnly {
                epoch,
                text: "Hello there".into()
            }
        );
        assert!(matches!(events[1], SynthesisEvent::Finished { chunks_played: 0, .. }));
        assert!(sink.played.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_both_stages() {
        let counter = EpochCounter::new();
        let epoch = counter.advance();
        let sink = Arc::new(RecordingSink::default());
        let stream = SpeechSynthesisStream::new(WordTts::new(0), sink.clone(), &config());

        let (_frag_tx, frag_rx) = mpsc::channel::<TextFragment>(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = stream.spawn(epoch, counter.reader(), frag_rx, out_tx, cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        let events = collect(out_rx).await;
        assert!(matches!(events[0], SynthesisEvent::Finished { chunks_played: 0, .. }));
    }
}
