//! Text-to-speech stage.
//!
//! `put_text` queues text; a worker thread synthesizes each utterance
//! through a [`SpeechSynth`] backend, resamples it to the pipeline rate and
//! slices it into tagged chunks on the audio ingest. Each text is stamped
//! with the ingest's interrupt epoch when queued; audio from an older epoch
//! is abandoned mid-stream and skipped by the ingest if it slips through.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use avatara_core::chunk::UtteranceChunker;
use avatara_core::types::SynthConfig;
use avatara_core::wav::{SAMPLE_RATE, StreamResampler, bytes_to_i16, i16_to_f32};

use crate::error::SynthError;
use crate::ingest::AudioIngest;
use crate::stage::{CancelFlag, Flow, recv_until};

/// Streaming speech backend.
pub trait SpeechSynth: Send + Sync {
    /// Synthesize `text`, handing mono PCM pieces at [`sample_rate`] to
    /// `sink` as they arrive. Stops early when `sink` returns `false`.
    ///
    /// [`sample_rate`]: SpeechSynth::sample_rate
    fn synthesize(&self, text: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError>;

    fn sample_rate(&self) -> u32;
}

/// Kokoro PCM streaming format: 24 kHz mono 16-bit signed LE.
const KOKORO_SAMPLE_RATE: u32 = 24_000;

/// Kokoro-FastAPI backend, streamed over HTTP.
pub struct KokoroSynth {
    url: String,
    voice: String,
    speed: f32,
}

impl KokoroSynth {
    pub fn new(config: &SynthConfig) -> Self {
        Self {
            url: format!("{}/v1/audio/speech", config.kokoro_url.trim_end_matches('/')),
            voice: config.voice.clone(),
            speed: config.speed,
        }
    }

    async fn stream(&self, text: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError> {
        let body = serde_json::json!({
            "input": text,
            "voice": self.voice,
            "model": "kokoro",
            "response_format": "pcm",
            "stream": true,
            "speed": self.speed,
        });
        debug!("synth: POST {} chars", text.len());

        let resp = reqwest::Client::new()
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthError::Backend { status, body });
        }

        let mut stream = resp.bytes_stream();
        let mut leftover: Option<u8> = None;
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| SynthError::Stream(e.to_string()))?;
            let (samples, lo) = bytes_to_i16(&piece, leftover.take());
            leftover = lo;
            if !samples.is_empty() && !sink(&i16_to_f32(&samples)) {
                debug!("synth: stream abandoned");
                break;
            }
        }
        Ok(())
    }
}

impl SpeechSynth for KokoroSynth {
    fn synthesize(&self, text: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError> {
        // Runs on the synth worker thread, outside any async context.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SynthError::Request(format!("runtime: {e}")))?;
        runtime.block_on(self.stream(text, sink))
    }

    fn sample_rate(&self) -> u32 {
        KOKORO_SAMPLE_RATE
    }
}

struct TextJob {
    text: String,
    msgevent: Option<serde_json::Value>,
    epoch: u64,
}

/// Session-side handle to the synth worker, feeding one ingest.
#[derive(Clone)]
pub struct SynthQueue {
    tx: Sender<TextJob>,
    rx: Receiver<TextJob>,
    ingest: AudioIngest,
}

impl SynthQueue {
    pub fn new(ingest: AudioIngest) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx, ingest }
    }

    pub fn put_text(&self, text: &str, msgevent: Option<serde_json::Value>) {
        let _ = self.tx.send(TextJob {
            text: text.to_string(),
            msgevent,
            epoch: self.ingest.epoch(),
        });
    }

    /// Abandon the utterance in flight and everything queued behind it:
    /// clears the ingest, which starts a new epoch, then drops queued texts.
    /// Returns `(texts, chunks)` discarded.
    pub fn interrupt(&self) -> (usize, usize) {
        let chunks = self.ingest.clear();
        (self.rx.try_iter().count(), chunks)
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Worker loop: synthesize queued texts into the ingest until cancelled.
    pub fn run(
        self,
        synth: Arc<dyn SpeechSynth>,
        pad_partial: bool,
        timeout: Duration,
        cancel: CancelFlag,
    ) {
        info!("synth worker started");
        loop {
            let job = match recv_until(&self.rx, timeout, &cancel) {
                Flow::Ready(job) => job,
                Flow::Cancelled | Flow::Disconnected => break,
            };
            if job.epoch != self.ingest.epoch() {
                debug!("synth: discarding stale text");
                continue;
            }
            self.speak(synth.as_ref(), pad_partial, job);
        }
        info!("synth worker stopped");
    }

    fn speak(&self, synth: &dyn SpeechSynth, pad_partial: bool, job: TextJob) {
        let ingest = &self.ingest;
        let live = || ingest.epoch() == job.epoch;
        let mut resampler = StreamResampler::new(synth.sample_rate(), SAMPLE_RATE);
        let mut chunker = UtteranceChunker::new(ingest.chunk_size(), pad_partial, &job.text, job.msgevent.clone());

        let result = synth.synthesize(&job.text, &mut |pcm: &[f32]| {
            if !live() {
                return false;
            }
            for chunk in chunker.push(&resampler.process(pcm)) {
                ingest.push_stamped(job.epoch, chunk);
            }
            true
        });

        if !live() {
            debug!("synth: utterance interrupted");
            return;
        }
        if let Err(e) = result {
            // Still close the utterance so the start/end markers reach the client.
            warn!("synthesis failed, emitting silence: {e}");
        }
        let tail = chunker.finish();
        debug!("synth: utterance done ({} chars)", job.text.len());
        for chunk in tail {
            ingest.push_stamped(job.epoch, chunk);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use avatara_core::types::{AudioChunk, EventStatus};

    use crate::custom::CustomState;

    /// Emits `pieces` pieces of `piece_len` samples at 16 kHz, or fails.
    pub(crate) struct FakeSynth {
        pub pieces: usize,
        pub piece_len: usize,
        pub fail: bool,
        pub texts: Mutex<Vec<String>>,
    }

    impl FakeSynth {
        pub(crate) fn new(pieces: usize, piece_len: usize) -> Self {
            Self {
                pieces,
                piece_len,
                fail: false,
                texts: Mutex::new(Vec::new()),
            }
        }
    }

    impl SpeechSynth for FakeSynth {
        fn synthesize(&self, text: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError> {
            self.texts.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(SynthError::Backend {
                    status: 500,
                    body: "down".into(),
                });
            }
            for _ in 0..self.pieces {
                if !sink(&vec![0.25; self.piece_len]) {
                    break;
                }
            }
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            SAMPLE_RATE
        }
    }

    fn drain(ingest: &AudioIngest) -> Vec<AudioChunk> {
        let idle = CustomState::new(Vec::new());
        (0..ingest.len()).map(|_| ingest.next_chunk(&idle)).collect()
    }

    fn status(chunk: &AudioChunk) -> Option<EventStatus> {
        chunk.eventpoint.as_ref().map(|e| e.status)
    }

    fn job(text: &str, epoch: u64) -> TextJob {
        TextJob {
            text: text.into(),
            msgevent: None,
            epoch,
        }
    }

    /// 24 kHz backend that streams `total` samples in `piece`-sized pieces.
    struct Rate24k {
        total: usize,
        piece: usize,
    }

    impl SpeechSynth for Rate24k {
        fn synthesize(&self, _: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError> {
            let pcm = vec![0.1; self.total];
            for piece in pcm.chunks(self.piece) {
                if !sink(piece) {
                    break;
                }
            }
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    #[test]
    fn utterance_chunks_carry_start_and_end() {
        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        let synth = FakeSynth::new(3, 500);
        q.speak(&synth, false, job("hello", 0));
        let chunks = drain(&ingest);
        // 1500 samples: four full chunks, 220 dropped.
        assert_eq!(chunks.len(), 4);
        assert_eq!(status(&chunks[0]), Some(EventStatus::Start));
        assert_eq!(status(&chunks[1]), None);
        assert_eq!(status(&chunks[3]), Some(EventStatus::End));
        assert!(chunks.iter().all(|c| c.kind.is_speech()));
    }

    #[test]
    fn failure_still_brackets_utterance() {
        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        let synth = FakeSynth {
            fail: true,
            ..FakeSynth::new(0, 0)
        };
        q.speak(&synth, false, TextJob {
            text: "oops".into(),
            msgevent: Some(serde_json::json!({"id": 1})),
            epoch: 0,
        });
        let chunks = drain(&ingest);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.samples.iter().all(|&s| s == 0.0)));
        assert_eq!(status(&chunks[0]), Some(EventStatus::Start));
        let end = chunks[1].eventpoint.as_ref().unwrap();
        assert_eq!(end.status, EventStatus::End);
        assert_eq!(end.msgevent, Some(serde_json::json!({"id": 1})));
    }

    #[test]
    fn resamples_to_pipeline_rate() {
        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        q.speak(&Rate24k { total: 2400, piece: 2400 }, false, job("x", 0));
        // 100 ms at 24 kHz is 1600 samples at 16 kHz: five chunks.
        assert_eq!(drain(&ingest).len(), 5);
    }

    #[test]
    fn small_network_pieces_lose_no_audio() {
        for piece in [1, 2, 7, 481] {
            let ingest = AudioIngest::new(320);
            let q = SynthQueue::new(ingest.clone());
            q.speak(&Rate24k { total: 2400, piece }, false, job("x", 0));
            let chunks = drain(&ingest);
            assert_eq!(chunks.len(), 5, "piece size {piece}");
            assert!(
                chunks.iter().flat_map(|c| &c.samples).all(|&s| (s - 0.1).abs() < 1e-6),
                "piece size {piece}"
            );
        }
    }

    #[test]
    fn interrupt_drops_queue_and_stale_jobs() {
        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        q.put_text("one", None);
        q.put_text("two", None);
        assert_eq!(q.pending(), 2);
        assert_eq!(q.interrupt(), (2, 0));
        assert_eq!(q.pending(), 0);

        let synth = FakeSynth::new(2, 320);
        // A job stamped before the interrupt produces nothing.
        q.speak(&synth, false, job("stale", 0));
        assert!(ingest.is_empty());
    }

    #[test]
    fn interrupt_during_utterance_discards_its_audio() {
        /// Interrupts the session after the second piece, then keeps talking.
        struct Interrupted {
            queue: Mutex<Option<SynthQueue>>,
        }
        impl SpeechSynth for Interrupted {
            fn synthesize(&self, _: &str, sink: &mut dyn FnMut(&[f32]) -> bool) -> Result<(), SynthError> {
                for i in 0..6 {
                    if i == 2 {
                        if let Some(q) = self.queue.lock().unwrap().as_ref() {
                            q.interrupt();
                        }
                    }
                    sink(&[0.5; 320]);
                }
                Ok(())
            }
            fn sample_rate(&self) -> u32 {
                SAMPLE_RATE
            }
        }

        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        let synth = Interrupted {
            queue: Mutex::new(Some(q.clone())),
        };
        q.speak(&synth, false, job("cut off", ingest.epoch()));
        let idle = CustomState::new(Vec::new());
        assert!(!ingest.next_chunk(&idle).kind.is_speech());

        // The next utterance, stamped after the interrupt, plays in full.
        *synth.queue.lock().unwrap() = None;
        q.speak(&FakeSynth::new(2, 320), false, job("next", ingest.epoch()));
        let chunks = drain(&ingest);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].eventpoint.as_ref().unwrap().text, "next");
    }

    #[test]
    fn worker_processes_queue_until_cancelled() {
        let ingest = AudioIngest::new(320);
        let q = SynthQueue::new(ingest.clone());
        let synth = Arc::new(FakeSynth::new(2, 320));
        let cancel = CancelFlag::new();
        let (worker, s, c) = (q.clone(), synth.clone(), cancel.clone());
        let handle = std::thread::spawn(move || {
            worker.run(s, false, Duration::from_millis(5), c);
        });
        q.put_text("hi there", None);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ingest.len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        handle.join().unwrap();
        assert_eq!(ingest.len(), 2);
        assert_eq!(*synth.texts.lock().unwrap(), vec!["hi there".to_string()]);
    }
}
