//! Audio ingest queue.
//!
//! Producers (uploads, the synthesis worker) push fixed-size speech chunks;
//! the driver pulls one chunk per audio tick. When nothing is queued the
//! driver gets idle audio instead: the active custom clip, or silence.
//!
//! Every queued chunk is stamped with the interrupt epoch it was produced
//! under. `clear` bumps the epoch, so a chunk that lands after the clear but
//! was produced before it is skipped on the way out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use avatara_core::chunk::slice_chunks;
use avatara_core::types::{AudioChunk, ChunkKind, EventPoint};

use crate::custom::CustomState;
use crate::error::SessionError;

/// How long the driver waits for queued speech before producing idle audio.
pub const INGEST_POLL: Duration = Duration::from_millis(10);

struct Stamped {
    epoch: u64,
    chunk: AudioChunk,
}

#[derive(Clone)]
pub struct AudioIngest {
    tx: Sender<Stamped>,
    rx: Receiver<Stamped>,
    epoch: Arc<AtomicU64>,
    chunk_size: usize,
}

impl AudioIngest {
    pub fn new(chunk_size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            epoch: Arc::new(AtomicU64::new(0)),
            chunk_size,
        }
    }

    /// Current interrupt epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Queue one speech chunk of exactly `chunk_size` samples.
    pub fn put_audio_chunk(
        &self,
        samples: Vec<f32>,
        eventpoint: Option<EventPoint>,
    ) -> Result<(), SessionError> {
        if samples.len() != self.chunk_size {
            return Err(SessionError::ChunkSize {
                expected: self.chunk_size,
                got: samples.len(),
            });
        }
        self.push(AudioChunk::speech(samples, eventpoint));
        Ok(())
    }

    /// Queue an already-sized chunk under the current epoch.
    pub(crate) fn push(&self, chunk: AudioChunk) {
        self.push_stamped(self.epoch(), chunk);
    }

    /// Queue a chunk produced under `epoch`. Dropped on the way out if an
    /// interrupt has happened since.
    pub(crate) fn push_stamped(&self, epoch: u64, chunk: AudioChunk) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(Stamped { epoch, chunk });
    }

    /// Slice raw 16 kHz samples into chunks and queue them as speech.
    /// Returns `(queued, dropped_samples)`.
    pub fn put_samples(&self, samples: &[f32], pad_partial: bool) -> (usize, usize) {
        let (chunks, dropped) = slice_chunks(samples, self.chunk_size, pad_partial);
        let queued = chunks.len();
        for chunk in chunks {
            self.push(AudioChunk::speech(chunk, None));
        }
        (queued, dropped)
    }

    /// Start a new epoch and drop everything queued. Returns the number of
    /// discarded chunks.
    pub fn clear(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Next chunk for the driver: queued speech, else idle audio.
    pub fn next_chunk(&self, custom: &CustomState) -> AudioChunk {
        self.next_chunk_within(INGEST_POLL, custom)
    }

    pub fn next_chunk_within(&self, wait: Duration, custom: &CustomState) -> AudioChunk {
        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(stamped) if stamped.epoch == self.epoch() => return stamped.chunk,
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        match custom.next_audio(self.chunk_size) {
            Some((id, samples)) => AudioChunk {
                samples,
                kind: ChunkKind::Custom(id),
                eventpoint: None,
            },
            None => AudioChunk::silence(self.chunk_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom::tests::test_clip;
    use avatara_core::types::EventStatus;

    #[test]
    fn rejects_wrong_chunk_size() {
        let ingest = AudioIngest::new(320);
        let err = ingest.put_audio_chunk(vec![0.0; 100], None).unwrap_err();
        assert!(matches!(err, SessionError::ChunkSize { expected: 320, got: 100 }));
        assert!(ingest.is_empty());
    }

    #[test]
    fn queued_speech_comes_first() {
        let ingest = AudioIngest::new(4);
        let custom = CustomState::new(vec![]);
        ingest
            .put_audio_chunk(vec![0.1; 4], Some(EventPoint::start("hi", None)))
            .unwrap();
        let chunk = ingest.next_chunk(&custom);
        assert_eq!(chunk.kind, ChunkKind::Speech);
        assert_eq!(chunk.eventpoint.unwrap().status, EventStatus::Start);
    }

    #[test]
    fn empty_queue_yields_silence() {
        let ingest = AudioIngest::new(4);
        let custom = CustomState::new(vec![]);
        let chunk = ingest.next_chunk(&custom);
        assert_eq!(chunk.kind, ChunkKind::Silence);
        assert_eq!(chunk.samples, vec![0.0; 4]);
    }

    #[test]
    fn empty_queue_plays_custom_clip() {
        let ingest = AudioIngest::new(4);
        let custom = CustomState::new(vec![test_clip(3, 2, 6)]);
        custom.set(3, true);
        let chunk = ingest.next_chunk(&custom);
        assert_eq!(chunk.kind, ChunkKind::Custom(3));
        assert_eq!(chunk.samples, vec![0.5; 4]);
        let tail = ingest.next_chunk(&custom);
        assert_eq!(tail.samples, vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(ingest.next_chunk(&custom).kind, ChunkKind::Silence);
    }

    #[test]
    fn put_samples_drops_remainder() {
        let ingest = AudioIngest::new(320);
        assert_eq!(ingest.put_samples(&[0.2; 1000], false), (3, 40));
        assert_eq!(ingest.len(), 3);
        assert_eq!(ingest.put_samples(&[0.2; 1000], true), (4, 0));
        assert_eq!(ingest.len(), 7);
    }

    #[test]
    fn clear_discards_queue() {
        let ingest = AudioIngest::new(2);
        ingest.put_samples(&[0.0; 10], false);
        assert_eq!(ingest.clear(), 5);
        assert!(ingest.is_empty());
        assert_eq!(ingest.epoch(), 1);
    }

    #[test]
    fn chunk_from_before_clear_is_skipped() {
        let ingest = AudioIngest::new(4);
        let custom = CustomState::new(vec![]);
        let before = ingest.epoch();
        ingest.clear();
        // Produced before the interrupt, queued after it.
        ingest.push_stamped(before, AudioChunk::speech(vec![0.9; 4], Some(EventPoint::start("old", None))));
        ingest.put_audio_chunk(vec![0.1; 4], None).unwrap();
        let chunk = ingest.next_chunk(&custom);
        assert_eq!(chunk.samples, vec![0.1; 4]);
        assert!(chunk.eventpoint.is_none());
        assert_eq!(ingest.next_chunk(&custom).kind, ChunkKind::Silence);
    }
}
