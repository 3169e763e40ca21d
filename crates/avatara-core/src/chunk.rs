//! Slicing PCM into fixed-size pipeline chunks.

use crate::types::{AudioChunk, EventPoint};

/// Split `samples` into `chunk_size` slices.
///
/// Returns the chunks and the number of trailing samples that did not fill a
/// chunk. With `pad_partial` the remainder is zero-padded into one last chunk
/// instead and the returned count is zero. Nothing is carried between calls.
pub fn slice_chunks(samples: &[f32], chunk_size: usize, pad_partial: bool) -> (Vec<Vec<f32>>, usize) {
    if chunk_size == 0 {
        return (Vec::new(), samples.len());
    }
    let mut chunks: Vec<Vec<f32>> = samples
        .chunks_exact(chunk_size)
        .map(|c| c.to_vec())
        .collect();
    let remainder = samples.len() % chunk_size;
    if remainder == 0 {
        return (chunks, 0);
    }
    if pad_partial {
        let mut last = samples[samples.len() - remainder..].to_vec();
        last.resize(chunk_size, 0.0);
        chunks.push(last);
        return (chunks, 0);
    }
    (chunks, remainder)
}

/// Streaming slicer for one synthesized utterance.
///
/// Audio arrives in arbitrary pieces; full chunks come out tagged as speech.
/// The first chunk carries a `start` eventpoint and the last an `end`
/// eventpoint, so one chunk is always held back until [`finish`] is called.
///
/// [`finish`]: UtteranceChunker::finish
pub struct UtteranceChunker {
    chunk_size: usize,
    pad_partial: bool,
    text: String,
    msgevent: Option<serde_json::Value>,
    pending: Vec<f32>,
    held: Option<Vec<f32>>,
    emitted: usize,
}

impl UtteranceChunker {
    pub fn new(
        chunk_size: usize,
        pad_partial: bool,
        text: &str,
        msgevent: Option<serde_json::Value>,
    ) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pad_partial,
            text: text.to_string(),
            msgevent,
            pending: Vec::new(),
            held: None,
            emitted: 0,
        }
    }

    /// Feed samples, returning every chunk that is now known not to be last.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let rest = self.pending.split_off(self.chunk_size);
            let chunk = std::mem::replace(&mut self.pending, rest);
            if let Some(prev) = self.held.replace(chunk) {
                out.push(self.tag(prev));
            }
        }
        out
    }

    /// Flush the utterance. Always yields at least two chunks when nothing
    /// was emitted yet, so both eventpoints reach the transport.
    pub fn finish(mut self) -> Vec<AudioChunk> {
        let mut out = Vec::new();
        if self.pad_partial && !self.pending.is_empty() {
            let mut last = std::mem::take(&mut self.pending);
            last.resize(self.chunk_size, 0.0);
            if let Some(prev) = self.held.replace(last) {
                out.push(self.tag(prev));
            }
        }

        if self.emitted == 0 {
            let first = self.held.take().unwrap_or_else(|| vec![0.0; self.chunk_size]);
            out.push(self.tag(first));
            out.push(AudioChunk::speech(
                vec![0.0; self.chunk_size],
                Some(EventPoint::end(&self.text, self.msgevent.clone())),
            ));
            return out;
        }

        if let Some(last) = self.held.take() {
            out.push(AudioChunk::speech(
                last,
                Some(EventPoint::end(&self.text, self.msgevent.clone())),
            ));
        }
        out
    }

    /// Chunks emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn tag(&mut self, samples: Vec<f32>) -> AudioChunk {
        let eventpoint = (self.emitted == 0).then(|| EventPoint::start(&self.text, self.msgevent.clone()));
        self.emitted += 1;
        AudioChunk::speech(samples, eventpoint)
    }
}
