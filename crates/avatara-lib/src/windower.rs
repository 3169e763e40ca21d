//! Rolling feature windower.
//!
//! Each tick pulls `2 * batch_size` audio chunks (two audio chunks per video
//! frame), forwards every chunk untouched to the pass-through queue, and cuts
//! `batch_size` feature windows out of the rolling buffer. The buffer keeps
//! `stride_left + stride_right` chunks of context between ticks.
//!
//! ```text
//!   [ left ctx | 2B new chunks ... | right ctx ]
//!              ^ window i starts at left + i * (frames per video frame)
//! ```

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::debug;

use avatara_core::types::AudioChunk;

use crate::features::{FeatureBatch, FeatureExtractor};

pub struct FeatureWindower {
    extractor: Arc<dyn FeatureExtractor>,
    passthrough: Sender<AudioChunk>,
    batch_size: usize,
    stride_left: usize,
    stride_right: usize,
    fps: u32,
    buffer: Vec<Vec<f32>>,
}

impl FeatureWindower {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        passthrough: Sender<AudioChunk>,
        batch_size: usize,
        stride_left: usize,
        stride_right: usize,
        fps: u32,
    ) -> Self {
        Self {
            extractor,
            passthrough,
            batch_size,
            stride_left,
            stride_right,
            fps,
            buffer: Vec::new(),
        }
    }

    fn context(&self) -> usize {
        self.stride_left + self.stride_right
    }

    /// Pre-fill the context with `stride_left + stride_right` chunks.
    ///
    /// Only the right-context chunks reach the pass-through queue: the left
    /// context precedes the first window and is never played back, which
    /// keeps audio aligned with the video it drives.
    pub fn warm_up(&mut self, mut next: impl FnMut() -> AudioChunk) {
        self.buffer.clear();
        for i in 0..self.context() {
            let chunk = next();
            self.buffer.push(chunk.samples.clone());
            if i >= self.stride_left {
                let _ = self.passthrough.send(chunk);
            }
        }
        debug!("windower warmed up with {} context chunks", self.buffer.len());
    }

    /// One driving tick.
    pub fn tick(&mut self, mut next: impl FnMut() -> AudioChunk) -> Option<FeatureBatch> {
        for _ in 0..self.batch_size * 2 {
            let chunk = next();
            self.buffer.push(chunk.samples.clone());
            let _ = self.passthrough.send(chunk);
        }
        if self.buffer.len() <= self.context() {
            return None;
        }

        let samples: Vec<f32> = self.buffer.concat();
        let spectrum = self.extractor.spectrogram(&samples);

        // Feature frames covered by one audio chunk.
        let per_chunk = self.extractor.frame_rate() / self.fps as f32;
        let left = self.stride_left as f32 * per_chunk;
        let step = 2.0 * per_chunk;
        let count = (self.buffer.len() - self.context()) / 2;
        let window_len = self.extractor.window_frames();
        let floor = self.extractor.floor();

        let batch: FeatureBatch = (0..count)
            .map(|i| spectrum.window((left + i as f32 * step) as usize, window_len, floor))
            .collect();

        let keep = self.context();
        let drop = self.buffer.len() - keep;
        self.buffer.drain(..drop);
        Some(batch)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
