//! Batched inference scheduler.
//!
//! Pairs each feature batch with the `2 * batch_size` pass-through audio
//! chunks that produced it and turns them into `batch_size` frame slots.
//! Batches whose audio is entirely non-speech skip the renderer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use image::RgbImage;
use tracing::{debug, info, warn};

use avatara_core::mirror::mirror_index;
use avatara_core::types::AudioChunk;

use crate::error::RenderError;
use crate::features::FeatureBatch;
use crate::renderer::Renderer;
use crate::stage::{CancelFlag, Flow, recv_until, send_until};

/// One pending video frame.
#[derive(Debug)]
pub struct FrameSlot {
    /// Strictly increasing within a session.
    pub seq: u64,
    /// Mirrored position in the avatar cycle.
    pub index: usize,
    /// Predicted face crop, `None` for no-op slots.
    pub crop: Option<RgbImage>,
    /// The two audio chunks played while this frame is on screen.
    pub audio: [AudioChunk; 2],
}

impl FrameSlot {
    /// Both audio halves are idle audio.
    pub fn is_silent(&self) -> bool {
        !self.audio[0].kind.is_speech() && !self.audio[1].kind.is_speech()
    }
}

const FPS_LOG_EVERY: usize = 100;

pub struct InferenceScheduler {
    renderer: Arc<dyn Renderer>,
    cycle_len: usize,
    batch_size: usize,
    counter: usize,
    seq: u64,
    rendered: usize,
    render_time: Duration,
}

impl InferenceScheduler {
    pub fn new(renderer: Arc<dyn Renderer>, cycle_len: usize, batch_size: usize) -> Self {
        Self {
            renderer,
            cycle_len: cycle_len.max(1),
            batch_size,
            counter: 0,
            seq: 0,
            rendered: 0,
            render_time: Duration::ZERO,
        }
    }

    /// Turn one batch and its `2 * batch_size` audio chunks into slots.
    pub fn process(&mut self, batch: FeatureBatch, audio: Vec<AudioChunk>) -> Vec<FrameSlot> {
        let all_idle = audio.iter().all(|c| !c.kind.is_speech());
        let crops = if all_idle {
            None
        } else {
            match self.render(&batch) {
                Ok(crops) => Some(crops),
                Err(e) => {
                    warn!("inference batch failed, emitting idle frames: {e}");
                    None
                }
            }
        };

        let mut crops = crops.map(|c| c.into_iter());
        let mut audio = audio.into_iter();
        let mut slots = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let (Some(a), Some(b)) = (audio.next(), audio.next()) else {
                break;
            };
            slots.push(FrameSlot {
                seq: self.seq,
                index: mirror_index(self.cycle_len, self.counter),
                crop: crops.as_mut().and_then(|c| c.next()),
                audio: [a, b],
            });
            self.seq += 1;
            self.counter += 1;
        }
        slots
    }

    fn render(&mut self, batch: &FeatureBatch) -> Result<Vec<RgbImage>, RenderError> {
        let indices: Vec<usize> = (0..batch.len())
            .map(|i| mirror_index(self.cycle_len, self.counter + i))
            .collect();
        let t = Instant::now();
        let crops = self.renderer.infer(batch, &indices)?;
        if crops.len() != self.batch_size {
            return Err(RenderError::BatchShape {
                expected: self.batch_size,
                got: crops.len(),
            });
        }

        self.render_time += t.elapsed();
        self.rendered += crops.len();
        if self.rendered >= FPS_LOG_EVERY {
            info!(
                "average inference fps: {:.1}",
                self.rendered as f64 / self.render_time.as_secs_f64().max(1e-9)
            );
            self.rendered = 0;
            self.render_time = Duration::ZERO;
        }
        Ok(crops)
    }

    /// Worker loop. Exits on cancellation or when a neighbour stage is gone.
    pub fn run(
        mut self,
        features: Receiver<FeatureBatch>,
        passthrough: Receiver<AudioChunk>,
        slots: Sender<FrameSlot>,
        timeout: Duration,
        cancel: CancelFlag,
    ) {
        info!("inference scheduler started");
        'outer: loop {
            let batch = match recv_until(&features, timeout, &cancel) {
                Flow::Ready(b) => b,
                Flow::Cancelled | Flow::Disconnected => break,
            };

            let mut audio = Vec::with_capacity(self.batch_size * 2);
            while audio.len() < self.batch_size * 2 {
                match recv_until(&passthrough, timeout, &cancel) {
                    Flow::Ready(c) => audio.push(c),
                    Flow::Cancelled | Flow::Disconnected => break 'outer,
                }
            }

            for slot in self.process(batch, audio) {
                if send_until(&slots, slot, timeout, &cancel) != Flow::Ready(()) {
                    break 'outer;
                }
            }
        }
        let dropped = features.try_iter().count() + passthrough.try_iter().count();
        debug!("scheduler drained {dropped} queued items");
        info!("inference scheduler stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use image::Rgb;

    use crate::features::FeatureWindow;

    /// Records every call; returns crops whose pixel value is the cycle index.
    #[derive(Default)]
    pub(crate) struct FakeRenderer {
        pub calls: Mutex<Vec<Vec<usize>>>,
        pub fail: bool,
        pub short: bool,
    }

    impl Renderer for FakeRenderer {
        fn infer(
            &self,
            windows: &[FeatureWindow],
            indices: &[usize],
        ) -> Result<Vec<RgbImage>, RenderError> {
            self.calls.lock().unwrap().push(indices.to_vec());
            if self.fail {
                return Err(RenderError::Inference("boom".into()));
            }
            let n = if self.short { windows.len() - 1 } else { windows.len() };
            Ok(indices[..n]
                .iter()
                .map(|&i| RgbImage::from_pixel(4, 4, Rgb([i as u8; 3])))
                .collect())
        }
    }

    pub(crate) fn batch(n: usize) -> FeatureBatch {
        vec![
            FeatureWindow {
                bins: 1,
                frames: 1,
                data: vec![0.0],
            };
            n
        ]
    }

    fn speech() -> AudioChunk {
        AudioChunk::speech(vec![0.0; 4], None)
    }

    fn silence() -> AudioChunk {
        AudioChunk::silence(4)
    }

    #[test]
    fn silent_batch_skips_renderer() {
        let renderer = Arc::new(FakeRenderer::default());
        let mut s = InferenceScheduler::new(renderer.clone(), 5, 2);
        let slots = s.process(batch(2), vec![silence(), silence(), silence(), silence()]);
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.crop.is_none() && s.is_silent()));
        assert!(renderer.calls.lock().unwrap().is_empty());
        assert_eq!(slots[1].index, 1);
    }

    #[test]
    fn one_speech_chunk_renders_whole_batch() {
        let renderer = Arc::new(FakeRenderer::default());
        let mut s = InferenceScheduler::new(renderer.clone(), 5, 2);
        let slots = s.process(batch(2), vec![silence(), silence(), silence(), speech()]);
        assert_eq!(renderer.calls.lock().unwrap().len(), 1);
        assert!(slots.iter().all(|s| s.crop.is_some()));
        assert!(slots[0].is_silent());
        assert!(!slots[1].is_silent());
    }

    #[test]
    fn indices_mirror_across_batches() {
        let renderer = Arc::new(FakeRenderer::default());
        let mut s = InferenceScheduler::new(renderer.clone(), 3, 2);
        let mut indices = Vec::new();
        let mut seqs = Vec::new();
        for _ in 0..3 {
            for slot in s.process(batch(2), vec![speech(), speech(), speech(), speech()]) {
                assert_eq!(slot.crop.as_ref().unwrap().get_pixel(0, 0)[0] as usize, slot.index);
                indices.push(slot.index);
                seqs.push(slot.seq);
            }
        }
        assert_eq!(indices, vec![0, 1, 2, 2, 1, 0]);
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(
            *renderer.calls.lock().unwrap(),
            vec![vec![0, 1], vec![2, 2], vec![1, 0]]
        );
    }

    #[test]
    fn renderer_failure_yields_noop_slots() {
        let renderer = Arc::new(FakeRenderer {
            fail: true,
            ..Default::default()
        });
        let mut s = InferenceScheduler::new(renderer, 5, 2);
        let slots = s.process(batch(2), vec![speech(), speech(), speech(), speech()]);
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.crop.is_none()));
        // Counter still advances.
        let next = s.process(batch(2), vec![silence(), silence(), silence(), silence()]);
        assert_eq!(next[0].index, 2);
    }

    #[test]
    fn short_crop_batch_is_rejected() {
        let renderer = Arc::new(FakeRenderer {
            short: true,
            ..Default::default()
        });
        let mut s = InferenceScheduler::new(renderer, 5, 2);
        let slots = s.process(batch(2), vec![speech(), speech(), speech(), speech()]);
        assert!(slots.iter().all(|s| s.crop.is_none()));
    }

    #[test]
    fn audio_pairs_stay_in_order() {
        let mut s = InferenceScheduler::new(Arc::new(FakeRenderer::default()), 5, 2);
        let audio = (0..4)
            .map(|i| AudioChunk::speech(vec![i as f32; 4], None))
            .collect();
        let slots = s.process(batch(2), audio);
        assert_eq!(slots[0].audio[0].samples[0], 0.0);
        assert_eq!(slots[0].audio[1].samples[0], 1.0);
        assert_eq!(slots[1].audio[1].samples[0], 3.0);
    }

    #[test]
    fn run_exits_on_cancel() {
        let (_ftx, frx) = crossbeam_channel::bounded::<FeatureBatch>(2);
        let (_ptx, prx) = crossbeam_channel::unbounded();
        let (stx, _srx) = crossbeam_channel::bounded(4);
        let cancel = CancelFlag::new();
        let s = InferenceScheduler::new(Arc::new(FakeRenderer::default()), 5, 2);
        let c = cancel.clone();
        let handle = std::thread::spawn(move || {
            s.run(frx, prx, stx, Duration::from_millis(10), c);
        });
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn run_pairs_batches_with_passthrough() {
        let (ftx, frx) = crossbeam_channel::bounded(2);
        let (ptx, prx) = crossbeam_channel::unbounded();
        let (stx, srx) = crossbeam_channel::bounded(4);
        let cancel = CancelFlag::new();
        let s = InferenceScheduler::new(Arc::new(FakeRenderer::default()), 5, 1);
        let c = cancel.clone();
        let handle = std::thread::spawn(move || {
            s.run(frx, prx, stx, Duration::from_millis(10), c);
        });
        ftx.send(batch(1)).unwrap();
        ptx.send(speech()).unwrap();
        ptx.send(silence()).unwrap();
        let slot = srx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(slot.seq, 0);
        assert!(slot.crop.is_some());
        cancel.cancel();
        handle.join().unwrap();
    }
}
