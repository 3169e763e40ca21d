//! Output pacer.
//!
//! Splits each composed frame into its two audio sub-chunks and hands them to
//! the transport, holding back while the consumer falls behind and, in
//! realtime mode, keeping emission on the audio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use avatara_core::types::SessionConfig;
use avatara_core::wav::f32_to_s16le;

use crate::compositor::{ComposedFrame, Compositor};
use crate::error::TransportError;
use crate::recorder::Recorder;
use crate::scheduler::FrameSlot;
use crate::stage::{CancelFlag, Flow, recv_until, sleep_cancellable};
use crate::transport::{EnqueueError, FrameSink, PacedFrame};

/// Sleep applied once per check while the transport backlog is over the
/// limit. Grows with the backlog: 80% of the time the queued video frames
/// take to play.
pub fn backpressure_delay(backlog: usize, chunk_interval: Duration) -> Duration {
    let backlog = u32::try_from(backlog).unwrap_or(u32::MAX).min(u32::MAX / 8);
    chunk_interval * (backlog * 8) / 5
}

/// Wall-clock schedule for realtime emission.
struct Cadence {
    start: Option<Instant>,
    interval: Duration,
    ticks: u32,
}

impl Cadence {
    fn new(interval: Duration) -> Self {
        Self {
            start: None,
            interval,
            ticks: 0,
        }
    }

    /// Wait for the next tick. `false` if cancelled while waiting.
    fn wait(&mut self, slice: Duration, cancel: &CancelFlag) -> bool {
        let start = *self.start.get_or_insert_with(Instant::now);
        let due = start + self.interval * self.ticks;
        self.ticks = self.ticks.wrapping_add(1);
        let now = Instant::now();
        if due <= now {
            return !cancel.is_cancelled();
        }
        sleep_cancellable(due - now, slice, cancel)
    }
}

pub struct Pacer {
    sink: Arc<dyn FrameSink>,
    recorder: Arc<Recorder>,
    chunk_interval: Duration,
    backlog_limit: usize,
    timeout: Duration,
    cadence: Option<Cadence>,
    emitted: Arc<AtomicU64>,
}

impl Pacer {
    pub fn new(
        config: &SessionConfig,
        sink: Arc<dyn FrameSink>,
        recorder: Arc<Recorder>,
        emitted: Arc<AtomicU64>,
    ) -> Self {
        let chunk_interval = config.chunk_interval();
        Self {
            sink,
            recorder,
            chunk_interval,
            backlog_limit: (config.backlog_factor * config.batch_size as f32).ceil() as usize,
            timeout: config.queue_timeout,
            cadence: config.realtime.then(|| Cadence::new(chunk_interval)),
            emitted,
        }
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    /// Block while the transport holds more than the backlog limit.
    /// `false` if cancelled.
    fn throttle(&self, cancel: &CancelFlag) -> bool {
        loop {
            let backlog = self.sink.backlog();
            if backlog <= self.backlog_limit {
                return !cancel.is_cancelled();
            }
            let delay = backpressure_delay(backlog, self.chunk_interval);
            debug!("transport backlog {backlog}, pausing {delay:?}");
            if !sleep_cancellable(delay, self.timeout, cancel) {
                return false;
            }
        }
    }

    /// Emit one composed frame as two paced frames. Returns `Ok` without
    /// emitting once cancelled.
    pub fn emit(&mut self, frame: ComposedFrame, cancel: &CancelFlag) -> Result<(), TransportError> {
        if !self.throttle(cancel) {
            return Ok(());
        }
        self.recorder.write_video(&frame.image);

        let ComposedFrame { seq, image, audio } = frame;
        for (sub_index, chunk) in audio.into_iter().enumerate() {
            if let Some(cadence) = self.cadence.as_mut() {
                if !cadence.wait(self.timeout, cancel) {
                    return Ok(());
                }
            }
            let pcm = f32_to_s16le(&chunk.samples);
            self.recorder.write_audio(&pcm);
            let paced = PacedFrame {
                video: image.clone(),
                audio: pcm,
                eventpoint: chunk.eventpoint,
                slot: seq,
                sub_index: sub_index as u8,
            };
            if !self.enqueue(paced, cancel)? {
                return Ok(());
            }
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retry a full transport until it accepts the frame. Never drops.
    fn enqueue(&self, mut frame: PacedFrame, cancel: &CancelFlag) -> Result<bool, TransportError> {
        loop {
            match self.sink.enqueue(frame) {
                Ok(()) => return Ok(true),
                Err(EnqueueError::Closed) => return Err(TransportError::Closed),
                Err(EnqueueError::Full(back)) => {
                    frame = back;
                    if !sleep_cancellable(self.chunk_interval, self.timeout, cancel) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Compose-and-emit loop. Exits on cancellation or when the scheduler is
    /// gone. A closed transport cancels the whole session and is returned
    /// as an error.
    pub fn run(
        mut self,
        compositor: Compositor,
        slots: Receiver<FrameSlot>,
        cancel: CancelFlag,
    ) -> Result<(), TransportError> {
        info!("pacer started (backlog limit {})", self.backlog_limit);
        let mut result = Ok(());
        loop {
            let slot = match recv_until(&slots, self.timeout, &cancel) {
                Flow::Ready(s) => s,
                Flow::Cancelled | Flow::Disconnected => break,
            };
            let seq = slot.seq;
            let frame = match compositor.compose(slot) {
                Ok(f) => f,
                Err(e) => {
                    warn!("dropping frame {seq}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.emit(frame, &cancel) {
                if !cancel.is_cancelled() {
                    warn!("pacer stopping: {e}");
                    cancel.cancel();
                    result = Err(e);
                }
                break;
            }
        }
        info!(
            "pacer stopped after {} frames",
            self.emitted.load(Ordering::Relaxed)
        );
        result
    }
}
