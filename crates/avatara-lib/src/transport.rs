//! Transport seam.
//!
//! The pacer pushes [`PacedFrame`]s into a [`FrameSink`]. The bundled
//! [`ChannelTransport`] hands them to a [`FrameReceiver`], which fires the
//! registered notify callback for every frame carrying an eventpoint.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use tracing::debug;

use avatara_core::types::EventPoint;

use crate::stage::CancelFlag;

/// One emission: a video frame plus one audio sub-chunk. Two frames share
/// each video image; `sub_index` 0 is the first of the pair.
#[derive(Debug, Clone)]
pub struct PacedFrame {
    pub video: Arc<RgbImage>,
    /// 16 kHz mono s16le.
    pub audio: Vec<u8>,
    pub eventpoint: Option<EventPoint>,
    pub slot: u64,
    pub sub_index: u8,
}

impl PacedFrame {
    pub fn starts_video_frame(&self) -> bool {
        self.sub_index == 0
    }
}

pub trait FrameSink: Send + Sync {
    /// Non-blocking enqueue. `Full` means retry later; `Closed` is final.
    fn enqueue(&self, frame: PacedFrame) -> Result<(), EnqueueError>;

    /// Frames accepted but not yet consumed.
    fn backlog(&self) -> usize;
}

/// Why a frame was not accepted. `Full` hands the frame back.
#[derive(Debug)]
pub enum EnqueueError {
    Full(PacedFrame),
    Closed,
}

pub type NotifyFn = Arc<dyn Fn(&EventPoint) + Send + Sync>;

#[derive(Clone)]
pub struct ChannelTransport {
    tx: Sender<PacedFrame>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self { tx }, FrameReceiver { rx, notify: None })
    }
}

impl FrameSink for ChannelTransport {
    fn enqueue(&self, frame: PacedFrame) -> Result<(), EnqueueError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => Err(EnqueueError::Full(frame)),
            Err(TrySendError::Disconnected(_)) => Err(EnqueueError::Closed),
        }
    }

    fn backlog(&self) -> usize {
        self.tx.len()
    }
}

/// Consuming half of a [`ChannelTransport`].
pub struct FrameReceiver {
    rx: Receiver<PacedFrame>,
    notify: Option<NotifyFn>,
}

impl FrameReceiver {
    /// Register the eventpoint callback.
    pub fn on_event(mut self, notify: impl Fn(&EventPoint) + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(notify));
        self
    }

    fn deliver(&self, frame: &PacedFrame) {
        if let (Some(ep), Some(notify)) = (&frame.eventpoint, &self.notify) {
            notify(ep);
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PacedFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.deliver(&frame);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently queued, without waiting.
    pub fn drain(&self) -> Vec<PacedFrame> {
        let frames: Vec<PacedFrame> = self.rx.try_iter().collect();
        for f in &frames {
            self.deliver(f);
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Consume and discard frames until cancelled or the sender is gone,
    /// still firing notify. Returns the number of frames consumed.
    pub fn discard_until(self, timeout: Duration, cancel: &CancelFlag) -> u64 {
        let mut n = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.rx.recv_timeout(timeout) {
                Ok(frame) => {
                    self.deliver(&frame);
                    n += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("frame receiver consumed {n} frames");
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use avatara_core::types::EventStatus;

    fn frame(slot: u64, ep: Option<EventPoint>) -> PacedFrame {
        PacedFrame {
            video: Arc::new(RgbImage::new(1, 1)),
            audio: vec![0; 4],
            eventpoint: ep,
            slot,
            sub_index: 0,
        }
    }

    #[test]
    fn full_channel_hands_frame_back() {
        let (t, _rx) = ChannelTransport::new(1);
        t.enqueue(frame(0, None)).unwrap();
        match t.enqueue(frame(1, None)) {
            Err(EnqueueError::Full(f)) => assert_eq!(f.slot, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.backlog(), 1);
    }

    #[test]
    fn closed_when_receiver_dropped() {
        let (t, rx) = ChannelTransport::new(2);
        drop(rx);
        assert!(matches!(t.enqueue(frame(0, None)), Err(EnqueueError::Closed)));
    }

    #[test]
    fn notify_fires_only_for_eventpoints() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let (t, rx) = ChannelTransport::new(4);
        let rx = rx.on_event(move |ep| s.lock().unwrap().push(ep.status));
        t.enqueue(frame(0, Some(EventPoint::start("a", None)))).unwrap();
        t.enqueue(frame(1, None)).unwrap();
        t.enqueue(frame(2, Some(EventPoint::end("a", None)))).unwrap();
        assert_eq!(rx.drain().len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![EventStatus::Start, EventStatus::End]);
    }

    #[test]
    fn discard_stops_when_sender_dropped() {
        let (t, rx) = ChannelTransport::new(4);
        t.enqueue(frame(0, None)).unwrap();
        t.enqueue(frame(1, None)).unwrap();
        drop(t);
        assert_eq!(rx.discard_until(Duration::from_millis(5), &CancelFlag::new()), 2);
    }
}
