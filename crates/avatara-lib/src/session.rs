//! Session controller.
//!
//! Owns one session's pipeline: audio ingest, feature windower (driver
//! thread), inference scheduler, compositor + pacer, and the synth worker.
//!
//! ```text
//! put_text ─► synth ─┐
//! put_audio ─────────┴► ingest ─► driver ─► features ─► infer ─► slots ─► pacer ─► transport
//!                                      └──► passthrough ──────┘
//! ```
//!
//! Every stage checks the shared [`CancelFlag`] at least once per queue
//! timeout, so `shutdown` returns within about one timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use avatara_core::types::{AudioChunk, EventPoint, SessionConfig, SessionStatus};
use avatara_core::wav::decode_to_pipeline_rate;

use crate::compositor::Compositor;
use crate::custom::{CustomClip, CustomState};
use crate::error::SessionError;
use crate::features::{FeatureBatch, FeatureExtractor};
use crate::ingest::AudioIngest;
use crate::pacer::Pacer;
use crate::recorder::Recorder;
use crate::renderer::LoadedModel;
use crate::scheduler::{FrameSlot, InferenceScheduler};
use crate::stage::{CancelFlag, Flow, send_until};
use crate::synth::{SpeechSynth, SynthQueue};
use crate::transport::FrameSink;
use crate::windower::FeatureWindower;

/// Called with the session id, on the pacer thread, when the transport
/// closes underneath a running session.
pub type OnClose = Box<dyn FnOnce(u32) + Send>;

/// Collaborators a session is built from.
pub struct SessionParts {
    pub model: Arc<LoadedModel>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub clips: Vec<Arc<CustomClip>>,
    pub synth: Arc<dyn SpeechSynth>,
    pub sink: Arc<dyn FrameSink>,
    pub on_close: Option<OnClose>,
}

pub struct Session {
    id: u32,
    config: SessionConfig,
    model: Arc<LoadedModel>,
    ingest: AudioIngest,
    synth: SynthQueue,
    custom: Arc<CustomState>,
    recorder: Arc<Recorder>,
    speaking: Arc<AtomicBool>,
    emitted: Arc<AtomicU64>,
    cancel: CancelFlag,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Validate the config and spawn the four stage threads.
    pub fn start(id: u32, config: SessionConfig, parts: SessionParts) -> Result<Self, SessionError> {
        config.validate()?;
        let SessionParts {
            model,
            extractor,
            clips,
            synth,
            sink,
            on_close,
        } = parts;

        let ingest = AudioIngest::new(config.chunk_size());
        let session = Self {
            id,
            synth: SynthQueue::new(ingest.clone()),
            ingest,
            custom: Arc::new(CustomState::new(clips)),
            recorder: Arc::new(Recorder::new(
                &config.ffmpeg,
                &config.record_dir,
                id,
                config.video_fps(),
            )),
            speaking: Arc::new(AtomicBool::new(false)),
            emitted: Arc::new(AtomicU64::new(0)),
            cancel: CancelFlag::new(),
            threads: Mutex::new(Vec::new()),
            model,
            config,
        };
        session.custom.reset();

        if let Err(e) = session.spawn_stages(extractor, synth, sink, on_close) {
            session.shutdown();
            return Err(e);
        }
        info!(
            "session {id} started: {} / {}, fps {}, batch {}",
            session.model.model, session.model.avatar_id, session.config.fps, session.config.batch_size
        );
        Ok(session)
    }

    fn spawn_stages(
        &self,
        extractor: Arc<dyn FeatureExtractor>,
        synth: Arc<dyn SpeechSynth>,
        sink: Arc<dyn FrameSink>,
        on_close: Option<OnClose>,
    ) -> Result<(), SessionError> {
        let cfg = &self.config;
        let timeout = cfg.queue_timeout;
        let (feat_tx, feat_rx) = crossbeam_channel::bounded::<FeatureBatch>(2);
        let (pass_tx, pass_rx) = crossbeam_channel::unbounded::<AudioChunk>();
        let (slot_tx, slot_rx) = crossbeam_channel::bounded::<FrameSlot>(cfg.batch_size * 2);

        // Driver: ingest -> windower -> features + passthrough.
        let mut windower = FeatureWindower::new(
            extractor,
            pass_tx,
            cfg.batch_size,
            cfg.stride_left,
            cfg.stride_right,
            cfg.fps,
        );
        let (ingest, custom, cancel) = (self.ingest.clone(), self.custom.clone(), self.cancel.clone());
        self.spawn("driver", move || {
            let mut next = || ingest.next_chunk(&custom);
            windower.warm_up(&mut next);
            while !cancel.is_cancelled() {
                let Some(batch) = windower.tick(&mut next) else {
                    continue;
                };
                if send_until(&feat_tx, batch, timeout, &cancel) != Flow::Ready(()) {
                    break;
                }
            }
            debug!("driver stopped");
        })?;

        let scheduler = InferenceScheduler::new(
            self.model.renderer.clone(),
            self.model.cycle.len(),
            cfg.batch_size,
        );
        let cancel = self.cancel.clone();
        self.spawn("infer", move || {
            scheduler.run(feat_rx, pass_rx, slot_tx, timeout, cancel);
        })?;

        let compositor = Compositor::new(self.model.cycle.clone(), self.custom.clone(), self.speaking.clone());
        let pacer = Pacer::new(cfg, sink, self.recorder.clone(), self.emitted.clone());
        let (id, cancel) = (self.id, self.cancel.clone());
        self.spawn("pacer", move || {
            if pacer.run(compositor, slot_rx, cancel).is_err() {
                info!("session {id}: transport closed, session cancelled");
                if let Some(on_close) = on_close {
                    on_close(id);
                }
            }
        })?;

        let (queue, pad, cancel) = (self.synth.clone(), cfg.pad_partial_chunk, self.cancel.clone());
        self.spawn("synth", move || queue.run(synth, pad, timeout, cancel))?;
        Ok(())
    }

    fn spawn(&self, stage: &'static str, f: impl FnOnce() + Send + 'static) -> Result<(), SessionError> {
        let handle = std::thread::Builder::new()
            .name(format!("avatara-{stage}-{}", self.id))
            .spawn(f)
            .map_err(|source| SessionError::Spawn { stage, source })?;
        self.threads.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Set once the session shuts down or its transport closes.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue text for synthesis. The utterance's first and last chunks carry
    /// `start` / `end` eventpoints with `msgevent` attached.
    pub fn put_text(&self, text: &str, msgevent: Option<serde_json::Value>) -> Result<(), SessionError> {
        self.ensure_open()?;
        debug!("session {}: put_text ({} chars)", self.id, text.len());
        self.synth.put_text(text, msgevent);
        Ok(())
    }

    /// Decode a WAV upload and queue it as speech. Returns the number of
    /// chunks queued.
    pub fn put_audio(&self, bytes: &[u8]) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let samples = decode_to_pipeline_rate(bytes).map_err(SessionError::Audio)?;
        let (queued, dropped) = self.ingest.put_samples(&samples, self.config.pad_partial_chunk);
        if dropped > 0 {
            debug!("session {}: dropped {dropped} trailing samples", self.id);
        }
        info!("session {}: queued {queued} audio chunks", self.id);
        Ok(queued)
    }

    pub fn put_audio_chunk(
        &self,
        samples: Vec<f32>,
        eventpoint: Option<EventPoint>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.ingest.put_audio_chunk(samples, eventpoint)
    }

    /// Drop queued audio and abandon synthesis in flight. Stages keep running.
    pub fn interrupt(&self) {
        let (texts, chunks) = self.synth.interrupt();
        info!(
            "session {}: interrupted ({texts} texts, {chunks} chunks discarded)",
            self.id
        );
    }

    /// Returns `false` when `id` names no configured clip.
    pub fn set_custom_state(&self, id: u32, reinit: bool) -> bool {
        self.custom.set(id, reinit)
    }

    pub fn start_recording(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        Ok(self.recorder.start()?)
    }

    pub fn stop_recording(&self) -> Result<std::path::PathBuf, SessionError> {
        Ok(self.recorder.stop()?)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            speaking: self.is_speaking(),
            custom_state: self.custom.current(),
            recording: self.recorder.is_recording(),
            slots_emitted: self.emitted.load(Ordering::Relaxed),
        }
    }

    /// Cancel every stage, join their threads and finalize any recording.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let threads: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            let name = handle.thread().name().unwrap_or("stage").to_string();
            if handle.join().is_err() {
                warn!("session {}: {name} panicked", self.id);
            }
        }
        if self.recorder.is_recording() {
            match self.recorder.stop() {
                Ok(path) => info!("session {}: recording finalized at {}", self.id, path.display()),
                Err(e) => warn!("session {}: recording lost: {e}", self.id),
            }
        }
        info!("session {} shut down", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
