//! Custom clips and the custom-state machine.
//!
//! `curr_state` is 0 for normal idle, 1 for plain silence, or the id of a
//! configured clip. While a clip is selected, idle audio is read from the
//! clip; once its audio runs out the state drops to 1 by itself and only an
//! explicit `set` starts it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use image::RgbImage;
use tracing::{debug, info, warn};

use avatara_core::error::ConfigError;
use avatara_core::mirror::mirror_index;
use avatara_core::types::CustomClipConfig;
use avatara_core::wav::decode_to_pipeline_rate;

use crate::assets::read_rgb_dir;

pub const STATE_IDLE: u32 = 0;
pub const STATE_SILENCE: u32 = 1;

/// An alternate idle loop: image sequence plus its own 16 kHz audio.
pub struct CustomClip {
    pub audiotype: u32,
    images: Vec<Arc<RgbImage>>,
    audio: Vec<f32>,
}

impl CustomClip {
    pub fn new(audiotype: u32, images: Vec<RgbImage>, audio: Vec<f32>) -> Result<Self, ConfigError> {
        if audiotype <= STATE_SILENCE {
            return Err(ConfigError::Invalid(format!(
                "custom clip id {audiotype} is reserved"
            )));
        }
        if images.is_empty() {
            return Err(ConfigError::Invalid(format!("custom clip {audiotype} has no images")));
        }
        Ok(Self {
            audiotype,
            images: images.into_iter().map(Arc::new).collect(),
            audio,
        })
    }

    pub fn load(config: &CustomClipConfig) -> Result<Self, ConfigError> {
        let images = read_rgb_dir(&config.imgpath)?;
        if !config.audiopath.is_file() {
            return Err(ConfigError::MissingAsset(config.audiopath.clone()));
        }
        let bytes = std::fs::read(&config.audiopath).map_err(|e| ConfigError::Load {
            path: config.audiopath.clone(),
            reason: e.to_string(),
        })?;
        let audio = decode_to_pipeline_rate(&bytes).map_err(|reason| ConfigError::Load {
            path: config.audiopath.clone(),
            reason,
        })?;
        info!(
            "custom clip {}: {} images, {} samples",
            config.audiotype,
            images.len(),
            audio.len()
        );
        Self::new(config.audiotype, images, audio)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn audio_len(&self) -> usize {
        self.audio.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub audio: usize,
    pub image: usize,
}

struct Inner {
    curr: u32,
    cursors: HashMap<u32, Cursors>,
}

/// Per-session custom state. Shared between the driver (audio reads), the
/// compositor (image reads) and the control surface.
pub struct CustomState {
    clips: HashMap<u32, Arc<CustomClip>>,
    inner: Mutex<Inner>,
}

impl CustomState {
    pub fn new(clips: Vec<Arc<CustomClip>>) -> Self {
        let cursors = clips.iter().map(|c| (c.audiotype, Cursors::default())).collect();
        Self {
            clips: clips.into_iter().map(|c| (c.audiotype, c)).collect(),
            inner: Mutex::new(Inner {
                curr: STATE_IDLE,
                cursors,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> u32 {
        self.lock().curr
    }

    pub fn has_clip(&self, id: u32) -> bool {
        self.clips.contains_key(&id)
    }

    /// Switch state. Returns `false` (and changes nothing) for ids that are
    /// neither reserved nor configured.
    pub fn set(&self, id: u32, reinit: bool) -> bool {
        if id > STATE_SILENCE && !self.has_clip(id) {
            warn!("custom state {id} has no configured clip, ignoring");
            return false;
        }
        let mut inner = self.lock();
        inner.curr = id;
        if reinit {
            if let Some(c) = inner.cursors.get_mut(&id) {
                *c = Cursors::default();
            }
        }
        debug!("custom state -> {id} (reinit={reinit})");
        true
    }

    /// Read the next `chunk_size` samples of the active clip's audio.
    ///
    /// Returns `None` unless a clip is selected. Reaching the end of the clip
    /// drops the state to silence.
    pub fn next_audio(&self, chunk_size: usize) -> Option<(u32, Vec<f32>)> {
        let mut inner = self.lock();
        let id = inner.curr;
        if id <= STATE_SILENCE {
            return None;
        }
        let clip = self.clips.get(&id)?;
        let cursor = inner.cursors.entry(id).or_default();
        let start = cursor.audio.min(clip.audio.len());
        let end = (start + chunk_size).min(clip.audio.len());
        let mut samples = clip.audio[start..end].to_vec();
        samples.resize(chunk_size, 0.0);
        cursor.audio += chunk_size;
        if cursor.audio >= clip.audio.len() {
            inner.curr = STATE_SILENCE;
            debug!("custom clip {id} audio finished");
        }
        Some((id, samples))
    }

    /// Next image of clip `id` in mirrored order, advancing its image cursor.
    pub fn next_image(&self, id: u32) -> Option<Arc<RgbImage>> {
        let clip = self.clips.get(&id)?;
        let mut inner = self.lock();
        let cursor = inner.cursors.entry(id).or_default();
        let image = clip.images[mirror_index(clip.images.len(), cursor.image)].clone();
        cursor.image += 1;
        Some(image)
    }

    pub fn cursors(&self, id: u32) -> Option<Cursors> {
        self.lock().cursors.get(&id).copied()
    }

    /// Back to idle with every cursor at 0.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.curr = STATE_IDLE;
        for c in inner.cursors.values_mut() {
            *c = Cursors::default();
        }
    }
}
