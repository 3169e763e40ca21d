//! Avatar identity assets.
//!
//! An avatar directory holds one short video loop, pre-cut for the renderer:
//!
//! ```text
//! <avatars_dir>/<avatar_id>/
//!     full_imgs/0.png 1.png ...    base frames
//!     face_imgs/0.png ...          face templates (renderer input)
//!     coords.json                  [{x1,y1,x2,y2}, ...] face region per frame
//!     mask/0.png ...               optional blend masks
//!     mask_coords.json             optional [[x1,y1,x2,y2], ...] mask boxes
//!     latents.bin + avatar.json    optional f32 latent templates
//! ```
//!
//! Everything is loaded once and shared read-only between sessions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GrayImage, RgbImage};
use serde::Deserialize;
use tracing::{debug, info};

use avatara_core::error::ConfigError;
use avatara_core::types::Region;

/// Expanded blend box around a face region. May extend past the frame edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BlendBox {
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }
}

/// Per-frame latent templates stored as one flat f32 buffer.
#[derive(Debug, Clone)]
pub struct Latents {
    /// Shape of a single frame's latent, e.g. `[8, 32, 32]`.
    pub shape: Vec<usize>,
    data: Vec<f32>,
}

impl Latents {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ConfigError> {
        let per_frame: usize = shape.iter().product();
        if per_frame == 0 || data.len() % per_frame != 0 {
            return Err(ConfigError::Invalid(format!(
                "latent buffer of {} values does not divide into frames of shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn per_frame(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.per_frame()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        let n = self.per_frame();
        self.data.get(index * n..(index + 1) * n)
    }
}

struct Masks {
    images: Vec<GrayImage>,
    boxes: Vec<BlendBox>,
}

/// Immutable precomputed identity loop. Every per-frame list has the same
/// length.
pub struct AvatarCycle {
    frames: Vec<Arc<RgbImage>>,
    faces: Vec<RgbImage>,
    coords: Vec<Region>,
    masks: Option<Masks>,
    latents: Option<Latents>,
}

impl AvatarCycle {
    pub fn new(
        frames: Vec<RgbImage>,
        faces: Vec<RgbImage>,
        coords: Vec<Region>,
    ) -> Result<Self, ConfigError> {
        if frames.is_empty() {
            return Err(ConfigError::Invalid("avatar has no frames".into()));
        }
        let n = frames.len();
        if faces.len() != n || coords.len() != n {
            return Err(ConfigError::Invalid(format!(
                "avatar lists disagree: {n} frames, {} faces, {} coords",
                faces.len(),
                coords.len()
            )));
        }
        for (i, (frame, region)) in frames.iter().zip(&coords).enumerate() {
            if !region.fits(frame.width(), frame.height()) {
                return Err(ConfigError::Invalid(format!(
                    "frame {i}: region {region:?} outside {}x{} frame",
                    frame.width(),
                    frame.height()
                )));
            }
        }
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            faces,
            coords,
            masks: None,
            latents: None,
        })
    }

    pub fn with_masks(
        mut self,
        images: Vec<GrayImage>,
        boxes: Vec<BlendBox>,
    ) -> Result<Self, ConfigError> {
        if images.len() != self.len() || boxes.len() != self.len() {
            return Err(ConfigError::Invalid(format!(
                "avatar has {} frames but {} masks and {} mask boxes",
                self.len(),
                images.len(),
                boxes.len()
            )));
        }
        self.masks = Some(Masks { images, boxes });
        Ok(self)
    }

    pub fn with_latents(mut self, latents: Latents) -> Result<Self, ConfigError> {
        if latents.len() != self.len() {
            return Err(ConfigError::Invalid(format!(
                "avatar has {} frames but {} latents",
                self.len(),
                latents.len()
            )));
        }
        self.latents = Some(latents);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Arc<RgbImage>> {
        self.frames.get(index)
    }

    pub fn face(&self, index: usize) -> Option<&RgbImage> {
        self.faces.get(index)
    }

    pub fn region(&self, index: usize) -> Option<Region> {
        self.coords.get(index).copied()
    }

    pub fn mask(&self, index: usize) -> Option<(&GrayImage, BlendBox)> {
        let masks = self.masks.as_ref()?;
        Some((masks.images.get(index)?, *masks.boxes.get(index)?))
    }

    pub fn has_masks(&self) -> bool {
        self.masks.is_some()
    }

    pub fn latents(&self) -> Option<&Latents> {
        self.latents.as_ref()
    }

    /// Load an avatar directory.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::MissingAsset(dir.to_path_buf()));
        }
        info!("loading avatar from {}", dir.display());

        let frames = read_rgb_dir(&dir.join("full_imgs"))?;
        let faces = read_rgb_dir(&dir.join("face_imgs"))?;
        let coords: Vec<Region> = read_json(&dir.join("coords.json"))?;
        let mut cycle = Self::new(frames, faces, coords)?;

        let mask_dir = dir.join("mask");
        if mask_dir.is_dir() {
            let images = read_gray_dir(&mask_dir)?;
            let raw: Vec<[i32; 4]> = read_json(&dir.join("mask_coords.json"))?;
            let boxes = raw
                .into_iter()
                .map(|[x1, y1, x2, y2]| BlendBox { x1, y1, x2, y2 })
                .collect();
            cycle = cycle.with_masks(images, boxes)?;
        }

        let latent_path = dir.join("latents.bin");
        if latent_path.is_file() {
            let meta: AvatarMeta = read_json(&dir.join("avatar.json"))?;
            let bytes = fs::read(&latent_path).map_err(|e| load_err(&latent_path, e))?;
            let data = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            cycle = cycle.with_latents(Latents::new(meta.latent_shape, data)?)?;
        }

        debug!(
            "avatar {}: {} frames, masks={}, latents={}",
            dir.display(),
            cycle.len(),
            cycle.has_masks(),
            cycle.latents.is_some()
        );
        Ok(cycle)
    }
}

#[derive(Deserialize)]
struct AvatarMeta {
    latent_shape: Vec<usize>,
}

fn load_err(path: &Path, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingAsset(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|e| load_err(path, e))?;
    serde_json::from_str(&text).map_err(|e| load_err(path, e))
}

/// Image files in `dir`, ordered by numeric file stem.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::MissingAsset(dir.to_path_buf()));
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| load_err(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        })
        .collect();
    paths.sort_by_key(|p| {
        let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        (stem.parse::<u64>().unwrap_or(u64::MAX), stem.to_string())
    });
    if paths.is_empty() {
        return Err(ConfigError::MissingAsset(dir.to_path_buf()));
    }
    Ok(paths)
}

pub fn read_rgb_dir(dir: &Path) -> Result<Vec<RgbImage>, ConfigError> {
    list_images(dir)?
        .iter()
        .map(|p| image::open(p).map(|img| img.to_rgb8()).map_err(|e| load_err(p, e)))
        .collect()
}

fn read_gray_dir(dir: &Path) -> Result<Vec<GrayImage>, ConfigError> {
    list_images(dir)?
        .iter()
        .map(|p| image::open(p).map(|img| img.to_luma8()).map_err(|e| load_err(p, e)))
        .collect()
}
