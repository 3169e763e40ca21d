//! Frame compositor: crops back onto base frames, idle and custom loops for
//! no-op slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};

use avatara_core::types::{AudioChunk, ChunkKind, Region};

use crate::assets::{AvatarCycle, BlendBox};
use crate::custom::CustomState;
use crate::error::CompositeError;
use crate::scheduler::FrameSlot;

/// A finished video frame with the audio it carries.
#[derive(Debug)]
pub struct ComposedFrame {
    pub seq: u64,
    pub image: Arc<RgbImage>,
    pub audio: [AudioChunk; 2],
}

pub struct Compositor {
    cycle: Arc<AvatarCycle>,
    custom: Arc<CustomState>,
    speaking: Arc<AtomicBool>,
}

impl Compositor {
    pub fn new(cycle: Arc<AvatarCycle>, custom: Arc<CustomState>, speaking: Arc<AtomicBool>) -> Self {
        Self {
            cycle,
            custom,
            speaking,
        }
    }

    pub fn compose(&self, slot: FrameSlot) -> Result<ComposedFrame, CompositeError> {
        self.speaking.store(!slot.is_silent(), Ordering::Relaxed);
        let FrameSlot {
            seq,
            index,
            crop,
            audio,
        } = slot;
        let image = match crop {
            Some(crop) => Arc::new(self.paste(index, &crop)?),
            None => self.idle_frame(index, audio[0].kind)?,
        };
        Ok(ComposedFrame { seq, image, audio })
    }

    /// Frame for a slot without a crop: the clip selected by the slot's audio,
    /// else the shared base frame.
    fn idle_frame(&self, index: usize, kind: ChunkKind) -> Result<Arc<RgbImage>, CompositeError> {
        if let ChunkKind::Custom(id) = kind {
            if let Some(image) = self.custom.next_image(id) {
                return Ok(image);
            }
        }
        self.cycle
            .frame(index)
            .cloned()
            .ok_or(CompositeError::IndexOutOfRange {
                index,
                len: self.cycle.len(),
            })
    }

    fn paste(&self, index: usize, crop: &RgbImage) -> Result<RgbImage, CompositeError> {
        let out_of_range = || CompositeError::IndexOutOfRange {
            index,
            len: self.cycle.len(),
        };
        let base = self.cycle.frame(index).ok_or_else(out_of_range)?;
        let region = self.cycle.region(index).ok_or_else(out_of_range)?;
        match self.cycle.mask(index) {
            Some((mask, blend_box)) => blend_back(base, crop, region, mask, blend_box),
            None => paste_back(base, crop, region),
        }
    }
}

fn check_region(base: &RgbImage, crop: &RgbImage, region: Region) -> Result<(), CompositeError> {
    if crop.width() == 0 || crop.height() == 0 {
        return Err(CompositeError::EmptyCrop);
    }
    if !region.fits(base.width(), base.height()) {
        return Err(CompositeError::RegionOutOfBounds {
            region,
            width: base.width(),
            height: base.height(),
        });
    }
    Ok(())
}

/// Resize `crop` to `region` and overwrite that box on a copy of `base`.
pub fn paste_back(base: &RgbImage, crop: &RgbImage, region: Region) -> Result<RgbImage, CompositeError> {
    check_region(base, crop, region)?;
    let face = imageops::resize(crop, region.width(), region.height(), FilterType::Triangle);
    let mut out = base.clone();
    imageops::replace(&mut out, &face, region.x1 as i64, region.y1 as i64);
    Ok(out)
}

/// Paste the resized face into the expanded blend box, then alpha-blend that
/// box onto a copy of `base` through `mask`. Parts of the box outside the
/// frame are skipped.
pub fn blend_back(
    base: &RgbImage,
    crop: &RgbImage,
    region: Region,
    mask: &GrayImage,
    blend_box: BlendBox,
) -> Result<RgbImage, CompositeError> {
    check_region(base, crop, region)?;
    if mask.dimensions() != (blend_box.width(), blend_box.height()) {
        return Err(CompositeError::MaskShape {
            mask_w: mask.width(),
            mask_h: mask.height(),
            box_w: blend_box.width(),
            box_h: blend_box.height(),
        });
    }

    let face = imageops::resize(crop, region.width(), region.height(), FilterType::Triangle);
    let mut out = base.clone();
    let (w, h) = (base.width() as i64, base.height() as i64);
    for (mx, my, alpha) in mask.enumerate_pixels() {
        let fx = blend_box.x1 as i64 + mx as i64;
        let fy = blend_box.y1 as i64 + my as i64;
        if fx < 0 || fy < 0 || fx >= w || fy >= h {
            continue;
        }
        let (fx, fy) = (fx as u32, fy as u32);
        let under = *base.get_pixel(fx, fy);
        let over = if fx >= region.x1 && fx < region.x2 && fy >= region.y1 && fy < region.y2 {
            *face.get_pixel(fx - region.x1, fy - region.y1)
        } else {
            under
        };
        let a = alpha[0] as f32 / 255.0;
        let mix = |c: usize| (over[c] as f32 * a + under[c] as f32 * (1.0 - a)).round() as u8;
        out.put_pixel(fx, fy, Rgb([mix(0), mix(1), mix(2)]));
    }
    Ok(out)
}
