//! Renderer seam and the model variant table.
//!
//! A renderer maps a batch of feature windows plus mirrored cycle indices to
//! one face crop per window. Concrete models differ only in how they build
//! their input tensors, so they share [`OnnxRenderer`] and are told apart by
//! an [`InputLayout`]. Which one a session gets is resolved once, by name,
//! from [`VARIANTS`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4, ArrayD, IxDyn};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::{debug, info};

use avatara_core::error::ConfigError;
use avatara_core::mirror::mirror_index;
use avatara_core::types::ModelConfig;
use avatara_core::wav::SAMPLE_RATE;

use crate::assets::AvatarCycle;
use crate::error::RenderError;
use crate::features::{FeatureExtractor, FeatureWindow};

/// Black-box lip-sync model. Must be deterministic and side-effect free.
pub trait Renderer: Send + Sync {
    fn infer(
        &self,
        windows: &[FeatureWindow],
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, RenderError>;
}

/// An avatar identity paired with the renderer that animates it. Shared
/// read-only by every session using the same (model, avatar).
pub struct LoadedModel {
    pub model: String,
    pub avatar_id: String,
    pub cycle: Arc<AvatarCycle>,
    pub renderer: Arc<dyn Renderer>,
}

impl LoadedModel {
    /// Run one batch of silent features through the renderer.
    pub fn warm_up(
        &self,
        batch_size: usize,
        extractor: &dyn FeatureExtractor,
    ) -> Result<(), RenderError> {
        let t = Instant::now();
        let spectrum = extractor.spectrogram(&vec![0.0; SAMPLE_RATE as usize / 4]);
        let window = spectrum.window(0, extractor.window_frames(), extractor.floor());
        let windows = vec![window; batch_size];
        let indices: Vec<usize> = (0..batch_size)
            .map(|i| mirror_index(self.cycle.len(), i))
            .collect();
        let crops = self.renderer.infer(&windows, &indices)?;
        if crops.len() != batch_size {
            return Err(RenderError::BatchShape {
                expected: batch_size,
                got: crops.len(),
            });
        }
        info!(
            "warmed up {} for {} in {:.0?}",
            self.model,
            self.avatar_id,
            t.elapsed()
        );
        Ok(())
    }
}

// ─── Variant table ─────────────────────────────────────────────────────────

type BuildFn = fn(&ModelConfig, &Arc<AvatarCycle>) -> Result<Arc<dyn Renderer>, ConfigError>;

pub struct RendererVariant {
    pub name: &'static str,
    build: BuildFn,
}

pub static VARIANTS: &[RendererVariant] = &[
    RendererVariant {
        name: "wav2lip",
        build: build_wav2lip,
    },
    RendererVariant {
        name: "ultralight",
        build: build_ultralight,
    },
    RendererVariant {
        name: "musetalk",
        build: build_musetalk,
    },
    RendererVariant {
        name: "static",
        build: build_static,
    },
];

pub fn known_models() -> String {
    VARIANTS
        .iter()
        .map(|v| v.name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn variant(name: &str) -> Result<&'static RendererVariant, ConfigError> {
    VARIANTS
        .iter()
        .find(|v| v.name == name)
        .ok_or_else(|| ConfigError::UnknownModel {
            name: name.to_string(),
            known: known_models(),
        })
}

/// Resolve the variant, load the avatar, build the renderer.
pub fn load_model(config: &ModelConfig) -> Result<LoadedModel, ConfigError> {
    let variant = variant(&config.model)?;
    let cycle = Arc::new(AvatarCycle::load(&config.avatar_path())?);
    let renderer = (variant.build)(config, &cycle)?;
    Ok(LoadedModel {
        model: config.model.clone(),
        avatar_id: config.avatar_id.clone(),
        cycle,
        renderer,
    })
}

fn build_wav2lip(
    config: &ModelConfig,
    cycle: &Arc<AvatarCycle>,
) -> Result<Arc<dyn Renderer>, ConfigError> {
    Ok(Arc::new(OnnxRenderer::load(
        config,
        cycle.clone(),
        InputLayout::FaceTemplate { size: 96 },
    )?))
}

fn build_ultralight(
    config: &ModelConfig,
    cycle: &Arc<AvatarCycle>,
) -> Result<Arc<dyn Renderer>, ConfigError> {
    Ok(Arc::new(OnnxRenderer::load(
        config,
        cycle.clone(),
        InputLayout::FaceTemplate { size: 160 },
    )?))
}

fn build_musetalk(
    config: &ModelConfig,
    cycle: &Arc<AvatarCycle>,
) -> Result<Arc<dyn Renderer>, ConfigError> {
    if cycle.latents().is_none() {
        return Err(ConfigError::MissingAsset(
            config.avatar_path().join("latents.bin"),
        ));
    }
    if !cycle.has_masks() {
        return Err(ConfigError::MissingAsset(config.avatar_path().join("mask")));
    }
    Ok(Arc::new(OnnxRenderer::load(
        config,
        cycle.clone(),
        InputLayout::Latent,
    )?))
}

fn build_static(
    _config: &ModelConfig,
    cycle: &Arc<AvatarCycle>,
) -> Result<Arc<dyn Renderer>, ConfigError> {
    Ok(Arc::new(StaticRenderer::new(cycle.clone())))
}

// ─── Static renderer ───────────────────────────────────────────────────────

/// Returns the face templates unchanged. No weights; useful for pipeline
/// bring-up and avatars that only need idle loops.
pub struct StaticRenderer {
    cycle: Arc<AvatarCycle>,
}

impl StaticRenderer {
    pub fn new(cycle: Arc<AvatarCycle>) -> Self {
        Self { cycle }
    }
}

impl Renderer for StaticRenderer {
    fn infer(
        &self,
        windows: &[FeatureWindow],
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, RenderError> {
        check_batch(windows, indices)?;
        indices
            .iter()
            .map(|&i| {
                self.cycle
                    .face(i)
                    .cloned()
                    .ok_or_else(|| RenderError::Input(format!("cycle index {i} out of range")))
            })
            .collect()
    }
}

// ─── ONNX renderer ─────────────────────────────────────────────────────────

/// How a model wants its per-frame identity input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// `mel: [B,1,bins,frames]`, `face: [B,6,S,S]` (lower-half-masked face
    /// stacked on the reference face, scaled to 0..1).
    FaceTemplate { size: u32 },
    /// `audio: [B,bins,frames]`, `latent: [B, ..latent_shape]`.
    Latent,
}

pub struct OnnxRenderer {
    // `Session::run` needs `&mut`; one batch at a time per model.
    session: Mutex<Session>,
    cycle: Arc<AvatarCycle>,
    layout: InputLayout,
}

impl OnnxRenderer {
    pub fn load(
        config: &ModelConfig,
        cycle: Arc<AvatarCycle>,
        layout: InputLayout,
    ) -> Result<Self, ConfigError> {
        let path = config.weights_path();
        if !path.is_file() {
            return Err(ConfigError::MissingAsset(path));
        }
        let session = Session::builder()
            .map_err(|e| weights_err(&path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| weights_err(&path, e))?
            .commit_from_file(&path)
            .map_err(|e| weights_err(&path, e))?;
        info!("loaded {} weights from {}", config.model, path.display());
        Ok(Self {
            session: Mutex::new(session),
            cycle,
            layout,
        })
    }

    fn face_input(&self, indices: &[usize], size: u32) -> Result<Array4<f32>, RenderError> {
        let s = size as usize;
        let mut faces = Array4::<f32>::zeros((indices.len(), 6, s, s));
        for (b, &idx) in indices.iter().enumerate() {
            let face = self
                .cycle
                .face(idx)
                .ok_or_else(|| RenderError::Input(format!("cycle index {idx} out of range")))?;
            let face = imageops::resize(face, size, size, FilterType::Triangle);
            for (x, y, px) in face.enumerate_pixels() {
                let (x, y) = (x as usize, y as usize);
                for c in 0..3 {
                    let v = px[c] as f32 / 255.0;
                    if y < s / 2 {
                        faces[[b, c, y, x]] = v;
                    }
                    faces[[b, c + 3, y, x]] = v;
                }
            }
        }
        Ok(faces)
    }

    fn latent_input(&self, indices: &[usize]) -> Result<ArrayD<f32>, RenderError> {
        let latents = self
            .cycle
            .latents()
            .ok_or_else(|| RenderError::Input("avatar has no latents".into()))?;
        let mut shape = vec![indices.len()];
        shape.extend_from_slice(&latents.shape);
        let mut data = Vec::with_capacity(indices.len() * latents.per_frame());
        for &idx in indices {
            let frame = latents
                .frame(idx)
                .ok_or_else(|| RenderError::Input(format!("latent index {idx} out of range")))?;
            data.extend_from_slice(frame);
        }
        ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| RenderError::Input(e.to_string()))
    }
}

fn weights_err(path: &Path, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn tensor_err(e: impl std::fmt::Display) -> RenderError {
    RenderError::Input(e.to_string())
}

fn check_batch(windows: &[FeatureWindow], indices: &[usize]) -> Result<(), RenderError> {
    if windows.len() != indices.len() {
        return Err(RenderError::Input(format!(
            "{} windows but {} indices",
            windows.len(),
            indices.len()
        )));
    }
    if windows.is_empty() {
        return Err(RenderError::Input("empty batch".into()));
    }
    Ok(())
}

fn feature_input(windows: &[FeatureWindow]) -> Result<Array3<f32>, RenderError> {
    let (bins, frames) = (windows[0].bins, windows[0].frames);
    let mut data = Vec::with_capacity(windows.len() * bins * frames);
    for w in windows {
        if w.bins != bins || w.frames != frames {
            return Err(RenderError::Input("feature windows differ in shape".into()));
        }
        data.extend_from_slice(&w.data);
    }
    Array3::from_shape_vec((windows.len(), bins, frames), data)
        .map_err(|e| RenderError::Input(e.to_string()))
}

/// `[B,3,H,W]` floats in 0..1 to images.
fn images_from_nchw(shape: &[i64], data: &[f32]) -> Result<Vec<RgbImage>, RenderError> {
    if shape.len() != 4 || shape[1] != 3 {
        return Err(RenderError::Inference(format!(
            "unexpected output shape {shape:?}"
        )));
    }
    let (b, h, w) = (shape[0] as usize, shape[2] as usize, shape[3] as usize);
    let plane = h * w;
    if data.len() != b * 3 * plane {
        return Err(RenderError::Inference("output buffer size mismatch".into()));
    }
    let to_u8 = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;
    Ok((0..b)
        .map(|n| {
            let base = n * 3 * plane;
            RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let p = y as usize * w + x as usize;
                Rgb([
                    to_u8(data[base + p]),
                    to_u8(data[base + plane + p]),
                    to_u8(data[base + 2 * plane + p]),
                ])
            })
        })
        .collect())
}

impl Renderer for OnnxRenderer {
    fn infer(
        &self,
        windows: &[FeatureWindow],
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, RenderError> {
        check_batch(windows, indices)?;
        let features = feature_input(windows)?;

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let outputs = match self.layout {
            InputLayout::FaceTemplate { size } => {
                let (b, bins, frames) = features.dim();
                let mel = features
                    .into_shape_with_order((b, 1, bins, frames))
                    .map_err(|e| RenderError::Input(e.to_string()))?;
                let faces = self.face_input(indices, size)?;
                session.run(ort::inputs![
                    "mel" => Tensor::from_array(mel).map_err(tensor_err)?,
                    "face" => Tensor::from_array(faces).map_err(tensor_err)?,
                ])
            }
            InputLayout::Latent => {
                let latents = self.latent_input(indices)?;
                session.run(ort::inputs![
                    "audio" => Tensor::from_array(features).map_err(tensor_err)?,
                    "latent" => Tensor::from_array(latents).map_err(tensor_err)?,
                ])
            }
        }
        .map_err(|e| RenderError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RenderError::Inference(e.to_string()))?;
        let crops = images_from_nchw(shape, data)?;
        debug!("rendered {} crops", crops.len());
        Ok(crops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::tests::test_cycle;
    use crate::features::MelExtractor;

    fn window() -> FeatureWindow {
        FeatureWindow {
            bins: 2,
            frames: 2,
            data: vec![0.0; 4],
        }
    }

    #[test]
    fn unknown_model_lists_known() {
        let err = variant("nerf").err().unwrap();
        match err {
            ConfigError::UnknownModel { name, known } => {
                assert_eq!(name, "nerf");
                assert!(known.contains("wav2lip") && known.contains("static"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn variants_resolve_by_name() {
        for name in ["wav2lip", "ultralight", "musetalk", "static"] {
            assert_eq!(variant(name).unwrap().name, name);
        }
    }

    #[test]
    fn load_model_rejects_unknown_before_touching_disk() {
        let config = ModelConfig {
            model: "nope".into(),
            avatars_dir: "/nonexistent".into(),
            ..Default::default()
        };
        assert!(matches!(
            load_model(&config),
            Err(ConfigError::UnknownModel { .. })
        ));
    }

    #[test]
    fn missing_weights_is_config_error() {
        let config = ModelConfig {
            model_path: Some("/nonexistent/wav2lip.onnx".into()),
            ..Default::default()
        };
        let err = OnnxRenderer::load(
            &config,
            Arc::new(test_cycle(2)),
            InputLayout::FaceTemplate { size: 96 },
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::MissingAsset(_)));
    }

    #[test]
    fn static_renderer_returns_faces() {
        let r = StaticRenderer::new(Arc::new(test_cycle(3)));
        let crops = r.infer(&[window(), window()], &[2, 0]).unwrap();
        assert_eq!(crops[0].get_pixel(0, 0), &Rgb([25, 25, 25]));
        assert_eq!(crops[1].get_pixel(0, 0), &Rgb([5, 5, 5]));
    }

    #[test]
    fn static_renderer_checks_batch() {
        let r = StaticRenderer::new(Arc::new(test_cycle(3)));
        assert!(r.infer(&[window()], &[0, 1]).is_err());
        assert!(r.infer(&[window()], &[7]).is_err());
    }

    #[test]
    fn warm_up_runs_one_batch() {
        let cycle = Arc::new(test_cycle(3));
        let model = LoadedModel {
            model: "static".into(),
            avatar_id: "test".into(),
            cycle: cycle.clone(),
            renderer: Arc::new(StaticRenderer::new(cycle)),
        };
        assert!(model.warm_up(4, &MelExtractor::new()).is_ok());
    }

    #[test]
    fn nchw_conversion() {
        // One 1x2 image: R plane [0, 1], G plane [0.5, 0.5], B plane [1, 0].
        let data = [0.0, 1.0, 0.5, 0.5, 1.0, 0.0];
        let images = images_from_nchw(&[1, 3, 1, 2], &data).unwrap();
        assert_eq!(images[0].get_pixel(0, 0), &Rgb([0, 127, 255]));
        assert_eq!(images[0].get_pixel(1, 0), &Rgb([255, 127, 0]));
        assert!(images_from_nchw(&[1, 1, 1, 2], &data[..2]).is_err());
    }

    #[test]
    fn feature_input_rejects_mixed_shapes() {
        let odd = FeatureWindow {
            bins: 3,
            frames: 2,
            data: vec![0.0; 6],
        };
        assert!(feature_input(&[window(), odd]).is_err());
        assert_eq!(feature_input(&[window(), window()]).unwrap().dim(), (2, 2, 2));
    }
}
