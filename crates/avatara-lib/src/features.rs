//! Audio features fed to the renderer.
//!
//! The default extractor produces the normalized log-mel spectrogram that
//! lip-sync models are trained on: 80 mel bins, 800-point STFT with a 200
//! sample hop at 16 kHz (80 feature frames per second), pre-emphasis, Slaney
//! filters between 55 Hz and 7.6 kHz, dB scaling, symmetric clip to [-4, 4].

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use avatara_core::wav::SAMPLE_RATE;

/// One fixed-shape feature tensor, `bins` rows by `frames` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    pub bins: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

/// Features handed to the scheduler per driving tick, one window per video frame.
pub type FeatureBatch = Vec<FeatureWindow>;

/// Full feature matrix for a span of audio, row-major by bin.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    pub data: Vec<f32>,
}

impl Spectrogram {
    /// Cut `len` frames starting at `start`. A window running past the end is
    /// pulled back to the last full window; columns that still do not exist
    /// are filled with `floor`.
    pub fn window(&self, start: usize, len: usize, floor: f32) -> FeatureWindow {
        let start = if start + len > self.frames {
            self.frames.saturating_sub(len)
        } else {
            start
        };
        let mut data = Vec::with_capacity(self.bins * len);
        for bin in 0..self.bins {
            let row = &self.data[bin * self.frames..(bin + 1) * self.frames];
            for f in start..start + len {
                data.push(row.get(f).copied().unwrap_or(floor));
            }
        }
        FeatureWindow {
            bins: self.bins,
            frames: len,
            data,
        }
    }
}

/// Turns raw 16 kHz audio into a feature matrix.
pub trait FeatureExtractor: Send + Sync {
    fn spectrogram(&self, samples: &[f32]) -> Spectrogram;

    /// Feature frames per second of audio.
    fn frame_rate(&self) -> f32;

    /// Frames per window handed to the renderer.
    fn window_frames(&self) -> usize;

    /// Value representing silence, used for padding.
    fn floor(&self) -> f32;
}

const N_FFT: usize = 800;
const HOP: usize = 200;
const N_MELS: usize = 80;
const WINDOW_FRAMES: usize = 16;
const PREEMPHASIS: f32 = 0.97;
const F_MIN: f64 = 55.0;
const F_MAX: f64 = 7600.0;
const MIN_LEVEL_DB: f32 = -100.0;
const REF_LEVEL_DB: f32 = 20.0;
const MAX_ABS: f32 = 4.0;

pub struct MelExtractor {
    window: Vec<f32>,
    filters: Vec<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

impl Default for MelExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MelExtractor {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            window: hann_window(N_FFT),
            filters: slaney_filter_bank(N_MELS, N_FFT, SAMPLE_RATE, F_MIN, F_MAX),
            fft: planner.plan_fft_forward(N_FFT),
        }
    }

    /// Magnitude STFT with centered reflect padding, one `Vec` per frame.
    fn stft_magnitude(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let padded = pad_reflect(samples, N_FFT / 2);
        let n_frames = padded.len().saturating_sub(N_FFT) / HOP + 1;
        let n_freqs = N_FFT / 2 + 1;
        let mut buf = vec![Complex::new(0.0f32, 0.0); N_FFT];
        let mut out = Vec::with_capacity(n_frames);
        for frame in 0..n_frames {
            let start = frame * HOP;
            if start + N_FFT > padded.len() {
                break;
            }
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            out.push(buf[..n_freqs].iter().map(|c| c.norm()).collect());
        }
        out
    }
}

impl FeatureExtractor for MelExtractor {
    fn spectrogram(&self, samples: &[f32]) -> Spectrogram {
        let mut emphasized = Vec::with_capacity(samples.len());
        let mut prev = 0.0f32;
        for &s in samples {
            emphasized.push(s - PREEMPHASIS * prev);
            prev = s;
        }

        let stft = self.stft_magnitude(&emphasized);
        let frames = stft.len();
        let mut data = vec![0.0f32; N_MELS * frames];
        for (f, spectrum) in stft.iter().enumerate() {
            for (bin, filter) in self.filters.iter().enumerate() {
                let energy: f32 = filter.iter().zip(spectrum).map(|(w, m)| w * m).sum();
                let db = 20.0 * energy.max(1e-5).log10() - REF_LEVEL_DB;
                let norm = 2.0 * MAX_ABS * ((db - MIN_LEVEL_DB) / -MIN_LEVEL_DB) - MAX_ABS;
                data[bin * frames + f] = norm.clamp(-MAX_ABS, MAX_ABS);
            }
        }
        Spectrogram {
            bins: N_MELS,
            frames,
            data,
        }
    }

    fn frame_rate(&self) -> f32 {
        SAMPLE_RATE as f32 / HOP as f32
    }

    fn window_frames(&self) -> usize {
        WINDOW_FRAMES
    }

    fn floor(&self) -> f32 {
        -MAX_ABS
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    let factor = 2.0 * std::f32::consts::PI / size as f32;
    (0..size).map(|i| 0.5 - 0.5 * (i as f32 * factor).cos()).collect()
}

fn pad_reflect(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    if n < 2 {
        let v = samples.first().copied().unwrap_or(0.0);
        return vec![v; n + 2 * pad];
    }
    let reflect = |i: isize| -> f32 {
        let period = 2 * (n as isize - 1);
        let mut j = i.rem_euclid(period);
        if j >= n as isize {
            j = period - j;
        }
        samples[j as usize]
    };
    (-(pad as isize)..(n + pad) as isize).map(reflect).collect()
}

fn hz_to_mel(freq: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = 15.0;
    const LOGSTEP: f64 = 0.06875177742094912; // ln(6.4) / 27

    if freq < MIN_LOG_HZ {
        freq / F_SP
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = 15.0;
    const LOGSTEP: f64 = 0.06875177742094912;

    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Area-normalized triangular mel filters.
fn slaney_filter_bank(
    n_mels: usize,
    n_fft: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * sample_rate as f64 / n_fft as f64)
        .collect();
    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut bank = vec![vec![0.0f32; n_freqs]; n_mels];
    for (m, filter) in bank.iter_mut().enumerate() {
        let (lower, center, upper) = (points[m], points[m + 1], points[m + 2]);
        let enorm = 2.0 / (upper - lower);
        for (j, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper {
                (upper - freq) / (upper - center)
            } else {
                0.0
            };
            filter[j] = (enorm * w) as f32;
        }
    }
    bank
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn frame_rate_is_eighty_per_second() {
        let mel = MelExtractor::new();
        assert_eq!(mel.frame_rate(), 80.0);
        let spec = mel.spectrogram(&vec![0.0; 16000]);
        assert_eq!(spec.bins, 80);
        assert_eq!(spec.frames, 81);
        assert_eq!(spec.data.len(), 80 * 81);
    }

    #[test]
    fn silence_sits_at_floor() {
        let mel = MelExtractor::new();
        let spec = mel.spectrogram(&vec![0.0; 3200]);
        assert!(spec.data.iter().all(|&v| v == mel.floor()));
    }

    #[test]
    fn values_are_clipped() {
        let mel = MelExtractor::new();
        let spec = mel.spectrogram(&sine(440.0, 8000));
        assert!(spec.data.iter().all(|v| (-4.0..=4.0).contains(v)));
        assert!(spec.data.iter().any(|&v| v > mel.floor()));
    }

    #[test]
    fn tone_energy_lands_in_low_bins() {
        let mel = MelExtractor::new();
        let spec = mel.spectrogram(&sine(300.0, 16000));
        let mid = spec.frames / 2;
        let at = |bin: usize| spec.data[bin * spec.frames + mid];
        let loudest = (0..spec.bins)
            .max_by(|&a, &b| at(a).total_cmp(&at(b)))
            .unwrap();
        assert!(loudest < 20, "loudest bin {loudest}");
    }

    #[test]
    fn window_clamps_to_last_full_window() {
        let spec = Spectrogram {
            bins: 1,
            frames: 20,
            data: (0..20).map(|v| v as f32).collect(),
        };
        let w = spec.window(10, 16, -4.0);
        assert_eq!(w.data[0], 4.0);
        assert_eq!(w.data[15], 19.0);
    }

    #[test]
    fn window_pads_short_spectrum() {
        let spec = Spectrogram {
            bins: 2,
            frames: 3,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        let w = spec.window(0, 5, -4.0);
        assert_eq!(w.frames, 5);
        assert_eq!(w.data, vec![1.0, 2.0, 3.0, -4.0, -4.0, 4.0, 5.0, 6.0, -4.0, -4.0]);
    }

    #[test]
    fn reflect_padding_mirrors_edges() {
        assert_eq!(
            pad_reflect(&[1.0, 2.0, 3.0, 4.0], 2),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
    }
}
