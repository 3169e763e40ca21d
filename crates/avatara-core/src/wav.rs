//! WAV decoding and PCM conversion utilities.
//!
//! Pure functions with no I/O and no async runtime.

/// Pipeline sample rate (16 kHz mono).
pub const SAMPLE_RATE: u32 = 16_000;

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;

/// Parsed WAV header fields needed for decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset in the buffer where sample data begins.
    pub data_offset: usize,
    /// Declared data length, `None` for streaming sentinel sizes.
    pub data_len: Option<usize>,
}

/// Parse a WAV header from a byte buffer.
///
/// Accepts integer PCM and IEEE float. Streaming encoders write `0xFFFFFFFF`
/// for unknown chunk sizes; those are treated as "until end of buffer".
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, &'static str> {
    if buf.len() < 12 {
        return Err("too short for RIFF header");
    }
    if &buf[0..4] != b"RIFF" {
        return Err("missing RIFF tag");
    }
    if &buf[8..12] != b"WAVE" {
        return Err("missing WAVE tag");
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u16, u32, u16)> = None;

    while pos + 8 <= buf.len() {
        let chunk_id = &buf[pos..pos + 4];
        let chunk_size =
            u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);

        if chunk_id == b"fmt " {
            if pos + 24 > buf.len() {
                return Err("fmt chunk truncated");
            }
            let audio_format = u16::from_le_bytes([buf[pos + 8], buf[pos + 9]]);
            if audio_format != FORMAT_PCM && audio_format != FORMAT_FLOAT {
                return Err("unsupported WAV encoding");
            }
            let channels = u16::from_le_bytes([buf[pos + 10], buf[pos + 11]]);
            let sample_rate = u32::from_le_bytes([
                buf[pos + 12],
                buf[pos + 13],
                buf[pos + 14],
                buf[pos + 15],
            ]);
            let bits = u16::from_le_bytes([buf[pos + 22], buf[pos + 23]]);
            fmt = Some((audio_format, channels, sample_rate, bits));

            let skip = if chunk_size == 0xFFFFFFFF {
                16
            } else {
                chunk_size as usize
            };
            // RIFF chunks are word-aligned.
            pos += 8 + skip + (skip & 1);
            continue;
        }

        if chunk_id == b"data" {
            let (audio_format, channels, sample_rate, bits_per_sample) =
                fmt.ok_or("data chunk before fmt chunk")?;
            if channels == 0 {
                return Err("zero channels");
            }
            return Ok(WavHeader {
                audio_format,
                channels,
                sample_rate,
                bits_per_sample,
                data_offset: pos + 8,
                data_len: (chunk_size != 0xFFFFFFFF).then_some(chunk_size as usize),
            });
        }

        let skip = if chunk_size == 0xFFFFFFFF {
            0
        } else {
            chunk_size as usize
        };
        pos += 8 + skip + (skip & 1);
    }

    Err("data chunk not found")
}

/// Decoded mono audio at its native sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode a WAV buffer to mono f32 in `[-1, 1]`.
pub fn decode_wav(buf: &[u8]) -> Result<DecodedAudio, String> {
    let header = parse_wav_header(buf).map_err(|e| format!("invalid WAV: {e}"))?;
    let end = match header.data_len {
        Some(len) => (header.data_offset + len).min(buf.len()),
        None => buf.len(),
    };
    let data = &buf[header.data_offset..end];

    let interleaved: Vec<f32> = match (header.audio_format, header.bits_per_sample) {
        (FORMAT_PCM, 16) => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
        (FORMAT_FLOAT, 32) => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        (format, bits) => {
            return Err(format!(
                "unsupported WAV sample layout: format {format}, {bits} bits"
            ));
        }
    };

    Ok(DecodedAudio {
        samples: mix_to_mono(&interleaved, header.channels),
        sample_rate: header.sample_rate,
    })
}

/// Decode any supported WAV buffer and bring it to the pipeline rate.
pub fn decode_to_pipeline_rate(buf: &[u8]) -> Result<Vec<f32>, String> {
    let decoded = decode_wav(buf)?;
    Ok(resample_linear(&decoded.samples, decoded.sample_rate, SAMPLE_RATE))
}

/// Mix interleaved multi-channel audio to mono by averaging channels.
pub fn mix_to_mono(input: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }
    let ch = channels as usize;
    input
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Resample using linear interpolation. Good enough for speech.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;
        let s0 = input[idx];
        let s1 = input.get(idx + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Linear resampler for audio that arrives in arbitrary pieces.
///
/// Carries the fractional read position and the last input sample across
/// calls, so feeding a signal piece by piece yields the same output as
/// [`resample_linear`] over the whole signal.
pub struct StreamResampler {
    step: f64,
    /// Read position of the next output, relative to the next piece.
    /// `-1.0..0.0` means it falls between `last` and the next piece.
    pos: f64,
    last: f32,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            step,
            pos: 0.0,
            last: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }
        let n = input.len() as f64;
        let last = self.last;
        let at = |i: isize| if i < 0 { last } else { input[i as usize] };
        let mut output = Vec::with_capacity((n / self.step) as usize + 1);
        while self.pos + 1.0 < n {
            let idx = self.pos.floor();
            let frac = (self.pos - idx) as f32;
            let (s0, s1) = (at(idx as isize), at(idx as isize + 1));
            output.push(s0 + frac * (s1 - s0));
            self.pos += self.step;
        }
        self.pos -= n;
        self.last = input[input.len() - 1];
        output
    }
}

/// Convert f32 samples to 16-bit little-endian PCM bytes.
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Convert raw bytes to i16 PCM samples (little-endian), carrying an odd
/// trailing byte over to the next call.
pub fn bytes_to_i16(bytes: &[u8], leftover: Option<u8>) -> (Vec<i16>, Option<u8>) {
    let mut data: Vec<u8>;
    let slice = if let Some(lo) = leftover {
        data = Vec::with_capacity(1 + bytes.len());
        data.push(lo);
        data.extend_from_slice(bytes);
        &data[..]
    } else {
        bytes
    };

    let samples = slice
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let remainder = if slice.len() % 2 == 1 {
        Some(slice[slice.len() - 1])
    } else {
        None
    };

    (samples, remainder)
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}
