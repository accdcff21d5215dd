/// PCM audio pipeline: browser capture format → upstream wire format.
///
/// ```text
///  browser (f32le / s16le, any rate)          upstream (s16le, 16 kHz)
///  ────────────────────────────────▶ decode ▶ resample ▶ encode ▶
/// ```
///
/// The resampler is linear interpolation with state carried across
/// calls: the last sample of each batch is retained as a tail and the
/// fractional read position survives, so a position straddling two
/// batches interpolates across the real sample pair instead of
/// restarting at the batch edge.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sample rate of everything sent upstream.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

// ═══════════════════════════════════════════════════════════════════════
//  Input encoding
// ═══════════════════════════════════════════════════════════════════════

/// Sample encoding of the browser's binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEncoding {
    /// IEEE-754 float32, little-endian (Web Audio default).
    #[default]
    F32le,
    /// Signed 16-bit, little-endian.
    S16le,
}

impl InputEncoding {
    pub fn sample_size(self) -> usize {
        match self {
            InputEncoding::F32le => 4,
            InputEncoding::S16le => 2,
        }
    }
}

impl fmt::Display for InputEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputEncoding::F32le => write!(f, "f32le"),
            InputEncoding::S16le => write!(f, "s16le"),
        }
    }
}

impl FromStr for InputEncoding {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32le" => Ok(InputEncoding::F32le),
            "s16le" => Ok(InputEncoding::S16le),
            other => Err(AudioError::UnsupportedEncoding(other.to_owned())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("{len}-byte frame is not aligned to {sample_size}-byte samples")]
    UnalignedFrame { len: usize, sample_size: usize },
    #[error("unsupported audio encoding {0:?} (expected \"f32le\" or \"s16le\")")]
    UnsupportedEncoding(String),
    #[error("input sample rate must be positive")]
    InvalidSampleRate,
}

// ═══════════════════════════════════════════════════════════════════════
//  Pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Per-session audio converter. Owned by one session, driven from one
/// task; carries only the resampler state between calls.
#[derive(Debug)]
pub struct PcmPipeline {
    encoding: InputEncoding,
    resampler: Option<LinearResampler>,
}

impl PcmPipeline {
    pub fn new(sample_rate: u32, encoding: InputEncoding) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate);
        }
        let resampler = (sample_rate != TARGET_SAMPLE_RATE)
            .then(|| LinearResampler::new(sample_rate, TARGET_SAMPLE_RATE));
        Ok(PcmPipeline { encoding, resampler })
    }

    /// Convert one batch of browser audio to 16 kHz mono s16le bytes.
    ///
    /// Empty input yields empty output. A length not divisible by the
    /// sample size fails with [`AudioError::UnalignedFrame`].
    pub fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, AudioError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let sample_size = self.encoding.sample_size();
        if input.len() % sample_size != 0 {
            return Err(AudioError::UnalignedFrame {
                len: input.len(),
                sample_size,
            });
        }

        // s16le at the target rate is already wire format.
        if self.encoding == InputEncoding::S16le && self.resampler.is_none() {
            return Ok(input.to_vec());
        }

        let samples = decode_samples(input, self.encoding);
        let samples = match &mut self.resampler {
            Some(r) => r.resample(&samples),
            None => samples,
        };
        Ok(encode_s16le(&samples))
    }
}

fn decode_samples(input: &[u8], encoding: InputEncoding) -> Vec<f32> {
    match encoding {
        InputEncoding::F32le => input
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        InputEncoding::S16le => input
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
    }
}

/// Clamp to [-1, 1], scale by 32767, round half away from zero.
fn encode_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let q = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
//  Resampler
// ═══════════════════════════════════════════════════════════════════════

/// Streaming linear-interpolation resampler.
///
/// `pos` is the fractional read cursor into the current batch (with the
/// previous batch's final sample prepended at index 0). The final
/// in-flight sample of every batch is retained as `tail` and emitted at
/// the start of the next batch. Dropping either between calls causes
/// audible seams at batch boundaries.
#[derive(Debug)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    tail: Option<f32>,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        LinearResampler {
            step: src_rate as f64 / dst_rate as f64,
            pos: 0.0,
            tail: None,
        }
    }

    pub fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let mut buf = Vec::with_capacity(input.len() + 1);
        if let Some(t) = self.tail {
            buf.push(t);
        }
        buf.extend_from_slice(input);

        let last = (buf.len() - 1) as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 2);

        // A position exactly on the final sample is deferred to the next
        // batch, where that sample sits at index 0.
        while self.pos < last {
            let idx = self.pos as usize;
            let frac = self.pos - idx as f64;
            let a = buf[idx] as f64;
            let b = buf[idx + 1] as f64;
            out.push((a + (b - a) * frac) as f32);
            self.pos += self.step;
        }

        self.tail = Some(buf[buf.len() - 1]);
        self.pos -= last;
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn s16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn as_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_s16_at_target_rate_is_bit_exact() {
        let mut p = PcmPipeline::new(16_000, InputEncoding::S16le).unwrap();
        let input = s16_bytes(&[0, 1, -1, i16::MAX, i16::MIN, 12345, -12345]);
        assert_eq!(p.process(&input).unwrap(), input);
    }

    #[test]
    fn test_f32_at_target_rate_quantizes() {
        let mut p = PcmPipeline::new(16_000, InputEncoding::F32le).unwrap();
        let input = f32_bytes(&[0.0, 1.0, -1.0, 0.5, 2.0, -3.0]);
        let out = as_i16(&p.process(&input).unwrap());
        // Out-of-range floats clamp instead of wrapping.
        assert_eq!(out, vec![0, 32767, -32767, 16384, 32767, -32767]);
    }

    #[test]
    fn test_empty_input_is_empty_output() {
        let mut p = PcmPipeline::new(48_000, InputEncoding::F32le).unwrap();
        assert!(p.process(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let mut p = PcmPipeline::new(48_000, InputEncoding::F32le).unwrap();
        assert_eq!(
            p.process(&[0u8; 6]).unwrap_err(),
            AudioError::UnalignedFrame { len: 6, sample_size: 4 }
        );

        let mut p = PcmPipeline::new(16_000, InputEncoding::S16le).unwrap();
        assert_eq!(
            p.process(&[0u8; 3]).unwrap_err(),
            AudioError::UnalignedFrame { len: 3, sample_size: 2 }
        );
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert_eq!(
            PcmPipeline::new(0, InputEncoding::F32le).unwrap_err(),
            AudioError::InvalidSampleRate
        );
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("f32le".parse::<InputEncoding>().unwrap(), InputEncoding::F32le);
        assert_eq!("s16le".parse::<InputEncoding>().unwrap(), InputEncoding::S16le);
        assert!(matches!(
            "opus".parse::<InputEncoding>(),
            Err(AudioError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_dc_input_stays_dc_in_any_partition() {
        // 480 samples of DC at 48 kHz resample to 160 samples at 16 kHz,
        // no matter how the input is batched.
        let input = vec![1.0f32; 480];
        for batches in [vec![480], vec![240, 240], vec![7, 473], vec![100, 100, 100, 180]] {
            let mut p = PcmPipeline::new(48_000, InputEncoding::F32le).unwrap();
            let mut out = Vec::new();
            let mut off = 0;
            for n in batches {
                out.extend(p.process(&f32_bytes(&input[off..off + n])).unwrap());
                off += n;
            }
            let samples = as_i16(&out);
            assert_eq!(samples.len(), 160);
            assert!(samples.iter().all(|&s| s == 32767), "DC level must survive");
        }
    }

    #[test]
    fn test_batching_does_not_move_samples() {
        // A full-scale 1 kHz sine at 44.1 kHz, resampled whole vs. in
        // ragged batches: same sample count, every sample within 1 LSB
        // (no spikes or dropouts at the seams).
        let n = 44_100;
        let sine: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 44_100.0).sin() as f32)
            .collect();

        let mut whole = PcmPipeline::new(44_100, InputEncoding::F32le).unwrap();
        let reference = as_i16(&whole.process(&f32_bytes(&sine)).unwrap());

        let mut batched = PcmPipeline::new(44_100, InputEncoding::F32le).unwrap();
        let mut out = Vec::new();
        let mut off = 0;
        for &size in [1usize, 441, 113, 4096, 555].iter().cycle() {
            if off >= n {
                break;
            }
            let end = (off + size).min(n);
            out.extend(batched.process(&f32_bytes(&sine[off..end])).unwrap());
            off = end;
        }
        let samples = as_i16(&out);

        assert_eq!(samples.len(), reference.len());
        for (i, (a, b)) in samples.iter().zip(&reference).enumerate() {
            assert!((*a as i32 - *b as i32).abs() <= 1, "sample {i}: {a} vs {b}");
        }
        // Full-scale input stays full-scale, never clipped past it.
        let peak = samples.iter().map(|s| (*s as i32).abs()).max().unwrap();
        assert!(peak <= 32767);
        assert!(peak >= 32700, "peak collapsed to {peak}");
    }

    #[test]
    fn test_resampler_tail_spans_batches() {
        // Ramp 0,1,2,...: interpolated values must be the ramp itself,
        // including positions that land between two batches.
        let mut r = LinearResampler::new(48_000, 16_000);
        let first: Vec<f32> = (0..5).map(|i| i as f32).collect();
        let second: Vec<f32> = (5..11).map(|i| i as f32).collect();
        let mut out = r.resample(&first);
        out.extend(r.resample(&second));
        // Step 3: positions 0, 3, 6, 9 over the 11-sample stream.
        assert_eq!(out, vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_upsampling_interpolates() {
        let mut r = LinearResampler::new(8_000, 16_000);
        let out = r.resample(&[0.0, 1.0]);
        // Step 0.5: positions 0.0 and 0.5 emit; position 1.0 is deferred
        // as the tail.
        assert_eq!(out, vec![0.0, 0.5]);
        let out = r.resample(&[2.0]);
        assert_eq!(out, vec![1.0, 1.5]);
    }
}
