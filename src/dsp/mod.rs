//! DSP — synthesis models, filters, and effects.
//!
//! Note renderers (pluck, bowed, drum) produce complete finite
//! [`StereoBuffer`]s at note-on time; the real-time path only plays
//! them back and runs the per-sample effects.

pub mod additive;
pub mod analysis;
pub mod bowed;
pub mod compressor;
pub mod convolver;
pub mod delay;
pub mod drum;
pub mod envelope;
pub mod filter;
pub mod mixer;
pub mod noise;
pub mod oscillator;
pub mod pluck;
pub mod renderer;
pub mod reverb;

/// A pre-rendered stereo sample buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoBuffer {
    /// A silent buffer of `len` frames.
    pub fn new(len: usize) -> Self {
        StereoBuffer {
            left: vec![0.0; len],
            right: vec![0.0; len],
        }
    }

    /// A silent buffer lasting `seconds`.
    pub fn with_duration(seconds: f64, sample_rate: f64) -> Self {
        Self::new((seconds * sample_rate).round().max(0.0) as usize)
    }

    pub fn len(&self) -> usize {
        self.left.len().min(self.right.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute peak across both channels.
    pub fn peak(&self) -> f32 {
        self.left
            .iter()
            .chain(self.right.iter())
            .fold(0.0f32, |m, s| m.max(s.abs()))
    }

    /// Linear fade to zero over the last `frames` frames.
    pub fn fade_out(&mut self, frames: usize) {
        let len = self.len();
        let frames = frames.min(len);
        for k in 0..frames {
            let i = len - frames + k;
            let g = 1.0 - (k + 1) as f32 / frames as f32;
            self.left[i] *= g;
            self.right[i] *= g;
        }
    }
}

/// Mean energy of `samples` over consecutive windows of `window` frames.
pub fn window_energy(samples: &[f32], window: usize) -> Vec<f64> {
    samples
        .chunks(window.max(1))
        .filter(|c| c.len() == window.max(1))
        .map(|c| c.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / c.len() as f64)
        .collect()
}
