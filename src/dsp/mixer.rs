//! Per-channel mixer buses and the master output stage.

use crate::config::EngineConfig;
use crate::dsp::compressor::Compressor;
use crate::synth::channel::pan_gains;

/// Stereo summing point for one MIDI channel.
#[derive(Debug, Clone)]
pub struct MixerBus {
    pub channel: u8,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl MixerBus {
    pub fn new(channel: u8, block_size: usize) -> Self {
        MixerBus {
            channel,
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
        }
    }

    /// Zero the bus and size it for `frames` samples.
    pub fn clear(&mut self, frames: usize) {
        self.left.clear();
        self.left.resize(frames, 0.0);
        self.right.clear();
        self.right.resize(frames, 0.0);
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    #[inline]
    pub fn add_frame(&mut self, index: usize, left: f32, right: f32) {
        if index < self.left.len() {
            self.left[index] += left;
            self.right[index] += right;
        }
    }

    pub fn buffers_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.left, &mut self.right)
    }

    /// Accumulate a block scaled by `gain`.
    pub fn add_block(&mut self, left: &[f32], right: &[f32], gain: f32) {
        for (dst, src) in self.left.iter_mut().zip(left) {
            *dst += src * gain;
        }
        for (dst, src) in self.right.iter_mut().zip(right) {
            *dst += src * gain;
        }
    }

    /// Sum this bus into `out` after channel gain and balance.
    pub fn mix_into(&self, out_left: &mut [f32], out_right: &mut [f32], gain: f64, pan: f64) {
        let (pl, pr) = pan_gains(pan);
        let gl = (gain * pl) as f32;
        let gr = (gain * pr) as f32;
        for (dst, src) in out_left.iter_mut().zip(&self.left) {
            *dst += src * gl;
        }
        for (dst, src) in out_right.iter_mut().zip(&self.right) {
            *dst += src * gr;
        }
    }

    pub fn is_silent(&self) -> bool {
        self.left.iter().chain(&self.right).all(|s| *s == 0.0)
    }
}

/// Master volume, compressor, then a tanh soft limiter.
#[derive(Debug, Clone)]
pub struct MasterBus {
    pub volume: f32,
    drive: f32,
    compressor: Compressor,
}

impl MasterBus {
    pub fn new(config: &EngineConfig) -> Self {
        MasterBus {
            volume: config.master_volume as f32,
            drive: config.limiter_drive as f32,
            compressor: Compressor::new(config.sample_rate, &config.compressor),
        }
    }

    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (cl, cr) = self.compressor.process(*l * self.volume, *r * self.volume);
            *l = (cl * self.drive).tanh();
            *r = (cr * self.drive).tanh();
        }
    }

    pub fn reset(&mut self) {
        self.compressor.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_accumulates_sources() {
        let mut bus = MixerBus::new(0, 4);
        bus.add_block(&[0.5; 4], &[0.25; 4], 1.0);
        bus.add_block(&[0.5; 4], &[0.25; 4], 0.5);
        bus.add_frame(2, 1.0, 0.0);
        let mut l = [0.0; 4];
        let mut r = [0.0; 4];
        bus.mix_into(&mut l, &mut r, 1.0, 0.0);
        assert!((l[0] - 0.75).abs() < 1e-6, "Should sum, got {}", l[0]);
        assert!((l[2] - 1.75).abs() < 1e-6);
        assert!((r[1] - 0.375).abs() < 1e-6);
    }

    #[test]
    fn hard_pan_silences_other_side() {
        let mut bus = MixerBus::new(3, 8);
        bus.add_block(&[1.0; 8], &[1.0; 8], 1.0);
        let mut l = [0.0; 8];
        let mut r = [0.0; 8];
        bus.mix_into(&mut l, &mut r, 1.0, 1.0);
        assert!(l.iter().all(|s| *s == 0.0), "Left should be silent");
        assert!(r.iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn clear_resets_and_resizes() {
        let mut bus = MixerBus::new(0, 4);
        bus.add_frame(0, 1.0, 1.0);
        bus.clear(16);
        assert_eq!(bus.frames(), 16);
        assert!(bus.is_silent());
    }

    #[test]
    fn master_output_is_bounded() {
        let mut master = MasterBus::new(&EngineConfig {
            master_volume: 10.0,
            ..EngineConfig::default()
        });
        let mut l = vec![5.0; 512];
        let mut r = vec![-5.0; 512];
        master.process_block(&mut l, &mut r);
        assert!(l.iter().all(|s| *s > 0.0 && *s < 1.0), "Limiter should bound output");
        assert!(r.iter().all(|s| *s < 0.0 && *s > -1.0));
    }

    #[test]
    fn master_silence_stays_silent() {
        let mut master = MasterBus::new(&EngineConfig::default());
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        master.process_block(&mut l, &mut r);
        assert!(l.iter().chain(&r).all(|s| *s == 0.0));
    }
}
