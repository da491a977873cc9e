//! Master-bus compressor: feed-forward, soft knee, linked peak detector.
//! Parameters follow the usual threshold/knee/ratio/attack/release set.

use crate::config::CompressorConfig;

#[derive(Debug, Clone)]
pub struct Compressor {
    threshold: f64,
    knee: f64,
    ratio: f64,
    attack_coef: f64,
    release_coef: f64,
    /// Linear peak envelope.
    envelope: f64,
}

#[inline]
fn to_db(linear: f64) -> f64 {
    if linear <= 1e-6 { -120.0 } else { 20.0 * linear.log10() }
}

#[inline]
fn from_db(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

impl Compressor {
    pub fn new(sample_rate: f64, config: &CompressorConfig) -> Self {
        let coef = |seconds: f64| (-1.0 / (seconds.max(1e-4) * sample_rate)).exp();
        Compressor {
            threshold: config.threshold.clamp(-100.0, 0.0),
            knee: config.knee.clamp(0.0, 40.0),
            ratio: config.ratio.clamp(1.0, 20.0),
            attack_coef: coef(config.attack),
            release_coef: coef(config.release),
            envelope: 0.0,
        }
    }

    /// Gain change in dB (<= 0) for an input level in dB.
    fn gain_db(&self, level_db: f64) -> f64 {
        let slope = 1.0 - 1.0 / self.ratio;
        let over = level_db - self.threshold;
        if self.knee > 0.0 && over.abs() <= self.knee / 2.0 {
            let x = over + self.knee / 2.0;
            -slope * x * x / (2.0 * self.knee)
        } else if over > 0.0 {
            -slope * over
        } else {
            0.0
        }
    }

    /// Compress one stereo frame (linked detection).
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let level = left.abs().max(right.abs()) as f64;
        let coef = if level > self.envelope {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope = coef * self.envelope + (1.0 - coef) * level;
        let gain = from_db(self.gain_db(to_db(self.envelope))) as f32;
        (left * gain, right * gain)
    }

    /// Current gain reduction in dB, positive when compressing.
    pub fn gain_reduction(&self) -> f64 {
        -self.gain_db(to_db(self.envelope))
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
