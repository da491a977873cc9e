//! Freeverb-style stereo reverb for the routing `reverb` module.
//!
//! Eight parallel damped combs feed four series allpasses per side. The
//! `decay` parameter is an RT60 in seconds: each comb's feedback is chosen so
//! its own loop falls by 60 dB over that time.

const COMB_LENGTHS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_LENGTHS: [usize; 4] = [556, 441, 341, 225];
/// Right-channel length offset, in samples at 44.1 kHz.
const SPREAD: usize = 23;
const INPUT_GAIN: f32 = 0.015;
const DAMPING: f32 = 0.2;
const MAX_FEEDBACK: f64 = 0.98;

#[derive(Debug, Clone)]
struct Comb {
    line: Vec<f32>,
    pos: usize,
    feedback: f32,
    lowpass: f32,
}

impl Comb {
    fn new(len: usize) -> Self {
        Comb {
            line: vec![0.0; len.max(1)],
            pos: 0,
            feedback: 0.0,
            lowpass: 0.0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let out = self.line[self.pos];
        self.lowpass = out * (1.0 - DAMPING) + self.lowpass * DAMPING;
        self.line[self.pos] = input + self.lowpass * self.feedback;
        self.pos = (self.pos + 1) % self.line.len();
        out
    }
}

#[derive(Debug, Clone)]
struct Allpass {
    line: Vec<f32>,
    pos: usize,
}

impl Allpass {
    fn new(len: usize) -> Self {
        Allpass {
            line: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let delayed = self.line[self.pos];
        self.line[self.pos] = input + delayed * 0.5;
        self.pos = (self.pos + 1) % self.line.len();
        delayed - input
    }
}

#[derive(Debug, Clone)]
struct Side {
    combs: Vec<Comb>,
    allpasses: Vec<Allpass>,
}

impl Side {
    fn new(scale: f64, offset: usize) -> Self {
        let len = |base: usize| ((base + offset) as f64 * scale) as usize;
        Side {
            combs: COMB_LENGTHS.iter().map(|&n| Comb::new(len(n))).collect(),
            allpasses: ALLPASS_LENGTHS.iter().map(|&n| Allpass::new(len(n))).collect(),
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let mut out: f32 = self.combs.iter_mut().map(|c| c.tick(input)).sum();
        for ap in &mut self.allpasses {
            out = ap.tick(out);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Reverb {
    sample_rate: f64,
    left: Side,
    right: Side,
    decay: f64,
    mix: f32,
}

impl Reverb {
    pub fn new(sample_rate: f64) -> Self {
        Self::with_params(sample_rate, 2.0, 0.25)
    }

    pub fn with_params(sample_rate: f64, decay: f64, mix: f64) -> Self {
        let scale = sample_rate / 44100.0;
        let mut reverb = Reverb {
            sample_rate,
            left: Side::new(scale, 0),
            right: Side::new(scale, SPREAD),
            decay: 0.0,
            mix: 0.0,
        };
        reverb.set_decay(decay);
        reverb.set_mix(mix);
        reverb
    }

    /// RT60 in seconds, clamped to 0.1..=10.
    pub fn set_decay(&mut self, seconds: f64) {
        self.decay = seconds.clamp(0.1, 10.0);
        let sr = self.sample_rate;
        let decay = self.decay;
        for comb in self.left.combs.iter_mut().chain(self.right.combs.iter_mut()) {
            let loop_seconds = comb.line.len() as f64 / sr;
            comb.feedback = 10f64.powf(-3.0 * loop_seconds / decay).min(MAX_FEEDBACK) as f32;
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn set_mix(&mut self, mix: f64) {
        self.mix = mix.clamp(0.0, 1.0) as f32;
    }

    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let input = (left + right) * INPUT_GAIN;
        let wet_l = self.left.tick(input);
        let wet_r = self.right.tick(input);
        let dry = 1.0 - self.mix;
        (left * dry + wet_l * self.mix, right * dry + wet_r * self.mix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tail_peak(reverb: &mut Reverb, skip: usize, len: usize) -> f32 {
        for _ in 0..skip {
            reverb.process(0.0, 0.0);
        }
        (0..len)
            .map(|_| {
                let (l, r) = reverb.process(0.0, 0.0);
                l.abs().max(r.abs())
            })
            .fold(0.0, f32::max)
    }

    #[test]
    fn dry_mix_is_identity() {
        let mut reverb = Reverb::with_params(44100.0, 2.0, 0.0);
        assert_eq!(reverb.process(0.3, -0.2), (0.3, -0.2));
    }

    #[test]
    fn impulse_produces_tail() {
        let mut reverb = Reverb::with_params(44100.0, 2.0, 1.0);
        reverb.process(1.0, 1.0);
        let peak = tail_peak(&mut reverb, 0, 4410);
        assert!(peak > 1e-3, "Should ring after an impulse, got {peak}");
    }

    #[test]
    fn longer_decay_rings_longer() {
        let mut short = Reverb::with_params(44100.0, 0.3, 1.0);
        let mut long = Reverb::with_params(44100.0, 4.0, 1.0);
        short.process(1.0, 1.0);
        long.process(1.0, 1.0);
        let short_tail = tail_peak(&mut short, 44100, 4410);
        let long_tail = tail_peak(&mut long, 44100, 4410);
        assert!(
            long_tail > short_tail * 10.0,
            "Should sustain longer with larger decay, got {short_tail} vs {long_tail}"
        );
        assert!(short_tail < 1e-4, "Short room should be gone after 1 s, got {short_tail}");
    }

    #[test]
    fn decay_is_clamped() {
        let mut reverb = Reverb::new(44100.0);
        reverb.set_decay(100.0);
        assert_eq!(reverb.decay(), 10.0);
        reverb.set_decay(0.0);
        assert_eq!(reverb.decay(), 0.1);
    }
}
