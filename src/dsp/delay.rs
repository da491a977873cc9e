//! Stereo feedback delay used by the routing `delay` module.

/// Longest delay time a routing module may request.
pub const MAX_DELAY_SECONDS: f64 = 2.0;

/// Stereo feedback delay with a dry/wet mix.
#[derive(Debug, Clone)]
pub struct Delay {
    left: Vec<f32>,
    right: Vec<f32>,
    cursor: usize,
    sample_rate: f64,
    delay_samples: usize,
    feedback: f32,
    mix: f32,
}

impl Delay {
    pub fn new(sample_rate: f64) -> Self {
        Self::with_params(sample_rate, 0.25, 0.35, 0.3)
    }

    pub fn with_params(sample_rate: f64, time: f64, feedback: f64, mix: f64) -> Self {
        let capacity = (sample_rate * MAX_DELAY_SECONDS) as usize + 1;
        let mut delay = Delay {
            left: vec![0.0; capacity],
            right: vec![0.0; capacity],
            cursor: 0,
            sample_rate,
            delay_samples: 1,
            feedback: 0.0,
            mix: 0.0,
        };
        delay.set_time(time);
        delay.set_feedback(feedback);
        delay.set_mix(mix);
        delay
    }

    /// Delay time in seconds, at least one sample.
    pub fn set_time(&mut self, seconds: f64) {
        let samples = (seconds.clamp(0.0, MAX_DELAY_SECONDS) * self.sample_rate).round() as usize;
        self.delay_samples = samples.clamp(1, self.left.len() - 1);
    }

    pub fn set_feedback(&mut self, feedback: f64) {
        self.feedback = feedback.clamp(0.0, 0.95) as f32;
    }

    pub fn set_mix(&mut self, mix: f64) {
        self.mix = mix.clamp(0.0, 1.0) as f32;
    }

    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let len = self.left.len();
        let read = (self.cursor + len - self.delay_samples) % len;
        let (wet_l, wet_r) = (self.left[read], self.right[read]);
        self.left[self.cursor] = left + wet_l * self.feedback;
        self.right[self.cursor] = right + wet_r * self.feedback;
        self.cursor = (self.cursor + 1) % len;
        let dry = 1.0 - self.mix;
        (left * dry + wet_l * self.mix, right * dry + wet_r * self.mix)
    }

    pub fn clear(&mut self) {
        self.left.fill(0.0);
        self.right.fill(0.0);
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_arrives_after_delay_time() {
        let mut delay = Delay::with_params(1000.0, 0.01, 0.0, 1.0);
        let mut out = vec![delay.process(1.0, 1.0).0];
        for _ in 0..20 {
            out.push(delay.process(0.0, 0.0).0);
        }
        let peak = out
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |acc, (i, &s)| if s > acc.1 { (i, s) } else { acc });
        assert_eq!(peak.0, 10, "Should echo after 10 samples, got {}", peak.0);
        assert!((peak.1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn feedback_repeats_decay() {
        let mut delay = Delay::with_params(1000.0, 0.005, 0.5, 1.0);
        delay.process(1.0, 0.0);
        let out: Vec<f32> = (0..15).map(|_| delay.process(0.0, 0.0).0).collect();
        assert!((out[4] - 1.0).abs() < 1e-6, "First echo, got {}", out[4]);
        assert!((out[9] - 0.5).abs() < 1e-6, "Second echo, got {}", out[9]);
        assert!((out[14] - 0.25).abs() < 1e-6, "Third echo, got {}", out[14]);
    }

    #[test]
    fn dry_mix_passes_input() {
        let mut delay = Delay::with_params(44100.0, 0.25, 0.35, 0.0);
        let (l, r) = delay.process(0.4, -0.4);
        assert_eq!((l, r), (0.4, -0.4));
    }

    #[test]
    fn params_are_clamped() {
        let mut delay = Delay::with_params(1000.0, 10.0, 3.0, 2.0);
        assert_eq!(delay.delay_samples, 2000);
        assert!((delay.feedback - 0.95).abs() < 1e-6);
        delay.set_time(0.0);
        assert_eq!(delay.delay_samples, 1);
    }
}
