//! Percussion — pitch-swept sine body plus a band-passed noise click.

use std::f64::consts::PI;

use rand::Rng;

use super::StereoBuffer;
use super::filter::{BiquadFilter, FilterType};

const ATTACK_SECONDS: f64 = 0.005;
const SHELF_HZ: f64 = 2500.0;
const SHELF_GAIN_DB: f64 = 2.5;
const CLICK_DECAY_SECONDS: f64 = 0.0025;

/// Parameters of one drum sound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrumPreset {
    /// Start of the pitch sweep in Hz.
    pub start_hz: f64,
    /// End of the pitch sweep in Hz.
    pub end_hz: f64,
    pub duration: f64,
    pub transient: f64,
    pub sweep: f64,
    pub bandpass_hz: f64,
}

impl DrumPreset {
    const fn tone(start_hz: f64, end_hz: f64) -> Self {
        DrumPreset {
            start_hz,
            end_hz,
            duration: 0.4,
            transient: 0.015,
            sweep: 0.15,
            bandpass_hz: 1000.0,
        }
    }

    const fn short(start_hz: f64, end_hz: f64, duration: f64, transient: f64) -> Self {
        DrumPreset {
            duration,
            transient,
            ..Self::tone(start_hz, end_hz)
        }
    }

    const fn full(
        start_hz: f64,
        end_hz: f64,
        duration: f64,
        transient: f64,
        sweep: f64,
        bandpass_hz: f64,
    ) -> Self {
        DrumPreset {
            start_hz,
            end_hz,
            duration,
            transient,
            sweep,
            bandpass_hz,
        }
    }

    /// Preset for a General MIDI percussion note, if the kit has one.
    pub fn for_note(note: u8) -> Option<Self> {
        let preset = match note {
            35 => Self::tone(80.0, 60.0),
            36 => Self::tone(100.0, 80.0),
            37 => Self::short(800.0, 750.0, 0.15, 0.03),
            38 => Self::tone(220.0, 180.0),
            40 => Self::tone(250.0, 200.0),
            41 => Self::full(110.0, 70.0, 0.75, 0.06, 0.45, 1400.0),
            43 => Self::tone(140.0, 110.0),
            45 => Self::tone(180.0, 140.0),
            48 => Self::full(200.0, 150.0, 0.75, 0.06, 0.3, 280.0),
            63 => Self::short(300.0, 200.0, 0.15, 0.03),
            _ => return None,
        };
        Some(preset)
    }

    /// Render the hit at MIDI `velocity`.
    pub fn render<R: Rng + ?Sized>(&self, sample_rate: f64, velocity: u8, rng: &mut R) -> StereoBuffer {
        let v = velocity.min(127) as f64 / 127.0;
        let seconds = self.duration.max(self.transient);
        let mut out = StereoBuffer::with_duration(seconds, sample_rate);
        let len = out.len();

        let mut shelf = BiquadFilter::with_params(FilterType::HighShelf, sample_rate, SHELF_HZ, 0.707);
        shelf.set_gain_db(SHELF_GAIN_DB);
        let mut click_bp = BiquadFilter::with_params(FilterType::Bandpass, sample_rate, self.bandpass_hz, 1.5);

        let attack_n = (ATTACK_SECONDS * sample_rate).max(1.0);
        let click_n = (self.transient * sample_rate) as usize;
        let ratio = (self.end_hz / self.start_hz).max(1e-6);
        let mut phase = 0.0f64;

        for i in 0..len {
            let t = i as f64 / sample_rate;

            let freq = if t < self.sweep && self.sweep > 0.0 {
                self.start_hz * ratio.powf(t / self.sweep)
            } else {
                self.end_hz
            };
            phase = (phase + freq / sample_rate).fract();

            let body_gain = if (i as f64) < attack_n {
                0.0001 * (v.max(0.0001) / 0.0001).powf(i as f64 / attack_n)
            } else {
                let span = (self.duration - ATTACK_SECONDS).max(1e-3);
                let k = ((t - ATTACK_SECONDS) / span).min(1.0);
                v * (0.001 / v.max(0.001)).powf(k)
            };
            let body = shelf.process((2.0 * PI * phase).sin() * body_gain);

            let click = if i < click_n {
                let raw = rng.gen_range(-1.0..1.0) * (-(i as f64) / (sample_rate * CLICK_DECAY_SECONDS)).exp();
                let g = v * 0.25 * (0.001 / (v * 0.25).max(0.001)).powf(i as f64 / click_n as f64);
                click_bp.process(raw * g)
            } else {
                0.0
            };

            let s = (body + click) as f32;
            out.left[i] = s;
            out.right[i] = s;
        }
        out.fade_out((0.002 * sample_rate) as usize);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn kit_notes() {
        assert!(DrumPreset::for_note(36).is_some());
        assert!(DrumPreset::for_note(60).is_none());
        let tom = DrumPreset::for_note(41).unwrap();
        assert_eq!(tom.duration, 0.75);
        assert_eq!(tom.bandpass_hz, 1400.0);
        let rim = DrumPreset::for_note(37).unwrap();
        assert_eq!(rim.sweep, 0.15);
        assert_eq!(rim.transient, 0.03);
    }

    #[test]
    fn hit_is_audible_and_decays() {
        let kick = DrumPreset::for_note(36).unwrap();
        let buf = kick.render(44100.0, 127, &mut StdRng::seed_from_u64(8));
        assert_eq!(buf.len(), (0.4f64 * 44100.0).round() as usize);
        let head: f32 = buf.left[..4410].iter().map(|s| s.abs()).fold(0.0, f32::max);
        let tail: f32 = buf.left[buf.len() - 2205..].iter().map(|s| s.abs()).fold(0.0, f32::max);
        assert!(head > 0.1, "Kick should be loud at onset, got {head}");
        assert!(tail < head * 0.05, "Kick should decay, head {head} tail {tail}");
        assert_eq!(*buf.left.last().unwrap(), 0.0);
    }

    #[test]
    fn velocity_zero_is_quiet() {
        let kick = DrumPreset::for_note(35).unwrap();
        let buf = kick.render(44100.0, 0, &mut StdRng::seed_from_u64(8));
        assert!(buf.peak() < 0.01, "Zero velocity should be near silent, got {}", buf.peak());
    }
}
