//! Plucked string — Karplus-Strong delay loop with a damping lowpass.
//!
//! The excitation (a seed noise buffer, read cyclically) is shaped by the
//! pluck damping and pluck position, then recirculated through a delay of
//! `round(sample_rate / frequency)` samples. The feedback path holds a
//! one-pole smoothing lowpass, an optional dispersion all-pass, and a loop
//! gain below one, so every pass loses energy and the decay time follows
//! from frequency and damping alone.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::StereoBuffer;
use super::filter::{BiquadFilter, FilterType};
use super::noise::{self, NoiseColor};
use crate::synth::channel::{DampingCalculation, SynthOptions};

/// Gain applied on every trip around the loop.
const LOOP_GAIN: f64 = 0.996;
/// Pluck position used when the caller has no preference.
pub const DEFAULT_PLUCK_POSITION: f64 = 0.2;
/// Length of a rendered pluck.
pub const PLUCK_SECONDS: f64 = 1.0;
const FADE_OUT_SECONDS: f64 = 0.005;

/// Resonant body applied after the string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    None,
    Simple,
}

/// Loop smoothing derived from the note number.
///
/// Higher notes get values closer to one (less smoothing per pass, since they
/// pass through the filter more often); `variation` adds random spread.
pub fn auto_smoothing<R: Rng + ?Sized>(note: u8, variation: f64, rng: &mut R) -> f64 {
    let note = note.min(127) as f64;
    let sd = note / 127.0 * 0.85 + 0.15;
    let nn = (note / 64.0).sqrt();
    let jitter: f64 = rng.r#gen();
    let s = sd + nn * (1.0 - sd) * 0.5 + (1.0 - sd) * jitter * variation;
    s.clamp(0.01, 0.99)
}

/// Smoothing chosen by the channel's damping options.
pub fn channel_smoothing<R: Rng + ?Sized>(note: u8, options: &SynthOptions, rng: &mut R) -> f64 {
    match options.string_damping_calculation {
        DampingCalculation::Direct => {
            auto_smoothing(note, options.string_damping_variation, rng)
        }
        DampingCalculation::Manual => options.string_damping.clamp(0.01, 0.99),
    }
}

/// Render a plucked string into `target`.
///
/// `seed` is read as `seed[i % seed.len()]` for the first period; an empty
/// seed excites the loop with silence. `damping` is the loop smoothing
/// coefficient in (0, 1), `pluck_position` the relative excitation point.
#[allow(clippy::too_many_arguments)]
pub fn pluck<R: Rng + ?Sized>(
    target: &mut StereoBuffer,
    seed: &[f32],
    sample_rate: f64,
    frequency: f64,
    damping: f64,
    velocity_gain: f64,
    options: &SynthOptions,
    pluck_position: f64,
    rng: &mut R,
) {
    let len = target.len();
    if len == 0 {
        return;
    }
    let period = if frequency > 0.0 {
        (sample_rate / frequency).round().max(2.0) as usize
    } else {
        2
    };

    let variation = options.character_variation.clamp(0.0, 1.0);
    let jitter: f64 = rng.gen_range(-0.5..0.5);
    let smoothing = (damping.clamp(0.01, 0.99) * (1.0 + variation * jitter * 0.2)).clamp(0.01, 0.99);
    let dispersion = -0.5 * options.string_tension.clamp(0.0, 1.0);

    // Low-frequency group delay of the loop filters, taken out of the delay line.
    let mut filter_delay = (1.0 - smoothing) / smoothing;
    if dispersion != 0.0 {
        filter_delay += (1.0 - dispersion) / (1.0 + dispersion);
    }
    let loop_len = period.saturating_sub(filter_delay.round() as usize).max(2);

    let excitation = shape_excitation(seed, loop_len, options, pluck_position, rng);

    let mut string = vec![0.0f64; len];
    let mut lp = 0.0f64;
    let (mut ap_x1, mut ap_y1) = (0.0f64, 0.0f64);
    for i in 0..len {
        let input = if i < loop_len {
            excitation[i]
        } else {
            string[i - loop_len] * LOOP_GAIN
        };
        lp += smoothing * (input - lp);
        string[i] = if dispersion == 0.0 {
            lp
        } else {
            let y = dispersion * lp + ap_x1 - dispersion * ap_y1;
            ap_x1 = lp;
            ap_y1 = y;
            y
        };
    }

    let body = match options.body {
        BodyType::None => string,
        BodyType::Simple => simple_body(&string, sample_rate),
    };

    let spread = (options.stereo_spread.clamp(0.0, 1.0) * 0.0015 * sample_rate).round() as usize;
    let gain = velocity_gain;
    for i in 0..len {
        target.left[i] = (body[i] * gain) as f32;
        target.right[i] = if i >= spread {
            (body[i - spread] * gain) as f32
        } else {
            0.0
        };
    }
    target.fade_out((FADE_OUT_SECONDS * sample_rate) as usize);
}

/// Render a whole note into a fresh buffer of `seconds`, seeded with one
/// period of `color` noise.
#[allow(clippy::too_many_arguments)]
pub fn render_note<R: Rng + ?Sized>(
    sample_rate: f64,
    frequency: f64,
    damping: f64,
    velocity_gain: f64,
    seconds: f64,
    color: NoiseColor,
    options: &SynthOptions,
    rng: &mut R,
) -> StereoBuffer {
    let period = if frequency > 0.0 {
        (sample_rate / frequency).round() as usize
    } else {
        1
    };
    let seed = noise::generate(color, period, sample_rate, rng);
    let mut target = StereoBuffer::with_duration(seconds, sample_rate);
    pluck(
        &mut target,
        &seed,
        sample_rate,
        frequency,
        damping,
        velocity_gain,
        options,
        DEFAULT_PLUCK_POSITION,
        rng,
    );
    target
}

/// Seed cycled to one period, low-passed by the pluck damping and combed at
/// the pluck position.
fn shape_excitation<R: Rng + ?Sized>(
    seed: &[f32],
    period: usize,
    options: &SynthOptions,
    pluck_position: f64,
    rng: &mut R,
) -> Vec<f64> {
    const DAMP_MIN: f64 = 0.1;
    const DAMP_MAX: f64 = 0.9;
    let pd = options.pluck_damping.clamp(DAMP_MIN, DAMP_MAX);
    let pdv = options.pluck_damping_variation.clamp(0.0, 1.0);
    let lo = pd - (pd - DAMP_MIN) * pdv;
    let hi = pd + (DAMP_MAX - pd) * pdv;
    let coef = lo + rng.r#gen::<f64>() * (hi - lo);

    let mut lp = 0.0f64;
    let raw: Vec<f64> = (0..period)
        .map(|i| {
            let s = if seed.is_empty() {
                0.0
            } else {
                seed[i % seed.len()] as f64
            };
            lp += (1.0 - coef) * (s - lp);
            lp
        })
        .collect();

    let offset = (pluck_position.clamp(0.0, 1.0) * period as f64).round() as usize;
    if offset == 0 || offset >= period {
        return raw;
    }
    (0..period)
        .map(|i| {
            if i >= offset {
                raw[i] - raw[i - offset]
            } else {
                raw[i]
            }
        })
        .collect()
}

/// Two low body resonances blended with the dry string.
fn simple_body(input: &[f64], sample_rate: f64) -> Vec<f64> {
    let mut low = BiquadFilter::new(FilterType::Bandpass, sample_rate);
    low.set_frequency(110.0);
    low.set_q(3.0);
    let mut high = BiquadFilter::new(FilterType::Bandpass, sample_rate);
    high.set_frequency(220.0);
    high.set_q(3.0);
    input
        .iter()
        .map(|&x| 0.8 * x + 0.5 * low.process(x) + 0.3 * high.process(x))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::analysis::detect_pitch;
    use crate::dsp::noise::{NoiseColor, generate};
    use crate::dsp::window_energy;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dry_options() -> SynthOptions {
        SynthOptions {
            body: BodyType::None,
            stereo_spread: 0.0,
            ..SynthOptions::default()
        }
    }

    fn render(frequency: f64, damping: f64, options: &SynthOptions, seed_len: usize) -> StereoBuffer {
        let sr = 44100.0;
        let mut rng = StdRng::seed_from_u64(11);
        let seed = generate(NoiseColor::Pink, seed_len, sr, &mut rng);
        let mut buf = StereoBuffer::with_duration(PLUCK_SECONDS, sr);
        pluck(&mut buf, &seed, sr, frequency, damping, 1.0, options, DEFAULT_PLUCK_POSITION, &mut rng);
        buf
    }

    #[test]
    fn energy_decays_after_onset() {
        let opts = dry_options();
        for &(f, d) in &[(110.0, 0.3), (440.0, 0.5), (880.0, 0.9), (1760.0, 0.99)] {
            let buf = render(f, d, &opts, (44100.0 / f).round() as usize);
            let energy = window_energy(&buf.left, 4096);
            for w in energy.windows(2).skip(1) {
                assert!(
                    w[1] <= w[0] * 1.001 + 1e-15,
                    "Energy should not grow at {f}Hz d={d}: {} -> {}",
                    w[0],
                    w[1]
                );
            }
            assert!(
                energy.last().copied().unwrap_or(0.0) < energy[1],
                "Energy should decay at {f}Hz"
            );
        }
    }

    #[test]
    fn fundamental_matches_frequency() {
        let buf = render(440.0, 0.6, &dry_options(), 100);
        let mono: Vec<f64> = buf.left[2048..10240].iter().map(|&s| s as f64).collect();
        let est = detect_pitch(&mono, 44100.0, 50.0, 2000.0);
        assert!(
            (est.frequency - 441.0).abs() < 8.0,
            "Should ring near 440Hz (period 100), got {}",
            est.frequency
        );
    }

    #[test]
    fn short_and_empty_seeds_do_not_panic() {
        let opts = dry_options();
        let short = render(55.0, 0.5, &opts, 3);
        assert!(short.peak() > 0.0, "Short seed should still excite the string");

        let mut buf = StereoBuffer::new(2000);
        let mut rng = StdRng::seed_from_u64(2);
        pluck(&mut buf, &[], 44100.0, 220.0, 0.5, 1.0, &opts, 0.2, &mut rng);
        assert_eq!(buf.peak(), 0.0, "Empty seed should stay silent");
    }

    #[test]
    fn velocity_scales_output() {
        let opts = dry_options();
        let sr = 44100.0;
        let seed = generate(NoiseColor::White, 100, sr, &mut StdRng::seed_from_u64(5));
        let mut loud = StereoBuffer::new(4410);
        let mut soft = StereoBuffer::new(4410);
        pluck(&mut loud, &seed, sr, 440.0, 0.5, 1.0, &opts, 0.2, &mut StdRng::seed_from_u64(1));
        pluck(&mut soft, &seed, sr, 440.0, 0.5, 0.25, &opts, 0.2, &mut StdRng::seed_from_u64(1));
        let ratio = soft.peak() / loud.peak();
        assert!((ratio - 0.25).abs() < 1e-3, "Velocity gain should scale linearly, got {ratio}");
    }

    #[test]
    fn stereo_spread_delays_right() {
        let opts = SynthOptions {
            body: BodyType::None,
            stereo_spread: 1.0,
            ..SynthOptions::default()
        };
        let buf = render(440.0, 0.5, &opts, 100);
        let spread = (0.0015f64 * 44100.0).round() as usize;
        assert!(buf.right[..spread].iter().all(|&s| s == 0.0));
        assert_eq!(buf.right[spread + 10], buf.left[10]);
    }

    #[test]
    fn render_note_sizes_buffer() {
        let mut rng = StdRng::seed_from_u64(4);
        let buf = render_note(8000.0, 200.0, 0.5, 0.8, 0.5, NoiseColor::Pink, &dry_options(), &mut rng);
        assert_eq!(buf.len(), 4000, "Should render half a second, got {}", buf.len());
        assert!(buf.peak() > 0.0);
    }

    #[test]
    fn auto_smoothing_rises_with_note() {
        let mut rng = StdRng::seed_from_u64(0);
        let low = auto_smoothing(30, 0.0, &mut rng);
        let high = auto_smoothing(100, 0.0, &mut rng);
        assert!(high > low, "Higher notes should get larger smoothing, {low} vs {high}");
        for note in 0..=127u8 {
            let s = auto_smoothing(note, 1.0, &mut rng);
            assert!(s > 0.0 && s < 1.0, "Smoothing out of (0,1): {s}");
        }
    }

    #[test]
    fn manual_smoothing_is_clamped() {
        let mut rng = StdRng::seed_from_u64(0);
        let opts = SynthOptions {
            string_damping: 1.5,
            string_damping_calculation: DampingCalculation::Manual,
            ..SynthOptions::default()
        };
        assert_eq!(channel_smoothing(60, &opts, &mut rng), 0.99);
    }
}
