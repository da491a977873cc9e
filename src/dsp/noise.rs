//! Seed noise generator — colored noise buffers for string excitation.
//!
//! Every color is a fixed filter topology over uniform white noise drawn from
//! the caller's RNG, so a seeded RNG gives a reproducible buffer.

use std::f64::consts::PI;

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::filter::{BiquadFilter, FilterType};

/// Named noise colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoiseColor {
    White,
    Pink,
    SoftPink,
    Brown,
    SoftBrown,
    Red,
    Blue,
    Violet,
    Grey,
    Wind,
    Perlin,
    Formant,
    Dust,
    Wood,
}

impl NoiseColor {
    pub const ALL: [NoiseColor; 14] = [
        NoiseColor::Brown,
        NoiseColor::SoftBrown,
        NoiseColor::Red,
        NoiseColor::Pink,
        NoiseColor::SoftPink,
        NoiseColor::White,
        NoiseColor::Blue,
        NoiseColor::Violet,
        NoiseColor::Wind,
        NoiseColor::Perlin,
        NoiseColor::Formant,
        NoiseColor::Dust,
        NoiseColor::Wood,
        NoiseColor::Grey,
    ];

    /// Look up a color by its document name. Unknown names fall back to white.
    pub fn from_name(name: &str) -> Self {
        match name {
            "white" => NoiseColor::White,
            "pink" | "synthPink" => NoiseColor::Pink,
            "softPink" => NoiseColor::SoftPink,
            "brown" => NoiseColor::Brown,
            "softBrown" => NoiseColor::SoftBrown,
            "red" => NoiseColor::Red,
            "blue" => NoiseColor::Blue,
            "violet" => NoiseColor::Violet,
            "grey" | "gray" => NoiseColor::Grey,
            "wind" => NoiseColor::Wind,
            "perlin" => NoiseColor::Perlin,
            "formant" => NoiseColor::Formant,
            "dust" => NoiseColor::Dust,
            "wood" => NoiseColor::Wood,
            other => {
                warn!("unknown noise color {other:?}, using white");
                NoiseColor::White
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NoiseColor::White => "white",
            NoiseColor::Pink => "pink",
            NoiseColor::SoftPink => "softPink",
            NoiseColor::Brown => "brown",
            NoiseColor::SoftBrown => "softBrown",
            NoiseColor::Red => "red",
            NoiseColor::Blue => "blue",
            NoiseColor::Violet => "violet",
            NoiseColor::Grey => "grey",
            NoiseColor::Wind => "wind",
            NoiseColor::Perlin => "perlin",
            NoiseColor::Formant => "formant",
            NoiseColor::Dust => "dust",
            NoiseColor::Wood => "wood",
        }
    }
}

/// Generate `len` samples of `color` noise (at least one sample).
///
/// Falls back to white noise if the colored generator yields non-finite values.
pub fn generate<R: Rng + ?Sized>(
    color: NoiseColor,
    len: usize,
    sample_rate: f64,
    rng: &mut R,
) -> Vec<f32> {
    let len = len.max(1);
    let out = match color {
        NoiseColor::White => white(len, rng),
        NoiseColor::Pink => pink(len, rng),
        NoiseColor::SoftPink => one_pole(&pink(len, rng), 0.5, 1.6),
        NoiseColor::Brown => brown(len, rng),
        NoiseColor::SoftBrown => one_pole(&brown(len, rng), 0.3, 1.0),
        NoiseColor::Red => red(len, rng),
        NoiseColor::Blue => difference(&pink(len, rng), 2.0),
        NoiseColor::Violet => difference(&white(len, rng), 0.5),
        NoiseColor::Grey => grey(len, rng),
        NoiseColor::Wind => wind(len, sample_rate, rng),
        NoiseColor::Perlin => perlin(len, sample_rate, rng),
        NoiseColor::Formant => formant(len, sample_rate, rng),
        NoiseColor::Dust => dust(len, sample_rate, rng),
        NoiseColor::Wood => wood(len, sample_rate, rng),
    };
    if out.iter().all(|s| s.is_finite()) {
        out
    } else {
        warn!("{} noise produced non-finite samples, using white", color.name());
        white(len, rng)
    }
}

/// Generate by document name; unknown names produce white noise.
pub fn generate_named<R: Rng + ?Sized>(
    name: &str,
    len: usize,
    sample_rate: f64,
    rng: &mut R,
) -> Vec<f32> {
    generate(NoiseColor::from_name(name), len, sample_rate, rng)
}

#[inline]
fn uniform<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(-1.0..1.0)
}

fn white<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<f32> {
    (0..len).map(|_| uniform(rng) as f32).collect()
}

/// Paul Kellet's refined pink filter.
fn pink<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<f32> {
    let (mut b0, mut b1, mut b2, mut b3, mut b4, mut b5, mut b6) =
        (0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    (0..len)
        .map(|_| {
            let w = uniform(rng);
            b0 = 0.99886 * b0 + w * 0.0555179;
            b1 = 0.99332 * b1 + w * 0.0750759;
            b2 = 0.96900 * b2 + w * 0.1538520;
            b3 = 0.86650 * b3 + w * 0.3104856;
            b4 = 0.55000 * b4 + w * 0.5329522;
            b5 = -0.7616 * b5 - w * 0.0168980;
            let p = b0 + b1 + b2 + b3 + b4 + b5 + b6 + w * 0.5362;
            b6 = w * 0.115926;
            (p * 0.11) as f32
        })
        .collect()
}

/// Leaky random walk.
fn brown<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<f32> {
    let mut last = 0.0;
    (0..len)
        .map(|_| {
            last = (last + 0.02 * uniform(rng)) / 1.02;
            (last * 3.5) as f32
        })
        .collect()
}

/// Two cascaded leaky integrators, steeper than brown.
fn red<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<f32> {
    let (mut s1, mut s2) = (0.0, 0.0);
    (0..len)
        .map(|_| {
            s1 = 0.98 * s1 + 0.05 * uniform(rng);
            s2 = 0.98 * s2 + 0.2 * s1;
            (s2 * 2.0).clamp(-1.0, 1.0) as f32
        })
        .collect()
}

fn grey<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<f32> {
    let (mut x1, mut x2) = (0.0, 0.0);
    (0..len)
        .map(|_| {
            let x0 = uniform(rng);
            let y = 0.169 * x0 - 0.5 * x1 + 0.33 * x2;
            x2 = x1;
            x1 = x0;
            (y * 1.9997) as f32
        })
        .collect()
}

fn wind<R: Rng + ?Sized>(len: usize, sample_rate: f64, rng: &mut R) -> Vec<f32> {
    let phase = rng.gen_range(0.0..2.0 * PI);
    let mut lp = 0.0;
    (0..len)
        .map(|i| {
            let t = i as f64 / sample_rate;
            let gust = 0.65 + 0.35 * (2.0 * PI * 0.7 * t + phase).sin();
            lp += 0.08 * (uniform(rng) - lp);
            (lp * gust * 3.0) as f32
        })
        .collect()
}

/// Value noise with smoothstep interpolation, three octaves.
fn perlin<R: Rng + ?Sized>(len: usize, sample_rate: f64, rng: &mut R) -> Vec<f32> {
    let base_step = (sample_rate / 2000.0).max(2.0);
    let mut out = vec![0.0f64; len];
    let mut amp = 0.6;
    for octave in 0..3 {
        let step = base_step / (1 << octave) as f64;
        let points = (len as f64 / step).ceil() as usize + 2;
        let lattice: Vec<f64> = (0..points).map(|_| uniform(rng)).collect();
        for (i, o) in out.iter_mut().enumerate() {
            let x = i as f64 / step;
            let k = x.floor() as usize;
            let t = x - k as f64;
            let s = t * t * (3.0 - 2.0 * t);
            *o += amp * (lattice[k] + (lattice[k + 1] - lattice[k]) * s);
        }
        amp *= 0.5;
    }
    out.into_iter().map(|s| s as f32).collect()
}

/// White noise amplitude-modulated by three vowel formants.
fn formant<R: Rng + ?Sized>(len: usize, sample_rate: f64, rng: &mut R) -> Vec<f32> {
    const FORMANTS: [f64; 3] = [700.0, 1220.0, 2600.0];
    (0..len)
        .map(|i| {
            let t = i as f64 / sample_rate;
            let m: f64 = FORMANTS.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f64>() / 3.0;
            (uniform(rng) * m) as f32
        })
        .collect()
}

/// Sparse decaying impulses.
fn dust<R: Rng + ?Sized>(len: usize, sample_rate: f64, rng: &mut R) -> Vec<f32> {
    let density = 0.02;
    let decay = (-1.0 / (sample_rate * 0.0008)).exp();
    let mut level = uniform(rng);
    (0..len)
        .map(|_| {
            if rng.gen_bool(density) {
                level = uniform(rng);
            }
            let s = level;
            level *= decay;
            s as f32
        })
        .collect()
}

/// Noise through a narrow resonance with a knock-like decay.
fn wood<R: Rng + ?Sized>(len: usize, sample_rate: f64, rng: &mut R) -> Vec<f32> {
    let mut bp = BiquadFilter::new(FilterType::Bandpass, sample_rate);
    bp.set_frequency(900.0);
    bp.set_q(8.0);
    let decay = (-1.0 / (sample_rate * 0.01)).exp();
    let mut env = 1.0;
    let raw: Vec<f64> = (0..len)
        .map(|_| {
            let s = bp.process(uniform(rng)) * env;
            env = env * decay + 0.002;
            s
        })
        .collect();
    normalize_peak(&raw, 0.9)
}

fn one_pole(input: &[f32], coef: f32, gain: f32) -> Vec<f32> {
    let mut lp = 0.0f32;
    input
        .iter()
        .map(|&x| {
            lp += coef * (x - lp);
            lp * gain
        })
        .collect()
}

fn difference(input: &[f32], gain: f32) -> Vec<f32> {
    let mut prev = 0.0f32;
    input
        .iter()
        .map(|&x| {
            let d = (x - prev) * gain;
            prev = x;
            d
        })
        .collect()
}

fn normalize_peak(input: &[f64], target: f64) -> Vec<f32> {
    let peak = input.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    let scale = if peak > 1e-12 { target / peak } else { 1.0 };
    input.iter().map(|&s| (s * scale) as f32).collect()
}
