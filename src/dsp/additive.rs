//! Additive-harmonic voice — nine decaying harmonics, each a chorus of three
//! sines, through a per-note bandpass and a 300 Hz highpass.

use rand::Rng;

use super::filter::{BiquadFilter, FilterType};
use super::oscillator::{Oscillator, Waveform};

pub const HARMONICS: usize = 9;
const ATTACK_SECONDS: f64 = 0.02;
const BASE_DECAY: f64 = 14.5;
/// Level treated as silent at the end of a decay.
const FLOOR: f64 = 1e-6;
/// Chorus spread of the three oscillators per harmonic, in cents.
const SPREAD_CENTS: f64 = 0.25;
const HIGHPASS_HZ: f64 = 300.0;

/// Relative harmonic levels, eight per register row (rows step every 12 notes
/// from note 16).
#[rustfmt::skip]
const HARMONIC_RATIO: [f64; 64] = [
    1.0246079839113384, 1.1582997098203605, 1.1388447671472606, 1.1719544344534898, 1.2164137280584002, 1.0685639213044205, 0.9537010802260389, 0.9815681183973349,
    1.143244941182331, 1.1561880403503995, 1.1476663400547313, 1.1488029936757953, 1.086872695255089, 1.0984287975472282, 0.966653131230532, 1.0410188843390245,
    1.0037683465770395, 1.007146205285253, 0.9409009523639191, 0.9947457664048427, 0.9617784723323823, 0.9045326670684404, 0.8582613131924376, 0.8960555096076478,
    0.972055638107516, 0.9406779746094587, 0.9123789973452026, 0.7965213763826684, 0.8156965567579568, 0.8139021629575786, 0.7697647600840131, 0.7556845067402741,
    0.882455242070097, 0.8458030984856008, 0.8131982403201687, 0.7372657252860997, 0.7216073464462383, 0.6651998103877568, 0.6578420005135593, 0.6575283835590198,
    0.8977268467056416, 0.7558446396734972, 0.7342616083010517, 0.7010909092023433, 0.6643503248668519, 0.6370964804339656, 0.6227372142121878, 0.5929093698600671,
    0.8889964200480135, 0.7591102317460732, 0.6326798492952872, 0.656574107019366, 0.6901026344225969, 0.6834339185789894, 0.6229595254229808, 0.5995726627791448,
    0.7771693877901827, 0.6678207346454161, 0.44054758723425014, 0.5715067781055962, 0.0, 0.0, 0.0, 0.0,
];

fn harmonic_ratio(note: u8, harmonic: usize) -> f64 {
    let row = ((note as i32 - 16) / 12).clamp(0, 7) as usize;
    let idx = (row * 8 + harmonic - 1).min(HARMONIC_RATIO.len() - 1);
    HARMONIC_RATIO[idx]
}

/// Decay time and velocity adjustment for harmonic `h` (1-based) of `note`.
fn harmonic_shape(note: u8, h: usize) -> (f64, f64) {
    let n = note as f64;
    let k = (h - 1) as f64;
    let (decay, adj) = if h == 1 {
        (BASE_DECAY - (n - 20.0) / 8.0, 1.0 + (64.0 - n) * -0.75 / 64.0)
    } else {
        (
            BASE_DECAY - (n - 14.0 + k * 6.0) / 12.0,
            1.0 + (58.0 - n - k * 6.0) * -0.75 / 64.0,
        )
    };
    (decay.max(0.05), adj.max(0.0))
}

#[derive(Debug, Clone)]
struct Partial {
    oscs: [Oscillator; 3],
    peak: f64,
    /// Natural-log slope per sample after the attack.
    decay_slope: f64,
}

#[derive(Debug, Clone)]
struct Release {
    elapsed: usize,
    /// Exponential time constant in samples.
    tau: f64,
    /// Release length in samples; gain reaches zero here.
    length: usize,
}

/// One sounding additive note.
#[derive(Debug, Clone)]
pub struct AdditiveVoice {
    partials: Vec<Partial>,
    bandpass: BiquadFilter,
    highpass: BiquadFilter,
    elapsed: usize,
    attack_samples: usize,
    decay_samples: usize,
    release: Option<Release>,
    sample_rate: f64,
}

impl AdditiveVoice {
    pub fn new<R: Rng + ?Sized>(
        sample_rate: f64,
        note: u8,
        frequency: f64,
        velocity: u8,
        rng: &mut R,
    ) -> Self {
        let inharmonic = rng.r#gen::<f64>() / 200.0;
        let vel = velocity.min(127) as f64 / 127.0;
        let attack_samples = (ATTACK_SECONDS * sample_rate) as usize;
        let mut longest = 0.0f64;
        let partials = (1..=HARMONICS)
            .map(|h| {
                let mut f = frequency * h as f64;
                let mut level = vel;
                if h > 1 {
                    level *= harmonic_ratio(note, h);
                    f += f * inharmonic;
                }
                let (decay, adj) = harmonic_shape(note, h);
                longest = longest.max(decay);
                let peak = level * adj;
                let decay_slope = if peak > FLOOR {
                    (FLOOR / peak).ln() / (decay * sample_rate)
                } else {
                    0.0
                };
                let spread = 2.0_f64.powf(SPREAD_CENTS / 1200.0);
                Partial {
                    oscs: [
                        Oscillator::with_frequency(Waveform::Sine, sample_rate, f),
                        Oscillator::with_frequency(Waveform::Sine, sample_rate, f * spread),
                        Oscillator::with_frequency(Waveform::Sine, sample_rate, f / spread),
                    ],
                    peak,
                    decay_slope,
                }
            })
            .collect();

        AdditiveVoice {
            partials,
            bandpass: BiquadFilter::with_params(
                FilterType::Bandpass,
                sample_rate,
                frequency,
                1.0 / 3.0_f64.sqrt(),
            ),
            highpass: BiquadFilter::with_params(FilterType::Highpass, sample_rate, HIGHPASS_HZ, 0.5),
            elapsed: 0,
            attack_samples,
            decay_samples: (longest * sample_rate) as usize,
            release: None,
            sample_rate,
        }
    }

    /// Seconds until the natural decay reaches silence.
    pub fn natural_length(&self) -> f64 {
        (self.attack_samples + self.decay_samples) as f64 / self.sample_rate
    }

    /// Live pitch offset for every oscillator.
    pub fn set_detune(&mut self, cents: f64) {
        for p in &mut self.partials {
            for o in &mut p.oscs {
                o.detune = cents;
            }
        }
    }

    /// Begin an exponential release with time constant `seconds`, ending
    /// after `seconds * ratio`. A release already running is kept unless the
    /// new one ends sooner.
    pub fn release(&mut self, seconds: f64, ratio: f64) {
        let tau = (seconds.max(0.001) * self.sample_rate).max(1.0);
        let length = ((tau * ratio.max(1.0)) as usize).max(1);
        match &self.release {
            Some(r) if r.length - r.elapsed.min(r.length) <= length => {}
            _ => self.release = Some(Release { elapsed: 0, tau, length }),
        }
    }

    pub fn is_releasing(&self) -> bool {
        self.release.is_some()
    }

    pub fn is_finished(&self) -> bool {
        match &self.release {
            Some(r) => r.elapsed >= r.length,
            None => self.elapsed >= self.attack_samples + self.decay_samples,
        }
    }

    pub fn next_sample(&mut self) -> f64 {
        if self.is_finished() {
            return 0.0;
        }
        let n = self.elapsed;
        let mut sum = 0.0;
        for p in &mut self.partials {
            let gain = if n < self.attack_samples {
                p.peak * n as f64 / self.attack_samples as f64
            } else {
                p.peak * (p.decay_slope * (n - self.attack_samples) as f64).exp()
            };
            let s: f64 = p.oscs.iter_mut().map(|o| o.next_sample()).sum();
            sum += s * gain;
        }
        if let Some(r) = &mut self.release {
            let t = r.elapsed as f64;
            sum *= (-t / r.tau).exp() * (1.0 - t / r.length as f64);
            r.elapsed += 1;
        }
        self.elapsed += 1;
        // Three oscillators per partial; keep the sum near unit scale.
        self.highpass.process(self.bandpass.process(sum / 3.0))
    }
}
