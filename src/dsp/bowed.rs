//! Bowed string — two-segment digital waveguide with stick-slip friction.
//!
//! The string is split at the bow point into a nut segment and a bridge
//! segment. Each sample, the waves arriving at both ends are reflected
//! (negated, scaled by `r_nut` / `r_bridge`) back toward the bow, where the
//! bow velocity is compared with the string velocity and a `tanh` friction
//! force is injected with opposite signs into the two segments. The output
//! is tapped mostly at the bridge end, DC-blocked, and summed over a small
//! detuned ensemble.

use std::f64::consts::PI;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::StereoBuffer;

/// Length of a bowed note rendered at note-on.
pub const BOWED_SECONDS: f64 = 2.0;
/// Envelope floor that keeps the friction loop from locking into silence.
const SUSTAIN_FLOOR: f64 = 0.55;
const FADE_IN_SECONDS: f64 = 0.004;
const FADE_OUT_SECONDS: f64 = 0.01;
const BOW_LFO_HZ: f64 = 3.0;
const BOW_LFO_DEPTH: f64 = 0.015;
const JITTER: f64 = 5e-5;

/// Bowed-string parameters, adjustable per channel by controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BowedParams {
    pub voices: usize,
    pub detune_cents: Vec<f64>,
    pub pans: Vec<f64>,
    /// Attack time in seconds.
    pub attack: f64,
    pub sustain: f64,
    /// Release time in seconds.
    pub release: f64,
    /// Bow point as a fraction of the string, (0, 1).
    pub bow_position: f64,
    pub bow_velocity: f64,
    /// Bow pressure.
    pub bow_gain: f64,
    /// Friction nonlinearity.
    pub friction: f64,
    pub loss_lp: f64,
    pub leak: f64,
    pub r_nut: f64,
    pub r_bridge: f64,
    pub dc_block_hz: f64,
    pub vibrato_hz: f64,
    pub vibrato_depth_cents: f64,
    pub velocity_gain: f64,
    pub post_gain: f64,
    pub bow_attack: f64,
    /// Random bow jitter and initial string noise. Disable for bit-exact renders.
    pub jitter: bool,
}

impl Default for BowedParams {
    fn default() -> Self {
        Self {
            voices: 4,
            detune_cents: vec![-6.0, -3.0, 3.0, 6.0],
            pans: vec![-0.6, -0.2, 0.2, 0.6],
            attack: 0.10,
            sustain: 0.80,
            release: 2.0,
            bow_position: 0.15,
            bow_velocity: 0.22,
            bow_gain: 0.34,
            friction: 2.1,
            loss_lp: 0.10,
            leak: 0.999,
            r_nut: 0.995,
            r_bridge: 0.985,
            dc_block_hz: 18.0,
            vibrato_hz: 5.6,
            vibrato_depth_cents: 8.0,
            velocity_gain: 1.0,
            post_gain: 1.0,
            bow_attack: 0.05,
            jitter: true,
        }
    }
}

impl BowedParams {
    /// Apply a controller that shapes bowed notes. Returns false if `cc` has
    /// no bowed meaning.
    pub fn apply_controller(&mut self, cc: u8, value: u8) -> bool {
        let v = value.min(127) as f64 / 127.0;
        match cc {
            1 => self.vibrato_depth_cents = 8.0 + v * 28.0,
            11 => self.velocity_gain = 0.4 + v * 0.8,
            72 => self.release = 0.8 + v * 3.0,
            73 => self.attack = 0.02 + v * 0.12,
            _ => return false,
        }
        true
    }
}

/// Renderer for bowed notes at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct BowedStringModel {
    pub params: BowedParams,
    sample_rate: f64,
}

impl BowedStringModel {
    pub fn new(sample_rate: f64) -> Self {
        Self::with_params(sample_rate, BowedParams::default())
    }

    pub fn with_params(sample_rate: f64, params: BowedParams) -> Self {
        BowedStringModel { params, sample_rate }
    }

    /// Render `duration` seconds of a bowed note at `frequency` with MIDI
    /// `velocity` (0–127).
    pub fn render<R: Rng + ?Sized>(
        &self,
        frequency: f64,
        duration: f64,
        velocity: u8,
        rng: &mut R,
    ) -> StereoBuffer {
        let mut out = StereoBuffer::with_duration(duration, self.sample_rate);
        if out.is_empty() {
            return out;
        }
        let p = &self.params;
        let voices = p.voices.max(1);
        for v in 0..voices {
            let cents = p.detune_cents.get(v % p.detune_cents.len().max(1)).copied().unwrap_or(0.0);
            let pan = p.pans.get(v % p.pans.len().max(1)).copied().unwrap_or(0.0);
            let f = frequency * 2.0_f64.powf(cents / 1200.0);
            self.render_voice(&mut out, f, pan, velocity, rng);
        }
        out.fade_out((FADE_OUT_SECONDS * self.sample_rate) as usize);
        if p.post_gain != 1.0 {
            let g = p.post_gain as f32;
            out.left.iter_mut().chain(out.right.iter_mut()).for_each(|s| *s *= g);
        }
        out
    }

    fn render_voice<R: Rng + ?Sized>(
        &self,
        out: &mut StereoBuffer,
        frequency: f64,
        pan: f64,
        velocity: u8,
        rng: &mut R,
    ) {
        let p = &self.params;
        let sr = self.sample_rate;
        let n_total = out.len();

        let total = ((sr / frequency.max(1.0)).round() as usize).max(32);
        let bow_idx = ((total as f64 * p.bow_position).round() as usize).clamp(2, total - 3);
        // The loss lowpass delays each segment; take that out of the line length.
        let loss = p.loss_lp.clamp(1e-3, 1.0);
        let lp_delay = ((1.0 - loss) / loss).round() as usize;
        let mut nut = vec![0.0f64; (bow_idx + 2).saturating_sub(lp_delay).max(2)];
        let mut bridge = vec![0.0f64; (total - bow_idx + 2).saturating_sub(lp_delay).max(2)];
        if p.jitter {
            nut.iter_mut().for_each(|s| *s = rng.gen_range(-1.0..1.0) * 1e-6);
            bridge.iter_mut().for_each(|s| *s = rng.gen_range(-1.0..1.0) * 1e-6);
        }
        nut[0] += 2e-5;
        bridge[0] += 2e-5;
        let (mut w_nut, mut w_bridge) = (0usize, 0usize);
        let (mut lp_nut, mut lp_bridge) = (0.0f64, 0.0f64);

        let dc_r = (1.0 - 2.0 * PI * p.dc_block_hz / sr).clamp(0.0, 0.9999);
        let (mut dc_x, mut dc_y) = (0.0f64, 0.0f64);

        let attack_n = (p.attack * sr) as usize;
        let release_n = ((p.release * sr) as usize).min(n_total);
        let bow_attack_n = ((p.bow_attack * sr) as usize).max(1);
        let fade_n = ((FADE_IN_SECONDS * sr) as usize).max(1);
        let vel_gain = (velocity as f64 / 127.0).clamp(0.1, 1.0) * p.velocity_gain;
        let (gl, gr) = (1.0 - pan.max(0.0), 1.0 + pan.min(0.0));

        for n in 0..n_total {
            let env = if n < attack_n {
                n as f64 / attack_n as f64
            } else if n < n_total - release_n {
                p.sustain
            } else {
                p.sustain * (1.0 - (n - (n_total - release_n)) as f64 / release_n as f64)
            };
            let bow_ramp = if n < bow_attack_n {
                n as f64 / bow_attack_n as f64
            } else {
                1.0
            };
            let g = p.bow_gain * env.max(SUSTAIN_FLOOR) * vel_gain * bow_ramp;

            // Waves arriving at the nut and the bridge, reflected back toward the bow.
            let at_nut = nut[w_nut];
            let at_bridge = bridge[w_bridge];
            let from_nut = -p.r_nut * at_nut;
            let from_bridge = -p.r_bridge * at_bridge;

            let v_string = 0.5 * (from_nut + from_bridge);
            let lfo = BOW_LFO_DEPTH * (2.0 * PI * BOW_LFO_HZ * n as f64 / sr).sin();
            let jitter = if p.jitter {
                rng.gen_range(-1.0..1.0) * JITTER
            } else {
                0.0
            };
            let force = (p.friction * ((p.bow_velocity * bow_ramp + lfo) - v_string + jitter)).tanh();

            lp_nut += loss * ((from_bridge + g * force) - lp_nut);
            lp_bridge += loss * ((from_nut - g * force) - lp_bridge);
            nut[w_nut] = p.leak * lp_nut;
            bridge[w_bridge] = p.leak * lp_bridge;
            w_nut = (w_nut + 1) % nut.len();
            w_bridge = (w_bridge + 1) % bridge.len();

            let tap = 0.85 * at_bridge + 0.15 * at_nut;
            let y = tap - dc_x + dc_r * dc_y;
            dc_x = tap;
            dc_y = y;

            let fade = if n < fade_n { n as f64 / fade_n as f64 } else { 1.0 };
            out.left[n] += (y * gl * fade) as f32;
            out.right[n] += (y * gr * fade) as f32;
        }
    }
}
