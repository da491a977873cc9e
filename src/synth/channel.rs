//! Per-channel controller state and string synthesis options.

use serde::{Deserialize, Serialize};

use crate::dsp::bowed::BowedParams;
use crate::dsp::pluck::BodyType;

/// Number of MIDI channels.
pub const CHANNELS: usize = 16;
/// Channel reserved for percussion.
pub const DRUM_CHANNEL: u8 = 9;
/// Program selecting additive-harmonic synthesis.
pub const PROGRAM_ADDITIVE: i32 = -1;
/// Program selecting the bowed-string waveguide.
pub const PROGRAM_BOWED: i32 = 480;

/// How the plucked string's loop smoothing is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DampingCalculation {
    /// Derived from note number and damping variation.
    Direct,
    /// Taken from `stringDamping`.
    Manual,
}

/// String synthesis options, editable per channel by the GUI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SynthOptions {
    pub string_tension: f64,
    pub character_variation: f64,
    pub string_damping: f64,
    pub string_damping_variation: f64,
    pub string_damping_calculation: DampingCalculation,
    pub pluck_damping: f64,
    pub pluck_damping_variation: f64,
    pub body: BodyType,
    pub stereo_spread: f64,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            string_tension: 0.0,
            character_variation: 0.2,
            string_damping: 0.5,
            string_damping_variation: 0.1,
            string_damping_calculation: DampingCalculation::Direct,
            pluck_damping: 0.5,
            pluck_damping_variation: 0.1,
            body: BodyType::Simple,
            stereo_spread: 0.2,
        }
    }
}

/// Mutable state of one MIDI channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    /// [0, 1], squared controller curve.
    pub volume: f64,
    /// [0, 1], squared controller curve.
    pub expression: f64,
    /// [-1, 1].
    pub pan: f64,
    pub bend_cents: f64,
    /// Vibrato depth in cents, [0, 100].
    pub modulation_depth: f64,
    pub program: i32,
    pub pedal: u8,
    /// Release control in [0, 1] (CC72).
    pub release_control: f64,
    pub options: SynthOptions,
    pub bowed: BowedParams,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            volume: controller_curve(100),
            expression: 1.0,
            pan: 0.0,
            bend_cents: 0.0,
            modulation_depth: 0.0,
            program: 0,
            pedal: 0,
            release_control: 1.0,
            options: SynthOptions::default(),
            bowed: BowedParams::default(),
        }
    }
}

/// `v² / 127²`
#[inline]
pub fn controller_curve(v: u8) -> f64 {
    let v = v.min(127) as f64;
    v * v / (127.0 * 127.0)
}

impl ChannelState {
    /// Sustain pedal is down.
    pub fn sustain_active(&self) -> bool {
        self.pedal >= 64
    }

    /// Linear gain applied to everything the channel produces.
    pub fn gain(&self) -> f64 {
        3.0 * self.volume * self.expression
    }

    /// Left/right gains for the channel pan.
    pub fn pan_gains(&self) -> (f64, f64) {
        pan_gains(self.pan)
    }

    pub fn set_volume(&mut self, v: u8) {
        self.volume = controller_curve(v);
    }

    pub fn set_expression(&mut self, v: u8) {
        self.expression = controller_curve(v);
    }

    pub fn set_pan(&mut self, v: u8) {
        self.pan = ((v.min(127) as f64 - 64.0) / 64.0).clamp(-1.0, 1.0);
    }

    pub fn set_modulation(&mut self, v: u8) {
        self.modulation_depth = v.min(127) as f64 * 100.0 / 127.0;
    }

    /// Apply a 14-bit bend value with a range in semitones.
    pub fn set_bend(&mut self, value: u16, range_semitones: f64) {
        self.bend_cents = (value.min(16383) as f64 - 8192.0) / 8192.0 * range_semitones * 100.0;
    }

    /// Controller reset: bend, expression, pedal, program, modulation.
    pub fn reset_controllers(&mut self) {
        self.bend_cents = 0.0;
        self.expression = 1.0;
        self.pedal = 0;
        self.program = 0;
        self.modulation_depth = 0.0;
    }
}

/// Equal-sum pan law: the far side is attenuated, the near side stays at unity.
pub fn pan_gains(pan: f64) -> (f64, f64) {
    let pan = pan.clamp(-1.0, 1.0);
    (1.0 - pan.max(0.0), 1.0 + pan.min(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_volume_is_cc100() {
        let ch = ChannelState::default();
        let expected = 100.0 * 100.0 / (127.0 * 127.0);
        assert!((ch.volume - expected).abs() < 1e-12);
        assert!((ch.gain() - 3.0 * expected).abs() < 1e-12);
    }

    #[test]
    fn pan_extremes() {
        let mut ch = ChannelState::default();
        ch.set_pan(0);
        assert_eq!(ch.pan, -1.0);
        assert_eq!(ch.pan_gains(), (1.0, 0.0));
        ch.set_pan(64);
        assert_eq!(ch.pan_gains(), (1.0, 1.0));
        ch.set_pan(127);
        let (l, r) = ch.pan_gains();
        assert!(l < 0.02 && r == 1.0, "Hard right should mute left, got {l}");
    }

    #[test]
    fn bend_range() {
        let mut ch = ChannelState::default();
        ch.set_bend(8192, 2.0);
        assert_eq!(ch.bend_cents, 0.0);
        ch.set_bend(0, 2.0);
        assert_eq!(ch.bend_cents, -200.0);
        ch.set_bend(16383, 2.0);
        assert!((ch.bend_cents - 200.0).abs() < 0.1, "Full up should be ~+200, got {}", ch.bend_cents);
    }

    #[test]
    fn reset_controllers_keeps_volume() {
        let mut ch = ChannelState::default();
        ch.set_volume(20);
        ch.pedal = 127;
        ch.program = 25;
        ch.bend_cents = 50.0;
        ch.set_expression(10);
        ch.reset_controllers();
        assert_eq!(ch.pedal, 0);
        assert_eq!(ch.program, 0);
        assert_eq!(ch.bend_cents, 0.0);
        assert_eq!(ch.expression, 1.0);
        assert!((ch.volume - controller_curve(20)).abs() < 1e-12);
    }

    #[test]
    fn options_from_gui_json() {
        let opts: SynthOptions =
            serde_json::from_str(r#"{"stringDamping": 0.7, "body": "none", "stringDampingCalculation": "manual"}"#)
                .unwrap();
        assert_eq!(opts.string_damping, 0.7);
        assert_eq!(opts.body, BodyType::None);
        assert_eq!(opts.string_damping_calculation, DampingCalculation::Manual);
        assert_eq!(opts.stereo_spread, 0.2);
    }
}
