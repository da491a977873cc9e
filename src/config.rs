//! Engine configuration — tuning, voice limits, and master-bus settings.
//!
//! Every field has a default so a partial JSON document is a valid config.

use serde::{Deserialize, Serialize};

use crate::error::SynthError;

/// Configuration for the master-bus compressor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Threshold in dB.
    pub threshold: f64,
    /// Knee width in dB.
    pub knee: f64,
    /// Compression ratio.
    pub ratio: f64,
    /// Attack time in seconds.
    pub attack: f64,
    /// Release time in seconds.
    pub release: f64,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold: -18.0,
            knee: 10.0,
            ratio: 3.0,
            attack: 0.003,
            release: 0.2,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub sample_rate: f64,
    /// Frequency of A4 (MIDI 69) in Hz.
    pub a4: f64,
    pub master_volume: f64,
    /// Hard polyphony cap across all channels.
    pub max_voices: usize,
    pub release_ratio: f64,
    /// Samples per render block.
    pub block_size: usize,
    /// Interval of the background voice sweep.
    pub sweep_interval_ms: f64,
    /// Pitch-bend range in semitones (full deflection).
    pub pitch_bend_range: f64,
    pub compressor: CompressorConfig,
    /// Drive into the tanh limiter after the compressor.
    pub limiter_drive: f64,
    /// Shortest release reachable through the release control.
    pub min_release: f64,
    /// Longest release reachable through the release control.
    pub max_release: f64,
    /// Longest offline render; events timed later are dropped.
    pub max_render_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            a4: 440.0,
            master_volume: 0.3,
            max_voices: 64,
            release_ratio: 3.5,
            block_size: 128,
            sweep_interval_ms: 60.0,
            pitch_bend_range: 2.0,
            compressor: CompressorConfig::default(),
            limiter_drive: 1.2,
            min_release: 0.05,
            max_release: 2.0,
            max_render_seconds: 600.0,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON config document.
    pub fn from_json(json: &str) -> Result<Self, SynthError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Convert a MIDI note number to frequency under this tuning.
    pub fn note_frequency(&self, note: u8) -> f64 {
        midi_to_frequency(note as i32, self.a4)
    }
}

/// Convert a MIDI note number to frequency using the given tuning pitch.
///
/// `tuning_pitch` is the frequency of A4 (MIDI 69).
pub fn midi_to_frequency(midi: i32, tuning_pitch: f64) -> f64 {
    tuning_pitch * (2.0_f64).powf((midi as f64 - 69.0) / 12.0)
}
