pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod midi;
pub mod routing;
pub mod synth;

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::error::SynthError;
use crate::midi::TimedMidiEvent;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the midisynth-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// Parse a JSON list of `{time, status, data1, data2}` events.
pub fn parse_events(events_json: &str) -> Result<Vec<TimedMidiEvent>, SynthError> {
    Ok(serde_json::from_str(events_json)?)
}

/// WASM-exposed: normalize a routing document. Returns `null` when the input
/// is not a usable chain document.
#[wasm_bindgen]
pub fn normalize_chain_document(json: &str) -> Result<JsValue, JsValue> {
    let Some(set) = routing::normalize_str(json) else {
        return Ok(JsValue::NULL);
    };
    // Plain objects rather than JS Maps for the params.
    set.serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&format!("{e}")))
}

/// WASM-exposed: render timed MIDI events to a WAV byte array.
#[wasm_bindgen]
pub fn render_midi_wav(events_json: &str, sample_rate: u32) -> Result<Vec<u8>, JsValue> {
    let events = parse_events(events_json).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    dsp::renderer::render_wav(&events, sample_rate).map_err(|e| JsValue::from_str(&format!("{e}")))
}
