//! Note dispatch: channel state, voices, and the synth core.

pub mod channel;
pub mod core;
pub mod voice;

pub use self::core::SynthCore;
