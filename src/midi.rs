//! MIDI channel-voice message decoding.

use serde::{Deserialize, Serialize};

/// A decoded channel-voice message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Channel aftertouch; drives channel volume.
    ChannelPressure { channel: u8, value: u8 },
    /// 14-bit bend value, 8192 = center.
    PitchBend { channel: u8, value: u16 },
    /// 0xFF system reset.
    Reset,
}

impl MidiMessage {
    /// Decode a `(status, data1, data2)` tuple. Returns `None` for
    /// messages the synth does not react to.
    pub fn parse(status: u8, data1: u8, data2: u8) -> Option<Self> {
        if status == 0xFF {
            return Some(MidiMessage::Reset);
        }
        let channel = status & 0x0F;
        let d1 = data1 & 0x7F;
        let d2 = data2 & 0x7F;
        match status & 0xF0 {
            0x90 if d2 == 0 => Some(MidiMessage::NoteOff { channel, note: d1 }),
            0x90 => Some(MidiMessage::NoteOn { channel, note: d1, velocity: d2 }),
            0x80 => Some(MidiMessage::NoteOff { channel, note: d1 }),
            0xB0 => Some(MidiMessage::ControlChange { channel, controller: d1, value: d2 }),
            0xC0 => Some(MidiMessage::ProgramChange { channel, program: d1 }),
            0xD0 => Some(MidiMessage::ChannelPressure { channel, value: d1 }),
            0xE0 => Some(MidiMessage::PitchBend {
                channel,
                value: d1 as u16 + ((d2 as u16) << 7),
            }),
            _ => None,
        }
    }
}

/// A raw MIDI event stamped with a time in seconds, as used by offline rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedMidiEvent {
    pub time: f64,
    pub status: u8,
    #[serde(default)]
    pub data1: u8,
    #[serde(default)]
    pub data2: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_velocity_zero_is_note_off() {
        assert_eq!(
            MidiMessage::parse(0x93, 60, 0),
            Some(MidiMessage::NoteOff { channel: 3, note: 60 })
        );
    }

    #[test]
    fn pitch_bend_is_fourteen_bit() {
        assert_eq!(
            MidiMessage::parse(0xE1, 0x00, 0x40),
            Some(MidiMessage::PitchBend { channel: 1, value: 8192 })
        );
        assert_eq!(
            MidiMessage::parse(0xE0, 0x7F, 0x7F),
            Some(MidiMessage::PitchBend { channel: 0, value: 16383 })
        );
    }

    #[test]
    fn unknown_status_ignored() {
        assert_eq!(MidiMessage::parse(0xF8, 0, 0), None);
        assert_eq!(MidiMessage::parse(0xFF, 0, 0), Some(MidiMessage::Reset));
    }
}
