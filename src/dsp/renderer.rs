//! WAV renderer — plays timed MIDI events through a [`SynthCore`] offline.

use log::warn;

use super::StereoBuffer;
use crate::config::EngineConfig;
use crate::error::SynthError;
use crate::midi::TimedMidiEvent;
use crate::synth::SynthCore;

/// Silence rendered after the last event so tails can ring out.
pub const TAIL_SECONDS: f64 = 1.0;

/// Render `events` (seconds, any order) through `synth`, then `tail_seconds`
/// more. Output never exceeds the synth's `max_render_seconds`; events past
/// that point are dropped.
pub fn render_events(events: &[TimedMidiEvent], synth: &mut SynthCore, tail_seconds: f64) -> StereoBuffer {
    let sr = synth.sample_rate();
    let limit = synth.config().max_render_seconds.max(0.0);
    let mut sorted: Vec<TimedMidiEvent> = events
        .iter()
        .copied()
        .filter(|e| e.time.is_finite())
        .collect();
    let before = sorted.len();
    sorted.retain(|e| e.time <= limit);
    if sorted.len() < before {
        warn!("dropped {} events timed past {limit}s", before - sorted.len());
    }
    sorted.sort_by(|a, b| a.time.total_cmp(&b.time));

    let last = sorted.last().map_or(0.0, |e| e.time.max(0.0));
    let seconds = (last + tail_seconds.max(0.0)).min(limit);
    let total = (seconds * sr).round() as usize;
    let mut out = StereoBuffer::new(total);

    let mut cursor = 0usize;
    for event in &sorted {
        let at = ((event.time.max(0.0) * sr).round() as usize).min(total);
        if at > cursor {
            synth.render_block(&mut out.left[cursor..at], &mut out.right[cursor..at]);
            cursor = at;
        }
        if let Err(e) = synth.handle_midi(event.status, event.data1, event.data2) {
            warn!("skipping event at {:.3}s: {e}", event.time);
        }
    }
    if cursor < total {
        synth.render_block(&mut out.left[cursor..], &mut out.right[cursor..]);
    }
    out
}

/// Render events to a WAV file as bytes (16-bit stereo PCM).
pub fn render_wav(events: &[TimedMidiEvent], sample_rate: u32) -> Result<Vec<u8>, SynthError> {
    if sample_rate == 0 {
        return Err(SynthError::InvalidSampleRate(sample_rate));
    }
    let config = EngineConfig {
        sample_rate: sample_rate as f64,
        ..EngineConfig::default()
    };
    let mut synth = SynthCore::new(config);
    let audio = render_events(events, &mut synth, TAIL_SECONDS);
    Ok(encode_wav(&to_pcm_i16(&audio), sample_rate, 2))
}

/// Interleave and quantize to 16-bit PCM.
pub fn to_pcm_i16(audio: &StereoBuffer) -> Vec<i16> {
    audio
        .left
        .iter()
        .zip(&audio.right)
        .flat_map(|(&l, &r)| [l, r])
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Encode interleaved i16 PCM samples to a WAV byte buffer.
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(time: f64, status: u8, data1: u8, data2: u8) -> TimedMidiEvent {
        TimedMidiEvent {
            time,
            status,
            data1,
            data2,
        }
    }

    #[test]
    fn wav_header_valid() {
        let wav = render_wav(&[event(0.0, 0x90, 60, 100), event(0.25, 0x80, 60, 0)], 22050).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 22050);
        let ch = u16::from_le_bytes([wav[22], wav[23]]);
        assert_eq!(ch, 2);
    }

    #[test]
    fn wav_size_covers_events_and_tail() {
        let wav = render_wav(&[event(0.5, 0xB0, 7, 100)], 8000).unwrap();
        // (0.5 s + 1 s tail) * 8000 frames * 2 channels * 2 bytes
        let data_size = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(data_size, 48000);
        assert_eq!(wav.len(), 44 + 48000);
    }

    #[test]
    fn empty_event_list_is_tail_only_silence() {
        let mut synth = SynthCore::with_seed(EngineConfig::default(), 0);
        let out = render_events(&[], &mut synth, 0.1);
        assert_eq!(out.len(), 4410);
        assert_eq!(out.peak(), 0.0);
    }

    #[test]
    fn events_apply_in_time_order() {
        let mut synth = SynthCore::with_seed(EngineConfig::default(), 3);
        // Note-off listed first but timed after the note-on.
        let events = [event(0.2, 0x80, 64, 0), event(0.0, 0x90, 64, 110)];
        let out = render_events(&events, &mut synth, 0.0);
        assert_eq!(out.len(), 8820);
        assert!(out.left[..4410].iter().any(|s| *s != 0.0), "Note should sound before its note-off");
        assert!(synth.voices(0).all(|v| v.release_time.is_some()), "Note-off should have applied");
    }

    #[test]
    fn pcm_is_interleaved_and_clamped() {
        let audio = StereoBuffer {
            left: vec![2.0, 0.0],
            right: vec![-2.0, 0.5],
        };
        let pcm = to_pcm_i16(&audio);
        assert_eq!(pcm, vec![i16::MAX, -i16::MAX, 0, (0.5 * i16::MAX as f32) as i16]);
    }

    #[test]
    fn far_future_events_are_dropped_not_allocated() {
        let config = EngineConfig {
            sample_rate: 8000.0,
            max_render_seconds: 2.0,
            ..EngineConfig::default()
        };
        let mut synth = SynthCore::with_seed(config, 1);
        let events = [event(0.0, 0x90, 60, 100), event(1e13, 0x80, 60, 0)];
        let out = render_events(&events, &mut synth, TAIL_SECONDS);
        // 0 s last kept event + 1 s tail.
        assert_eq!(out.len(), 8000, "Should ignore the far-future event, got {}", out.len());
        assert!(synth.voices(0).all(|v| v.release_time.is_none()), "Dropped note-off must not apply");

        let mut synth = SynthCore::with_seed(EngineConfig::default(), 1);
        let out = render_events(&[event(1e13, 0x90, 60, 100)], &mut synth, TAIL_SECONDS);
        assert_eq!(out.len(), 44100, "Only the tail should render, got {}", out.len());
    }

    #[test]
    fn render_length_is_capped() {
        let config = EngineConfig {
            sample_rate: 1000.0,
            max_render_seconds: 1.5,
            ..EngineConfig::default()
        };
        let mut synth = SynthCore::with_seed(config, 1);
        let out = render_events(&[event(1.2, 0xB0, 7, 100)], &mut synth, TAIL_SECONDS);
        assert_eq!(out.len(), 1500);
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let err = render_wav(&[event(0.0, 0x90, 60, 100)], 0);
        assert!(matches!(err, Err(SynthError::InvalidSampleRate(0))), "Should reject 0 Hz, got {err:?}");
    }
}
