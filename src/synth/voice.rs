//! Voices and the per-channel voice registry.
//!
//! A voice owns its generator outright. The registry never drops a voice on
//! note-off; voices leave only once their generator reports it has finished
//! (or the periodic sweep finds their scheduled end time has passed).

use std::cmp::Ordering;
use std::f64::consts::PI;
use std::sync::Arc;

use log::debug;

use crate::dsp::StereoBuffer;
use crate::dsp::additive::AdditiveVoice;
use crate::dsp::envelope::{Envelope, Fade};
use crate::dsp::oscillator::Oscillator;

/// Ramp used whenever a voice has to be cut short.
pub const FAST_STOP_SECONDS: f64 = 0.02;

/// Which synthesis path produced a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceKind {
    Additive,
    Plucked,
    Bowed,
    Percussion,
    Oscillator,
}

/// Lifecycle of a sounding note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Sounding,
    Releasing,
    /// Note-off arrived while the pedal was down.
    SustainFlagged,
    Finished,
}

/// Where a routed voice enters its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub chain: usize,
    /// Index of the source module the voice feeds.
    pub position: usize,
    /// Id of that source module; indices are re-resolved from it on rebuild.
    pub source: String,
}

/// Plays a pre-rendered buffer with a live playback-rate detune.
#[derive(Debug, Clone)]
pub struct BufferPlayer {
    buffer: Arc<StereoBuffer>,
    position: f64,
    rate: f64,
}

impl BufferPlayer {
    pub fn new(buffer: Arc<StereoBuffer>) -> Self {
        BufferPlayer {
            buffer,
            position: 0.0,
            rate: 1.0,
        }
    }

    pub fn set_detune(&mut self, cents: f64) {
        self.rate = 2.0_f64.powf(cents / 1200.0);
    }

    /// Seconds of buffer left at the current rate.
    pub fn remaining(&self, sample_rate: f64) -> f64 {
        let left = (self.buffer.len() as f64 - self.position).max(0.0);
        left / self.rate / sample_rate
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.buffer.len() as f64
    }

    #[inline]
    pub fn next_frame(&mut self) -> (f32, f32) {
        let len = self.buffer.len();
        let i = self.position as usize;
        if i >= len {
            return (0.0, 0.0);
        }
        let frac = (self.position - i as f64) as f32;
        let b = &self.buffer;
        let (l1, r1) = if i + 1 < len {
            (b.left[i + 1], b.right[i + 1])
        } else {
            (0.0, 0.0)
        };
        self.position += self.rate;
        (
            b.left[i] + (l1 - b.left[i]) * frac,
            b.right[i] + (r1 - b.right[i]) * frac,
        )
    }
}

/// An oscillator shaped by an ADSR, used by routing oscillator sources.
#[derive(Debug, Clone)]
pub struct OscillatorVoice {
    pub osc: Oscillator,
    pub envelope: Envelope,
}

impl OscillatorVoice {
    pub fn new(osc: Oscillator, mut envelope: Envelope) -> Self {
        envelope.gate_on();
        OscillatorVoice { osc, envelope }
    }
}

/// Sound source owned by a voice.
#[derive(Debug, Clone)]
pub enum Generator {
    Buffer(BufferPlayer),
    Additive(Box<AdditiveVoice>),
    Oscillator(OscillatorVoice),
}

impl Generator {
    fn set_detune(&mut self, cents: f64) {
        match self {
            Generator::Buffer(p) => p.set_detune(cents),
            Generator::Additive(a) => a.set_detune(cents),
            Generator::Oscillator(o) => o.osc.detune = cents,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Generator::Buffer(p) => p.is_finished(),
            Generator::Additive(a) => a.is_finished(),
            Generator::Oscillator(o) => o.envelope.is_finished(),
        }
    }

    #[inline]
    fn next_frame(&mut self) -> (f32, f32) {
        match self {
            Generator::Buffer(p) => p.next_frame(),
            Generator::Additive(a) => {
                let s = a.next_sample() as f32;
                (s, s)
            }
            Generator::Oscillator(o) => {
                let s = (o.osc.next_sample() * o.envelope.next_sample()) as f32;
                (s, s)
            }
        }
    }
}

/// One sounding note instance.
#[derive(Debug, Clone)]
pub struct Voice {
    pub id: u64,
    pub channel: u8,
    pub note: u8,
    /// [0, 1].
    pub velocity: f32,
    pub kind: VoiceKind,
    pub start_time: f64,
    pub release_time: Option<f64>,
    pub state: VoiceState,
    /// Scheduled end, used by the sweep. `None` while held indefinitely.
    pub end_time: Option<f64>,
    /// End of a pending release or stop ramp.
    cutoff: Option<f64>,
    generator: Generator,
    fade: Fade,
    /// Per-voice vibrato (Hz, cents) on top of the channel detune.
    vibrato: Option<(f64, f64)>,
    /// Release seconds chosen at note-on, if the source fixes one.
    pub release_hint: Option<f64>,
    /// Routing chain entry point, for voices owned by a routing graph.
    pub route: Option<Route>,
    sample_rate: f64,
}

impl Voice {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        channel: u8,
        note: u8,
        velocity: u8,
        kind: VoiceKind,
        generator: Generator,
        now: f64,
        sample_rate: f64,
    ) -> Self {
        let end_time = match &generator {
            Generator::Buffer(p) => Some(now + p.remaining(sample_rate)),
            Generator::Additive(a) => Some(now + a.natural_length()),
            Generator::Oscillator(_) => None,
        };
        Voice {
            id,
            channel,
            note,
            velocity: velocity.min(127) as f32 / 127.0,
            kind,
            start_time: now,
            release_time: None,
            state: VoiceState::Sounding,
            end_time,
            cutoff: None,
            generator,
            fade: Fade::default(),
            vibrato: None,
            release_hint: None,
            route: None,
            sample_rate,
        }
    }

    pub fn with_vibrato(mut self, hz: f64, depth_cents: f64) -> Self {
        if hz > 0.0 && depth_cents != 0.0 {
            self.vibrato = Some((hz, depth_cents));
        }
        self
    }

    pub fn with_release(mut self, seconds: f64) -> Self {
        self.release_hint = Some(seconds);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    /// Push the channel's live detune (bend plus modulation) into the generator.
    pub fn set_detune(&mut self, cents: f64, now: f64) {
        let own = match self.vibrato {
            Some((hz, depth)) => depth * (2.0 * PI * hz * (now - self.start_time)).sin(),
            None => 0.0,
        };
        self.generator.set_detune(cents + own);
        // Playback rate moved, so the buffer's natural end moved with it.
        if let Generator::Buffer(p) = &self.generator {
            let natural = now + p.remaining(self.sample_rate);
            self.end_time = Some(self.cutoff.map_or(natural, |c| c.min(natural)));
        }
    }

    /// Record a release or stop ending at `end`.
    fn cut_at(&mut self, end: f64) {
        self.cutoff = Some(self.cutoff.map_or(end, |c| c.min(end)));
        self.end_time = Some(self.end_time.map_or(end, |e| e.min(end)));
    }

    /// Natural release over `seconds`. Additive voices use an exponential
    /// tail of `seconds * ratio`.
    pub fn release(&mut self, seconds: f64, ratio: f64, now: f64) {
        if self.state == VoiceState::Finished {
            return;
        }
        let seconds = seconds.max(0.0);
        let end = match &mut self.generator {
            Generator::Additive(a) => {
                a.release(seconds, ratio);
                now + seconds * ratio.max(1.0)
            }
            Generator::Oscillator(o) => {
                o.envelope.gate_off_with(seconds);
                now + seconds
            }
            Generator::Buffer(_) => {
                self.fade.start(seconds, self.sample_rate);
                now + seconds
            }
        };
        self.cut_at(end);
        self.release_time = Some(now);
        self.state = VoiceState::Releasing;
    }

    /// Ramp to silence over `seconds` regardless of kind.
    pub fn stop(&mut self, seconds: f64, now: f64) {
        if self.state == VoiceState::Finished {
            return;
        }
        self.fade.start(seconds, self.sample_rate);
        self.cut_at(now + seconds);
        self.release_time.get_or_insert(now);
        self.state = VoiceState::Releasing;
    }

    /// Being cut short by [`Voice::stop`].
    pub fn is_stopping(&self) -> bool {
        self.fade.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state == VoiceState::Finished
    }

    /// Add `left.len()` frames into the buffers. Marks the voice finished
    /// when the generator or stop ramp runs out.
    pub fn render_into(&mut self, left: &mut [f32], right: &mut [f32]) {
        if self.state == VoiceState::Finished {
            return;
        }
        let scale = if self.kind == VoiceKind::Oscillator {
            self.velocity
        } else {
            1.0
        };
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (a, b) = self.generator.next_frame();
            let g = self.fade.next_gain() as f32 * scale;
            *l += a * g;
            *r += b * g;
        }
        if self.generator.is_finished() || self.fade.is_silent() {
            self.state = VoiceState::Finished;
        }
    }
}

/// Orders voices by how readily they should be stolen: released voices
/// before held ones, then oldest first.
pub fn eviction_order(a: &Voice, b: &Voice) -> Ordering {
    let ka = (a.state == VoiceState::Sounding, a.start_time);
    let kb = (b.state == VoiceState::Sounding, b.start_time);
    ka.partial_cmp(&kb).unwrap_or(Ordering::Equal)
}

/// Active voices of one channel.
#[derive(Debug, Clone, Default)]
pub struct VoiceRegistry {
    voices: Vec<Voice>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Voice> {
        self.voices.iter()
    }

    /// Voices that still count against the polyphony cap.
    pub fn live_count(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_stopping()).count()
    }

    pub fn insert(&mut self, voice: Voice) {
        debug!(
            "voice {} on: ch {} note {} {:?}",
            voice.id, voice.channel, voice.note, voice.kind
        );
        self.voices.push(voice);
    }

    /// Stop any earlier instance of `note` before a retrigger.
    pub fn retrigger(&mut self, note: u8, now: f64) -> usize {
        let mut stopped = 0;
        for v in self.voices.iter_mut().filter(|v| v.note == note && !v.is_stopping()) {
            v.stop(FAST_STOP_SECONDS, now);
            stopped += 1;
        }
        stopped
    }

    /// Note-off: release, or flag for the pedal when `sustain` is set.
    /// `release_for` picks the release seconds for each voice.
    pub fn note_off(
        &mut self,
        note: u8,
        sustain: bool,
        now: f64,
        ratio: f64,
        release_for: impl Fn(&Voice) -> f64,
    ) {
        for v in self
            .voices
            .iter_mut()
            .filter(|v| v.note == note && v.state == VoiceState::Sounding)
        {
            // Drums always ring out.
            if v.kind == VoiceKind::Percussion {
                continue;
            }
            if sustain {
                v.state = VoiceState::SustainFlagged;
            } else {
                let seconds = release_for(v);
                v.release(seconds, ratio, now);
            }
        }
    }

    /// Pedal lifted: release every flagged voice.
    pub fn release_sustained(
        &mut self,
        now: f64,
        ratio: f64,
        release_for: impl Fn(&Voice) -> f64,
    ) -> usize {
        let mut released = 0;
        for v in self
            .voices
            .iter_mut()
            .filter(|v| v.state == VoiceState::SustainFlagged)
        {
            let seconds = release_for(v);
            v.release(seconds, ratio, now);
            released += 1;
        }
        released
    }

    pub fn set_detune(&mut self, cents: f64, now: f64) {
        for v in &mut self.voices {
            v.set_detune(cents, now);
        }
    }

    /// Fast ramp on every voice.
    pub fn all_sound_off(&mut self, now: f64) {
        for v in &mut self.voices {
            v.stop(FAST_STOP_SECONDS, now);
        }
    }

    pub fn stop_voice(&mut self, id: u64, now: f64) -> bool {
        match self.voices.iter_mut().find(|v| v.id == id) {
            Some(v) => {
                v.stop(FAST_STOP_SECONDS, now);
                true
            }
            None => false,
        }
    }

    /// Candidate for eviction: oldest releasing voice, else oldest overall.
    pub fn eviction_candidate(&self) -> Option<&Voice> {
        self.voices
            .iter()
            .filter(|v| !v.is_stopping())
            .min_by(|a, b| eviction_order(a, b))
    }

    /// Render all voices into the buffers, then drop those that finished.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        for v in &mut self.voices {
            v.render_into(left, right);
        }
        self.remove_finished()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Voice> {
        self.voices.iter_mut()
    }

    /// Drop voices whose generator has finished.
    pub fn remove_finished(&mut self) -> usize {
        let before = self.voices.len();
        self.voices.retain(|v| {
            if v.is_finished() {
                debug!("voice {} done: ch {} note {}", v.id, v.channel, v.note);
            }
            !v.is_finished()
        });
        before - self.voices.len()
    }

    /// Drop voices whose scheduled end has passed by more than a stop ramp.
    pub fn prune_expired(&mut self, now: f64) -> usize {
        let before = self.voices.len();
        self.voices
            .retain(|v| v.end_time.is_none_or(|end| end + FAST_STOP_SECONDS > now));
        before - self.voices.len()
    }

    /// Move every voice out of the registry.
    pub fn drain(&mut self) -> impl Iterator<Item = Voice> + '_ {
        self.voices.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::oscillator::Waveform;

    const SR: f64 = 1000.0;

    fn tone(len: usize) -> Arc<StereoBuffer> {
        let mut b = StereoBuffer::new(len);
        b.left.fill(0.5);
        b.right.fill(0.5);
        Arc::new(b)
    }

    fn buffer_voice(id: u64, note: u8, len: usize, now: f64) -> Voice {
        let g = Generator::Buffer(BufferPlayer::new(tone(len)));
        Voice::new(id, 0, note, 100, VoiceKind::Plucked, g, now, SR)
    }

    fn run(reg: &mut VoiceRegistry, frames: usize) -> (Vec<f32>, usize) {
        let mut l = vec![0.0; frames];
        let mut r = vec![0.0; frames];
        let removed = reg.render(&mut l, &mut r);
        (l, removed)
    }

    #[test]
    fn buffer_voice_removed_after_playback() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 100, 0.0));
        let (out, removed) = run(&mut reg, 50);
        assert_eq!(removed, 0);
        assert!((out[10] - 0.5).abs() < 1e-6);
        let (_, removed) = run(&mut reg, 60);
        assert_eq!(removed, 1, "Voice should leave once the buffer ends");
        assert!(reg.is_empty());
    }

    #[test]
    fn note_off_releases_without_removal() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 10_000, 0.0));
        reg.note_off(60, false, 0.0, 1.0, |_| 0.1);
        assert_eq!(reg.len(), 1, "Note-off must not drop the voice synchronously");
        assert_eq!(reg.iter().next().map(|v| v.state), Some(VoiceState::Releasing));
        let (out, _) = run(&mut reg, 50);
        assert!(out[49] > 0.0 && out[49] < out[0], "Should be ramping, got {}", out[49]);
        let (_, removed) = run(&mut reg, 60);
        assert_eq!(removed, 1);
    }

    #[test]
    fn sustain_defers_release() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 10_000, 0.0));
        reg.note_off(60, true, 0.0, 1.0, |_| 0.05);
        assert_eq!(reg.iter().next().map(|v| v.state), Some(VoiceState::SustainFlagged));
        let (out, _) = run(&mut reg, 500);
        assert!((out[499] - 0.5).abs() < 1e-6, "Flagged voice should hold, got {}", out[499]);
        assert_eq!(reg.release_sustained(0.5, 1.0, |_| 0.05), 1);
        let (_, removed) = run(&mut reg, 100);
        assert_eq!(removed, 1);
    }

    #[test]
    fn retrigger_stops_previous_instance() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 10_000, 0.0));
        assert_eq!(reg.retrigger(60, 0.0), 1);
        reg.insert(buffer_voice(2, 60, 10_000, 0.0));
        assert_eq!(reg.live_count(), 1);
        run(&mut reg, 100);
        let ids: Vec<u64> = reg.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn percussion_ignores_note_off() {
        let mut reg = VoiceRegistry::new();
        let g = Generator::Buffer(BufferPlayer::new(tone(100)));
        reg.insert(Voice::new(1, 9, 36, 100, VoiceKind::Percussion, g, 0.0, SR));
        reg.note_off(36, false, 0.0, 1.0, |_| 0.01);
        assert_eq!(reg.iter().next().map(|v| v.state), Some(VoiceState::Sounding));
    }

    #[test]
    fn detune_changes_buffer_rate() {
        let mut b = StereoBuffer::new(100);
        for (i, s) in b.left.iter_mut().enumerate() {
            *s = i as f32;
        }
        let mut p = BufferPlayer::new(Arc::new(b));
        p.set_detune(1200.0);
        p.next_frame();
        let (l, _) = p.next_frame();
        assert!((l - 2.0).abs() < 1e-4, "Octave up should skip samples, got {l}");
        assert!((p.remaining(SR) - 0.048).abs() < 1e-9);
    }

    #[test]
    fn oscillator_voice_finishes_after_release() {
        let osc = Oscillator::with_frequency(Waveform::Sine, SR, 50.0);
        let env = Envelope::with_adsr(SR, 0.01, 0.01, 0.5, 0.05);
        let g = Generator::Oscillator(OscillatorVoice::new(osc, env));
        let mut reg = VoiceRegistry::new();
        reg.insert(Voice::new(1, 0, 60, 127, VoiceKind::Oscillator, g, 0.0, SR));
        assert_eq!(reg.iter().next().and_then(|v| v.end_time), None);
        let (_, removed) = run(&mut reg, 200);
        assert_eq!(removed, 0, "Held oscillator should keep sounding");
        reg.note_off(60, false, 0.2, 1.0, |_| 0.05);
        let (_, removed) = run(&mut reg, 60);
        assert_eq!(removed, 1);
    }

    #[test]
    fn eviction_prefers_releasing_then_oldest() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 10_000, 0.0));
        reg.insert(buffer_voice(2, 62, 10_000, 1.0));
        reg.insert(buffer_voice(3, 64, 10_000, 2.0));
        assert_eq!(reg.eviction_candidate().map(|v| v.id), Some(1));
        reg.note_off(64, false, 2.0, 1.0, |_| 1.0);
        assert_eq!(reg.eviction_candidate().map(|v| v.id), Some(3));
    }

    #[test]
    fn sweep_prunes_expired() {
        let mut reg = VoiceRegistry::new();
        reg.insert(buffer_voice(1, 60, 100, 0.0));
        reg.insert(buffer_voice(2, 61, 10_000, 0.0));
        assert_eq!(reg.prune_expired(0.5), 1);
        assert_eq!(reg.iter().next().map(|v| v.id), Some(2));
    }

    #[test]
    fn detune_reschedules_buffer_end() {
        let mut v = buffer_voice(1, 60, 100, 0.0);
        assert_eq!(v.end_time, Some(0.1));
        v.set_detune(-1200.0, 0.0);
        let end = v.end_time.unwrap_or_default();
        assert!((end - 0.2).abs() < 1e-9, "Octave down should double the length, got {end}");

        v.stop(FAST_STOP_SECONDS, 0.05);
        v.set_detune(-1200.0, 0.06);
        let end = v.end_time.unwrap_or_default();
        assert!((end - 0.07).abs() < 1e-9, "Stop ramp should still bound the end, got {end}");
    }
}
