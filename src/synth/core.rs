//! SynthCore — the MIDI-driven dispatch layer.
//!
//! Owns the sixteen [`ChannelState`]s, one [`VoiceRegistry`] per channel, the
//! mixer buses, and the master stage. Note-on picks a synthesis path from the
//! channel's program (or hands the note to an attached routing graph);
//! rendering pulls fixed-size blocks through voices, buses, and the master.

use std::collections::hash_map::RandomState;
use std::f64::consts::PI;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::EngineConfig;
use crate::dsp::StereoBuffer;
use crate::dsp::additive::AdditiveVoice;
use crate::dsp::bowed::{BOWED_SECONDS, BowedStringModel};
use crate::dsp::drum::DrumPreset;
use crate::dsp::envelope::release_time;
use crate::dsp::mixer::{MasterBus, MixerBus};
use crate::dsp::noise::NoiseColor;
use crate::dsp::pluck::{self, PLUCK_SECONDS, channel_smoothing};
use crate::error::SynthError;
use crate::midi::MidiMessage;
use crate::routing::document::ChainSet;
use crate::routing::graph::Router;
use crate::synth::channel::{
    CHANNELS, ChannelState, DRUM_CHANNEL, PROGRAM_ADDITIVE, PROGRAM_BOWED, SynthOptions,
};
use crate::synth::voice::{
    BufferPlayer, FAST_STOP_SECONDS, Generator, Voice, VoiceKind, VoiceRegistry, eviction_order,
};

/// Modulation wheel vibrato rate.
const MOD_LFO_HZ: f64 = 5.0;
/// Short tail for the guitar programs (nylon and steel).
const PLUCK_RELEASE_SHORT: f64 = 0.02;
const PLUCK_RELEASE: f64 = 0.4;

/// The synth engine: channel state, voices, and the mix.
#[derive(Debug)]
pub struct SynthCore {
    config: EngineConfig,
    channels: Vec<ChannelState>,
    voices: Vec<VoiceRegistry>,
    buses: Vec<MixerBus>,
    master: MasterBus,
    router: Option<Router>,
    rng: StdRng,
    next_id: u64,
    /// Seconds rendered so far.
    now: f64,
    last_sweep: f64,
}

impl SynthCore {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(entropy_seed()))
    }

    /// A core whose renders are reproducible.
    pub fn with_seed(config: EngineConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: EngineConfig, rng: StdRng) -> Self {
        let block = config.block_size.max(1);
        SynthCore {
            channels: (0..CHANNELS).map(|_| ChannelState::default()).collect(),
            voices: (0..CHANNELS).map(|_| VoiceRegistry::new()).collect(),
            buses: (0..CHANNELS as u8).map(|c| MixerBus::new(c, block)).collect(),
            master: MasterBus::new(&config),
            router: None,
            rng,
            next_id: 1,
            now: 0.0,
            last_sweep: 0.0,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    /// Seconds of audio rendered so far.
    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(channel as usize)
    }

    pub fn set_options(&mut self, channel: u8, options: SynthOptions) -> Result<(), SynthError> {
        self.state_mut(channel)?.options = options;
        Ok(())
    }

    /// Voices of one channel (not counting routed voices).
    pub fn voices(&self, channel: u8) -> impl Iterator<Item = &Voice> {
        self.voices
            .get(channel as usize)
            .into_iter()
            .flat_map(VoiceRegistry::iter)
    }

    /// All voices still held in a registry, routed ones included.
    pub fn active_voices(&self) -> usize {
        let own: usize = self.voices.iter().map(VoiceRegistry::len).sum();
        own + self.router.as_ref().map_or(0, Router::voice_count)
    }

    fn live_voices(&self) -> usize {
        let own: usize = self.voices.iter().map(VoiceRegistry::live_count).sum();
        own + self.router.as_ref().map_or(0, Router::live_count)
    }

    fn state_mut(&mut self, channel: u8) -> Result<&mut ChannelState, SynthError> {
        self.channels
            .get_mut(channel as usize)
            .ok_or(SynthError::InvalidChannel(channel))
    }

    fn check_channel(channel: u8) -> Result<usize, SynthError> {
        let ch = channel as usize;
        if ch < CHANNELS {
            Ok(ch)
        } else {
            Err(SynthError::InvalidChannel(channel))
        }
    }

    /// Live detune of a channel: bend plus modulation vibrato.
    fn detune(&self, ch: usize) -> f64 {
        let state = &self.channels[ch];
        let vibrato = if state.modulation_depth > 0.0 {
            state.modulation_depth * (2.0 * PI * MOD_LFO_HZ * self.now).sin()
        } else {
            0.0
        };
        state.bend_cents + vibrato
    }

    fn push_detune(&mut self, ch: usize) {
        let cents = self.detune(ch);
        let now = self.now;
        self.voices[ch].set_detune(cents, now);
        if let Some(router) = &mut self.router {
            router.set_detune(ch as u8, cents, now);
        }
    }

    // ── Routing ─────────────────────────────────────────────

    /// Send every subsequent note through a routing graph compiled from `set`.
    pub fn attach_routing(&mut self, set: &ChainSet) {
        let router = Router::new(set, self.config.sample_rate, self.config.block_size.max(1));
        if let Some(old) = self.router.take() {
            self.adopt(old);
        }
        info!("routing graph attached: {} chains", set.len());
        self.router = Some(router);
    }

    /// Drop the routing graph. Its voices keep sounding on their channel bus.
    pub fn detach_routing(&mut self) {
        if let Some(router) = self.router.take() {
            self.adopt(router);
            info!("routing graph detached");
        }
    }

    fn adopt(&mut self, mut router: Router) {
        for voice in router.take_voices() {
            let ch = voice.channel as usize;
            if let Some(registry) = self.voices.get_mut(ch) {
                registry.insert(voice);
            }
        }
    }

    pub fn router(&self) -> Option<&Router> {
        self.router.as_ref()
    }

    pub fn router_mut(&mut self) -> Option<&mut Router> {
        self.router.as_mut()
    }

    // ── Channel messages ────────────────────────────────────

    /// Start a note. Velocity 0 is a note-off.
    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let note = note.min(127);
        let velocity = velocity.min(127);
        if velocity == 0 {
            return self.note_off(channel, note);
        }
        self.make_room();
        let now = self.now;
        let detune = self.detune(ch);

        if let Some(router) = &mut self.router {
            router.note_on(
                channel,
                note,
                velocity,
                &self.channels[ch],
                &self.config,
                detune,
                now,
                &mut self.rng,
            );
            return Ok(());
        }

        self.voices[ch].retrigger(note, now);
        let sr = self.config.sample_rate;
        let state = &self.channels[ch];
        let frequency = self.config.note_frequency(note);

        let voice = if channel == DRUM_CHANNEL {
            let Some(preset) = DrumPreset::for_note(note) else {
                debug!("no percussion preset for note {note}");
                return Ok(());
            };
            let hit = preset.render(sr, velocity, &mut self.rng);
            self.buffer_voice(channel, note, velocity, VoiceKind::Percussion, hit)
        } else if state.program == PROGRAM_ADDITIVE {
            let additive = AdditiveVoice::new(sr, note, frequency, velocity, &mut self.rng);
            let id = self.take_id();
            Voice::new(
                id,
                channel,
                note,
                velocity,
                VoiceKind::Additive,
                Generator::Additive(Box::new(additive)),
                now,
                sr,
            )
        } else if state.program == PROGRAM_BOWED {
            let params = state.bowed.clone();
            let (vib_hz, vib_depth, release) =
                (params.vibrato_hz, params.vibrato_depth_cents, params.release);
            let model = BowedStringModel::with_params(sr, params);
            let rendered = model.render(frequency, BOWED_SECONDS, velocity, &mut self.rng);
            self.buffer_voice(channel, note, velocity, VoiceKind::Bowed, rendered)
                .with_vibrato(vib_hz, vib_depth)
                .with_release(release)
        } else {
            let release = if matches!(state.program, 24 | 25) {
                PLUCK_RELEASE_SHORT
            } else {
                PLUCK_RELEASE
            };
            let options = state.options.clone();
            let damping = channel_smoothing(note, &options, &mut self.rng);
            let rendered = pluck::render_note(
                sr,
                frequency,
                damping,
                velocity as f64 / 127.0,
                PLUCK_SECONDS,
                NoiseColor::Pink,
                &options,
                &mut self.rng,
            );
            self.buffer_voice(channel, note, velocity, VoiceKind::Plucked, rendered)
                .with_release(release)
        };

        let mut voice = voice;
        voice.set_detune(detune, now);
        self.voices[ch].insert(voice);
        Ok(())
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer_voice(
        &mut self,
        channel: u8,
        note: u8,
        velocity: u8,
        kind: VoiceKind,
        buffer: StereoBuffer,
    ) -> Voice {
        let id = self.take_id();
        let player = BufferPlayer::new(Arc::new(buffer));
        Voice::new(
            id,
            channel,
            note,
            velocity,
            kind,
            Generator::Buffer(player),
            self.now,
            self.config.sample_rate,
        )
    }

    /// Fast-stop the most expendable voices until one more fits.
    fn make_room(&mut self) {
        let cap = self.config.max_voices.max(1);
        while self.live_voices() >= cap {
            let own = self
                .voices
                .iter()
                .filter_map(VoiceRegistry::eviction_candidate)
                .min_by(|a, b| eviction_order(a, b));
            let routed = self.router.as_ref().and_then(Router::eviction_candidate);
            let victim = match (own, routed) {
                (Some(a), Some(b)) if eviction_order(b, a).is_lt() => (true, b.channel, b.id),
                (Some(a), _) => (false, a.channel, a.id),
                (None, Some(b)) => (true, b.channel, b.id),
                (None, None) => return,
            };
            let now = self.now;
            debug!("polyphony cap {cap}: stealing voice {} on ch {}", victim.2, victim.1);
            let stopped = match victim {
                (true, ch, id) => self
                    .router
                    .as_mut()
                    .is_some_and(|r| r.stop_voice(ch, id, now)),
                (false, ch, id) => self.voices[ch as usize].stop_voice(id, now),
            };
            if !stopped {
                return;
            }
        }
    }

    /// Release a note, or flag it while the sustain pedal is down.
    pub fn note_off(&mut self, channel: u8, note: u8) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let now = self.now;
        let sustain = self.channels[ch].sustain_active();
        if let Some(router) = &mut self.router {
            router.note_off(channel, note, sustain, now);
        }
        let fallback = self.additive_release(ch);
        let ratio = self.config.release_ratio;
        self.voices[ch].note_off(note, sustain, now, ratio, |v| {
            v.release_hint.unwrap_or(fallback)
        });
        Ok(())
    }

    fn additive_release(&self, ch: usize) -> f64 {
        release_time(
            self.config.min_release,
            self.config.max_release,
            self.channels[ch].release_control,
        )
    }

    /// Pedal lifted: every flagged voice on the channel starts releasing.
    fn release_sustain(&mut self, ch: usize) -> usize {
        let now = self.now;
        let fallback = self.additive_release(ch);
        let ratio = self.config.release_ratio;
        let mut released = self.voices[ch].release_sustained(now, ratio, |v| {
            v.release_hint.unwrap_or(fallback)
        });
        if let Some(router) = &mut self.router {
            released += router.release_sustained(ch as u8, now);
        }
        released
    }

    pub fn control_change(&mut self, channel: u8, controller: u8, value: u8) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let value = value.min(127);
        let state = &mut self.channels[ch];
        match controller {
            1 => {
                state.set_modulation(value);
                state.bowed.apply_controller(1, value);
                self.push_detune(ch);
            }
            7 => state.set_volume(value),
            10 => state.set_pan(value),
            11 => {
                state.set_expression(value);
                state.bowed.apply_controller(11, value);
            }
            64 => {
                let was_down = state.sustain_active();
                state.pedal = value;
                if was_down && !state.sustain_active() {
                    self.release_sustain(ch);
                }
            }
            72 => {
                state.bowed.apply_controller(72, value);
                state.release_control = value as f64 / 127.0;
            }
            73 => {
                state.bowed.apply_controller(73, value);
            }
            120 | 123..=127 => self.all_sound_off(channel)?,
            121 => self.reset_all_controllers(channel)?,
            other => debug!("ignoring cc {other} on ch {channel}"),
        }
        Ok(())
    }

    pub fn program_change(&mut self, channel: u8, program: u8) -> Result<(), SynthError> {
        self.set_program(channel, program.min(127) as i32)
    }

    /// Set any program, including the additive and bowed special values.
    pub fn set_program(&mut self, channel: u8, program: i32) -> Result<(), SynthError> {
        self.state_mut(channel)?.program = program;
        Ok(())
    }

    /// 14-bit bend, pushed to every sounding voice on the channel.
    pub fn pitch_bend(&mut self, channel: u8, value: u16) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let range = self.config.pitch_bend_range;
        self.channels[ch].set_bend(value, range);
        self.push_detune(ch);
        Ok(())
    }

    /// Channel aftertouch drives the channel volume.
    pub fn channel_pressure(&mut self, channel: u8, value: u8) -> Result<(), SynthError> {
        self.state_mut(channel)?.set_volume(value);
        Ok(())
    }

    /// Fast ramp then stop for everything on the channel.
    pub fn all_sound_off(&mut self, channel: u8) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let now = self.now;
        self.voices[ch].all_sound_off(now);
        if let Some(router) = &mut self.router {
            router.all_sound_off(channel, now);
        }
        Ok(())
    }

    pub fn reset_all_controllers(&mut self, channel: u8) -> Result<(), SynthError> {
        let ch = Self::check_channel(channel)?;
        let pedal_was_down = self.channels[ch].sustain_active();
        self.channels[ch].reset_controllers();
        if pedal_was_down {
            self.release_sustain(ch);
        }
        self.push_detune(ch);
        Ok(())
    }

    /// Stop every voice and return all channels to their defaults.
    pub fn reset(&mut self) {
        let now = self.now;
        for registry in &mut self.voices {
            registry.all_sound_off(now);
        }
        if let Some(router) = &mut self.router {
            for ch in 0..CHANNELS as u8 {
                router.all_sound_off(ch, now);
            }
        }
        for state in &mut self.channels {
            *state = ChannelState::default();
        }
        debug!("synth reset");
    }

    /// Dispatch a raw `(status, data1, data2)` message.
    pub fn handle_midi(&mut self, status: u8, data1: u8, data2: u8) -> Result<(), SynthError> {
        let Some(message) = MidiMessage::parse(status, data1, data2) else {
            debug!("ignoring midi status {status:#04x}");
            return Ok(());
        };
        self.dispatch(message)
    }

    pub fn dispatch(&mut self, message: MidiMessage) -> Result<(), SynthError> {
        match message {
            MidiMessage::NoteOn { channel, note, velocity } => self.note_on(channel, note, velocity),
            MidiMessage::NoteOff { channel, note } => self.note_off(channel, note),
            MidiMessage::ControlChange { channel, controller, value } => {
                self.control_change(channel, controller, value)
            }
            MidiMessage::ProgramChange { channel, program } => self.program_change(channel, program),
            MidiMessage::ChannelPressure { channel, value } => self.channel_pressure(channel, value),
            MidiMessage::PitchBend { channel, value } => self.pitch_bend(channel, value),
            MidiMessage::Reset => {
                self.reset();
                Ok(())
            }
        }
    }

    // ── Rendering ───────────────────────────────────────────

    /// Render `left.len()` frames of master output, overwriting the buffers.
    pub fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let total = left.len().min(right.len());
        let block = self.config.block_size.max(1);
        let mut start = 0;
        while start < total {
            let frames = block.min(total - start);
            let end = start + frames;
            self.render_chunk(&mut left[start..end], &mut right[start..end]);
            start = end;
        }
    }

    fn render_chunk(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len();
        left.fill(0.0);
        right.fill(0.0);
        for ch in 0..CHANNELS {
            self.buses[ch].clear(frames);
            self.push_detune(ch);
        }

        for (registry, bus) in self.voices.iter_mut().zip(self.buses.iter_mut()) {
            let (l, r) = bus.buffers_mut();
            registry.render(l, r);
        }
        if let Some(router) = &mut self.router {
            router.render(frames, &mut self.buses);
        }

        for (state, bus) in self.channels.iter().zip(&self.buses) {
            bus.mix_into(left, right, state.gain(), state.pan);
        }
        self.master.process_block(left, right);

        self.now += frames as f64 / self.config.sample_rate;
        if (self.now - self.last_sweep) * 1000.0 >= self.config.sweep_interval_ms {
            self.sweep();
        }
    }

    /// Drop voices whose scheduled end has passed.
    pub fn sweep(&mut self) -> usize {
        self.last_sweep = self.now;
        let now = self.now;
        let mut pruned: usize = self.voices.iter_mut().map(|r| r.prune_expired(now)).sum();
        if let Some(router) = &mut self.router {
            pruned += router.prune_expired(now);
        }
        if pruned > 0 {
            debug!("sweep pruned {pruned} voices");
        }
        pruned
    }

    /// Render `seconds` of audio into a new stereo buffer.
    pub fn render_seconds(&mut self, seconds: f64) -> StereoBuffer {
        let mut out = StereoBuffer::with_duration(seconds, self.config.sample_rate);
        let StereoBuffer { left, right } = &mut out;
        self.render_block(left, right);
        out
    }

    /// Fast-stop every voice and settle the master dynamics.
    pub fn silence(&mut self) {
        let now = self.now;
        for registry in &mut self.voices {
            for voice in registry.iter_mut() {
                voice.stop(FAST_STOP_SECONDS, now);
            }
        }
        if let Some(router) = &mut self.router {
            for ch in 0..CHANNELS as u8 {
                router.all_sound_off(ch, now);
            }
        }
        self.master.reset();
    }
}

/// Per-process seed for cores that do not need reproducible output.
fn entropy_seed() -> u64 {
    RandomState::new().build_hasher().finish()
}
