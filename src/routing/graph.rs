//! Routing graph compiler and note router.
//!
//! Compiling a [`ChainSet`] produces one [`CompiledChain`] per chain plus a
//! [`SourceIndex`] of every enabled source module. Node state is kept per MIDI
//! channel ("lane") so a chain shared by several channels still feeds each
//! channel's mixer bus separately. Lanes are created lazily the first time a
//! voice enters them.

use std::sync::Arc;

use log::{debug, warn};
use rand::Rng;
use serde_json::Value;

use crate::config::{EngineConfig, midi_to_frequency};
use crate::dsp::analysis::AnalyzerRing;
use crate::dsp::envelope::Envelope;
use crate::dsp::mixer::MixerBus;
use crate::dsp::noise::NoiseColor;
use crate::dsp::oscillator::{Oscillator, Waveform};
use crate::dsp::pluck::{self, channel_smoothing};
use crate::error::SynthError;
use crate::routing::document::{ChainSet, ModuleDoc, ModuleKind, param_f64, value_f64};
use crate::routing::node::Node;
use crate::synth::channel::{CHANNELS, ChannelState};
use crate::synth::voice::{
    BufferPlayer, Generator, OscillatorVoice, Route, Voice, VoiceKind, VoiceRegistry, eviction_order,
};

/// Which MIDI channels a source (and its chain) accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    All,
    Channel(u8),
}

impl ChannelSelector {
    /// Parse a `ch` param: `"all"` or a channel number. Missing means all.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return ChannelSelector::All;
        };
        if value.as_str().is_some_and(|s| s.eq_ignore_ascii_case("all")) {
            return ChannelSelector::All;
        }
        match value_f64(value) {
            Some(n) if n >= 0.0 && n < CHANNELS as f64 && n.fract() == 0.0 => {
                ChannelSelector::Channel(n as u8)
            }
            _ => {
                warn!("invalid channel selector {value}, accepting all channels");
                ChannelSelector::All
            }
        }
    }

    pub fn covers(self, channel: u8) -> bool {
        match self {
            ChannelSelector::All => true,
            ChannelSelector::Channel(c) => c == channel,
        }
    }
}

/// Program filter of a plucked source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramSelector {
    All,
    Program(i32),
}

impl ProgramSelector {
    /// Parse a `program` param. Missing means program 0.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return ProgramSelector::Program(0);
        };
        if value.as_str().is_some_and(|s| s.eq_ignore_ascii_case("all")) {
            return ProgramSelector::All;
        }
        match value_f64(value) {
            Some(n) if n.fract() == 0.0 && n.abs() <= i32::MAX as f64 => {
                ProgramSelector::Program(n as i32)
            }
            _ => {
                warn!("invalid program selector {value}, accepting all programs");
                ProgramSelector::All
            }
        }
    }

    pub fn matches(self, program: i32) -> bool {
        match self {
            ProgramSelector::All => true,
            ProgramSelector::Program(p) => p == program,
        }
    }
}

/// A compiled `pluckedSource` module.
#[derive(Debug, Clone, PartialEq)]
pub struct PluckSource {
    pub chain: usize,
    pub position: usize,
    pub id: String,
    pub channel: ChannelSelector,
    pub program: ProgramSelector,
    /// Fixed loop smoothing; `None` derives it from the note.
    pub smoothing: Option<f64>,
    pub vel_scale: f64,
    pub seed_noise: NoiseColor,
    pub use_synth_a4: bool,
    /// Rendered length in seconds.
    pub duration: f64,
    /// Fade applied on note-off.
    pub release: f64,
}

impl PluckSource {
    fn compile(chain: usize, position: usize, module: &ModuleDoc) -> Self {
        let smoothing = match module.param_str("smoothingMode", "auto") {
            "auto" => None,
            _ => Some(module.param_f64("smoothingFactor", 0.2).clamp(0.01, 0.99)),
        };
        PluckSource {
            chain,
            position,
            id: module.id.clone(),
            channel: ChannelSelector::from_value(module.param("ch")),
            program: ProgramSelector::from_value(module.param("program")),
            smoothing,
            vel_scale: module.param_f64("velScale", 1.0).max(0.0),
            seed_noise: NoiseColor::from_name(module.param_str("seedNoiseType", "pink")),
            use_synth_a4: module.param_bool("useSynthA4", true),
            duration: module.param_f64("ksDurSec", 1.0).clamp(0.05, 10.0),
            release: module.param_f64("ksRelease", 0.5).max(0.0),
        }
    }

    pub fn matches(&self, channel: u8, program: i32) -> bool {
        self.channel.covers(channel) && self.program.matches(program)
    }
}

/// Attack, decay, sustain level, release.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adsr {
    pub attack: f64,
    pub decay: f64,
    pub sustain: f64,
    pub release: f64,
}

impl Default for Adsr {
    fn default() -> Self {
        Adsr {
            attack: 0.003,
            decay: 0.08,
            sustain: 0.4,
            release: 0.2,
        }
    }
}

impl Adsr {
    fn from_value(value: Option<&Value>) -> Self {
        let d = Adsr::default();
        let Some(map) = value.and_then(Value::as_object) else {
            return d;
        };
        let get = |key: &str, default: f64| -> f64 { param_f64(map, key, default) };
        Adsr {
            attack: get("a", d.attack).max(0.0),
            decay: get("d", d.decay).max(0.0),
            sustain: get("s", d.sustain).clamp(0.0, 1.0),
            release: get("r", d.release).max(0.0),
        }
    }
}

/// A compiled `oscillatorSource` module.
#[derive(Debug, Clone, PartialEq)]
pub struct OscSource {
    pub chain: usize,
    pub position: usize,
    pub id: String,
    pub channel: ChannelSelector,
    pub waveform: Waveform,
    pub adsr: Adsr,
}

impl OscSource {
    fn compile(chain: usize, position: usize, module: &ModuleDoc) -> Self {
        let name = module.param_str("type", "sawtooth");
        let waveform = Waveform::from_name(name).unwrap_or_else(|| {
            warn!("unknown oscillator type {name:?} on {}, using sawtooth", module.id);
            Waveform::Sawtooth
        });
        OscSource {
            chain,
            position,
            id: module.id.clone(),
            channel: ChannelSelector::from_value(module.param("ch")),
            waveform,
            adsr: Adsr::from_value(module.param("adsr")),
        }
    }
}

/// Every enabled source module, in document order.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    pub plucked: Vec<PluckSource>,
    pub oscillators: Vec<OscSource>,
}

/// Per-chain mute gain, ramped across one block on change.
#[derive(Debug, Clone, Copy)]
struct MuteGain {
    current: f32,
    target: f32,
}

impl MuteGain {
    fn new(muted: bool) -> Self {
        let g = if muted { 0.0 } else { 1.0 };
        MuteGain {
            current: g,
            target: g,
        }
    }

    fn set(&mut self, muted: bool) {
        self.target = if muted { 0.0 } else { 1.0 };
    }

    #[inline]
    fn at(&self, i: usize, frames: usize) -> f32 {
        if self.current == self.target {
            return self.current;
        }
        self.current + (self.target - self.current) * (i + 1) as f32 / frames as f32
    }

    fn settle(&mut self) {
        self.current = self.target;
    }
}

/// Node state of one chain for one channel.
#[derive(Debug)]
struct Lane {
    nodes: Vec<Node>,
    /// Voice input injected ahead of each node.
    inputs: Vec<(Vec<f32>, Vec<f32>)>,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Lane {
    fn new(modules: &[ModuleDoc], sample_rate: f64, block_size: usize) -> Self {
        Lane {
            nodes: modules.iter().map(|m| Node::build(m, sample_rate)).collect(),
            inputs: modules
                .iter()
                .map(|_| (vec![0.0; block_size], vec![0.0; block_size]))
                .collect(),
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
        }
    }

    fn input(&mut self, position: usize, frames: usize) -> Option<(&mut [f32], &mut [f32])> {
        let (l, r) = self.inputs.get_mut(position)?;
        if l.len() < frames {
            l.resize(frames, 0.0);
            r.resize(frames, 0.0);
        }
        Some((&mut l[..frames], &mut r[..frames]))
    }

    fn run(&mut self, frames: usize) {
        self.left.clear();
        self.left.resize(frames, 0.0);
        self.right.clear();
        self.right.resize(frames, 0.0);
        for (node, (il, ir)) in self.nodes.iter_mut().zip(self.inputs.iter_mut()) {
            for (acc, s) in self.left.iter_mut().zip(il.iter_mut()) {
                *acc += *s;
                *s = 0.0;
            }
            for (acc, s) in self.right.iter_mut().zip(ir.iter_mut()) {
                *acc += *s;
                *s = 0.0;
            }
            node.process(&mut self.left, &mut self.right);
        }
    }
}

/// One chain after compilation.
#[derive(Debug)]
pub struct CompiledChain {
    modules: Vec<ModuleDoc>,
    /// Taken from the chain's first source module.
    pub selector: ChannelSelector,
    mute: MuteGain,
    lanes: Vec<Option<Lane>>,
}

impl CompiledChain {
    fn compile(modules: &[ModuleDoc], muted: bool) -> Self {
        let selector = modules
            .iter()
            .find(|m| m.kind.is_source())
            .map_or(ChannelSelector::All, |m| ChannelSelector::from_value(m.param("ch")));
        CompiledChain {
            modules: modules.to_vec(),
            selector,
            mute: MuteGain::new(muted),
            lanes: (0..CHANNELS).map(|_| None).collect(),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.mute.target == 0.0
    }

    pub fn modules(&self) -> &[ModuleDoc] {
        &self.modules
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.iter().filter(|l| l.is_some()).count()
    }
}

/// The compiled processing topology for a whole [`ChainSet`].
#[derive(Debug)]
pub struct RoutingGraph {
    chains: Vec<CompiledChain>,
    sources: SourceIndex,
    sample_rate: f64,
    block_size: usize,
}

impl RoutingGraph {
    pub fn compile(set: &ChainSet, sample_rate: f64, block_size: usize) -> Self {
        let mut sources = SourceIndex::default();
        let mut chains = Vec::with_capacity(set.chains.len());
        for (ci, modules) in set.chains.iter().enumerate() {
            for (position, module) in modules.iter().enumerate() {
                if !module.enabled {
                    continue;
                }
                match module.kind {
                    ModuleKind::PluckedSource => {
                        sources.plucked.push(PluckSource::compile(ci, position, module))
                    }
                    ModuleKind::OscillatorSource => {
                        sources.oscillators.push(OscSource::compile(ci, position, module))
                    }
                    _ => {}
                }
            }
            let muted = set.mutes.get(ci).copied().unwrap_or(false);
            chains.push(CompiledChain::compile(modules, muted));
        }
        debug!(
            "compiled {} chains: {} plucked sources, {} oscillator sources",
            chains.len(),
            sources.plucked.len(),
            sources.oscillators.len()
        );
        RoutingGraph {
            chains,
            sources,
            sample_rate,
            block_size: block_size.max(1),
        }
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn chain(&self, chain: usize) -> Option<&CompiledChain> {
        self.chains.get(chain)
    }

    pub fn sources(&self) -> &SourceIndex {
        &self.sources
    }

    /// Whether output of `chain` reaches the bus of `channel`.
    pub fn chain_covers(&self, chain: usize, channel: u8) -> bool {
        self.chains.get(chain).is_some_and(|c| c.selector.covers(channel))
    }

    /// Mute or unmute; takes effect over the next block.
    pub fn set_mute(&mut self, chain: usize, muted: bool) -> bool {
        match self.chains.get_mut(chain) {
            Some(c) => {
                c.mute.set(muted);
                true
            }
            None => false,
        }
    }

    /// Apply a parameter to a module in every lane. Returns false when the
    /// change needs a recompile.
    pub fn set_param(&mut self, chain: usize, module_id: &str, key: &str, value: &Value) -> bool {
        let Some(c) = self.chains.get_mut(chain) else {
            return false;
        };
        let Some(index) = c.modules.iter().position(|m| m.id == module_id) else {
            return false;
        };
        let module = &mut c.modules[index];
        module.params.insert(key.to_string(), value.clone());
        if !module.enabled {
            return true;
        }
        if !Node::is_live_param(module.kind, key) {
            return false;
        }
        let mut applied = true;
        for lane in c.lanes.iter_mut().flatten() {
            applied &= lane.nodes[index].set_param(key, value);
        }
        applied
    }

    /// Chain and position of the source module `id`.
    pub fn locate_source(&self, id: &str) -> Option<(usize, usize)> {
        self.chains.iter().enumerate().find_map(|(ci, c)| {
            c.modules
                .iter()
                .position(|m| m.id == id && m.kind.is_source())
                .map(|pos| (ci, pos))
        })
    }

    /// Create the lane of `chain` for `channel` if it does not exist yet.
    pub fn ensure_lane(&mut self, chain: usize, channel: u8) -> bool {
        let (sample_rate, block_size) = (self.sample_rate, self.block_size);
        let Some(c) = self.chains.get_mut(chain) else {
            return false;
        };
        let Some(slot) = c.lanes.get_mut(channel as usize) else {
            return false;
        };
        if slot.is_none() {
            debug!("lane for chain {chain} channel {channel}");
            *slot = Some(Lane::new(&c.modules, sample_rate, block_size));
        }
        true
    }

    /// Input buffers for a voice entering `chain` at `position`.
    pub fn lane_input(
        &mut self,
        chain: usize,
        channel: u8,
        position: usize,
        frames: usize,
    ) -> Option<(&mut [f32], &mut [f32])> {
        self.chains
            .get_mut(chain)?
            .lanes
            .get_mut(channel as usize)?
            .as_mut()?
            .input(position, frames)
    }

    /// Run every lane and fan its output through the chain's mute gain into
    /// the matching mixer bus.
    pub fn process(&mut self, frames: usize, buses: &mut [MixerBus]) {
        for chain in &mut self.chains {
            let mute = chain.mute;
            for (ch, slot) in chain.lanes.iter_mut().enumerate() {
                let Some(lane) = slot else {
                    continue;
                };
                lane.run(frames);
                if !chain.selector.covers(ch as u8) {
                    continue;
                }
                let Some(bus) = buses.get_mut(ch) else {
                    continue;
                };
                let (bl, br) = bus.buffers_mut();
                for (i, ((dl, dr), (sl, sr))) in bl
                    .iter_mut()
                    .zip(br.iter_mut())
                    .zip(lane.left.iter().zip(lane.right.iter()))
                    .enumerate()
                {
                    let g = mute.at(i, frames);
                    *dl += sl * g;
                    *dr += sr * g;
                }
            }
            chain.mute.settle();
        }
    }

    /// First analyzer tap of `chain` on `channel`.
    pub fn analyzer(&self, chain: usize, channel: u8) -> Option<&AnalyzerRing> {
        self.chains
            .get(chain)?
            .lanes
            .get(channel as usize)?
            .as_ref()?
            .nodes
            .iter()
            .find_map(Node::analyzer)
    }
}

/// Note handling on top of a [`RoutingGraph`].
///
/// Voices live in per-channel registries owned here, outside the compiled
/// graph, so a rebuild never cuts off a sounding note.
#[derive(Debug)]
pub struct Router {
    graph: RoutingGraph,
    voices: Vec<VoiceRegistry>,
    next_id: u64,
    sample_rate: f64,
    block_size: usize,
}

impl Router {
    pub fn new(set: &ChainSet, sample_rate: f64, block_size: usize) -> Self {
        Router {
            graph: RoutingGraph::compile(set, sample_rate, block_size),
            voices: (0..CHANNELS).map(|_| VoiceRegistry::new()).collect(),
            next_id: 1,
            sample_rate,
            block_size,
        }
    }

    pub fn graph(&self) -> &RoutingGraph {
        &self.graph
    }

    /// Replace the compiled graph. Sounding voices keep playing: each is
    /// matched to its source module by id, so it follows the module if the
    /// chain moved and goes straight to its channel bus if the module is gone.
    /// Mutes and params come from `set`; edit them through
    /// [`Router::apply_mute`] and [`Router::apply_param`] so they survive.
    pub fn rebuild(&mut self, set: &ChainSet) {
        self.graph = RoutingGraph::compile(set, self.sample_rate, self.block_size);
        let graph = &mut self.graph;
        for (ch, registry) in self.voices.iter_mut().enumerate() {
            for voice in registry.iter_mut() {
                let Some(route) = &mut voice.route else {
                    continue;
                };
                match graph.locate_source(&route.source) {
                    Some((chain, position)) => {
                        route.chain = chain;
                        route.position = position;
                        graph.ensure_lane(chain, ch as u8);
                    }
                    None => voice.route = None,
                }
            }
        }
    }

    /// Edit a parameter in `set`, applying it live when possible and
    /// recompiling otherwise.
    pub fn apply_param(
        &mut self,
        set: &mut ChainSet,
        chain: usize,
        module: usize,
        key: &str,
        value: Value,
    ) -> Result<(), SynthError> {
        set.set_param(chain, module, key, value.clone())?;
        let id = set.chains[chain][module].id.clone();
        if !self.graph.set_param(chain, &id, key, &value) {
            self.rebuild(set);
        }
        Ok(())
    }

    /// Record a mute in `set` and apply it without recompiling.
    pub fn apply_mute(&mut self, set: &mut ChainSet, chain: usize, muted: bool) -> Result<(), SynthError> {
        set.set_mute(chain, muted)?;
        if !self.graph.set_mute(chain, muted) {
            self.rebuild(set);
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Start a note. Matching plucked sources all receive one shared render;
    /// with no match, oscillator sources on the channel sound instead.
    /// Returns the number of voices started.
    #[allow(clippy::too_many_arguments)]
    pub fn note_on<R: Rng + ?Sized>(
        &mut self,
        channel: u8,
        note: u8,
        velocity: u8,
        state: &ChannelState,
        config: &EngineConfig,
        detune_cents: f64,
        now: f64,
        rng: &mut R,
    ) -> usize {
        let ch = channel as usize;
        if ch >= CHANNELS {
            return 0;
        }
        self.voices[ch].retrigger(note, now);

        let plucks: Vec<PluckSource> = self
            .graph
            .sources
            .plucked
            .iter()
            .filter(|s| s.matches(channel, state.program) && self.graph.chain_covers(s.chain, channel))
            .cloned()
            .collect();

        let started = match plucks.first() {
            Some(first) => {
                let a4 = if first.use_synth_a4 { config.a4 } else { 440.0 };
                let frequency = midi_to_frequency(note as i32, a4);
                let damping = match first.smoothing {
                    Some(s) => s,
                    None => channel_smoothing(note, &state.options, rng),
                };
                let gain = velocity.min(127) as f64 / 127.0 * first.vel_scale;
                let buffer = Arc::new(pluck::render_note(
                    self.sample_rate,
                    frequency,
                    damping,
                    gain,
                    first.duration,
                    first.seed_noise,
                    &state.options,
                    rng,
                ));
                for src in &plucks {
                    let route = Route {
                        chain: src.chain,
                        position: src.position,
                        source: src.id.clone(),
                    };
                    let generator = Generator::Buffer(BufferPlayer::new(Arc::clone(&buffer)));
                    let id = self.next_id();
                    let voice = Voice::new(
                        id,
                        channel,
                        note,
                        velocity,
                        VoiceKind::Plucked,
                        generator,
                        now,
                        self.sample_rate,
                    )
                    .with_release(src.release)
                    .with_route(route);
                    self.start(voice, detune_cents, now);
                }
                plucks.len()
            }
            None => {
                let oscs: Vec<OscSource> = self
                    .graph
                    .sources
                    .oscillators
                    .iter()
                    .filter(|s| s.channel.covers(channel) && self.graph.chain_covers(s.chain, channel))
                    .cloned()
                    .collect();
                let frequency = config.note_frequency(note);
                for src in &oscs {
                    let a = src.adsr;
                    let osc = Oscillator::with_frequency(src.waveform, self.sample_rate, frequency);
                    let env = Envelope::with_adsr(self.sample_rate, a.attack, a.decay, a.sustain, a.release);
                    let generator = Generator::Oscillator(OscillatorVoice::new(osc, env));
                    let id = self.next_id();
                    let voice = Voice::new(
                        id,
                        channel,
                        note,
                        velocity,
                        VoiceKind::Oscillator,
                        generator,
                        now,
                        self.sample_rate,
                    )
                    .with_release(a.release)
                    .with_route(Route {
                        chain: src.chain,
                        position: src.position,
                        source: src.id.clone(),
                    });
                    self.start(voice, detune_cents, now);
                }
                oscs.len()
            }
        };
        if started == 0 {
            debug!("no source matches ch {channel} program {}", state.program);
        }
        started
    }

    fn start(&mut self, mut voice: Voice, detune_cents: f64, now: f64) {
        if let Some(route) = &voice.route {
            self.graph.ensure_lane(route.chain, voice.channel);
        }
        voice.set_detune(detune_cents, now);
        self.voices[voice.channel as usize].insert(voice);
    }

    pub fn note_off(&mut self, channel: u8, note: u8, sustain: bool, now: f64) {
        if let Some(registry) = self.voices.get_mut(channel as usize) {
            registry.note_off(note, sustain, now, 1.0, release_of);
        }
    }

    pub fn release_sustained(&mut self, channel: u8, now: f64) -> usize {
        self.voices
            .get_mut(channel as usize)
            .map_or(0, |r| r.release_sustained(now, 1.0, release_of))
    }

    pub fn set_detune(&mut self, channel: u8, cents: f64, now: f64) {
        if let Some(registry) = self.voices.get_mut(channel as usize) {
            registry.set_detune(cents, now);
        }
    }

    pub fn all_sound_off(&mut self, channel: u8, now: f64) {
        if let Some(registry) = self.voices.get_mut(channel as usize) {
            registry.all_sound_off(now);
        }
    }

    pub fn stop_voice(&mut self, channel: u8, id: u64, now: f64) -> bool {
        self.voices
            .get_mut(channel as usize)
            .is_some_and(|r| r.stop_voice(id, now))
    }

    pub fn eviction_candidate(&self) -> Option<&Voice> {
        self.voices
            .iter()
            .filter_map(VoiceRegistry::eviction_candidate)
            .min_by(|a, b| eviction_order(a, b))
    }

    /// Hand every voice over, unrouted, e.g. when the graph is detached.
    pub fn take_voices(&mut self) -> Vec<Voice> {
        self.voices
            .iter_mut()
            .flat_map(|r| r.drain())
            .map(|mut v| {
                v.route = None;
                v
            })
            .collect()
    }

    pub fn voices(&self) -> impl Iterator<Item = &Voice> {
        self.voices.iter().flat_map(VoiceRegistry::iter)
    }

    pub fn voice_count(&self) -> usize {
        self.voices.iter().map(VoiceRegistry::len).sum()
    }

    pub fn live_count(&self) -> usize {
        self.voices.iter().map(VoiceRegistry::live_count).sum()
    }

    pub fn prune_expired(&mut self, now: f64) -> usize {
        self.voices.iter_mut().map(|r| r.prune_expired(now)).sum()
    }

    /// Render `frames` samples into the channel buses: voices into their
    /// lanes (or straight onto the bus when unrouted), then the graph.
    pub fn render(&mut self, frames: usize, buses: &mut [MixerBus]) {
        let Router { graph, voices, .. } = self;
        for (ch, registry) in voices.iter_mut().enumerate() {
            for voice in registry.iter_mut() {
                let lane = match &voice.route {
                    Some(r) => graph.lane_input(r.chain, ch as u8, r.position, frames),
                    None => None,
                };
                match lane {
                    Some((l, r)) => voice.render_into(l, r),
                    None => {
                        if let Some(bus) = buses.get_mut(ch) {
                            let (l, r) = bus.buffers_mut();
                            let n = frames.min(l.len());
                            voice.render_into(&mut l[..n], &mut r[..n]);
                        }
                    }
                }
            }
            registry.remove_finished();
        }
        graph.process(frames, buses);
    }

    pub fn analyzer(&self, chain: usize, channel: u8) -> Option<&AnalyzerRing> {
        self.graph.analyzer(chain, channel)
    }
}

fn release_of(voice: &Voice) -> f64 {
    voice.release_hint.unwrap_or(Adsr::default().release)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::document::normalize;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    const SR: f64 = 44100.0;
    const BLOCK: usize = 128;

    fn buses() -> Vec<MixerBus> {
        (0..CHANNELS as u8).map(|c| MixerBus::new(c, BLOCK)).collect()
    }

    fn render(router: &mut Router, buses: &mut [MixerBus], blocks: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for _ in 0..blocks {
            for bus in buses.iter_mut() {
                bus.clear(BLOCK);
            }
            router.render(BLOCK, buses);
            let (l, _) = buses[3].buffers_mut();
            out.extend_from_slice(l);
        }
        out
    }

    fn energy(samples: &[f32]) -> f64 {
        samples.iter().map(|s| (*s as f64) * (*s as f64)).sum()
    }

    fn two_chain_doc(mute_b: bool) -> ChainSet {
        normalize(&json!({
            "chains": [
                [ { "kind": "ks_source", "params": { "ch": "all", "program": 0 } },
                  { "kind": "gain", "params": { "gain": 1.0 } } ],
                [ { "kind": "ks_source", "params": { "ch": 3, "program": 0 } },
                  { "kind": "gain", "params": { "gain": 1.0 } } ]
            ],
            "mutes": [false, mute_b]
        }))
        .expect("valid document")
    }

    fn osc_doc() -> ChainSet {
        normalize(&json!([
            [ { "kind": "source", "params": { "type": "sine", "ch": "all" } },
              { "kind": "gain", "params": { "gain": 1.0 } } ]
        ]))
        .expect("valid document")
    }

    #[test]
    fn selectors_parse() {
        assert_eq!(ChannelSelector::from_value(None), ChannelSelector::All);
        assert_eq!(ChannelSelector::from_value(Some(&json!("all"))), ChannelSelector::All);
        assert_eq!(ChannelSelector::from_value(Some(&json!(3))), ChannelSelector::Channel(3));
        assert_eq!(ChannelSelector::from_value(Some(&json!("7"))), ChannelSelector::Channel(7));
        assert_eq!(ChannelSelector::from_value(Some(&json!(16))), ChannelSelector::All);
        assert_eq!(ProgramSelector::from_value(None), ProgramSelector::Program(0));
        assert_eq!(ProgramSelector::from_value(Some(&json!("all"))), ProgramSelector::All);
        let c = ChannelSelector::from_value(Some(&json!(2)));
        let p = ProgramSelector::from_value(Some(&json!(24)));
        assert!(c.covers(2) && !c.covers(3));
        assert!(p.matches(24) && !p.matches(0));
    }

    #[test]
    fn compile_indexes_enabled_sources() {
        let set = normalize(&json!([
            [ { "kind": "ks_source", "params": { "ch": 1 } }, { "kind": "gain" } ],
            [ { "kind": "source", "enabled": false }, { "kind": "source", "params": { "type": "square" } } ]
        ]))
        .expect("valid document");
        let graph = RoutingGraph::compile(&set, SR, BLOCK);
        assert_eq!(graph.sources().plucked.len(), 1);
        assert_eq!(graph.sources().oscillators.len(), 1, "Disabled sources are not indexed");
        assert_eq!(graph.sources().oscillators[0].position, 1);
        assert_eq!(graph.sources().oscillators[0].waveform, Waveform::Square);
        assert_eq!(graph.chain(0).map(|c| c.selector), Some(ChannelSelector::Channel(1)));
        assert!(graph.chain_covers(1, 15));
    }

    #[test]
    fn fan_out_sums_both_matching_chains() {
        let mut both = Router::new(&two_chain_doc(false), SR, BLOCK);
        let mut only_a = Router::new(&two_chain_doc(true), SR, BLOCK);
        let config = EngineConfig::default();
        let state = ChannelState::default();

        let n = both.note_on(3, 60, 100, &state, &config, 0.0, 0.0, &mut StdRng::seed_from_u64(9));
        assert_eq!(n, 2, "Should start one voice per matching chain, got {n}");
        only_a.note_on(3, 60, 100, &state, &config, 0.0, 0.0, &mut StdRng::seed_from_u64(9));

        let mut b1 = buses();
        let mut b2 = buses();
        let sum = render(&mut both, &mut b1, 20);
        let single = render(&mut only_a, &mut b2, 20);
        assert!(energy(&single) > 0.0, "Chain A alone should be audible");
        for (s, a) in sum.iter().zip(&single) {
            assert!((s - 2.0 * a).abs() < 1e-6, "Should sum both chains, got {s} vs 2*{a}");
        }
    }

    #[test]
    fn channel_specific_chain_ignores_other_channels() {
        let mut router = Router::new(&two_chain_doc(false), SR, BLOCK);
        let n = router.note_on(
            5,
            60,
            100,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        assert_eq!(n, 1, "Only the \"all\" chain should match channel 5, got {n}");
    }

    #[test]
    fn no_match_is_silent() {
        let set = normalize(&json!([[ { "kind": "ks_source", "params": { "ch": 5 } } ]]))
            .expect("valid document");
        let mut router = Router::new(&set, SR, BLOCK);
        let n = router.note_on(
            2,
            60,
            100,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        assert_eq!(n, 0, "Should not fall back to a built-in oscillator");
        let mut b = buses();
        render(&mut router, &mut b, 2);
        assert!(b.iter().all(MixerBus::is_silent));
    }

    #[test]
    fn program_mismatch_falls_back_to_oscillator() {
        let set = normalize(&json!([
            [ { "kind": "ks_source", "params": { "program": 24 } } ],
            [ { "kind": "source", "params": { "ch": "all" } } ]
        ]))
        .expect("valid document");
        let mut router = Router::new(&set, SR, BLOCK);
        let n = router.note_on(
            0,
            60,
            100,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        assert_eq!(n, 1);
        assert!(router.voices().all(|v| v.kind == VoiceKind::Oscillator));
    }

    #[test]
    fn mute_applies_within_a_block_without_rebuild() {
        let mut set = osc_doc();
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        let before = render(&mut router, &mut b, 4);
        assert!(energy(&before) > 0.0);

        router.apply_mute(&mut set, 0, true).expect("chain exists");
        render(&mut router, &mut b, 1);
        let after = render(&mut router, &mut b, 2);
        assert_eq!(energy(&after), 0.0, "Muted chain should be silent after one block");
        assert_eq!(router.voice_count(), 1, "Mute must not stop the voice");

        router.apply_mute(&mut set, 0, false).expect("chain exists");
        render(&mut router, &mut b, 1);
        assert!(energy(&render(&mut router, &mut b, 2)) > 0.0);
    }

    #[test]
    fn rebuild_keeps_sounding_voices() {
        let set = osc_doc();
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        render(&mut router, &mut b, 2);
        router.rebuild(&set);
        assert_eq!(router.voice_count(), 1, "Rebuild must not drop voices");
        assert_eq!(router.graph().chain(0).map(CompiledChain::lane_count), Some(1));
        assert!(energy(&render(&mut router, &mut b, 2)) > 0.0);

        router.rebuild(&ChainSet {
            chains: vec![vec![]],
            ..ChainSet::default()
        });
        assert!(router.voices().all(|v| v.route.is_none()), "Stale routes go to the bus");
        assert!(energy(&render(&mut router, &mut b, 2)) > 0.0);
    }

    #[test]
    fn live_gain_change_needs_no_rebuild() {
        let mut set = osc_doc();
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        render(&mut router, &mut b, 2);
        let lanes_before = router.graph().chain(0).map(CompiledChain::lane_count);
        router
            .apply_param(&mut set, 0, 1, "gain", json!(0.0))
            .expect("unlocked chain");
        assert_eq!(energy(&render(&mut router, &mut b, 2)), 0.0);
        assert_eq!(set.chains[0][1].param_f64("gain", 1.0), 0.0);
        assert_eq!(router.graph().chain(0).map(CompiledChain::lane_count), lanes_before);

        // Survives a recompile because the document carries it.
        router.rebuild(&set);
        assert_eq!(energy(&render(&mut router, &mut b, 2)), 0.0);
    }

    #[test]
    fn mute_survives_rebuild() {
        let mut set = osc_doc();
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        render(&mut router, &mut b, 2);
        router.apply_mute(&mut set, 0, true).expect("chain exists");
        router.rebuild(&set);
        assert!(router.graph().chain(0).is_some_and(CompiledChain::is_muted));
        assert_eq!(energy(&render(&mut router, &mut b, 2)), 0.0, "Should stay muted after rebuild");
        assert_eq!(router.voice_count(), 1);
    }

    #[test]
    fn rebuild_follows_moved_source_by_id() {
        let mut set = two_chain_doc(false);
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            60,
            100,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(2),
        );
        let chain_b_source = set.chains[1][0].id.clone();
        assert_eq!(router.voice_count(), 2);

        // Dropping chain A shifts chain B to index 0.
        set.delete_chain(0).expect("unlocked chain");
        router.rebuild(&set);
        let routes: Vec<Option<Route>> = router.voices().map(|v| v.route.clone()).collect();
        assert!(
            routes.contains(&Some(Route {
                chain: 0,
                position: 0,
                source: chain_b_source,
            })),
            "Chain B voice should follow its source, got {routes:?}"
        );
        assert!(routes.contains(&None), "Chain A voice should go straight to the bus");
    }

    #[test]
    fn note_off_releases_routed_oscillator() {
        let mut router = Router::new(&osc_doc(), SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        render(&mut router, &mut b, 2);
        router.note_off(3, 69, true, 0.01);
        assert!(router.voices().all(|v| v.state == crate::synth::voice::VoiceState::SustainFlagged));
        assert_eq!(router.release_sustained(3, 0.02), 1);
        // 0.2 s release at 128 frames per block.
        render(&mut router, &mut b, 120);
        assert_eq!(router.voice_count(), 0, "Voice should leave after its release");
    }

    #[test]
    fn analyzer_tap_sees_lane_signal() {
        let set = normalize(&json!([[ { "kind": "source" }, { "kind": "analyzer" } ]]))
            .expect("valid document");
        let mut router = Router::new(&set, SR, BLOCK);
        router.note_on(
            3,
            69,
            127,
            &ChannelState::default(),
            &EngineConfig::default(),
            0.0,
            0.0,
            &mut StdRng::seed_from_u64(1),
        );
        let mut b = buses();
        render(&mut router, &mut b, 4);
        let ring = router.analyzer(0, 3).expect("lane analyzer");
        assert!(ring.rms() > 0.0, "Analyzer should record the voice");
        assert!(router.analyzer(0, 4).is_none());
    }
}
