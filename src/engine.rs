//! Audio engine — real-time runner feeding an output sink.
//!
//! Control messages arrive over a crossbeam channel and are applied between
//! blocks; rendered blocks are pushed into an [`OutputSink`]. While the sink is
//! unavailable the engine keeps applying messages but renders nothing, so no
//! voice time passes until the device comes back.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use log::{debug, info, warn};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::SynthError;
use crate::routing::ChainSet;
use crate::synth::SynthCore;
use crate::synth::channel::SynthOptions;

/// Upper bound on control messages applied between two blocks.
pub const MAX_MESSAGES_PER_BLOCK: usize = 64;

#[derive(Debug, Clone)]
pub enum EngineMsg {
    /// Raw three-byte MIDI message.
    Midi { status: u8, data1: u8, data2: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// Program including the special additive/bowed values.
    SetProgram { channel: u8, program: i32 },
    SetOptions { channel: u8, options: SynthOptions },
    AttachRouting(ChainSet),
    DetachRouting,
    /// Replace the routing document after a structural edit.
    Rebuild(ChainSet),
    SetMute { chain: usize, muted: bool },
    SetParam { chain: usize, module: usize, key: String, value: Value },
    Reset,
    Quit,
}

/// Destination for rendered stereo blocks.
pub trait OutputSink {
    fn is_available(&self) -> bool;
    fn write_block(&mut self, left: &[f32], right: &[f32]) -> Result<(), SynthError>;
}

/// Sink that keeps everything written to it. Used for offline capture.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub available: bool,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            available: true,
            ..Default::default()
        }
    }
}

impl OutputSink for MemorySink {
    fn is_available(&self) -> bool {
        self.available
    }

    fn write_block(&mut self, left: &[f32], right: &[f32]) -> Result<(), SynthError> {
        self.left.extend_from_slice(left);
        self.right.extend_from_slice(right);
        Ok(())
    }
}

pub struct AudioEngine {
    tx: Sender<EngineMsg>,
    rx: Receiver<EngineMsg>,
    synth: SynthCore,
    chains: Option<ChainSet>,
    left: Vec<f32>,
    right: Vec<f32>,
    sink_available: bool,
    quit: bool,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_synth(SynthCore::new(config))
    }

    pub fn with_synth(synth: SynthCore) -> Self {
        let (tx, rx) = unbounded();
        let block = synth.config().block_size.max(1);
        AudioEngine {
            tx,
            rx,
            synth,
            chains: None,
            left: vec![0.0; block],
            right: vec![0.0; block],
            sink_available: true,
            quit: false,
        }
    }

    /// Handle for the control thread.
    pub fn sender(&self) -> Sender<EngineMsg> {
        self.tx.clone()
    }

    pub fn synth(&self) -> &SynthCore {
        &self.synth
    }

    /// The routing document as last applied, if routing is attached.
    pub fn chains(&self) -> Option<&ChainSet> {
        self.chains.as_ref()
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Apply up to [`MAX_MESSAGES_PER_BLOCK`] pending messages. Returns how
    /// many were applied.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while applied < MAX_MESSAGES_PER_BLOCK && !self.quit {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.apply_logged(msg);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        applied
    }

    fn apply_logged(&mut self, msg: EngineMsg) {
        if let Err(e) = self.apply(msg) {
            warn!("control message rejected: {e}");
        }
    }

    /// Apply one message to synth state.
    pub fn apply(&mut self, msg: EngineMsg) -> Result<(), SynthError> {
        match msg {
            EngineMsg::Midi { status, data1, data2 } => self.synth.handle_midi(status, data1, data2),
            EngineMsg::NoteOn { channel, note, velocity } => self.synth.note_on(channel, note, velocity),
            EngineMsg::NoteOff { channel, note } => self.synth.note_off(channel, note),
            EngineMsg::ControlChange { channel, controller, value } => {
                self.synth.control_change(channel, controller, value)
            }
            EngineMsg::SetProgram { channel, program } => self.synth.set_program(channel, program),
            EngineMsg::SetOptions { channel, options } => self.synth.set_options(channel, options),
            EngineMsg::AttachRouting(set) => {
                self.synth.attach_routing(&set);
                self.chains = Some(set);
                Ok(())
            }
            EngineMsg::DetachRouting => {
                self.synth.detach_routing();
                self.chains = None;
                Ok(())
            }
            EngineMsg::Rebuild(set) => {
                match self.synth.router_mut() {
                    Some(router) => router.rebuild(&set),
                    None => self.synth.attach_routing(&set),
                }
                self.chains = Some(set);
                Ok(())
            }
            EngineMsg::SetMute { chain, muted } => {
                let (Some(router), Some(set)) = (self.synth.router_mut(), self.chains.as_mut()) else {
                    debug!("mute for chain {chain} ignored, no routing attached");
                    return Ok(());
                };
                router.apply_mute(set, chain, muted)
            }
            EngineMsg::SetParam { chain, module, key, value } => {
                let (Some(router), Some(set)) = (self.synth.router_mut(), self.chains.as_mut()) else {
                    debug!("param {key} for chain {chain} ignored, no routing attached");
                    return Ok(());
                };
                router.apply_param(set, chain, module, &key, value)
            }
            EngineMsg::Reset => {
                self.synth.reset();
                Ok(())
            }
            EngineMsg::Quit => {
                self.quit = true;
                Ok(())
            }
        }
    }

    /// Render one block into `sink`. Returns false when the sink was
    /// unavailable and nothing was rendered.
    pub fn process(&mut self, sink: &mut dyn OutputSink) -> Result<bool, SynthError> {
        let available = sink.is_available();
        if available != self.sink_available {
            self.sink_available = available;
            if available {
                info!("output sink available, resuming at {:.3}s", self.synth.now());
            } else {
                info!("output sink unavailable, deferring rendering");
            }
        }
        if !available {
            return Ok(false);
        }
        self.synth.render_block(&mut self.left, &mut self.right);
        sink.write_block(&self.left, &self.right)?;
        Ok(true)
    }

    /// Drain and render until a [`EngineMsg::Quit`] arrives.
    pub fn run(&mut self, sink: &mut dyn OutputSink) -> Result<(), SynthError> {
        let block_time = Duration::from_secs_f64(self.left.len() as f64 / self.synth.sample_rate());
        info!(
            "engine started: {} Hz, {} frame blocks",
            self.synth.sample_rate(),
            self.left.len()
        );
        loop {
            self.drain();
            if self.quit {
                break;
            }
            if !self.process(sink)? {
                // Park until a message arrives or it is time to poll the sink again.
                match self.rx.recv_timeout(block_time) {
                    Ok(msg) => self.apply_logged(msg),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        info!("engine stopped at {:.3}s", self.synth.now());
        Ok(())
    }
}

// ── Device output ─────────────────────────────────────────────────────────

#[cfg(feature = "device")]
pub use device::CpalSink;

#[cfg(feature = "device")]
mod device {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
    use log::{info, warn};

    use super::OutputSink;
    use crate::error::SynthError;

    /// Blocks queued ahead of the device callback.
    const QUEUE_DEPTH: usize = 4;

    /// Default output device. Writes block once the queue is full, which paces
    /// the render loop to the device clock.
    pub struct CpalSink {
        _stream: cpal::Stream,
        tx: Sender<Vec<f32>>,
        healthy: Arc<AtomicBool>,
        sample_rate: u32,
    }

    impl CpalSink {
        pub fn open_default() -> Result<Self, SynthError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| SynthError::SinkUnavailable("no default output device".into()))?;
            let supported = device
                .default_output_config()
                .map_err(|e| SynthError::SinkUnavailable(e.to_string()))?;
            if supported.sample_format() != cpal::SampleFormat::F32 {
                return Err(SynthError::SinkUnavailable(format!(
                    "unsupported sample format {:?}",
                    supported.sample_format()
                )));
            }
            let config: cpal::StreamConfig = supported.into();
            let channels = config.channels as usize;
            let sample_rate = config.sample_rate.0;

            let (tx, rx) = bounded::<Vec<f32>>(QUEUE_DEPTH);
            let healthy = Arc::new(AtomicBool::new(true));
            let flag = healthy.clone();
            let mut feed = Feed::new(rx);

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feed.fill(data, channels),
                    move |err| {
                        warn!("output stream error: {err}");
                        flag.store(false, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| SynthError::SinkUnavailable(e.to_string()))?;
            stream
                .play()
                .map_err(|e| SynthError::SinkUnavailable(e.to_string()))?;
            info!(
                "output device {:?}: {} Hz, {} channels",
                device.name().unwrap_or_default(),
                sample_rate,
                channels
            );
            Ok(CpalSink {
                _stream: stream,
                tx,
                healthy,
                sample_rate,
            })
        }

        pub fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
    }

    impl OutputSink for CpalSink {
        fn is_available(&self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        fn write_block(&mut self, left: &[f32], right: &[f32]) -> Result<(), SynthError> {
            let block: Vec<f32> = left.iter().zip(right).flat_map(|(&l, &r)| [l, r]).collect();
            self.tx
                .send(block)
                .map_err(|_| SynthError::SinkUnavailable("output stream closed".into()))
        }
    }

    /// Callback side: replays queued stereo blocks onto the device layout.
    struct Feed {
        rx: Receiver<Vec<f32>>,
        current: Vec<f32>,
        pos: usize,
    }

    impl Feed {
        fn new(rx: Receiver<Vec<f32>>) -> Self {
            Feed {
                rx,
                current: Vec::new(),
                pos: 0,
            }
        }

        fn next_frame(&mut self) -> (f32, f32) {
            if self.pos + 1 >= self.current.len() {
                match self.rx.try_recv() {
                    Ok(block) => {
                        self.current = block;
                        self.pos = 0;
                    }
                    // Underrun plays silence.
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return (0.0, 0.0),
                }
                if self.current.len() < 2 {
                    return (0.0, 0.0);
                }
            }
            let frame = (self.current[self.pos], self.current[self.pos + 1]);
            self.pos += 2;
            frame
        }

        fn fill(&mut self, data: &mut [f32], channels: usize) {
            for frame in data.chunks_mut(channels.max(1)) {
                let (l, r) = self.next_frame();
                match frame {
                    [mono] => *mono = (l + r) * 0.5,
                    [fl, fr, rest @ ..] => {
                        *fl = l;
                        *fr = r;
                        rest.iter_mut().for_each(|s| *s = 0.0);
                    }
                    [] => {}
                }
            }
        }
    }
}
