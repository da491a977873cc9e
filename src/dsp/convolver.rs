//! Uniformly partitioned FFT convolver for the routing `convolver` module.
//!
//! The impulse response is cut into [`BLOCK`]-sized partitions whose spectra
//! are multiplied against a frequency-domain delay line of past input
//! blocks (overlap-save). Output lags the input by one block.

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

/// Partition and processing block size in samples.
pub const BLOCK: usize = 128;
const FFT_SIZE: usize = BLOCK * 2;

/// Identifier of the built-in guitar body response.
pub const DEFAULT_IR: &str = "IR_Gibson";

/// Synthesized acoustic guitar body response: a direct click followed by
/// damped body and top-plate modes, scaled to unit energy.
pub fn body_impulse(sample_rate: f64) -> Vec<f32> {
    // (frequency Hz, decay seconds, amplitude)
    const MODES: [(f64, f64, f64); 6] = [
        (98.0, 0.060, 1.0),
        (204.0, 0.050, 0.8),
        (390.0, 0.030, 0.5),
        (560.0, 0.025, 0.35),
        (1100.0, 0.012, 0.2),
        (2400.0, 0.006, 0.12),
    ];
    let len = (0.12 * sample_rate).round().max(1.0) as usize;
    let mut ir: Vec<f64> = (0..len)
        .map(|i| {
            let t = i as f64 / sample_rate;
            MODES
                .iter()
                .map(|&(f, tau, a)| a * (-t / tau).exp() * (2.0 * PI * f * t).sin())
                .sum::<f64>()
                * 0.05
        })
        .collect();
    ir[0] += 1.0;
    let energy = ir.iter().map(|x| x * x).sum::<f64>().sqrt();
    ir.iter().map(|x| (x / energy) as f32).collect()
}

/// Look up a named impulse response.
pub fn impulse_by_id(id: &str, sample_rate: f64) -> Option<Vec<f32>> {
    match id {
        DEFAULT_IR => Some(body_impulse(sample_rate)),
        _ => None,
    }
}

#[derive(Clone)]
struct Lane {
    /// Previous and current input block, time domain.
    window: Vec<f32>,
    /// Spectra of recent input blocks, newest at `head`.
    history: Vec<Vec<Complex32>>,
    head: usize,
    output: Vec<f32>,
}

impl Lane {
    fn new(partitions: usize) -> Self {
        Lane {
            window: vec![0.0; FFT_SIZE],
            history: vec![vec![Complex32::new(0.0, 0.0); FFT_SIZE]; partitions],
            head: 0,
            output: vec![0.0; BLOCK],
        }
    }
}

pub struct Convolver {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    partitions: Arc<Vec<Vec<Complex32>>>,
    lanes: [Lane; 2],
    spectrum: Vec<Complex32>,
    accum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    pos: usize,
    mix: f32,
}

impl std::fmt::Debug for Convolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolver")
            .field("partitions", &self.partitions.len())
            .field("mix", &self.mix)
            .finish()
    }
}

impl Convolver {
    pub fn new(impulse: &[f32], mix: f64) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        let mut scratch = vec![Complex32::new(0.0, 0.0); scratch_len];

        let impulse: &[f32] = if impulse.is_empty() { &[1.0] } else { impulse };
        let partitions: Vec<Vec<Complex32>> = impulse
            .chunks(BLOCK)
            .map(|part| {
                let mut buf = vec![Complex32::new(0.0, 0.0); FFT_SIZE];
                for (dst, &src) in buf.iter_mut().zip(part) {
                    dst.re = src;
                }
                forward.process_with_scratch(&mut buf, &mut scratch);
                buf
            })
            .collect();
        let count = partitions.len();

        Convolver {
            forward,
            inverse,
            partitions: Arc::new(partitions),
            lanes: [Lane::new(count), Lane::new(count)],
            spectrum: vec![Complex32::new(0.0, 0.0); FFT_SIZE],
            accum: vec![Complex32::new(0.0, 0.0); FFT_SIZE],
            scratch,
            pos: 0,
            mix: mix.clamp(0.0, 1.0) as f32,
        }
    }

    pub fn set_mix(&mut self, mix: f64) {
        self.mix = mix.clamp(0.0, 1.0) as f32;
    }

    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let wet_l = self.lanes[0].output[self.pos];
        let wet_r = self.lanes[1].output[self.pos];
        self.lanes[0].window[BLOCK + self.pos] = left;
        self.lanes[1].window[BLOCK + self.pos] = right;
        self.pos += 1;
        if self.pos == BLOCK {
            self.pos = 0;
            for lane in 0..2 {
                self.run_block(lane);
            }
        }
        let dry = 1.0 - self.mix;
        (left * dry + wet_l * self.mix, right * dry + wet_r * self.mix)
    }

    fn run_block(&mut self, index: usize) {
        let lane = &mut self.lanes[index];
        let count = self.partitions.len();

        for (dst, &src) in self.spectrum.iter_mut().zip(&lane.window) {
            *dst = Complex32::new(src, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
        lane.history[lane.head].copy_from_slice(&self.spectrum);

        self.accum.fill(Complex32::new(0.0, 0.0));
        for (k, part) in self.partitions.iter().enumerate() {
            let past = &lane.history[(lane.head + count - k) % count];
            for ((acc, x), h) in self.accum.iter_mut().zip(past).zip(part) {
                *acc += x * h;
            }
        }
        lane.head = (lane.head + 1) % count;

        self.inverse
            .process_with_scratch(&mut self.accum, &mut self.scratch);
        let scale = 1.0 / FFT_SIZE as f32;
        for (out, bin) in lane.output.iter_mut().zip(&self.accum[BLOCK..]) {
            *out = bin.re * scale;
        }
        lane.window.copy_within(BLOCK.., 0);
    }
}
