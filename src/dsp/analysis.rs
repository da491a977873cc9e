//! Signal analysis — period detection and an analyzer tap ring.
//!
//! Period detection follows YIN: difference function, cumulative mean
//! normalization, absolute threshold, parabolic refinement.

/// Result of period detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz (0 when nothing was found).
    pub frequency: f64,
    /// Fundamental period in samples (fractional).
    pub period: f64,
    /// In [0, 1]; higher is more periodic.
    pub confidence: f64,
}

impl PitchEstimate {
    const NONE: PitchEstimate = PitchEstimate {
        frequency: 0.0,
        period: 0.0,
        confidence: 0.0,
    };

    /// Too aperiodic to call a pitch.
    pub fn is_noise(&self) -> bool {
        self.confidence < 0.5
    }

    /// Nearest MIDI note and the offset from it in cents, under `a4` tuning.
    pub fn midi_note(&self, a4: f64) -> Option<(u8, f64)> {
        if self.frequency <= 0.0 {
            return None;
        }
        let exact = 69.0 + 12.0 * (self.frequency / a4).log2();
        let nearest = exact.round();
        Some((nearest.clamp(0.0, 127.0) as u8, (exact - nearest) * 100.0))
    }
}

/// Estimate the fundamental of a mono buffer, searching `min_freq..=max_freq`.
pub fn detect_pitch(samples: &[f64], sample_rate: f64, min_freq: f64, max_freq: f64) -> PitchEstimate {
    if samples.is_empty() || min_freq <= 0.0 || max_freq <= min_freq {
        return PitchEstimate::NONE;
    }
    let min_lag = (sample_rate / max_freq).ceil().max(1.0) as usize;
    let max_lag = (sample_rate / min_freq).floor() as usize;
    if samples.len() < max_lag * 2 {
        return PitchEstimate::NONE;
    }
    let window = max_lag;

    let mut cmnd = vec![1.0f64; window + 1];
    let mut running = 0.0;
    for tau in 1..=window {
        let d: f64 = (0..window)
            .map(|j| {
                let x = samples[j] - samples[j + tau];
                x * x
            })
            .sum();
        running += d;
        if running > 0.0 {
            cmnd[tau] = d * tau as f64 / running;
        }
    }

    const THRESHOLD: f64 = 0.15;
    let mut best = (min_lag..=window).find(|&tau| cmnd[tau] < THRESHOLD).map(|mut tau| {
        while tau < window && cmnd[tau + 1] < cmnd[tau] {
            tau += 1;
        }
        tau
    });
    if best.is_none() {
        best = (min_lag..=window).min_by(|&a, &b| cmnd[a].total_cmp(&cmnd[b]));
    }
    let Some(tau) = best else {
        return PitchEstimate::NONE;
    };

    let refined = if tau > 1 && tau < window {
        let (a, b, c) = (cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() > 1e-12 {
            tau as f64 + 0.5 * (a - c) / denom
        } else {
            tau as f64
        }
    } else {
        tau as f64
    };

    PitchEstimate {
        frequency: sample_rate / refined,
        period: refined,
        confidence: (1.0 - cmnd[tau]).clamp(0.0, 1.0),
    }
}

/// Ring of the most recent mono samples passing through a tap.
#[derive(Debug, Clone)]
pub struct AnalyzerRing {
    buffer: Vec<f32>,
    write: usize,
    filled: bool,
}

impl AnalyzerRing {
    pub const DEFAULT_SIZE: usize = 2048;

    pub fn new(size: usize) -> Self {
        AnalyzerRing {
            buffer: vec![0.0; size.max(1)],
            write: 0,
            filled: false,
        }
    }

    #[inline]
    pub fn push(&mut self, sample: f32) {
        self.buffer[self.write] = sample;
        self.write += 1;
        if self.write == self.buffer.len() {
            self.write = 0;
            self.filled = true;
        }
    }

    /// Samples in arrival order, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        if !self.filled {
            return self.buffer[..self.write].to_vec();
        }
        let mut out = Vec::with_capacity(self.buffer.len());
        out.extend_from_slice(&self.buffer[self.write..]);
        out.extend_from_slice(&self.buffer[..self.write]);
        out
    }

    /// Root-mean-square level of the current contents.
    pub fn rms(&self) -> f64 {
        let snap = self.snapshot();
        if snap.is_empty() {
            return 0.0;
        }
        (snap.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / snap.len() as f64).sqrt()
    }

    pub fn estimate_frequency(&self, sample_rate: f64) -> PitchEstimate {
        let snap: Vec<f64> = self.snapshot().iter().map(|&s| s as f64).collect();
        detect_pitch(&snap, sample_rate, 50.0, 2000.0)
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write = 0;
        self.filled = false;
    }
}
