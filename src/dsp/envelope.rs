//! Envelopes — linear ADSR, stop fades, and the release-control mapping.

/// Map a release control in [0, 1] onto `[min, max]` seconds.
///
/// Quadratic, so most of the control range gives short releases.
pub fn release_time(min: f64, max: f64, control: f64) -> f64 {
    let c = control.clamp(0.0, 1.0);
    min + (max - min) * c * c
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// ADSR envelope with linear segments.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Attack time in seconds.
    pub attack: f64,
    /// Decay time in seconds.
    pub decay: f64,
    /// Sustain level [0, 1].
    pub sustain: f64,
    /// Release time in seconds.
    pub release: f64,

    stage: Stage,
    level: f64,
    sample_rate: f64,
    stage_samples: usize,
    stage_counter: usize,
    /// Level when the current stage began.
    start_level: f64,
}

impl Envelope {
    pub fn new(sample_rate: f64) -> Self {
        Self::with_adsr(sample_rate, 0.01, 0.1, 0.7, 0.3)
    }

    pub fn with_adsr(sample_rate: f64, attack: f64, decay: f64, sustain: f64, release: f64) -> Self {
        Envelope {
            attack: attack.max(0.0),
            decay: decay.max(0.0),
            sustain: sustain.clamp(0.0, 1.0),
            release: release.max(0.0),
            stage: Stage::Idle,
            level: 0.0,
            sample_rate,
            stage_samples: 0,
            stage_counter: 0,
            start_level: 0.0,
        }
    }

    /// Note on; retriggers from the current level.
    pub fn gate_on(&mut self) {
        self.enter(Stage::Attack, self.attack);
    }

    /// Note off with the configured release.
    pub fn gate_off(&mut self) {
        self.gate_off_with(self.release);
    }

    /// Note off with an explicit release time.
    pub fn gate_off_with(&mut self, release: f64) {
        if self.stage == Stage::Idle {
            return;
        }
        self.enter(Stage::Release, release.max(0.0));
    }

    /// Next envelope value in [0, 1].
    pub fn next_sample(&mut self) -> f64 {
        let t = if self.stage_samples == 0 {
            1.0
        } else {
            self.stage_counter as f64 / self.stage_samples as f64
        };
        match self.stage {
            Stage::Idle => self.level = 0.0,
            Stage::Sustain => self.level = self.sustain,
            Stage::Attack => {
                self.level = self.start_level + (1.0 - self.start_level) * t;
                if self.advance() {
                    self.level = 1.0;
                    self.enter(Stage::Decay, self.decay);
                }
            }
            Stage::Decay => {
                self.level = self.start_level - (self.start_level - self.sustain) * t;
                if self.advance() {
                    self.level = self.sustain;
                    self.stage = Stage::Sustain;
                }
            }
            Stage::Release => {
                self.level = self.start_level * (1.0 - t);
                if self.advance() {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
        }
        self.level
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    /// Idle after release.
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Idle
    }

    fn enter(&mut self, stage: Stage, seconds: f64) {
        self.stage = stage;
        self.stage_samples = (seconds * self.sample_rate) as usize;
        self.stage_counter = 0;
        self.start_level = self.level;
    }

    /// Step the stage counter; true when the stage is complete.
    fn advance(&mut self) -> bool {
        self.stage_counter += 1;
        self.stage_counter >= self.stage_samples
    }
}

/// A one-shot linear fade to silence, used to stop generators without clicks.
#[derive(Debug, Clone, PartialEq)]
pub struct Fade {
    level: f64,
    step: f64,
    active: bool,
}

impl Default for Fade {
    fn default() -> Self {
        Fade {
            level: 1.0,
            step: 0.0,
            active: false,
        }
    }
}

impl Fade {
    /// Begin fading from the current level over `seconds`. A shorter fade
    /// already in progress is kept.
    pub fn start(&mut self, seconds: f64, sample_rate: f64) {
        let samples = (seconds * sample_rate).max(1.0);
        let step = self.level / samples;
        if !self.active || step > self.step {
            self.step = step;
            self.active = true;
        }
    }

    #[inline]
    pub fn next_gain(&mut self) -> f64 {
        if self.active {
            self.level -= self.step;
            if self.level < self.step * 0.5 {
                self.level = 0.0;
            }
        }
        self.level
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_silent(&self) -> bool {
        self.active && self.level <= 0.0
    }
}
