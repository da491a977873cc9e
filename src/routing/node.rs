//! Processing units instantiated from chain modules.
//!
//! Sources and disabled modules compile to [`Node::Pass`]; voices are injected
//! at a source's position by the graph instead.

use log::warn;
use serde_json::Value;

use crate::dsp::analysis::AnalyzerRing;
use crate::dsp::convolver::{self, Convolver};
use crate::dsp::delay::Delay;
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::reverb::Reverb;
use crate::routing::document::{ModuleDoc, ModuleKind, value_f64};

#[derive(Debug)]
pub enum Node {
    Pass,
    Gain(f32),
    Filter {
        left: BiquadFilter,
        right: BiquadFilter,
    },
    Delay(Delay),
    Reverb(Reverb),
    Convolver(Box<Convolver>),
    Analyzer(AnalyzerRing),
}

impl Node {
    pub fn build(module: &ModuleDoc, sample_rate: f64) -> Node {
        if !module.enabled {
            return Node::Pass;
        }
        match module.kind {
            ModuleKind::PluckedSource | ModuleKind::OscillatorSource => Node::Pass,
            ModuleKind::Gain => Node::Gain(module.param_f64("gain", 1.0) as f32),
            ModuleKind::Filter => {
                let mode = module.param_str("mode", "lowpass");
                let kind = FilterType::from_name(mode).unwrap_or_else(|| {
                    warn!("unknown filter mode {mode:?} on {}, using lowpass", module.id);
                    FilterType::Lowpass
                });
                let freq = module.param_f64("freq", 1200.0);
                let q = module.param_f64("q", 0.7);
                Node::Filter {
                    left: BiquadFilter::with_params(kind, sample_rate, freq, q),
                    right: BiquadFilter::with_params(kind, sample_rate, freq, q),
                }
            }
            ModuleKind::Delay => Node::Delay(Delay::with_params(
                sample_rate,
                module.param_f64("time", 0.25),
                module.param_f64("feedback", 0.35),
                module.param_f64("mix", 0.3),
            )),
            ModuleKind::Reverb => Node::Reverb(Reverb::with_params(
                sample_rate,
                module.param_f64("decay", 2.0),
                module.param_f64("mix", 0.25),
            )),
            ModuleKind::Convolver => {
                let ir_id = module.param_str("irId", convolver::DEFAULT_IR);
                let impulse = convolver::impulse_by_id(ir_id, sample_rate).unwrap_or_else(|| {
                    warn!("unknown impulse response {ir_id:?}, using {}", convolver::DEFAULT_IR);
                    convolver::body_impulse(sample_rate)
                });
                Node::Convolver(Box::new(Convolver::new(
                    &impulse,
                    module.param_f64("mix", 0.3),
                )))
            }
            ModuleKind::AnalyzerTap => Node::Analyzer(AnalyzerRing::new(AnalyzerRing::DEFAULT_SIZE)),
        }
    }

    /// Whether `key` on a module of `kind` can change without a recompile.
    pub fn is_live_param(kind: ModuleKind, key: &str) -> bool {
        matches!(
            (kind, key),
            (ModuleKind::Gain, "gain")
                | (ModuleKind::Delay, "time" | "feedback" | "mix")
                | (ModuleKind::Reverb, "decay" | "mix")
                | (ModuleKind::Convolver, "mix")
                | (ModuleKind::Filter, "freq" | "q")
        )
    }

    /// Apply a parameter change without rebuilding. Returns false when the
    /// change needs a recompile.
    pub fn set_param(&mut self, key: &str, value: &Value) -> bool {
        let Some(v) = value_f64(value) else {
            return false;
        };
        match (self, key) {
            (Node::Gain(g), "gain") => *g = v as f32,
            (Node::Delay(d), "time") => d.set_time(v),
            (Node::Delay(d), "feedback") => d.set_feedback(v),
            (Node::Delay(d), "mix") => d.set_mix(v),
            (Node::Reverb(r), "decay") => r.set_decay(v),
            (Node::Reverb(r), "mix") => r.set_mix(v),
            (Node::Convolver(c), "mix") => c.set_mix(v),
            (Node::Filter { left, right }, "freq") => {
                left.set_frequency(v);
                right.set_frequency(v);
            }
            (Node::Filter { left, right }, "q") => {
                left.set_q(v);
                right.set_q(v);
            }
            _ => return false,
        }
        true
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        match self {
            Node::Pass => {}
            Node::Gain(g) => {
                let g = *g;
                left.iter_mut().chain(right.iter_mut()).for_each(|s| *s *= g);
            }
            Node::Filter { left: fl, right: fr } => {
                for s in left.iter_mut() {
                    *s = fl.process(*s as f64) as f32;
                }
                for s in right.iter_mut() {
                    *s = fr.process(*s as f64) as f32;
                }
            }
            Node::Delay(d) => stereo(left, right, |l, r| d.process(l, r)),
            Node::Reverb(rv) => stereo(left, right, |l, r| rv.process(l, r)),
            Node::Convolver(c) => stereo(left, right, |l, r| c.process(l, r)),
            Node::Analyzer(ring) => {
                for (l, r) in left.iter().zip(right.iter()) {
                    ring.push((l + r) * 0.5);
                }
            }
        }
    }

    pub fn analyzer(&self) -> Option<&AnalyzerRing> {
        match self {
            Node::Analyzer(ring) => Some(ring),
            _ => None,
        }
    }
}

#[inline]
fn stereo(left: &mut [f32], right: &mut [f32], mut f: impl FnMut(f32, f32) -> (f32, f32)) {
    for (l, r) in left.iter_mut().zip(right.iter_mut()) {
        (*l, *r) = f(*l, *r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(kind: ModuleKind) -> ModuleDoc {
        ModuleDoc::new(kind)
    }

    #[test]
    fn disabled_module_is_identity() {
        let mut m = module(ModuleKind::Gain);
        m.enabled = false;
        let mut node = Node::build(&m, 44100.0);
        let mut l = [0.5f32; 8];
        let mut r = [-0.5f32; 8];
        node.process(&mut l, &mut r);
        assert!(matches!(node, Node::Pass));
        assert_eq!(l, [0.5; 8]);
        assert_eq!(r, [-0.5; 8]);
    }

    #[test]
    fn gain_scales_and_updates_live() {
        let mut node = Node::build(&module(ModuleKind::Gain), 44100.0);
        let mut l = [1.0f32; 4];
        let mut r = [1.0f32; 4];
        node.process(&mut l, &mut r);
        assert!((l[0] - 0.8).abs() < 1e-6, "Default gain is 0.8, got {}", l[0]);
        assert!(node.set_param("gain", &json!(0.0)));
        node.process(&mut l, &mut r);
        assert_eq!(l[0], 0.0);
        assert!(!node.set_param("gain", &json!("loud")));
    }

    #[test]
    fn lowpass_attenuates_nyquist() {
        let mut node = Node::build(&module(ModuleKind::Filter), 44100.0);
        let mut l: Vec<f32> = (0..2048).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let mut r = l.clone();
        node.process(&mut l, &mut r);
        let tail = l[1024..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(tail < 0.01, "1200 Hz lowpass should kill Nyquist, got {tail}");
    }

    #[test]
    fn unknown_filter_mode_falls_back() {
        let mut m = module(ModuleKind::Filter);
        m.params.insert("mode".into(), json!("wobble"));
        assert!(matches!(Node::build(&m, 44100.0), Node::Filter { .. }));
    }

    #[test]
    fn live_params_match_node_support() {
        assert!(Node::is_live_param(ModuleKind::Gain, "gain"));
        assert!(Node::is_live_param(ModuleKind::Filter, "q"));
        assert!(!Node::is_live_param(ModuleKind::Filter, "mode"));
        assert!(!Node::is_live_param(ModuleKind::PluckedSource, "ch"));
        let mut node = Node::build(&module(ModuleKind::Reverb), 44100.0);
        assert!(node.set_param("decay", &json!(3.5)));
    }

    #[test]
    fn sources_pass_through() {
        let node = Node::build(&module(ModuleKind::PluckedSource), 44100.0);
        assert!(matches!(node, Node::Pass));
    }

    #[test]
    fn analyzer_records_mono_mix() {
        let mut node = Node::build(&module(ModuleKind::AnalyzerTap), 44100.0);
        let mut l = [1.0f32; 16];
        let mut r = [0.0f32; 16];
        node.process(&mut l, &mut r);
        let ring = node.analyzer().expect("analyzer node");
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 16);
        assert_eq!(snap[snap.len() - 1], 0.5);
        assert_eq!(l, [1.0; 16], "Tap must not alter the signal");
    }
}
