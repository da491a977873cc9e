//! Chain documents: the declarative description of routing chains, its
//! normalization from loosely-typed JSON, and the editor operations.
//!
//! Wire format:
//! `{version, chains: [[{id, kind, enabled, params}]], chainMeta: [{name?, locked?}], mutes: [bool]}`
//! A bare list of chains is accepted on input.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::SynthError;

pub const DOCUMENT_VERSION: u32 = 1;

/// Processing module types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    PluckedSource,
    OscillatorSource,
    Gain,
    Filter,
    Delay,
    Reverb,
    Convolver,
    AnalyzerTap,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 8] = [
        ModuleKind::PluckedSource,
        ModuleKind::OscillatorSource,
        ModuleKind::Gain,
        ModuleKind::Filter,
        ModuleKind::Delay,
        ModuleKind::Reverb,
        ModuleKind::Convolver,
        ModuleKind::AnalyzerTap,
    ];

    /// Document tag used on serialization.
    pub fn tag(self) -> &'static str {
        match self {
            ModuleKind::PluckedSource => "ks_source",
            ModuleKind::OscillatorSource => "source",
            ModuleKind::Gain => "gain",
            ModuleKind::Filter => "filter",
            ModuleKind::Delay => "delay",
            ModuleKind::Reverb => "reverb",
            ModuleKind::Convolver => "convolver_ir",
            ModuleKind::AnalyzerTap => "analyzer",
        }
    }

    /// Accepts document tags and camelCase kind names.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "ks_source" | "pluckedSource" => ModuleKind::PluckedSource,
            "source" | "oscillatorSource" => ModuleKind::OscillatorSource,
            "gain" => ModuleKind::Gain,
            "filter" => ModuleKind::Filter,
            "delay" => ModuleKind::Delay,
            "reverb" => ModuleKind::Reverb,
            "convolver_ir" | "convolver" => ModuleKind::Convolver,
            "analyzer" | "analyzerTap" => ModuleKind::AnalyzerTap,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_source(self) -> bool {
        matches!(self, ModuleKind::PluckedSource | ModuleKind::OscillatorSource)
    }

    /// Parameters a freshly added module starts with.
    pub fn default_params(self) -> Map<String, Value> {
        let value = match self {
            ModuleKind::PluckedSource => json!({
                "smoothingMode": "auto",
                "smoothingFactor": 0.2,
                "velScale": 1.0,
                "seedNoiseType": "pink",
                "useSynthA4": true,
                "ch": "all",
                "program": 0,
                "ksDurSec": 1.0,
                "ksRelease": 0.5,
            }),
            ModuleKind::OscillatorSource => json!({
                "type": "sawtooth",
                "ch": "all",
                "adsr": { "a": 0.003, "d": 0.08, "s": 0.4, "r": 0.2 },
            }),
            ModuleKind::Gain => json!({ "gain": 0.8 }),
            ModuleKind::Filter => json!({ "mode": "lowpass", "freq": 1200, "q": 0.7 }),
            ModuleKind::Delay => json!({ "time": 0.25, "feedback": 0.35, "mix": 0.3 }),
            ModuleKind::Reverb => json!({ "decay": 2.0, "mix": 0.25 }),
            ModuleKind::Convolver => json!({ "irId": "IR_Gibson", "mix": 0.3 }),
            ModuleKind::AnalyzerTap => json!({}),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl Serialize for ModuleKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for ModuleKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        ModuleKind::from_name(&name)
            .ok_or_else(|| de::Error::custom(format!("unknown module kind {name:?}")))
    }
}

/// One module in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDoc {
    pub id: String,
    pub kind: ModuleKind,
    pub enabled: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ModuleDoc {
    /// A module of `kind` with default parameters and a fresh id.
    pub fn new(kind: ModuleKind) -> Self {
        ModuleDoc {
            id: module_id(kind),
            kind,
            enabled: true,
            params: kind.default_params(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        param_f64(&self.params, key, default)
    }

    pub fn param_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Numbers, or numeric strings as the editor sometimes stores them.
pub fn value_f64(value: &Value) -> Option<f64> {
    let v: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    v.filter(|v| v.is_finite())
}

pub fn param_f64(params: &Map<String, Value>, key: &str, default: f64) -> f64 {
    params.get(key).and_then(value_f64).unwrap_or(default)
}

/// Per-chain editor metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl ChainMeta {
    pub fn is_locked(&self) -> bool {
        self.locked.unwrap_or(false)
    }
}

/// The full routing document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSet {
    pub version: u32,
    pub chains: Vec<Vec<ModuleDoc>>,
    pub chain_meta: Vec<ChainMeta>,
    pub mutes: Vec<bool>,
}

impl Default for ChainSet {
    fn default() -> Self {
        ChainSet {
            version: DOCUMENT_VERSION,
            chains: vec![default_chain()],
            chain_meta: vec![ChainMeta::default()],
            mutes: vec![false],
        }
    }
}

/// `[oscillatorSource, gain 0.8, analyzerTap]`
pub fn default_chain() -> Vec<ModuleDoc> {
    vec![
        ModuleDoc::new(ModuleKind::OscillatorSource),
        ModuleDoc::new(ModuleKind::Gain),
        ModuleDoc::new(ModuleKind::AnalyzerTap),
    ]
}

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0x5DEE_CE66_D1CE_4E5B);

/// `<tag>_<7 base-36 chars>`
pub fn module_id(kind: ModuleKind) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let seed = ID_SEQUENCE.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    let mut rng = StdRng::seed_from_u64(seed);
    let suffix: String = (0..7)
        .map(|_| DIGITS[rng.gen_range(0..DIGITS.len())] as char)
        .collect();
    format!("{}_{}", kind.tag(), suffix)
}

/// A single module from loose JSON. `None` when `raw` is not an object.
fn normalize_module(raw: &Value, seen: &mut HashSet<String>) -> Option<ModuleDoc> {
    let obj = raw.as_object()?;
    let kind_name = obj.get("kind").and_then(Value::as_str).unwrap_or("");
    let params = match obj.get("params") {
        Some(Value::Object(p)) => p.clone(),
        _ => Map::new(),
    };
    let (kind, enabled) = match ModuleKind::from_name(kind_name) {
        Some(kind) => (kind, obj.get("enabled") != Some(&Value::Bool(false))),
        None => {
            warn!("unknown module kind {kind_name:?}, substituting a bypassed gain");
            (ModuleKind::Gain, false)
        }
    };
    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() && !seen.contains(id) => id.to_string(),
        _ => loop {
            let id = module_id(kind);
            if !seen.contains(&id) {
                break id;
            }
        },
    };
    seen.insert(id.clone());
    Some(ModuleDoc {
        id,
        kind,
        enabled,
        params,
    })
}

fn normalize_modules(raw: &Value, seen: &mut HashSet<String>) -> Option<Vec<ModuleDoc>> {
    raw.as_array()?
        .iter()
        .map(|m| normalize_module(m, seen))
        .collect()
}

fn normalize_meta(raw: Option<&Value>) -> ChainMeta {
    let Some(obj) = raw.and_then(Value::as_object) else {
        return ChainMeta::default();
    };
    ChainMeta {
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        locked: obj.get("locked").and_then(Value::as_bool),
    }
}

/// Normalize a chain document. Returns `None` for malformed input.
pub fn normalize(raw: &Value) -> Option<ChainSet> {
    let (chains_raw, envelope) = match raw {
        Value::Array(chains) => (chains, None),
        Value::Object(obj) => (obj.get("chains")?.as_array()?, Some(obj)),
        _ => return None,
    };
    let mut seen = HashSet::new();
    let mut chains = Vec::with_capacity(chains_raw.len());
    for chain in chains_raw {
        match normalize_modules(chain, &mut seen) {
            Some(c) => chains.push(c),
            None => {
                warn!("rejecting chain document: chains must be lists of module objects");
                return None;
            }
        }
    }

    let list = |key: &str| {
        envelope
            .and_then(|o| o.get(key))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let metas = list("chainMeta");
    let mutes = list("mutes");
    let version = envelope
        .and_then(|o| o.get("version"))
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
        .map_or(DOCUMENT_VERSION, |v| v.min(u32::MAX as u64) as u32);

    Some(ChainSet {
        version,
        chain_meta: (0..chains.len()).map(|i| normalize_meta(metas.get(i))).collect(),
        mutes: (0..chains.len())
            .map(|i| mutes.get(i).and_then(Value::as_bool).unwrap_or(false))
            .collect(),
        chains,
    })
}

/// Parse and normalize a JSON string.
pub fn normalize_str(json: &str) -> Option<ChainSet> {
    match serde_json::from_str::<Value>(json) {
        Ok(v) => normalize(&v),
        Err(e) => {
            warn!("chain document is not JSON: {e}");
            None
        }
    }
}

/// Normalize one module list, either bare or wrapped as `{chain, meta?, mute?}`.
pub fn normalize_single_chain(raw: &Value) -> Option<(Vec<ModuleDoc>, ChainMeta, bool)> {
    let mut seen = HashSet::new();
    match raw {
        Value::Array(_) => Some((normalize_modules(raw, &mut seen)?, ChainMeta::default(), false)),
        Value::Object(obj) => {
            let chain = normalize_modules(obj.get("chain")?, &mut seen)?;
            let mute = obj.get("mute").and_then(Value::as_bool).unwrap_or(false);
            Some((chain, normalize_meta(obj.get("meta")), mute))
        }
        _ => None,
    }
}

impl ChainSet {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json(&self) -> Result<String, SynthError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn is_locked(&self, chain: usize) -> bool {
        self.chain_meta.get(chain).is_some_and(ChainMeta::is_locked)
    }

    /// Keep `chain_meta` and `mutes` the same length as `chains`.
    fn align(&mut self) {
        let len = self.chains.len();
        self.chain_meta.resize_with(len, ChainMeta::default);
        self.mutes.resize(len, false);
    }

    fn check_chain(&mut self, chain: usize) -> Result<(), SynthError> {
        self.align();
        if chain >= self.chains.len() {
            return Err(SynthError::ChainIndex {
                chain,
                len: self.chains.len(),
            });
        }
        Ok(())
    }

    /// Index check plus lock check for edits.
    fn editable(&mut self, chain: usize) -> Result<&mut Vec<ModuleDoc>, SynthError> {
        self.check_chain(chain)?;
        if self.is_locked(chain) {
            warn!("rejected edit on locked chain {chain}");
            return Err(SynthError::ChainLocked { chain });
        }
        Ok(&mut self.chains[chain])
    }

    fn module_index(&self, chain: usize, module: usize) -> Result<(), SynthError> {
        let len = self.chains[chain].len();
        if module >= len {
            return Err(SynthError::ModuleIndex { chain, module, len });
        }
        Ok(())
    }

    fn all_ids(&self) -> HashSet<String> {
        self.chains.iter().flatten().map(|m| m.id.clone()).collect()
    }

    fn fresh_module(&self, kind: ModuleKind) -> ModuleDoc {
        let ids = self.all_ids();
        loop {
            let module = ModuleDoc::new(kind);
            if !ids.contains(&module.id) {
                return module;
            }
        }
    }

    /// Append a module with default params; returns its id.
    pub fn add_module(&mut self, chain: usize, kind: ModuleKind) -> Result<String, SynthError> {
        self.editable(chain)?;
        let module = self.fresh_module(kind);
        let id = module.id.clone();
        self.chains[chain].push(module);
        Ok(id)
    }

    pub fn remove_module(&mut self, chain: usize, module: usize) -> Result<ModuleDoc, SynthError> {
        self.editable(chain)?;
        self.module_index(chain, module)?;
        Ok(self.chains[chain].remove(module))
    }

    /// Move a module; both indices are clamped into range.
    pub fn move_module(&mut self, chain: usize, from: usize, to: usize) -> Result<(), SynthError> {
        let modules = self.editable(chain)?;
        if modules.is_empty() {
            return Ok(());
        }
        let from = from.min(modules.len() - 1);
        let item = modules.remove(from);
        let to = to.min(modules.len());
        modules.insert(to, item);
        Ok(())
    }

    /// Flip `enabled`; returns the new state.
    pub fn toggle_module(&mut self, chain: usize, module: usize) -> Result<bool, SynthError> {
        self.editable(chain)?;
        self.module_index(chain, module)?;
        let m = &mut self.chains[chain][module];
        m.enabled = !m.enabled;
        Ok(m.enabled)
    }

    pub fn set_param(
        &mut self,
        chain: usize,
        module: usize,
        key: &str,
        value: Value,
    ) -> Result<(), SynthError> {
        self.editable(chain)?;
        self.module_index(chain, module)?;
        self.chains[chain][module].params.insert(key.to_string(), value);
        Ok(())
    }

    /// Insert an unlocked copy with fresh ids after `chain`; returns its index.
    pub fn duplicate_chain(&mut self, chain: usize) -> Result<usize, SynthError> {
        self.check_chain(chain)?;
        let mut ids = self.all_ids();
        let copy: Vec<ModuleDoc> = self.chains[chain]
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.id = loop {
                    let id = module_id(m.kind);
                    if ids.insert(id.clone()) {
                        break id;
                    }
                };
                m
            })
            .collect();
        let meta = ChainMeta {
            name: self.chain_meta[chain].name.clone(),
            locked: None,
        };
        let at = chain + 1;
        self.chains.insert(at, copy);
        self.chain_meta.insert(at, meta);
        self.mutes.insert(at, false);
        Ok(at)
    }

    /// Replace a chain's modules with a normalized import.
    pub fn import_chain(&mut self, chain: usize, raw: &Value) -> Result<(), SynthError> {
        self.editable(chain)?;
        let (mut modules, _, _) = normalize_single_chain(raw)
            .ok_or_else(|| SynthError::InvalidChain("expected a list of module objects".into()))?;
        let mut others: HashSet<String> = self
            .chains
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chain)
            .flat_map(|(_, c)| c.iter().map(|m| m.id.clone()))
            .collect();
        for m in &mut modules {
            while !others.insert(m.id.clone()) {
                m.id = module_id(m.kind);
            }
        }
        self.chains[chain] = modules;
        Ok(())
    }

    /// Append a default chain; returns its index.
    pub fn add_chain(&mut self) -> usize {
        let mut chain = default_chain();
        let ids = self.all_ids();
        for m in &mut chain {
            while ids.contains(&m.id) {
                m.id = module_id(m.kind);
            }
        }
        self.align();
        self.chains.push(chain);
        self.chain_meta.push(ChainMeta::default());
        self.mutes.push(false);
        self.chains.len() - 1
    }

    /// Delete a chain. The last chain is replaced by a default one.
    pub fn delete_chain(&mut self, chain: usize) -> Result<(), SynthError> {
        self.editable(chain)?;
        self.chains.remove(chain);
        self.chain_meta.remove(chain);
        self.mutes.remove(chain);
        if self.chains.is_empty() {
            self.add_chain();
        }
        Ok(())
    }

    /// Mute is allowed on locked chains.
    pub fn set_mute(&mut self, chain: usize, muted: bool) -> Result<(), SynthError> {
        self.check_chain(chain)?;
        self.mutes[chain] = muted;
        Ok(())
    }

    pub fn set_meta(
        &mut self,
        chain: usize,
        name: Option<String>,
        locked: Option<bool>,
    ) -> Result<(), SynthError> {
        self.check_chain(chain)?;
        let meta = &mut self.chain_meta[chain];
        if name.is_some() {
            meta.name = name;
        }
        if locked.is_some() {
            meta.locked = locked;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Value {
        json!({
            "version": 1,
            "chains": [
                [
                    { "id": "ks_source_abc1234", "kind": "ks_source", "enabled": true,
                      "params": { "ch": "all", "program": 0 } },
                    { "kind": "gain", "params": { "gain": 0.5 } },
                    { "id": "x", "kind": "mystery" }
                ],
                [ { "id": "src_1", "kind": "oscillatorSource", "enabled": false, "params": {} } ]
            ],
            "chainMeta": [ { "name": "Guitar", "locked": true } ],
            "mutes": [ true ]
        })
    }

    #[test]
    fn normalize_fills_defaults() {
        let set = normalize(&sample_doc()).expect("valid document");
        assert_eq!(set.len(), 2);
        assert_eq!(set.chain_meta.len(), 2);
        assert_eq!(set.mutes, vec![true, false]);
        assert_eq!(set.chain_meta[1], ChainMeta::default());
        assert!(set.is_locked(0));

        let gain = &set.chains[0][1];
        assert!(gain.id.starts_with("gain_"), "Should regenerate id, got {}", gain.id);
        assert_eq!(gain.id.len(), "gain_".len() + 7);
        assert!(gain.enabled);

        let unknown = &set.chains[0][2];
        assert_eq!(unknown.kind, ModuleKind::Gain);
        assert!(!unknown.enabled, "Unknown kinds become bypassed gains");
        assert_eq!(unknown.id, "x");

        assert_eq!(set.chains[1][0].kind, ModuleKind::OscillatorSource);
        assert!(!set.chains[1][0].enabled);
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(&sample_doc()).expect("valid document");
        let twice = normalize(&once.to_value()).expect("serialized document");
        assert_eq!(once, twice);
        let text = once.to_json().expect("serializes");
        assert_eq!(normalize_str(&text), Some(once));
    }

    #[test]
    fn bare_chain_list_accepted() {
        let set = normalize(&json!([[{ "kind": "source" }], []])).expect("bare list");
        assert_eq!(set.version, DOCUMENT_VERSION);
        assert_eq!(set.chains[0][0].kind, ModuleKind::OscillatorSource);
        assert!(set.chains[1].is_empty());
        assert_eq!(set.mutes, vec![false, false]);
    }

    #[test]
    fn malformed_rejected() {
        assert_eq!(normalize(&json!({ "chains": 3 })), None);
        assert_eq!(normalize(&json!({ "chains": [[1, 2]] })), None);
        assert_eq!(normalize(&json!({ "chains": [{ "kind": "gain" }] })), None);
        assert_eq!(normalize(&json!("chains")), None);
        assert_eq!(normalize(&json!({})), None);
        assert_eq!(normalize_str("{not json"), None);
    }

    #[test]
    fn duplicate_ids_are_regenerated() {
        let set = normalize(&json!([[{ "id": "a", "kind": "gain" }, { "id": "a", "kind": "gain" }]]))
            .expect("valid");
        assert_eq!(set.chains[0][0].id, "a");
        assert_ne!(set.chains[0][1].id, "a");
    }

    #[test]
    fn serializes_document_tags() {
        let set = normalize(&json!([[{ "id": "p", "kind": "pluckedSource" }]])).expect("valid");
        let v = set.to_value();
        assert_eq!(v["chains"][0][0]["kind"], "ks_source");
        assert!(v.get("chainMeta").is_some());
    }

    #[test]
    fn locked_chain_rejects_structural_edits() {
        let mut set = normalize(&sample_doc()).expect("valid document");
        let before = serde_json::to_vec(&set.chains[0]).expect("serializes");

        assert!(matches!(
            set.add_module(0, ModuleKind::Delay),
            Err(SynthError::ChainLocked { chain: 0 })
        ));
        assert!(set.remove_module(0, 0).is_err());
        assert!(set.move_module(0, 0, 2).is_err());
        assert!(set.import_chain(0, &json!([{ "kind": "gain" }])).is_err());
        assert!(set.delete_chain(0).is_err());
        assert!(set.toggle_module(0, 0).is_err());

        let after = serde_json::to_vec(&set.chains[0]).expect("serializes");
        assert_eq!(before, after, "Locked chain must stay byte-for-byte identical");

        set.set_mute(0, false).expect("mute is allowed");
        assert!(!set.mutes[0]);
    }

    #[test]
    fn move_module_clamps() {
        let mut set = ChainSet::default();
        let ids: Vec<String> = set.chains[0].iter().map(|m| m.id.clone()).collect();
        set.move_module(0, 0, 99).expect("unlocked");
        let moved: Vec<&str> = set.chains[0].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(moved, vec![ids[1].as_str(), ids[2].as_str(), ids[0].as_str()]);
        set.move_module(0, 99, 0).expect("unlocked");
        assert_eq!(set.chains[0][0].id, ids[0]);
    }

    #[test]
    fn deleting_last_chain_substitutes_default() {
        let mut set = ChainSet::default();
        set.delete_chain(0).expect("unlocked");
        assert_eq!(set.len(), 1);
        let kinds: Vec<ModuleKind> = set.chains[0].iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![ModuleKind::OscillatorSource, ModuleKind::Gain, ModuleKind::AnalyzerTap]
        );
        assert_eq!(set.mutes.len(), 1);
    }

    #[test]
    fn duplicate_chain_gets_fresh_ids_and_unlocks() {
        let mut set = normalize(&sample_doc()).expect("valid document");
        let at = set.duplicate_chain(0).expect("in range");
        assert_eq!(at, 1);
        assert_eq!(set.len(), 3);
        assert!(!set.is_locked(1));
        assert_eq!(set.chain_meta[1].name.as_deref(), Some("Guitar"));
        for (a, b) in set.chains[0].iter().zip(&set.chains[1]) {
            assert_eq!(a.kind, b.kind);
            assert_ne!(a.id, b.id);
        }
    }

    #[test]
    fn editor_ops_on_unlocked_chain() {
        let mut set = ChainSet::default();
        let id = set.add_module(0, ModuleKind::Reverb).expect("unlocked");
        assert!(id.starts_with("reverb_"));
        assert_eq!(set.chains[0][3].param_f64("decay", 0.0), 2.0);
        set.set_param(0, 3, "mix", json!(0.5)).expect("in range");
        assert_eq!(set.chains[0][3].param_f64("mix", 0.0), 0.5);
        assert!(!set.toggle_module(0, 3).expect("in range"));
        assert!(matches!(
            set.remove_module(0, 9),
            Err(SynthError::ModuleIndex { module: 9, .. })
        ));
        assert!(matches!(set.set_mute(5, true), Err(SynthError::ChainIndex { .. })));
        set.import_chain(0, &json!({ "chain": [{ "kind": "delay" }] })).expect("valid import");
        assert_eq!(set.chains[0].len(), 1);
        assert_eq!(set.add_chain(), 1);
    }

    #[test]
    fn numeric_strings_read_as_numbers() {
        let mut params = Map::new();
        params.insert("freq".into(), json!("880"));
        assert_eq!(param_f64(&params, "freq", 0.0), 880.0);
        assert_eq!(param_f64(&params, "q", 0.7), 0.7);
    }
}
