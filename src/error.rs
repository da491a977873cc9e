use std::fmt;

#[derive(Debug)]
pub enum SynthError {
    /// MIDI channel outside 0..16.
    InvalidChannel(u8),
    /// Structural edit attempted on a locked chain.
    ChainLocked { chain: usize },
    ChainIndex { chain: usize, len: usize },
    ModuleIndex { chain: usize, module: usize, len: usize },
    /// Imported chain JSON was not a list of module objects.
    InvalidChain(String),
    Config(serde_json::Error),
    InvalidSampleRate(u32),
    SinkUnavailable(String),
}

impl fmt::Display for SynthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthError::InvalidChannel(ch) => write!(f, "Invalid MIDI channel {ch}"),
            SynthError::ChainLocked { chain } => write!(f, "Chain {chain} is locked"),
            SynthError::ChainIndex { chain, len } => {
                write!(f, "Chain index {chain} out of range ({len} chains)")
            }
            SynthError::ModuleIndex { chain, module, len } => {
                write!(f, "Module index {module} out of range in chain {chain} ({len} modules)")
            }
            SynthError::InvalidChain(msg) => write!(f, "Invalid chain: {msg}"),
            SynthError::Config(e) => write!(f, "Config error: {e}"),
            SynthError::InvalidSampleRate(sr) => write!(f, "Invalid sample rate {sr}"),
            SynthError::SinkUnavailable(msg) => write!(f, "Output sink unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SynthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SynthError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SynthError {
    fn from(e: serde_json::Error) -> Self {
        SynthError::Config(e)
    }
}
