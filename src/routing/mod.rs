//! Routing chains: the document model, per-module nodes, and the compiled
//! graph that matches notes to chains.

pub mod document;
pub mod graph;
pub mod node;

pub use document::{ChainMeta, ChainSet, ModuleDoc, ModuleKind, normalize, normalize_str};
pub use graph::{Router, RoutingGraph};
