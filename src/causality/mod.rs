//! Causality graph: dependency DAG and Merkle hashing over streams.
//!
//! Vertices are streams, events and commands; edges are stream order,
//! causal ancestry and command production.

mod gate;
mod graph;
pub mod hash;
mod vertex;

pub use gate::{CancellationToken, GateState, GraphGate, PauseGuard, ReadGuard, UpdateGuard};
pub use graph::{CausalityGraph, GraphStats, PopulateStats};
pub use vertex::{
    CommandVertex, Edge, EdgeKind, EventVertex, Occurrence, StreamVertex, Vertex, VertexId,
};
