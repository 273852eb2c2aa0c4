//! Spatial graph construction and storage.

pub mod builder;
pub mod spatial;

pub use builder::{CandidateGrid, GraphBuilder, SampleAssignment};
pub use spatial::{Edge, GraphTopology, Node, NodeBlock, SpatialGraph, TopologyRecord};
