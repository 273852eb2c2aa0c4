//! Builds a spatial graph from a habitat polygon, a candidate grid, and sample
//! locations.

use crate::error::{ConfigurationError, MigrationError};
use crate::graph::spatial::{Edge, GraphTopology, Node, SpatialGraph};
use crate::types::GridOptions;
use geo::{Coord, EuclideanDistance, Intersects, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MAX_CANDIDATES: usize = 4_000_000;

/// Candidate node layout laid over the habitat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CandidateGrid {
    /// Triangular lattice over the habitat's bounding box; odd rows are shifted by half a
    /// spacing and every node links to its six neighbours.
    Triangular { spacing: f64 },
    /// Square lattice with four-neighbour connectivity.
    Square { spacing: f64 },
    /// A caller-supplied planar triangulation. `edges` index into `points`.
    Explicit {
        points: Vec<[f64; 2]>,
        edges: Vec<(usize, usize)>,
    },
}

/// How samples are attached to nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum SampleAssignment {
    /// Nearest node; ties go to the smallest node id.
    #[default]
    Nearest,
    /// One candidate index per sample (the position in the candidate list before
    /// habitat filtering).
    Explicit(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    habitat: Vec<[f64; 2]>,
    grid: CandidateGrid,
    options: GridOptions,
}

struct Candidates {
    points: Vec<[f64; 2]>,
    edges: Vec<(usize, usize)>,
}

fn lattice_size(extent: f64, step: f64) -> usize {
    (extent / step + 1e-9).floor() as usize + 1
}

fn check_spacing(spacing: f64) -> Result<(), ConfigurationError> {
    if !(spacing.is_finite() && spacing > 0.0) {
        return Err(ConfigurationError::InvalidOption {
            name: "spacing",
            reason: format!("grid spacing must be finite and > 0, got {spacing}"),
        });
    }
    Ok(())
}

fn check_candidate_count(rows: usize, cols: usize) -> Result<(), ConfigurationError> {
    if rows.saturating_mul(cols) > MAX_CANDIDATES {
        return Err(ConfigurationError::InvalidOption {
            name: "spacing",
            reason: format!(
                "spacing yields {rows}x{cols} candidate nodes (limit {MAX_CANDIDATES})"
            ),
        });
    }
    Ok(())
}

fn bounding_box(vertices: &[[f64; 2]]) -> ([f64; 2], [f64; 2]) {
    let mut lo = [f64::INFINITY; 2];
    let mut hi = [f64::NEG_INFINITY; 2];
    for v in vertices {
        for k in 0..2 {
            lo[k] = lo[k].min(v[k]);
            hi[k] = hi[k].max(v[k]);
        }
    }
    (lo, hi)
}

fn triangular_lattice(lo: [f64; 2], hi: [f64; 2], spacing: f64) -> Result<Candidates, ConfigurationError> {
    let row_step = spacing * 3.0_f64.sqrt() / 2.0;
    let rows = lattice_size(hi[1] - lo[1], row_step);
    let cols = lattice_size(hi[0] - lo[0], spacing);
    check_candidate_count(rows, cols)?;
    let index = |r: usize, c: usize| r * cols + c;

    let mut points = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let shift = if r % 2 == 1 { 0.5 * spacing } else { 0.0 };
        for c in 0..cols {
            points.push([lo[0] + shift + c as f64 * spacing, lo[1] + r as f64 * row_step]);
        }
    }

    let mut edges = Vec::with_capacity(3 * rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            if c + 1 < cols {
                edges.push((index(r, c), index(r, c + 1)));
            }
            if r + 1 < rows {
                // Even rows reach down-left and down; odd rows down and down-right.
                edges.push((index(r, c), index(r + 1, c)));
                if r % 2 == 0 {
                    if c > 0 {
                        edges.push((index(r, c), index(r + 1, c - 1)));
                    }
                } else if c + 1 < cols {
                    edges.push((index(r, c), index(r + 1, c + 1)));
                }
            }
        }
    }
    Ok(Candidates { points, edges })
}

fn square_lattice(lo: [f64; 2], hi: [f64; 2], spacing: f64) -> Result<Candidates, ConfigurationError> {
    let rows = lattice_size(hi[1] - lo[1], spacing);
    let cols = lattice_size(hi[0] - lo[0], spacing);
    check_candidate_count(rows, cols)?;
    let index = |r: usize, c: usize| r * cols + c;

    let mut points = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            points.push([lo[0] + c as f64 * spacing, lo[1] + r as f64 * spacing]);
        }
    }
    let mut edges = Vec::with_capacity(2 * rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            if c + 1 < cols {
                edges.push((index(r, c), index(r, c + 1)));
            }
            if r + 1 < rows {
                edges.push((index(r, c), index(r + 1, c)));
            }
        }
    }
    Ok(Candidates { points, edges })
}

impl GraphBuilder {
    pub fn new(habitat: Vec<[f64; 2]>, grid: CandidateGrid) -> Self {
        Self {
            habitat,
            grid,
            options: GridOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GridOptions) -> Self {
        self.options = options;
        self
    }

    /// Habitat vertices with a repeated closing vertex removed.
    fn ring(&self) -> Result<Vec<[f64; 2]>, ConfigurationError> {
        let mut ring = self.habitat.clone();
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 || ring.iter().any(|v| !(v[0].is_finite() && v[1].is_finite())) {
            return Err(ConfigurationError::InvalidHabitat(ring.len()));
        }
        Ok(ring)
    }

    fn candidates(&self, ring: &[[f64; 2]]) -> Result<Candidates, ConfigurationError> {
        match &self.grid {
            CandidateGrid::Triangular { spacing } => {
                check_spacing(*spacing)?;
                let (lo, hi) = bounding_box(ring);
                triangular_lattice(lo, hi, *spacing)
            }
            CandidateGrid::Square { spacing } => {
                check_spacing(*spacing)?;
                let (lo, hi) = bounding_box(ring);
                square_lattice(lo, hi, *spacing)
            }
            CandidateGrid::Explicit { points, edges } => {
                if let Some(p) = points.iter().find(|p| !(p[0].is_finite() && p[1].is_finite())) {
                    return Err(ConfigurationError::InvalidOption {
                        name: "points",
                        reason: format!("non-finite grid point ({}, {})", p[0], p[1]),
                    });
                }
                let mut seen = HashSet::with_capacity(edges.len());
                for &(a, b) in edges {
                    if a == b {
                        return Err(ConfigurationError::InvalidEdge(a, b, "self loop"));
                    }
                    if a >= points.len() || b >= points.len() {
                        return Err(ConfigurationError::InvalidEdge(a, b, "endpoint out of range"));
                    }
                    if !seen.insert((a.min(b), a.max(b))) {
                        return Err(ConfigurationError::InvalidEdge(a, b, "duplicate edge"));
                    }
                }
                Ok(Candidates {
                    points: points.clone(),
                    edges: edges.clone(),
                })
            }
        }
    }

    /// Builds the graph and assigns `samples` to nodes.
    pub fn build(
        &self,
        samples: &[[f64; 2]],
        assignment: &SampleAssignment,
    ) -> Result<SpatialGraph, MigrationError> {
        self.options.validate()?;
        let ring = self.ring()?;
        let polygon = Polygon::new(
            LineString::from(
                ring.iter()
                    .map(|v| Coord { x: v[0], y: v[1] })
                    .collect::<Vec<_>>(),
            ),
            vec![],
        );

        let candidates = self.candidates(&ring)?;
        let mut node_of_candidate = vec![None; candidates.points.len()];
        let mut positions = Vec::new();
        for (k, p) in candidates.points.iter().enumerate() {
            if polygon.intersects(&Point::new(p[0], p[1])) {
                node_of_candidate[k] = Some(positions.len());
                positions.push(*p);
            }
        }
        if positions.is_empty() {
            return Err(ConfigurationError::EmptyGraph("nodes").into());
        }
        let edges: Vec<Edge> = candidates
            .edges
            .iter()
            .filter_map(|&(a, b)| match (node_of_candidate[a], node_of_candidate[b]) {
                (Some(i), Some(j)) => Some(Edge::new(i, j)),
                _ => None,
            })
            .collect();
        if edges.is_empty() {
            return Err(ConfigurationError::EmptyGraph("edges").into());
        }

        for (s, p) in samples.iter().enumerate() {
            let point = Point::new(p[0], p[1]);
            if !(p[0].is_finite() && p[1].is_finite()) {
                return Err(ConfigurationError::SampleOutsideHabitat {
                    sample: s,
                    x: p[0],
                    y: p[1],
                }
                .into());
            }
            if polygon.intersects(&point) {
                continue;
            }
            let distance = point.euclidean_distance(&polygon);
            if self.options.snap_tolerance > 0.0 && distance <= self.options.snap_tolerance {
                log::debug!(
                    "sample {s} lies {distance:.3e} outside the habitat; accepted by snap tolerance"
                );
                continue;
            }
            return Err(ConfigurationError::SampleOutsideHabitat {
                sample: s,
                x: p[0],
                y: p[1],
            }
            .into());
        }

        let sample_nodes: Vec<usize> = match assignment {
            SampleAssignment::Nearest => samples
                .iter()
                .map(|p| nearest_node(&positions, *p))
                .collect(),
            SampleAssignment::Explicit(mapping) => {
                if mapping.len() != samples.len() {
                    return Err(ConfigurationError::LengthMismatch {
                        what: "sample node mappings",
                        expected: samples.len(),
                        found: mapping.len(),
                    }
                    .into());
                }
                mapping
                    .iter()
                    .enumerate()
                    .map(|(sample, &candidate)| {
                        node_of_candidate
                            .get(candidate)
                            .copied()
                            .flatten()
                            .ok_or(ConfigurationError::UnknownNode {
                                sample,
                                node: candidate,
                            })
                    })
                    .collect::<Result<_, _>>()?
            }
        };

        let mut nodes: Vec<Node> = positions
            .into_iter()
            .enumerate()
            .map(|(id, position)| Node {
                id,
                position,
                samples: Vec::new(),
            })
            .collect();
        for (sample, &node) in sample_nodes.iter().enumerate() {
            nodes[node].samples.push(sample);
        }

        let topology = GraphTopology::new(nodes, edges)?;
        log::info!(
            "built spatial graph: {} nodes, {} edges, {} observed",
            topology.n_nodes(),
            topology.n_edges(),
            topology.observed().len()
        );
        Ok(SpatialGraph::new(topology))
    }
}

fn nearest_node(positions: &[[f64; 2]], p: [f64; 2]) -> usize {
    let mut best = 0usize;
    let mut best_d2 = f64::INFINITY;
    for (id, q) in positions.iter().enumerate() {
        let d2 = (q[0] - p[0]).powi(2) + (q[1] - p[1]).powi(2);
        if d2 < best_d2 {
            best = id;
            best_d2 = d2;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<[f64; 2]> {
        vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]
    }

    #[test]
    fn square_lattice_over_unit_square() {
        let graph = GraphBuilder::new(unit_square(), CandidateGrid::Square { spacing: 0.5 })
            .build(&[[0.1, 0.1], [0.9, 0.95]], &SampleAssignment::Nearest)
            .expect("graph");
        assert_eq!(graph.nodes().len(), 9);
        assert_eq!(graph.edges().len(), 12);
        assert_eq!(graph.observed(), &[0, 8]);
        assert_eq!(graph.topology().sample_node(), &[0, 8]);
    }

    #[test]
    fn triangular_lattice_has_six_neighbours_in_the_interior() {
        let habitat = vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]];
        let graph = GraphBuilder::new(habitat, CandidateGrid::Triangular { spacing: 1.0 })
            .build(&[[2.0, 2.0]], &SampleAssignment::Nearest)
            .expect("graph");
        let mut degree = vec![0usize; graph.nodes().len()];
        for edge in graph.edges() {
            degree[edge.i] += 1;
            degree[edge.j] += 1;
        }
        assert_eq!(degree.iter().copied().max(), Some(6));
        for edge in graph.edges() {
            let a = graph.nodes()[edge.i].position;
            let b = graph.nodes()[edge.j].position;
            let len = ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt();
            assert!((len - 1.0).abs() < 1e-9, "edge length {len}");
        }
    }

    #[test]
    fn nearest_assignment_breaks_ties_by_smallest_id() {
        let graph = GraphBuilder::new(unit_square(), CandidateGrid::Square { spacing: 1.0 })
            .build(&[[0.5, 0.5]], &SampleAssignment::Nearest)
            .expect("graph");
        assert_eq!(graph.topology().sample_node(), &[0]);
    }

    #[test]
    fn sample_outside_habitat_is_rejected_unless_snapped() {
        let builder = GraphBuilder::new(unit_square(), CandidateGrid::Square { spacing: 0.5 });
        let err = builder
            .build(&[[1.05, 0.5]], &SampleAssignment::Nearest)
            .expect_err("outside");
        assert!(matches!(
            err,
            MigrationError::Configuration(ConfigurationError::SampleOutsideHabitat {
                sample: 0,
                ..
            })
        ));
        let snapped = builder
            .with_options(GridOptions {
                snap_tolerance: 0.1,
            })
            .build(&[[1.05, 0.5]], &SampleAssignment::Nearest)
            .expect("snapped");
        assert_eq!(snapped.topology().sample_node(), &[5]);
    }

    #[test]
    fn explicit_triangulation_drops_edges_leaving_the_habitat() {
        let grid = CandidateGrid::Explicit {
            points: vec![[0.2, 0.2], [0.8, 0.2], [0.5, 0.8], [5.0, 5.0]],
            edges: vec![(0, 1), (1, 2), (2, 0), (2, 3)],
        };
        let graph = GraphBuilder::new(unit_square(), grid)
            .build(
                &[[0.2, 0.2], [0.5, 0.8]],
                &SampleAssignment::Explicit(vec![0, 2]),
            )
            .expect("graph");
        assert_eq!(graph.nodes().len(), 3);
        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.observed(), &[0, 2]);
    }

    #[test]
    fn explicit_mapping_errors() {
        let grid = CandidateGrid::Explicit {
            points: vec![[0.2, 0.2], [0.8, 0.2], [5.0, 5.0]],
            edges: vec![(0, 1), (1, 2)],
        };
        let builder = GraphBuilder::new(unit_square(), grid);
        let dropped = builder.build(&[[0.2, 0.2]], &SampleAssignment::Explicit(vec![2]));
        assert!(matches!(
            dropped,
            Err(MigrationError::Configuration(ConfigurationError::UnknownNode {
                sample: 0,
                node: 2
            }))
        ));
        let short = builder.build(&[[0.2, 0.2], [0.8, 0.2]], &SampleAssignment::Explicit(vec![0]));
        assert!(matches!(
            short,
            Err(MigrationError::Configuration(
                ConfigurationError::LengthMismatch { .. }
            ))
        ));
    }

    #[test]
    fn disconnected_lattice_is_rejected() {
        // Two lobes joined by a strip thinner than the spacing.
        let habitat = vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.45],
            [2.0, 0.45],
            [2.0, 0.0],
            [3.0, 0.0],
            [3.0, 1.0],
            [0.0, 1.0],
        ];
        let grid = CandidateGrid::Explicit {
            points: vec![[0.5, 0.2], [0.5, 0.8], [2.5, 0.2], [2.5, 0.8]],
            edges: vec![(0, 1), (2, 3)],
        };
        let err = GraphBuilder::new(habitat, grid)
            .build(&[[0.5, 0.2]], &SampleAssignment::Nearest)
            .expect_err("disconnected");
        assert!(matches!(
            err,
            MigrationError::Configuration(ConfigurationError::DisconnectedGraph { components: 2 })
        ));
    }

    #[test]
    fn degenerate_habitat_is_rejected() {
        let err = GraphBuilder::new(
            vec![[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]],
            CandidateGrid::Square { spacing: 0.5 },
        )
        .build(&[], &SampleAssignment::Nearest)
        .expect_err("degenerate");
        assert!(matches!(
            err,
            MigrationError::Configuration(ConfigurationError::InvalidHabitat(2))
        ));
    }
}
