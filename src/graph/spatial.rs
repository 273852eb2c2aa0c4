//! Spatial graph: immutable topology plus mutable edge weights.
//!
//! The Laplacian `L = B W B^T` and its unobserved block `L_uu` live in fixed CSC
//! patterns built once per topology. Each edge remembers the value slots it touches,
//! so a weight update rewrites the value buffers in `O(|V| + |E|)` without any
//! symbolic work.

use crate::error::{ConfigurationError, MigrationError, NumericalError};
use crate::linalg::sparse_exact::sparse_from_triplets;
use faer::sparse::{SparseColMat, SparseColMatRef};
use ndarray::Array1;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// A population location. `samples` is fixed at construction; a node with at least one
/// sample is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub position: [f64; 2],
    #[serde(default)]
    pub samples: Vec<usize>,
}

impl Node {
    pub fn is_observed(&self) -> bool {
        !self.samples.is_empty()
    }
}

/// Undirected edge with `i < j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub i: usize,
    pub j: usize,
}

impl Edge {
    /// Orders the endpoints so that `i < j`.
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self { i: a, j: b }
        } else {
            Self { i: b, j: a }
        }
    }
}

/// Which side of the observed/unobserved partition a node sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBlock {
    Observed,
    Unobserved,
}

#[derive(Debug, Clone, Copy)]
struct EdgeSlots {
    ii: usize,
    jj: usize,
    ij: usize,
    ji: usize,
    uu_ii: Option<usize>,
    uu_jj: Option<usize>,
    uu_off: Option<(usize, usize)>,
}

/// Serialized form of a topology: the nodes and edges only. Everything else is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyRecord {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Fixed graph structure shared between all weight states of a graph.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "TopologyRecord", try_from = "TopologyRecord")]
pub struct GraphTopology {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    observed: Vec<usize>,
    unobserved: Vec<usize>,
    block_index: Vec<usize>,
    sample_node: Vec<usize>,
    samples_per_node: Array1<f64>,
    incidence: SparseColMat<usize, f64>,
    laplacian_pattern: SparseColMat<usize, f64>,
    uu_pattern: SparseColMat<usize, f64>,
    diag_slots: Vec<usize>,
    uu_diag_slots: Vec<usize>,
    edge_slots: Vec<EdgeSlots>,
    adjacent_pairs: Vec<(usize, usize)>,
}

impl std::fmt::Debug for GraphTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTopology")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("observed", &self.observed.len())
            .field("unobserved", &self.unobserved.len())
            .finish()
    }
}

impl From<GraphTopology> for TopologyRecord {
    fn from(topology: GraphTopology) -> Self {
        TopologyRecord {
            nodes: topology.nodes,
            edges: topology.edges,
        }
    }
}

impl TryFrom<TopologyRecord> for GraphTopology {
    type Error = MigrationError;

    fn try_from(record: TopologyRecord) -> Result<Self, Self::Error> {
        GraphTopology::new(record.nodes, record.edges)
    }
}

/// Number of connected components of an undirected graph, by union-find.
pub(crate) fn count_components(n_nodes: usize, edges: &[Edge]) -> usize {
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut parent: Vec<usize> = (0..n_nodes).collect();
    let mut components = n_nodes;
    for edge in edges {
        let a = find(&mut parent, edge.i);
        let b = find(&mut parent, edge.j);
        if a != b {
            parent[a.max(b)] = a.min(b);
            components -= 1;
        }
    }
    components
}

fn find_slot(pattern: &SparseColMat<usize, f64>, row: usize, col: usize) -> Option<usize> {
    let symbolic = pattern.symbolic();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    (col_ptr[col]..col_ptr[col + 1]).find(|&idx| row_idx[idx] == row)
}

fn missing_slot(row: usize, col: usize) -> MigrationError {
    NumericalError::SparseAssembly(format!("entry ({row}, {col}) missing from Laplacian pattern"))
        .into()
}

impl GraphTopology {
    /// Validates and indexes a graph.
    ///
    /// Node ids must equal their position in `nodes`. Edge endpoints are normalized to
    /// `i < j`; self loops, duplicates, and dangling endpoints are rejected. Sample
    /// indices across all nodes must cover `0..m` exactly once. The graph must be
    /// connected.
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, MigrationError> {
        let n = nodes.len();
        if n == 0 {
            return Err(ConfigurationError::EmptyGraph("nodes").into());
        }
        if edges.is_empty() {
            return Err(ConfigurationError::EmptyGraph("edges").into());
        }
        for (idx, node) in nodes.iter().enumerate() {
            if node.id != idx {
                return Err(ConfigurationError::InvalidOption {
                    name: "nodes",
                    reason: format!("node at position {idx} has id {}", node.id),
                }
                .into());
            }
        }

        let mut seen = HashSet::with_capacity(edges.len());
        let mut normalized = Vec::with_capacity(edges.len());
        for edge in &edges {
            if edge.i == edge.j {
                return Err(ConfigurationError::InvalidEdge(edge.i, edge.j, "self loop").into());
            }
            if edge.i >= n || edge.j >= n {
                return Err(
                    ConfigurationError::InvalidEdge(edge.i, edge.j, "endpoint out of range")
                        .into(),
                );
            }
            let e = Edge::new(edge.i, edge.j);
            if !seen.insert(e) {
                return Err(ConfigurationError::InvalidEdge(e.i, e.j, "duplicate edge").into());
            }
            normalized.push(e);
        }
        let edges = normalized;

        let components = count_components(n, &edges);
        if components != 1 {
            return Err(ConfigurationError::DisconnectedGraph { components }.into());
        }

        let n_samples: usize = nodes.iter().map(|node| node.samples.len()).sum();
        let mut sample_node = vec![usize::MAX; n_samples];
        for node in &nodes {
            for &sample in &node.samples {
                if sample >= n_samples || sample_node[sample] != usize::MAX {
                    return Err(ConfigurationError::InvalidOption {
                        name: "samples",
                        reason: format!(
                            "sample index {sample} on node {} is out of range or repeated",
                            node.id
                        ),
                    }
                    .into());
                }
                sample_node[sample] = node.id;
            }
        }

        let mut observed = Vec::new();
        let mut unobserved = Vec::new();
        let mut block_index = vec![0usize; n];
        for node in &nodes {
            if node.is_observed() {
                block_index[node.id] = observed.len();
                observed.push(node.id);
            } else {
                block_index[node.id] = unobserved.len();
                unobserved.push(node.id);
            }
        }
        let samples_per_node =
            Array1::from_iter(observed.iter().map(|&id| nodes[id].samples.len() as f64));

        let mut incidence_entries = Vec::with_capacity(2 * edges.len());
        for (e, edge) in edges.iter().enumerate() {
            incidence_entries.push((edge.i, e, 1.0));
            incidence_entries.push((edge.j, e, -1.0));
        }
        let incidence = sparse_from_triplets(n, edges.len(), &incidence_entries)?;

        let mut laplacian_entries = Vec::with_capacity(n + 2 * edges.len());
        for id in 0..n {
            laplacian_entries.push((id, id, 0.0));
        }
        for edge in &edges {
            laplacian_entries.push((edge.i, edge.j, 0.0));
            laplacian_entries.push((edge.j, edge.i, 0.0));
        }
        let laplacian_pattern = sparse_from_triplets(n, n, &laplacian_entries)?;

        let u = unobserved.len();
        let mut uu_entries = Vec::with_capacity(u + 2 * edges.len());
        for local in 0..u {
            uu_entries.push((local, local, 0.0));
        }
        for edge in &edges {
            if !nodes[edge.i].is_observed() && !nodes[edge.j].is_observed() {
                let (a, b) = (block_index[edge.i], block_index[edge.j]);
                uu_entries.push((a, b, 0.0));
                uu_entries.push((b, a, 0.0));
            }
        }
        let uu_pattern = sparse_from_triplets(u, u, &uu_entries)?;

        let diag_slots = (0..n)
            .map(|id| find_slot(&laplacian_pattern, id, id).ok_or_else(|| missing_slot(id, id)))
            .collect::<Result<Vec<_>, _>>()?;
        let uu_diag_slots = (0..u)
            .map(|k| find_slot(&uu_pattern, k, k).ok_or_else(|| missing_slot(k, k)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut edge_slots = Vec::with_capacity(edges.len());
        for edge in &edges {
            let (i, j) = (edge.i, edge.j);
            let i_unobs = !nodes[i].is_observed();
            let j_unobs = !nodes[j].is_observed();
            let uu_off = if i_unobs && j_unobs {
                let (a, b) = (block_index[i], block_index[j]);
                Some((
                    find_slot(&uu_pattern, a, b).ok_or_else(|| missing_slot(a, b))?,
                    find_slot(&uu_pattern, b, a).ok_or_else(|| missing_slot(b, a))?,
                ))
            } else {
                None
            };
            edge_slots.push(EdgeSlots {
                ii: diag_slots[i],
                jj: diag_slots[j],
                ij: find_slot(&laplacian_pattern, i, j).ok_or_else(|| missing_slot(i, j))?,
                ji: find_slot(&laplacian_pattern, j, i).ok_or_else(|| missing_slot(j, i))?,
                uu_ii: i_unobs.then(|| uu_diag_slots[block_index[i]]),
                uu_jj: j_unobs.then(|| uu_diag_slots[block_index[j]]),
                uu_off,
            });
        }

        let mut incident: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (e, edge) in edges.iter().enumerate() {
            incident[edge.i].push(e);
            incident[edge.j].push(e);
        }
        let mut adjacent_pairs = Vec::new();
        for list in &incident {
            for (k, &a) in list.iter().enumerate() {
                for &b in &list[k + 1..] {
                    adjacent_pairs.push((a.min(b), a.max(b)));
                }
            }
        }
        adjacent_pairs.sort_unstable();

        log::debug!(
            "graph topology: {} nodes ({} observed), {} edges, {} samples",
            n,
            observed.len(),
            edges.len(),
            n_samples
        );

        Ok(Self {
            nodes,
            edges,
            observed,
            unobserved,
            block_index,
            sample_node,
            samples_per_node,
            incidence,
            laplacian_pattern,
            uu_pattern,
            diag_slots,
            uu_diag_slots,
            edge_slots,
            adjacent_pairs,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_node.len()
    }

    /// Observed node ids, ascending.
    pub fn observed(&self) -> &[usize] {
        &self.observed
    }

    /// Unobserved node ids, ascending.
    pub fn unobserved(&self) -> &[usize] {
        &self.unobserved
    }

    pub fn block_of(&self, node: usize) -> (NodeBlock, usize) {
        let block = if self.nodes[node].is_observed() {
            NodeBlock::Observed
        } else {
            NodeBlock::Unobserved
        };
        (block, self.block_index[node])
    }

    /// Node each sample is assigned to.
    pub fn sample_node(&self) -> &[usize] {
        &self.sample_node
    }

    /// Sample counts of the observed nodes, in observed order.
    pub fn samples_per_node(&self) -> &Array1<f64> {
        &self.samples_per_node
    }

    /// Pairs `(a, b)`, `a < b`, of edges that share an endpoint.
    pub fn adjacent_edge_pairs(&self) -> &[(usize, usize)] {
        &self.adjacent_pairs
    }

    /// Oriented incidence matrix `B` (|V|x|E|): `+1` at the lower endpoint, `-1` at the
    /// higher.
    pub fn incidence(&self) -> SparseColMatRef<'_, usize, f64> {
        self.incidence.as_ref()
    }

    /// Signed operator `Δ` with one row `e_a - e_b` per adjacent edge pair.
    pub fn edge_adjacency(&self) -> Result<SparseColMat<usize, f64>, NumericalError> {
        let mut entries = Vec::with_capacity(2 * self.adjacent_pairs.len());
        for (row, &(a, b)) in self.adjacent_pairs.iter().enumerate() {
            entries.push((row, a, 1.0));
            entries.push((row, b, -1.0));
        }
        sparse_from_triplets(self.adjacent_pairs.len(), self.edges.len(), &entries)
    }

    /// Recovers edge weights `w_e = -L[i, j]` from a Laplacian on this topology.
    pub fn weights_from_laplacian(
        &self,
        laplacian: SparseColMatRef<'_, usize, f64>,
    ) -> Result<Array1<f64>, NumericalError> {
        let n = self.n_nodes();
        if laplacian.nrows() != n || laplacian.ncols() != n {
            return Err(NumericalError::DimensionMismatch {
                expected: n,
                found: laplacian.nrows().max(laplacian.ncols()),
            });
        }
        let symbolic = laplacian.symbolic();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let values = laplacian.val();
        let mut weights = Array1::<f64>::zeros(self.n_edges());
        for (e, edge) in self.edges.iter().enumerate() {
            let slot = (col_ptr[edge.j]..col_ptr[edge.j + 1])
                .find(|&idx| row_idx[idx] == edge.i)
                .ok_or_else(|| {
                    NumericalError::SparseAssembly(format!(
                        "edge ({}, {}) has no Laplacian entry",
                        edge.i, edge.j
                    ))
                })?;
            weights[e] = -values[slot];
        }
        Ok(weights)
    }
}

/// A spatial graph with its current edge weights.
///
/// Cloning copies only the weight state; the topology is shared.
#[derive(Clone, Debug)]
pub struct SpatialGraph {
    topology: Arc<GraphTopology>,
    log_weights: Array1<f64>,
    weights: Array1<f64>,
    laplacian_values: Vec<f64>,
    uu_values: Vec<f64>,
    node_log_residuals: Option<Array1<f64>>,
}

impl SpatialGraph {
    /// A graph with all weights equal to one.
    pub fn new(topology: GraphTopology) -> Self {
        Self::from_shared(Arc::new(topology))
    }

    pub fn from_shared(topology: Arc<GraphTopology>) -> Self {
        let n_edges = topology.n_edges();
        let mut graph = Self {
            laplacian_values: vec![0.0; topology.laplacian_pattern.val().len()],
            uu_values: vec![0.0; topology.uu_pattern.val().len()],
            log_weights: Array1::zeros(n_edges),
            weights: Array1::ones(n_edges),
            node_log_residuals: None,
            topology,
        };
        graph.assemble();
        graph
    }

    pub fn topology(&self) -> &GraphTopology {
        &self.topology
    }

    pub fn shared_topology(&self) -> Arc<GraphTopology> {
        Arc::clone(&self.topology)
    }

    pub fn nodes(&self) -> &[Node] {
        self.topology.nodes()
    }

    pub fn edges(&self) -> &[Edge] {
        self.topology.edges()
    }

    pub fn observed(&self) -> &[usize] {
        self.topology.observed()
    }

    pub fn unobserved(&self) -> &[usize] {
        self.topology.unobserved()
    }

    pub fn n_edges(&self) -> usize {
        self.topology.n_edges()
    }

    pub fn log_weights(&self) -> &Array1<f64> {
        &self.log_weights
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Replaces the log-weights `x`, with `w = exp(x)`.
    ///
    /// On error the previous weights are kept.
    pub fn set_weights(&mut self, log_weights: &Array1<f64>) -> Result<(), MigrationError> {
        self.check_len(log_weights.len())?;
        let weights = log_weights.mapv(f64::exp);
        for (edge, (&x, &w)) in log_weights.iter().zip(weights.iter()).enumerate() {
            if !x.is_finite() || !w.is_finite() || w <= 0.0 {
                return Err(NumericalError::NonPositiveWeight { edge, weight: w }.into());
            }
        }
        self.log_weights.assign(log_weights);
        self.weights = weights;
        self.assemble();
        Ok(())
    }

    /// Replaces the weights directly; every weight must be finite and positive.
    pub fn set_edge_weights(&mut self, weights: &Array1<f64>) -> Result<(), MigrationError> {
        self.check_len(weights.len())?;
        for (edge, &w) in weights.iter().enumerate() {
            if !w.is_finite() || w <= 0.0 {
                return Err(NumericalError::NonPositiveWeight { edge, weight: w }.into());
            }
        }
        self.log_weights = weights.mapv(f64::ln);
        self.weights.assign(weights);
        self.assemble();
        Ok(())
    }

    /// Per-node `log sigma_i^2` in node-id order, if set.
    pub fn node_log_residuals(&self) -> Option<&Array1<f64>> {
        self.node_log_residuals.as_ref()
    }

    /// Replaces the per-node log residual variances, one per node in node-id order.
    /// Values for unobserved nodes only enter through the smoothness penalty.
    pub fn set_node_log_residuals(
        &mut self,
        log_residuals: &Array1<f64>,
    ) -> Result<(), MigrationError> {
        let expected = self.topology.n_nodes();
        if log_residuals.len() != expected {
            return Err(ConfigurationError::LengthMismatch {
                what: "node residual variances",
                expected,
                found: log_residuals.len(),
            }
            .into());
        }
        if log_residuals.iter().any(|z| !(z.is_finite() && z.exp().is_finite())) {
            return Err(NumericalError::NonFiniteValue("node residual variance").into());
        }
        self.node_log_residuals = Some(log_residuals.clone());
        Ok(())
    }

    /// Sets every log-weight to `log_weight`.
    pub fn set_uniform_log_weight(&mut self, log_weight: f64) -> Result<(), MigrationError> {
        self.set_weights(&Array1::from_elem(self.n_edges(), log_weight))
    }

    fn check_len(&self, found: usize) -> Result<(), MigrationError> {
        let expected = self.n_edges();
        if found != expected {
            return Err(ConfigurationError::LengthMismatch {
                what: "edge weights",
                expected,
                found,
            }
            .into());
        }
        Ok(())
    }

    fn assemble(&mut self) {
        self.laplacian_values.fill(0.0);
        self.uu_values.fill(0.0);
        for (slots, &w) in self.topology.edge_slots.iter().zip(self.weights.iter()) {
            self.laplacian_values[slots.ii] += w;
            self.laplacian_values[slots.jj] += w;
            self.laplacian_values[slots.ij] -= w;
            self.laplacian_values[slots.ji] -= w;
            if let Some(slot) = slots.uu_ii {
                self.uu_values[slot] += w;
            }
            if let Some(slot) = slots.uu_jj {
                self.uu_values[slot] += w;
            }
            if let Some((ab, ba)) = slots.uu_off {
                self.uu_values[ab] -= w;
                self.uu_values[ba] -= w;
            }
        }
    }

    /// `L = B W B^T` in node-id order.
    pub fn laplacian(&self) -> SparseColMatRef<'_, usize, f64> {
        SparseColMatRef::new(
            self.topology.laplacian_pattern.symbolic(),
            &self.laplacian_values,
        )
    }

    /// `L_uu` in local unobserved order.
    pub fn unobserved_laplacian(&self) -> SparseColMatRef<'_, usize, f64> {
        SparseColMatRef::new(self.topology.uu_pattern.symbolic(), &self.uu_values)
    }

    pub fn incidence(&self) -> SparseColMatRef<'_, usize, f64> {
        self.topology.incidence()
    }

    /// Dense Laplacian block in local block order, e.g. `(Observed, Unobserved)` gives
    /// `L_ou`.
    pub fn laplacian_block(&self, rows: NodeBlock, cols: NodeBlock) -> Array2<f64> {
        let topology = &self.topology;
        let size = |block: NodeBlock| match block {
            NodeBlock::Observed => topology.observed.len(),
            NodeBlock::Unobserved => topology.unobserved.len(),
        };
        let mut out = Array2::<f64>::zeros((size(rows), size(cols)));
        let symbolic = topology.laplacian_pattern.symbolic();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..topology.n_nodes() {
            let (col_block, c) = topology.block_of(col);
            if col_block != cols {
                continue;
            }
            for idx in col_ptr[col]..col_ptr[col + 1] {
                let (row_block, r) = topology.block_of(row_idx[idx]);
                if row_block == rows {
                    out[[r, c]] += self.laplacian_values[idx];
                }
            }
        }
        out
    }

    /// Diagonal of `L`, i.e. weighted node degrees.
    pub fn degrees(&self) -> Array1<f64> {
        Array1::from_iter(
            self.topology
                .diag_slots
                .iter()
                .map(|&slot| self.laplacian_values[slot]),
        )
    }

    /// Diagonal of `L_uu`.
    pub fn unobserved_degrees(&self) -> Array1<f64> {
        Array1::from_iter(
            self.topology
                .uu_diag_slots
                .iter()
                .map(|&slot| self.uu_values[slot]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse_exact::sparse_to_dense;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn node(id: usize, samples: Vec<usize>) -> Node {
        Node {
            id,
            position: [id as f64, 0.0],
            samples,
        }
    }

    // 0 - 1 - 2 - 3 with a chord 0 - 2; nodes 1 and 3 unobserved.
    fn kite() -> GraphTopology {
        GraphTopology::new(
            vec![
                node(0, vec![0]),
                node(1, vec![]),
                node(2, vec![1, 2]),
                node(3, vec![]),
            ],
            vec![Edge::new(0, 1), Edge::new(1, 2), Edge::new(2, 3), Edge::new(2, 0)],
        )
        .expect("topology")
    }

    fn dense_laplacian(graph: &SpatialGraph) -> Array2<f64> {
        let b = sparse_to_dense(graph.incidence());
        let w = Array2::from_diag(graph.weights());
        b.dot(&w).dot(&b.t())
    }

    #[test]
    fn laplacian_matches_incidence_product_after_updates() {
        let mut graph = SpatialGraph::new(kite());
        graph
            .set_weights(&array![0.3, -1.2, 0.7, 0.1])
            .expect("weights");
        let expected = dense_laplacian(&graph);
        let got = sparse_to_dense(graph.laplacian());
        for (a, b) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
        for row in got.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn blocks_agree_with_dense_laplacian() {
        let mut graph = SpatialGraph::new(kite());
        graph
            .set_edge_weights(&array![1.5, 0.5, 2.0, 0.25])
            .expect("weights");
        let dense = dense_laplacian(&graph);
        let obs = graph.observed().to_vec();
        let unobs = graph.unobserved().to_vec();
        assert_eq!(obs, vec![0, 2]);
        assert_eq!(unobs, vec![1, 3]);
        let l_ou = graph.laplacian_block(NodeBlock::Observed, NodeBlock::Unobserved);
        let l_uu = graph.laplacian_block(NodeBlock::Unobserved, NodeBlock::Unobserved);
        for (r, &i) in obs.iter().enumerate() {
            for (c, &j) in unobs.iter().enumerate() {
                assert_abs_diff_eq!(l_ou[[r, c]], dense[[i, j]], epsilon = 1e-14);
            }
        }
        let l_uu_sparse = sparse_to_dense(graph.unobserved_laplacian());
        for (r, &i) in unobs.iter().enumerate() {
            for (c, &j) in unobs.iter().enumerate() {
                assert_abs_diff_eq!(l_uu[[r, c]], dense[[i, j]], epsilon = 1e-14);
                assert_abs_diff_eq!(l_uu_sparse[[r, c]], dense[[i, j]], epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn weights_round_trip_through_laplacian() {
        let mut graph = SpatialGraph::new(kite());
        let w = array![0.8, 1.7, 0.05, 3.0];
        graph.set_edge_weights(&w).expect("weights");
        let back = graph
            .topology()
            .weights_from_laplacian(graph.laplacian())
            .expect("round trip");
        for (a, b) in back.iter().zip(w.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-15);
        }
    }

    #[test]
    fn rejected_updates_leave_weights_untouched() {
        let mut graph = SpatialGraph::new(kite());
        let before = graph.weights().clone();
        assert!(matches!(
            graph.set_weights(&array![0.0, 0.0, 0.0]),
            Err(MigrationError::Configuration(
                ConfigurationError::LengthMismatch { .. }
            ))
        ));
        assert!(matches!(
            graph.set_weights(&array![0.0, f64::NAN, 0.0, 0.0]),
            Err(MigrationError::Numerical(NumericalError::NonPositiveWeight {
                edge: 1,
                ..
            }))
        ));
        assert!(matches!(
            graph.set_weights(&array![0.0, 0.0, 1e4, 0.0]),
            Err(MigrationError::Numerical(NumericalError::NonPositiveWeight {
                edge: 2,
                ..
            }))
        ));
        assert!(graph.set_edge_weights(&array![1.0, 0.0, 1.0, 1.0]).is_err());
        assert_eq!(graph.weights(), &before);
    }

    #[test]
    fn disconnected_and_malformed_topologies_are_rejected() {
        let disconnected = GraphTopology::new(
            vec![node(0, vec![0]), node(1, vec![]), node(2, vec![]), node(3, vec![1])],
            vec![Edge::new(0, 1), Edge::new(2, 3)],
        );
        assert!(matches!(
            disconnected,
            Err(MigrationError::Configuration(
                ConfigurationError::DisconnectedGraph { components: 2 }
            ))
        ));

        let duplicate = GraphTopology::new(
            vec![node(0, vec![0]), node(1, vec![])],
            vec![Edge::new(0, 1), Edge { i: 1, j: 0 }],
        );
        assert!(matches!(
            duplicate,
            Err(MigrationError::Configuration(ConfigurationError::InvalidEdge(
                0,
                1,
                "duplicate edge"
            )))
        ));

        let no_edges = GraphTopology::new(vec![node(0, vec![0])], vec![]);
        assert!(matches!(
            no_edges,
            Err(MigrationError::Configuration(ConfigurationError::EmptyGraph(
                "edges"
            )))
        ));
    }

    #[test]
    fn edge_adjacency_pairs_edges_sharing_a_node() {
        let topology = kite();
        // Node 0: edges 0, 3. Node 1: 0, 1. Node 2: 1, 2, 3. Node 3: 2.
        assert_eq!(
            topology.adjacent_edge_pairs(),
            &[(0, 1), (0, 3), (1, 2), (1, 3), (2, 3)]
        );
        let delta = sparse_to_dense(topology.edge_adjacency().expect("delta").as_ref());
        assert_eq!(delta.dim(), (5, 4));
        for row in delta.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 0.0);
        }
    }

    #[test]
    fn node_residuals_are_validated() {
        let mut graph = SpatialGraph::new(kite());
        assert!(graph.node_log_residuals().is_none());
        let n = graph.topology().n_nodes();
        assert!(graph.set_node_log_residuals(&Array1::zeros(n + 1)).is_err());
        let mut bad = Array1::zeros(n);
        bad[1] = 800.0;
        assert!(matches!(
            graph.set_node_log_residuals(&bad),
            Err(MigrationError::Numerical(NumericalError::NonFiniteValue(_)))
        ));
        assert!(graph.node_log_residuals().is_none());
        let z = Array1::from_shape_fn(n, |i| -(i as f64));
        graph.set_node_log_residuals(&z).expect("residuals");
        assert_eq!(graph.node_log_residuals(), Some(&z));
    }

    #[test]
    fn clones_share_topology_but_not_weights() {
        let mut graph = SpatialGraph::new(kite());
        let snapshot = graph.clone();
        graph.set_uniform_log_weight(1.0).expect("weights");
        assert!(Arc::ptr_eq(&graph.shared_topology(), &snapshot.shared_topology()));
        assert_abs_diff_eq!(snapshot.weights()[0], 1.0, epsilon = 0.0);
        assert_abs_diff_eq!(graph.weights()[0], 1.0_f64.exp(), epsilon = 1e-15);
        assert_abs_diff_eq!(graph.degrees()[2], 3.0 * 1.0_f64.exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(graph.unobserved_degrees()[0], 2.0 * 1.0_f64.exp(), epsilon = 1e-12);
    }
}
