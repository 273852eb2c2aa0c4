use approx::assert_abs_diff_eq;
use faer::{Mat, Side};
use migration_surface::graph::spatial::NodeBlock;
use migration_surface::linalg::sparse_exact::sparse_to_dense;
use migration_surface::{CandidateGrid, GraphBuilder, SampleAssignment, SpatialGraph};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

fn lattice_graph(grid: CandidateGrid) -> SpatialGraph {
    let habitat = vec![[0.0, 0.0], [4.0, 0.0], [4.0, 3.0], [0.0, 3.0]];
    let samples = [[0.1, 0.1], [3.9, 0.2], [2.0, 1.6], [0.3, 2.8], [3.7, 2.9], [2.1, 1.4]];
    GraphBuilder::new(habitat, grid)
        .build(&samples, &SampleAssignment::Nearest)
        .expect("graph")
}

fn randomize(graph: &mut SpatialGraph, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array1::from_shape_fn(graph.n_edges(), |_| rng.random_range(-1.5..1.5));
    graph.set_weights(&x).expect("weights");
}

fn symmetric_eigenvalues(a: &Array2<f64>) -> Array1<f64> {
    let mat = Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]]);
    let eigen = mat.as_ref().self_adjoint_eigen(Side::Lower).expect("eigen");
    let values = eigen.S().column_vector().as_mat();
    Array1::from_shape_fn(a.nrows(), |i| values[(i, 0)])
}

fn dense_laplacian(graph: &SpatialGraph) -> Array2<f64> {
    sparse_to_dense(graph.laplacian())
}

fn check_laplacian(graph: &SpatialGraph) {
    let l = dense_laplacian(graph);
    let n = l.nrows();
    for i in 0..n {
        let row_sum: f64 = l.row(i).sum();
        assert_abs_diff_eq!(row_sum, 0.0, epsilon = 1e-12);
        for j in 0..n {
            assert_abs_diff_eq!(l[[i, j]], l[[j, i]], epsilon = 1e-14);
        }
    }

    let evals = symmetric_eigenvalues(&l);
    let scale = evals.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let tol = 1e-10 * scale.max(1.0);
    let zeros = evals.iter().filter(|v| v.abs() <= tol).count();
    assert_eq!(zeros, 1, "connected graph must have a single zero eigenvalue: {evals}");
    assert!(evals.iter().all(|v| *v >= -tol), "Laplacian must be PSD: {evals}");
}

#[test]
fn triangular_lattice_laplacian_is_a_connected_graph_laplacian() {
    let mut graph = lattice_graph(CandidateGrid::Triangular { spacing: 1.0 });
    check_laplacian(&graph);
    randomize(&mut graph, 7);
    check_laplacian(&graph);
}

#[test]
fn square_lattice_laplacian_is_a_connected_graph_laplacian() {
    let mut graph = lattice_graph(CandidateGrid::Square { spacing: 1.0 });
    randomize(&mut graph, 11);
    check_laplacian(&graph);
}

#[test]
fn laplacian_matches_incidence_product() {
    let mut graph = lattice_graph(CandidateGrid::Triangular { spacing: 1.0 });
    randomize(&mut graph, 3);
    let b = sparse_to_dense(graph.incidence());
    let w = Array2::from_diag(graph.weights());
    let expected = b.dot(&w).dot(&b.t());
    let l = dense_laplacian(&graph);
    for (a, e) in l.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, e, epsilon = 1e-12);
    }
    let degrees = graph.degrees();
    for i in 0..l.nrows() {
        assert_abs_diff_eq!(degrees[i], l[[i, i]], epsilon = 1e-12);
    }
}

#[test]
fn weight_updates_touch_only_the_edge_entries() {
    let mut graph = lattice_graph(CandidateGrid::Square { spacing: 1.0 });
    let before = dense_laplacian(&graph);
    let mut x = graph.log_weights().clone();
    x[0] += 2.0_f64.ln();
    graph.set_weights(&x).expect("weights");
    let after = dense_laplacian(&graph);
    let edge = graph.edges()[0];
    let diff = &after - &before;
    for ((r, c), v) in diff.indexed_iter() {
        let touched = (r == edge.i || r == edge.j) && (c == edge.i || c == edge.j);
        if touched {
            let expected = if r == c { 1.0 } else { -1.0 };
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-12);
        } else {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 0.0);
        }
    }
}

#[test]
fn blocks_reassemble_the_permuted_laplacian() {
    let mut graph = lattice_graph(CandidateGrid::Triangular { spacing: 1.0 });
    randomize(&mut graph, 19);
    let l = dense_laplacian(&graph);
    let observed = graph.observed().to_vec();
    let unobserved = graph.unobserved().to_vec();
    assert!(!unobserved.is_empty());

    let l_oo = graph.laplacian_block(NodeBlock::Observed, NodeBlock::Observed);
    let l_uo = graph.laplacian_block(NodeBlock::Unobserved, NodeBlock::Observed);
    let l_uu_sparse = sparse_to_dense(graph.unobserved_laplacian());
    for (a, &i) in observed.iter().enumerate() {
        for (b, &j) in observed.iter().enumerate() {
            assert_abs_diff_eq!(l_oo[[a, b]], l[[i, j]], epsilon = 0.0);
        }
    }
    for (a, &i) in unobserved.iter().enumerate() {
        for (b, &j) in observed.iter().enumerate() {
            assert_abs_diff_eq!(l_uo[[a, b]], l[[i, j]], epsilon = 0.0);
        }
        for (b, &j) in unobserved.iter().enumerate() {
            assert_abs_diff_eq!(l_uu_sparse[[a, b]], l[[i, j]], epsilon = 1e-14);
        }
    }
}

#[test]
fn weights_are_recovered_from_the_assembled_laplacian() {
    let mut graph = lattice_graph(CandidateGrid::Square { spacing: 1.0 });
    randomize(&mut graph, 23);
    let recovered = graph
        .topology()
        .weights_from_laplacian(graph.laplacian())
        .expect("weights");
    for (a, b) in recovered.iter().zip(graph.weights().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}
