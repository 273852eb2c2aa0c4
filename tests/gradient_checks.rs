use approx::assert_abs_diff_eq;
use migration_surface::linalg::sparse_exact::sparse_matvec;
use migration_surface::{
    CandidateGrid, CovarianceModel, CovarianceOptions, GraphBuilder, Objective, ObjectiveOptions,
    Penalty, ResidualVariance, SampleAssignment, SpatialGraph,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

struct Problem {
    graph: SpatialGraph,
    covariance: CovarianceModel,
}

fn simulated_problem(seed: u64) -> Problem {
    let mut rng = StdRng::seed_from_u64(seed);
    let habitat = vec![[0.0, 0.0], [3.0, 0.0], [3.0, 3.0], [0.0, 3.0]];
    let samples: Vec<[f64; 2]> = (0..14)
        .map(|_| [rng.random_range(0.0..3.0), rng.random_range(0.0..3.0)])
        .collect();
    let graph = GraphBuilder::new(habitat, CandidateGrid::Square { spacing: 1.0 })
        .build(&samples, &SampleAssignment::Nearest)
        .expect("graph");

    let n_markers = 150;
    let genotypes = Array2::from_shape_fn((n_markers, samples.len()), |_| {
        f64::from(rng.random_range(0..3u8))
    });
    let covariance = CovarianceModel::new(genotypes.view(), &graph, &CovarianceOptions::default())
        .expect("covariance");
    Problem { graph, covariance }
}

fn random_log_weights(graph: &SpatialGraph, seed: u64) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array1::from_shape_fn(graph.n_edges(), |_| rng.random_range(-0.7..0.7))
}

fn value_at(objective: &Objective, graph: &mut SpatialGraph, x: &Array1<f64>, lambda: f64) -> f64 {
    graph.set_weights(x).expect("weights");
    objective.evaluate(graph, lambda).expect("evaluate").value
}

fn check_gradient(objective: &Objective, graph: &mut SpatialGraph, x: &Array1<f64>, lambda: f64) {
    graph.set_weights(x).expect("weights");
    let analytic = objective.evaluate(graph, lambda).expect("evaluate").gradient;
    let h = 1e-5;
    for e in 0..x.len() {
        let mut plus = x.clone();
        plus[e] += h;
        let mut minus = x.clone();
        minus[e] -= h;
        let fd = (value_at(objective, graph, &plus, lambda)
            - value_at(objective, graph, &minus, lambda))
            / (2.0 * h);
        let scale = analytic[e].abs().max(fd.abs()).max(1.0);
        assert!(
            (analytic[e] - fd).abs() / scale < 1e-5,
            "edge {e}: analytic {} vs finite difference {}",
            analytic[e],
            fd
        );
    }
    graph.set_weights(x).expect("weights");
}

#[test]
fn ridge_gradient_matches_finite_differences_with_unobserved_nodes() {
    let Problem {
        mut graph,
        covariance,
    } = simulated_problem(42);
    assert!(!graph.unobserved().is_empty());
    let objective = Objective::new(&covariance, ObjectiveOptions::default()).expect("objective");
    let x = random_log_weights(&graph, 1);
    check_gradient(&objective, &mut graph, &x, 0.0);
    check_gradient(&objective, &mut graph, &x, 3.0);
}

#[test]
fn smoothness_gradient_matches_finite_differences() {
    let Problem {
        mut graph,
        covariance,
    } = simulated_problem(7);
    let objective = Objective::new(
        &covariance,
        ObjectiveOptions {
            penalty: Penalty::EdgeSmoothness,
            ..ObjectiveOptions::default()
        },
    )
    .expect("objective");
    let x = random_log_weights(&graph, 2);
    check_gradient(&objective, &mut graph, &x, 1.5);
}

#[test]
fn residual_variance_gradient_matches_finite_differences() {
    let Problem {
        mut graph,
        covariance,
    } = simulated_problem(99);
    let objective = Objective::new(
        &covariance,
        ObjectiveOptions {
            residual_variance: ResidualVariance::Fixed(0.02),
            ..ObjectiveOptions::default()
        },
    )
    .expect("objective");
    let x = random_log_weights(&graph, 3);
    check_gradient(&objective, &mut graph, &x, 0.5);
}

#[test]
fn smoothness_penalty_equals_squared_edge_differences() {
    let Problem {
        mut graph,
        covariance,
    } = simulated_problem(5);
    let lambda = 2.5;
    let objective = Objective::new(
        &covariance,
        ObjectiveOptions {
            penalty: Penalty::EdgeSmoothness,
            ..ObjectiveOptions::default()
        },
    )
    .expect("objective");
    let x = random_log_weights(&graph, 4);
    graph.set_weights(&x).expect("weights");
    let eval = objective.evaluate(&graph, lambda).expect("evaluate");

    let delta = graph.topology().edge_adjacency().expect("adjacency");
    let diffs = sparse_matvec(delta.as_ref(), &x);
    assert_eq!(diffs.len(), graph.topology().adjacent_edge_pairs().len());
    assert_abs_diff_eq!(
        eval.penalty_term,
        lambda * diffs.dot(&diffs),
        epsilon = 1e-10 * (1.0 + eval.penalty_term)
    );

    let ridge = Objective::new(&covariance, ObjectiveOptions::default()).expect("objective");
    let ridge_eval = ridge.evaluate(&graph, lambda).expect("evaluate");
    assert_abs_diff_eq!(ridge_eval.data_term, eval.data_term, epsilon = 1e-12);
    assert_abs_diff_eq!(ridge_eval.penalty_term, lambda * x.dot(&x), epsilon = 1e-10);
}

#[test]
fn uniform_rescaling_moves_the_data_term_as_the_null_model_predicts() {
    let Problem {
        mut graph,
        covariance,
    } = simulated_problem(13);
    let objective = Objective::new(&covariance, ObjectiveOptions::default()).expect("objective");
    let log_rate = objective
        .null_rate_closed_form(&graph)
        .expect("closed form")
        .ln();
    graph.set_uniform_log_weight(log_rate).expect("weights");
    let eval = objective.evaluate(&graph, 0.0).expect("evaluate");
    let null = objective
        .evaluate_null(&graph, log_rate, None)
        .expect("null");
    assert_abs_diff_eq!(eval.data_term, null.value, epsilon = 1e-10 * (1.0 + null.value.abs()));
    // Stationary in the common scale: the per-edge gradient sums to zero.
    let total: f64 = eval.gradient.iter().map(|g| g.abs()).sum();
    assert!(eval.gradient.sum().abs() < 1e-8 * (1.0 + total));
    assert_abs_diff_eq!(null.d_log_rate, eval.gradient.sum(), epsilon = 1e-8 * (1.0 + total));
}
