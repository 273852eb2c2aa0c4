use crate::error::NumericalError;
use crate::linalg::faer_ndarray::FaerArrayView;
use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::Llt as SparseLlt;
use faer::sparse::{SparseColMat, SparseColMatRef, Triplet};
use ndarray::{Array1, Array2};

/// Sparse LLT factor of an SPD matrix with a fixed sparsity pattern.
#[derive(Clone)]
pub struct SparseSpdFactor {
    factor: SparseLlt<usize, f64>,
    n: usize,
}

/// Builds a CSC matrix from `(row, col, value)` entries; duplicates are summed.
pub fn sparse_from_triplets(
    nrows: usize,
    ncols: usize,
    entries: &[(usize, usize, f64)],
) -> Result<SparseColMat<usize, f64>, NumericalError> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|&(row, col, value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets).map_err(|_| {
        NumericalError::SparseAssembly(format!(
            "failed to assemble {nrows}x{ncols} CSC matrix from {} entries",
            entries.len()
        ))
    })
}

pub fn sparse_to_dense(matrix: SparseColMatRef<'_, usize, f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    let symbolic = matrix.symbolic();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let values = matrix.val();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            dense[[row_idx[idx], col]] += values[idx];
        }
    }
    dense
}

pub fn sparse_matvec(matrix: SparseColMatRef<'_, usize, f64>, vector: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(matrix.nrows());
    let symbolic = matrix.symbolic();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let values = matrix.val();
    for col in 0..matrix.ncols() {
        let x = vector[col];
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            out[row_idx[idx]] += values[idx] * x;
        }
    }
    out
}

/// Factorizes a symmetric positive-definite sparse matrix. Only the upper triangle
/// is read. `label` names the block in the error.
pub fn factorize_sparse_spd(
    h: SparseColMatRef<'_, usize, f64>,
    label: &'static str,
) -> Result<SparseSpdFactor, NumericalError> {
    let factor = h
        .sp_cholesky(Side::Upper)
        .map_err(|_| NumericalError::NotPositiveDefinite { block: label })?;
    Ok(SparseSpdFactor {
        factor,
        n: h.ncols(),
    })
}

pub fn solve_sparse_spd_multi(
    factor: &SparseSpdFactor,
    rhs: &Array2<f64>,
) -> Result<Array2<f64>, NumericalError> {
    if rhs.nrows() != factor.n {
        return Err(NumericalError::DimensionMismatch {
            expected: factor.n,
            found: rhs.nrows(),
        });
    }
    let rhs_view = FaerArrayView::new(rhs);
    let out = factor.factor.solve(rhs_view.as_ref());
    let mut result = Array2::<f64>::zeros(rhs.raw_dim());
    for j in 0..rhs.ncols() {
        for i in 0..rhs.nrows() {
            let value = out[(i, j)];
            if !value.is_finite() {
                return Err(NumericalError::NonFiniteValue("sparse SPD solve"));
            }
            result[[i, j]] = value;
        }
    }
    Ok(result)
}
