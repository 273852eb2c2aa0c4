//! Thin bridge between `ndarray` storage and `faer` kernels.
//!
//! Everything in the crate keeps matrices as `ndarray` arrays; dense products and
//! symmetric factorizations go through faer via zero-copy views.

use crate::linalg::utils::symmetrize;
use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Accum, Mat, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, CowArray, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("dense Cholesky failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

// Below roughly 64^3 flops ndarray's own dot is faster than dispatching to faer.
fn gemm_backend(m: usize, n: usize, k: usize) -> Option<Par> {
    let flops = m.saturating_mul(n).saturating_mul(k);
    if m.max(n).max(k) < 32 || flops < 64 * 64 * 64 {
        return None;
    }
    if m.min(n).min(k) >= 128 {
        Some(get_global_parallelism())
    } else {
        Some(Par::Seq)
    }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let column = diag.column_vector().as_mat();
    Array1::from_shape_fn(column.nrows(), |i| column[(i, 0)])
}

/// Read-only faer view over an ndarray matrix.
///
/// Reversed or broadcast layouts (non-positive strides) are copied into standard
/// layout first; faer kernels walk memory forwards.
pub struct FaerArrayView<'a> {
    data: CowArray<'a, f64, Ix2>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let view = array.view();
        let forward = view.strides().iter().all(|&s| s > 0);
        let data = if forward || view.is_empty() {
            CowArray::from(view)
        } else {
            CowArray::from(view.as_standard_layout().into_owned())
        };
        Self { data }
    }

    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let strides = self.data.strides();
        // SAFETY: pointer, shape and strides describe `self.data`, which is borrowed
        // for the lifetime of the returned view.
        unsafe {
            MatRef::from_raw_parts(
                self.data.as_ptr(),
                self.data.nrows(),
                self.data.ncols(),
                strides[0],
                strides[1],
            )
        }
    }
}

/// `A B` for compatible `(n, p)` and `(p, q)` matrices.
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    debug_assert_eq!(a.ncols(), b.nrows(), "inner dimensions differ");
    let (n, q, p) = (a.nrows(), b.ncols(), a.ncols());
    let Some(par) = gemm_backend(n, q, p) else {
        return a.dot(b);
    };
    let lhs = FaerArrayView::new(a);
    let rhs = FaerArrayView::new(b);
    let mut out = Mat::<f64>::zeros(n, q);
    faer::linalg::matmul::matmul(out.as_mut(), Accum::Replace, lhs.as_ref(), rhs.as_ref(), 1.0, par);
    mat_to_array(out.as_ref())
}

/// Gram matrix `A^T A`, e.g. markers x nodes into nodes x nodes.
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let mut gram = fast_ab(&a.t(), a);
    symmetrize(&mut gram);
    gram
}

/// Dense LLT factor of a symmetric positive-definite matrix.
pub struct FaerCholeskyFactor {
    llt: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs = FaerArrayView::new(rhs);
        mat_to_array(self.llt.solve(rhs.as_ref()).as_ref())
    }

    /// Explicit inverse, symmetrized to remove solve round-off.
    pub fn inverse(&self) -> Array2<f64> {
        let mut inv = self.solve_mat(&Array2::eye(self.llt.L().nrows()));
        symmetrize(&mut inv);
        inv
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.llt.L().diagonal())
    }

    /// `log det(A) = 2 Σ log L_ii`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().iter().map(|d| d.ln()).sum::<f64>()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        let view = FaerArrayView::new(self);
        let llt = view.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { llt })
    }
}
