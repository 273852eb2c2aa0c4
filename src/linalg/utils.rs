use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Compensated summation for long reductions such as traces over many markers.
#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

/// `tr(A B)` without forming the product.
pub(crate) fn trace_of_product<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    debug_assert_eq!(a.ncols(), b.nrows());
    debug_assert_eq!(a.nrows(), b.ncols());
    let mut acc = KahanSum::default();
    for i in 0..a.nrows() {
        for k in 0..a.ncols() {
            acc.add(a[[i, k]] * b[[k, i]]);
        }
    }
    acc.sum()
}

pub(crate) fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn kahan_sum_keeps_small_terms() {
        let mut acc = KahanSum::default();
        acc.add(1e16);
        for _ in 0..10 {
            acc.add(1.0);
        }
        acc.add(-1e16);
        assert_abs_diff_eq!(acc.sum(), 10.0, epsilon = 0.0);
    }

    #[test]
    fn trace_of_product_matches_dense_product() {
        let a = array![[1.0, 2.0, 0.5], [0.0, -1.0, 3.0]];
        let b = array![[2.0, 1.0], [0.5, 4.0], [-1.0, 1.5]];
        let expected = a.dot(&b).diag().sum();
        assert_abs_diff_eq!(trace_of_product(&a, &b), expected, epsilon = 1e-14);
    }
}
