//! Linear solves used by the spline fits.
//!
//! The backbone tangents come from a small dense system solved by LU with
//! partial pivoting. The smoothing spline works on a symmetric
//! pentadiagonal matrix, factored as `L D Lᵀ` with a unit lower band.

use nalgebra::DMatrix;
use ndarray::Array2;

use crate::SplineError;

/// Ratio of smallest to largest LU pivot below which a system counts as singular.
const PIVOT_RATIO_MIN: f64 = 1e-13;

/// Solve `a · x = b` for a square `a` and any number of right-hand columns.
pub fn solve_dense(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>, SplineError> {
    let (n, cols) = a.dim();
    if n != cols {
        return Err(SplineError::InvalidParameter(format!(
            "system matrix must be square, got {}x{}",
            n, cols
        )));
    }
    if b.nrows() != n {
        return Err(SplineError::InvalidParameter(format!(
            "right-hand side has {} rows, expected {}",
            b.nrows(),
            n
        )));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(SplineError::SingularSystem(
            "system contains non-finite entries".into(),
        ));
    }

    let lhs = DMatrix::from_fn(n, n, |i, j| a[[i, j]]);
    let rhs = DMatrix::from_fn(n, b.ncols(), |i, j| b[[i, j]]);
    let lu = lhs.lu();

    let pivots = lu.u().diagonal();
    let max_pivot = pivots.iter().fold(0.0_f64, |acc, p| acc.max(p.abs()));
    let min_pivot = pivots.iter().fold(f64::INFINITY, |acc, p| acc.min(p.abs()));
    if max_pivot == 0.0 || min_pivot / max_pivot < PIVOT_RATIO_MIN {
        return Err(SplineError::SingularSystem(format!(
            "pivot ratio {:.3e} below {:.0e}",
            if max_pivot == 0.0 { 0.0 } else { min_pivot / max_pivot },
            PIVOT_RATIO_MIN
        )));
    }

    let x = lu
        .solve(&rhs)
        .ok_or_else(|| SplineError::SingularSystem("LU solve failed".into()))?;
    Ok(Array2::from_shape_fn((n, b.ncols()), |(i, j)| x[(i, j)]))
}

/// `L D Lᵀ` factorization of a symmetric positive definite pentadiagonal matrix.
#[derive(Clone, Debug)]
pub struct PentaLdl {
    d: Vec<f64>,
    l1: Vec<f64>,
    l2: Vec<f64>,
}

impl PentaLdl {
    /// Factor the matrix given by its main diagonal and first two superdiagonals.
    ///
    /// `diag` has length m, `off1` length m-1 and `off2` length m-2 (shorter
    /// slices are padded with zeros).
    pub fn factor(diag: &[f64], off1: &[f64], off2: &[f64]) -> Result<Self, SplineError> {
        let m = diag.len();
        let band = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0);
        let mut d = vec![0.0; m];
        let mut l1 = vec![0.0; m];
        let mut l2 = vec![0.0; m];
        for j in 0..m {
            let mut dj = diag[j];
            if j >= 1 {
                dj -= l1[j - 1] * l1[j - 1] * d[j - 1];
            }
            if j >= 2 {
                dj -= l2[j - 2] * l2[j - 2] * d[j - 2];
            }
            if !(dj.is_finite() && dj > 0.0) {
                return Err(SplineError::SingularSystem(format!(
                    "banded factor lost positive definiteness at row {}",
                    j
                )));
            }
            d[j] = dj;
            if j + 1 < m {
                let mut v = band(off1, j);
                if j >= 1 {
                    v -= l2[j - 1] * d[j - 1] * l1[j - 1];
                }
                l1[j] = v / dj;
            }
            if j + 2 < m {
                l2[j] = band(off2, j) / dj;
            }
        }
        Ok(Self { d, l1, l2 })
    }

    pub fn len(&self) -> usize {
        self.d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.d.is_empty()
    }

    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        let m = self.len();
        let mut x = rhs.to_vec();
        for j in 0..m {
            if j >= 1 {
                x[j] -= self.l1[j - 1] * x[j - 1];
            }
            if j >= 2 {
                x[j] -= self.l2[j - 2] * x[j - 2];
            }
        }
        for j in 0..m {
            x[j] /= self.d[j];
        }
        for j in (0..m).rev() {
            if j + 1 < m {
                x[j] -= self.l1[j] * x[j + 1];
            }
            if j + 2 < m {
                x[j] -= self.l2[j] * x[j + 2];
            }
        }
        x
    }

    /// Main diagonal and first two superdiagonals of the inverse matrix.
    pub fn inverse_band(&self) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let m = self.len();
        let mut s0 = vec![0.0; m];
        let mut s1 = vec![0.0; m];
        let mut s2 = vec![0.0; m];
        let at = |v: &Vec<f64>, i: usize| if i < m { v[i] } else { 0.0 };
        for j in (0..m).rev() {
            let (a, b) = (self.l1[j], self.l2[j]);
            s2[j] = -a * at(&s1, j + 1) - b * at(&s0, j + 2);
            s1[j] = -a * at(&s0, j + 1) - b * at(&s1, j + 1);
            s0[j] = 1.0 / self.d[j] - a * s1[j] - b * s2[j];
        }
        (s0, s1, s2)
    }
}
