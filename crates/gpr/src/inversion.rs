//! Inversion strategies for the regularized kernel matrix.
//!
//! Four algorithms are available with different accuracy/speed trade-offs:
//!
//! | method                             | accuracy                          | cost     |
//! |------------------------------------|-----------------------------------|----------|
//! | [`InversionMethod::Direct`]        | moderate, full pivoting LU        | fastest  |
//! | [`InversionMethod::HighAccuracySvd`] | highest, one-sided Jacobi SVD   | slowest  |
//! | [`InversionMethod::FastSvd`]       | high, bidiagonalization SVD       | moderate |
//! | [`InversionMethod::SymmetricEigen`] | high, exploits symmetry          | moderate |
//!
//! Every method fails with [`GprError::SingularMatrix`] when the matrix is singular
//! with respect to the tolerance `n * eps * max(|pivot|)` (resp. singular value or
//! eigenvalue). With the `stable` flag, spectral methods drop the components
//! below that tolerance (pseudo-inverse) instead of failing.

use crate::errors::{GprError, Result};
use linfa::Float;
use linfa_linalg::{eigh::*, svd::*};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of sweeps of the one-sided Jacobi SVD
const JACOBI_MAX_SWEEPS: usize = 100;

/// Algorithm used to invert the regularized kernel matrix.
///
/// The inversion method is an instance configuration and is never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum InversionMethod {
    /// LU decomposition with full pivoting
    #[default]
    Direct,
    /// One-sided Jacobi singular value decomposition
    HighAccuracySvd,
    /// Singular value decomposition through bidiagonalization
    FastSvd,
    /// Eigendecomposition of the symmetric matrix
    SymmetricEigen,
}

impl fmt::Display for InversionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            InversionMethod::Direct => "Direct",
            InversionMethod::HighAccuracySvd => "HighAccuracySvd",
            InversionMethod::FastSvd => "FastSvd",
            InversionMethod::SymmetricEigen => "SymmetricEigen",
        };
        write!(f, "{name}")
    }
}

/// Determinant in log space `det = sign * exp(ln_abs)`, safe from the underflow
/// of the plain product of factors for large kernel matrices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogDeterminant<F: Float> {
    /// Sign of the determinant: -1, 0 or 1
    pub sign: F,
    /// Natural logarithm of the absolute value of the determinant,
    /// `-inf` when the determinant is zero
    pub ln_abs: F,
}

impl<F: Float> LogDeterminant<F> {
    fn from_factors(sign: F, factors: impl Iterator<Item = F>) -> Self {
        let mut sign = sign;
        let mut ln_abs = F::zero();
        for v in factors {
            if v < F::zero() {
                sign = -sign;
            } else if v == F::zero() {
                sign = F::zero();
            }
            ln_abs += num_traits::Float::abs(v).ln();
        }
        LogDeterminant { sign, ln_abs }
    }

    /// Determinant value, which may underflow to zero or overflow to infinity
    pub fn value(&self) -> F {
        self.sign * self.ln_abs.exp()
    }
}

/// LU decomposition with full pivoting `P.A.Q = L.U`
#[derive(Debug)]
struct FullPivLu<F: Float> {
    /// L (unit diagonal, strictly lower part) and U (upper part) packed together
    lu: Array2<F>,
    /// Original row index of the i-th row of `lu`
    row_perm: Vec<usize>,
    /// Original column index of the j-th column of `lu`
    col_perm: Vec<usize>,
    /// Sign of the permutations
    sign: F,
}

impl<F: Float> FullPivLu<F> {
    fn decompose(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Self> {
        let n = a.nrows();
        let mut lu = a.to_owned();
        let mut row_perm: Vec<usize> = (0..n).collect();
        let mut col_perm: Vec<usize> = (0..n).collect();
        let mut sign = F::one();
        let mut max_pivot = F::zero();
        let threshold = F::epsilon() * F::cast(n);

        for k in 0..n {
            let (mut pi, mut pj, mut pmax) = (k, k, F::zero());
            for i in k..n {
                for j in k..n {
                    let v = num_traits::Float::abs(lu[[i, j]]);
                    if v > pmax {
                        (pi, pj, pmax) = (i, j, v);
                    }
                }
            }
            if k == 0 {
                max_pivot = pmax;
            }
            if pmax == F::zero() || pmax <= max_pivot * threshold {
                return Err(GprError::SingularMatrix(format!(
                    "full pivoting LU: rank deficiency detected at pivot {k} of {n}"
                )));
            }
            if pi != k {
                for j in 0..n {
                    lu.swap([k, j], [pi, j]);
                }
                row_perm.swap(k, pi);
                sign = -sign;
            }
            if pj != k {
                for i in 0..n {
                    lu.swap([i, k], [i, pj]);
                }
                col_perm.swap(k, pj);
                sign = -sign;
            }
            let pivot = lu[[k, k]];
            for i in (k + 1)..n {
                let factor = lu[[i, k]] / pivot;
                lu[[i, k]] = factor;
                for j in (k + 1)..n {
                    let ukj = lu[[k, j]];
                    lu[[i, j]] -= factor * ukj;
                }
            }
        }

        Ok(FullPivLu {
            lu,
            row_perm,
            col_perm,
            sign,
        })
    }

    /// Solve `A.X = B`
    fn solve(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let n = self.lu.nrows();
        let mut x = Array2::zeros((n, b.ncols()));
        let mut z = Array1::zeros(n);
        for c in 0..b.ncols() {
            for i in 0..n {
                z[i] = b[[self.row_perm[i], c]];
            }
            // L.y = P.b
            for i in 0..n {
                let mut acc = z[i];
                for j in 0..i {
                    acc -= self.lu[[i, j]] * z[j];
                }
                z[i] = acc;
            }
            // U.z = y
            for i in (0..n).rev() {
                let mut acc = z[i];
                for j in (i + 1)..n {
                    acc -= self.lu[[i, j]] * z[j];
                }
                z[i] = acc / self.lu[[i, i]];
            }
            for i in 0..n {
                x[[self.col_perm[i], c]] = z[i];
            }
        }
        x
    }

    fn determinant(&self) -> F {
        self.lu.diag().fold(self.sign, |acc, v| acc * *v)
    }

    fn log_determinant(&self) -> LogDeterminant<F> {
        LogDeterminant::from_factors(self.sign, self.lu.diag().iter().copied())
    }
}

/// One-sided Jacobi SVD `A = U.diag(s).V^t` of a square matrix
fn jacobi_svd<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<(Array2<F>, Array1<F>, Array2<F>)> {
    let n = a.ncols();
    let mut u = a.to_owned();
    let mut v = Array2::<F>::eye(n);
    let eps = F::epsilon();
    let two = F::cast(2.);

    let mut converged = n < 2;
    let mut sweeps = 0;
    while !converged && sweeps < JACOBI_MAX_SWEEPS {
        sweeps += 1;
        let mut rotated = false;
        for p in 0..(n - 1) {
            for q in (p + 1)..n {
                let cp = u.column(p);
                let cq = u.column(q);
                let alpha = cp.dot(&cp);
                let beta = cq.dot(&cq);
                let gamma = cp.dot(&cq);
                if num_traits::Float::abs(gamma) <= eps * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (two * gamma);
                let sign = if zeta < F::zero() { -F::one() } else { F::one() };
                let t = sign / (num_traits::Float::abs(zeta) + (F::one() + zeta * zeta).sqrt());
                let c = F::one() / (F::one() + t * t).sqrt();
                let s = c * t;
                rotate_columns(&mut u, p, q, c, s);
                rotate_columns(&mut v, p, q, c, s);
            }
        }
        converged = !rotated;
    }
    if !converged {
        return Err(GprError::SingularMatrix(format!(
            "Jacobi SVD did not converge after {JACOBI_MAX_SWEEPS} sweeps"
        )));
    }
    debug!("Jacobi SVD converged in {sweeps} sweeps");

    let s = Array1::from_shape_fn(n, |j| u.column(j).dot(&u.column(j)).sqrt());
    for (j, sj) in s.iter().enumerate() {
        if *sj > F::zero() {
            u.column_mut(j).mapv_inplace(|x| x / *sj);
        }
    }
    Ok((u, s, v))
}

fn rotate_columns<F: Float>(m: &mut Array2<F>, p: usize, q: usize, c: F, s: F) {
    for i in 0..m.nrows() {
        let mp = m[[i, p]];
        let mq = m[[i, q]];
        m[[i, p]] = c * mp - s * mq;
        m[[i, q]] = s * mp + c * mq;
    }
}

/// A decomposition of the regularized kernel matrix from which both
/// the inverse and the determinant are computed.
#[derive(Debug)]
enum Decomposition<F: Float> {
    Lu(FullPivLu<F>),
    /// `A = left.diag(values).right^t` with `inv_values` the (possibly clipped) inverted values
    Spectral {
        left: Array2<F>,
        values: Array1<F>,
        right: Array2<F>,
        inv_values: Array1<F>,
    },
}

impl<F: Float> Decomposition<F> {
    fn new(
        k: &ArrayBase<impl Data<Elem = F>, Ix2>,
        method: InversionMethod,
        stable: bool,
    ) -> Result<Self> {
        if k.nrows() != k.ncols() {
            return Err(GprError::DimensionMismatch(format!(
                "matrix to invert should be square, got ({}, {})",
                k.nrows(),
                k.ncols()
            )));
        }
        if k.nrows() == 0 {
            return Err(GprError::InvalidState(
                "cannot invert an empty matrix".to_string(),
            ));
        }
        match method {
            InversionMethod::Direct => Ok(Decomposition::Lu(FullPivLu::decompose(k)?)),
            InversionMethod::HighAccuracySvd => {
                let (u, s, v) = jacobi_svd(k)?;
                Self::spectral(u, s, v, stable, method)
            }
            InversionMethod::FastSvd => {
                let (u, s, vt) = k.svd(true, true)?;
                let (u, vt) = u.zip(vt).ok_or_else(|| {
                    GprError::SingularMatrix("SVD singular vectors not computed".to_string())
                })?;
                Self::spectral(u, s, vt.reversed_axes(), stable, method)
            }
            InversionMethod::SymmetricEigen => {
                let (vals, vecs) = k.to_owned().eigh_into()?;
                Self::spectral(vecs.to_owned(), vals, vecs, stable, method)
            }
        }
    }

    fn spectral(
        left: Array2<F>,
        values: Array1<F>,
        right: Array2<F>,
        stable: bool,
        method: InversionMethod,
    ) -> Result<Self> {
        let n = values.len();
        let max_value = values
            .iter()
            .fold(F::zero(), |acc, v| acc.max(num_traits::Float::abs(*v)));
        if max_value == F::zero() {
            return Err(GprError::SingularMatrix(format!(
                "{method}: all singular values are zero"
            )));
        }
        let tol = max_value * F::epsilon() * F::cast(n);
        let n_small = values
            .iter()
            .filter(|v| num_traits::Float::abs(**v) <= tol)
            .count();
        if n_small > 0 {
            if !stable {
                return Err(GprError::SingularMatrix(format!(
                    "{method}: {n_small} value(s) below tolerance {tol}"
                )));
            }
            warn!("{method}: clipping {n_small} value(s) below tolerance {tol}");
        }
        let inv_values = values.mapv(|v| {
            if num_traits::Float::abs(v) <= tol {
                F::zero()
            } else {
                F::one() / v
            }
        });
        Ok(Decomposition::Spectral {
            left,
            values,
            right,
            inv_values,
        })
    }

    fn inverse(&self) -> Array2<F> {
        match self {
            Decomposition::Lu(lu) => lu.solve(&Array2::<F>::eye(lu.lu.nrows())),
            Decomposition::Spectral {
                left,
                right,
                inv_values,
                ..
            } => (right * inv_values).dot(&left.t()),
        }
    }

    fn log_determinant(&self) -> LogDeterminant<F> {
        match self {
            Decomposition::Lu(lu) => lu.log_determinant(),
            Decomposition::Spectral { values, .. } => {
                LogDeterminant::from_factors(F::one(), values.iter().copied())
            }
        }
    }

    /// Determinant of the decomposed matrix. For SVD based methods this is
    /// the product of singular values, i.e. the determinant of a positive
    /// semi-definite matrix such as a regularized kernel matrix.
    fn determinant(&self) -> F {
        match self {
            Decomposition::Lu(lu) => lu.determinant(),
            Decomposition::Spectral { values, .. } => values.fold(F::one(), |acc, v| acc * *v),
        }
    }
}

/// Invert the (regularized) kernel matrix `k` with the given `method`.
pub fn invert_kernel_matrix<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    method: InversionMethod,
    stable: bool,
) -> Result<Array2<F>> {
    Ok(Decomposition::new(k, method, stable)?.inverse())
}

/// Invert the (regularized) kernel matrix `k` with the given `method` and
/// returns its determinant computed from the same decomposition.
pub fn invert_kernel_matrix_with_determinant<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    method: InversionMethod,
    stable: bool,
) -> Result<(Array2<F>, F)> {
    let decomposition = Decomposition::new(k, method, stable)?;
    Ok((decomposition.inverse(), decomposition.determinant()))
}

/// Invert the (regularized) kernel matrix `k` with the given `method` and
/// returns its log-determinant computed from the same decomposition.
pub fn invert_kernel_matrix_with_log_determinant<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    method: InversionMethod,
    stable: bool,
) -> Result<(Array2<F>, LogDeterminant<F>)> {
    let decomposition = Decomposition::new(k, method, stable)?;
    Ok((decomposition.inverse(), decomposition.log_determinant()))
}
