//! Dense LU solves and the batched helpers the guidance variants build on.
//!
//! Batched arrays carry the sample index on axis 0: vectors are `(batch, n)`,
//! matrices `(batch, n, n)`. Per-sample work is spread over rayon.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;

use crate::ad::Float;
use crate::error::{Error, Result};

/// LU factors with partial pivoting: L strictly below the diagonal (unit
/// diagonal implied), U on and above it, plus the row permutation.
#[derive(Clone, Debug)]
pub struct LuFactors<F> {
    lu: Array2<F>,
    perm: Vec<usize>,
}

/// Tolerance below which a pivot (or diagonal entry) of a matrix whose
/// largest entry is `scale` counts as zero: `n · ε · scale`.
pub fn singular_tol<F: Float>(n: usize, scale: F) -> F {
    F::from_usize(n.max(1)).unwrap_or_else(F::one) * F::epsilon() * scale
}

/// Factorize a square matrix. `None` if it is not finite, or if a pivot falls
/// to [`singular_tol`] relative to the largest entry.
pub fn lu_factor<F: Float>(a: ArrayView2<'_, F>) -> Option<LuFactors<F>> {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n);

    if a.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let scale = a.iter().fold(F::zero(), |m, v| m.max(v.abs()));
    let tol = singular_tol(n, scale);

    let mut lu = a.to_owned();
    let mut perm: Vec<usize> = (0..n).collect();

    for col in 0..n {
        let (pivot_row, max_val) = (col..n)
            .map(|row| (row, lu[[row, col]].abs()))
            .fold((col, F::zero()), |best, cur| if cur.1 > best.1 { cur } else { best });

        if max_val <= tol {
            return None;
        }

        if pivot_row != col {
            for j in 0..n {
                lu.swap([col, j], [pivot_row, j]);
            }
            perm.swap(col, pivot_row);
        }

        let pivot = lu[[col, col]];
        for row in (col + 1)..n {
            let factor = lu[[row, col]] / pivot;
            lu[[row, col]] = factor;
            for j in (col + 1)..n {
                let upper = lu[[col, j]];
                lu[[row, j]] = lu[[row, j]] - factor * upper;
            }
        }
    }

    Some(LuFactors { lu, perm })
}

impl<F: Float> LuFactors<F> {
    pub fn dim(&self) -> usize {
        self.perm.len()
    }

    /// Solve `A x = b` against the stored factors.
    pub fn solve(&self, b: ArrayView1<'_, F>) -> Vec<F> {
        let n = self.dim();
        debug_assert_eq!(b.len(), n);

        let mut y: Vec<F> = self.perm.iter().map(|&p| b[p]).collect();
        for i in 1..n {
            let mut acc = y[i];
            for j in 0..i {
                acc = acc - self.lu[[i, j]] * y[j];
            }
            y[i] = acc;
        }

        let mut x = vec![F::zero(); n];
        for i in (0..n).rev() {
            let mut acc = y[i];
            for j in (i + 1)..n {
                acc = acc - self.lu[[i, j]] * x[j];
            }
            x[i] = acc / self.lu[[i, i]];
        }
        x
    }
}

/// Solve `A x = b`; `None` when `A` is singular.
pub fn lu_solve<F: Float>(a: ArrayView2<'_, F>, b: ArrayView1<'_, F>) -> Option<Vec<F>> {
    lu_factor(a).map(|f| f.solve(b))
}

fn check_batch(what: &str, lhs: usize, rhs: usize) -> Result<()> {
    if lhs != rhs {
        return Err(Error::ShapeMismatch(format!(
            "{what}: batch sizes {lhs} and {rhs} differ"
        )));
    }
    Ok(())
}

fn stack_rows<F: Float>(rows: Vec<Vec<F>>, width: usize) -> Result<Array2<F>> {
    let batch = rows.len();
    let flat: Vec<F> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((batch, width), flat).map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// One independent solve `A[i] x[i] = b[i]` per sample.
///
/// Fails with [`Error::LinearAlgebra`] naming the lowest-indexed singular
/// sample.
pub fn batch_solve<F: Float>(a: &Array3<F>, b: &Array2<F>) -> Result<Array2<F>> {
    check_batch("batch_solve", a.len_of(Axis(0)), b.nrows())?;
    let n = b.ncols();
    if a.dim().1 != n || a.dim().2 != n {
        return Err(Error::ShapeMismatch(format!(
            "batch_solve: matrices {:?} do not match right-hand sides of length {n}",
            &a.shape()[1..]
        )));
    }

    let solved: Vec<Option<Vec<F>>> = (0..b.nrows())
        .into_par_iter()
        .map(|i| lu_solve(a.index_axis(Axis(0), i), b.row(i)))
        .collect();
    let rows = solved
        .into_iter()
        .enumerate()
        .map(|(i, x)| x.ok_or(Error::LinearAlgebra { sample: i }))
        .collect::<Result<Vec<_>>>()?;
    stack_rows(rows, n)
}

/// Solve every sample against one shared matrix, factorized once.
pub fn batch_solve_shared<F: Float>(a: &Array2<F>, b: &Array2<F>) -> Result<Array2<F>> {
    if a.nrows() != b.ncols() || a.ncols() != b.ncols() {
        return Err(Error::ShapeMismatch(format!(
            "batch_solve_shared: matrix {:?} does not match right-hand sides of length {}",
            a.shape(),
            b.ncols()
        )));
    }
    let factors = lu_factor(a.view()).ok_or(Error::LinearAlgebra { sample: 0 })?;
    let rows: Vec<Vec<F>> = b
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| factors.solve(row))
        .collect();
    stack_rows(rows, b.ncols())
}

/// `A[i]ᵀ · v[i]` per sample: the transposed-Jacobian contraction.
pub fn batch_matvec_t<F: Float>(a: &Array3<F>, v: &Array2<F>) -> Result<Array2<F>> {
    check_batch("batch_matvec_t", a.len_of(Axis(0)), v.nrows())?;
    let (_, m, n) = a.dim();
    if m != v.ncols() {
        return Err(Error::ShapeMismatch(format!(
            "batch_matvec_t: transposed {m}x{n} matrices against vectors of length {}",
            v.ncols()
        )));
    }
    let mut out = Array2::zeros((v.nrows(), n));
    Zip::from(out.rows_mut())
        .and(a.outer_iter())
        .and(v.rows())
        .par_for_each(|mut o, ai, vi| o.assign(&ai.t().dot(&vi)));
    Ok(out)
}

/// `A · v[i]` for one matrix shared by every sample.
pub fn batch_matvec_shared<F: Float>(a: &Array2<F>, v: &Array2<F>) -> Result<Array2<F>> {
    if a.ncols() != v.ncols() {
        return Err(Error::ShapeMismatch(format!(
            "batch_matvec_shared: {:?} matrix against vectors of length {}",
            a.shape(),
            v.ncols()
        )));
    }
    Ok(v.dot(&a.t()))
}

/// Elementwise `v[i] ⊙ w[i]`, e.g. scaling innovations by a diagonal
/// precision.
pub fn batch_mul<F: Float>(v: &Array2<F>, w: &Array2<F>) -> Result<Array2<F>> {
    if v.dim() != w.dim() {
        return Err(Error::ShapeMismatch(format!(
            "batch_mul: {:?} against {:?}",
            v.shape(),
            w.shape()
        )));
    }
    Ok(v * w)
}
