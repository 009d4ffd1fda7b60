//! Guidance through vector-Jacobian products of the Tweedie estimate.
//!
//! [`Vjp`], [`VjpAlt`] and [`VjpDiag`] assemble `H·J_{x̂0}` row by row from
//! one recording per sample and need a linear observation map. [`VjpMask`]
//! works with any map and estimates only the diagonal of `C_yy`, with two
//! vjps per sample.

use ndarray::{Array2, ArrayView1, Axis};

use super::{
    add_correction, per_sample, rows_through, shifted, stack_matrices, stack_vectors, GuidanceArgs,
    GuidanceMethod, MethodName, Setup, SignalShape,
};
use crate::ad::Pullback;
use crate::error::{Error, Result};
use crate::linalg::{batch_matvec_shared, batch_matvec_t, batch_solve};

/// Per-sample products of the `x ↦ x̂0` recording.
struct Projected {
    score: Vec<f64>,
    innovation: Vec<f64>,
    /// `H · J_{x̂0}`, `(d_y × d_x)`.
    hj: Array2<f64>,
    pullback: Pullback<f64>,
}

fn project(setup: &Setup, h: &Array2<f64>, x: &Array2<f64>, t: &[f64]) -> Result<Vec<Projected>> {
    let recorded = per_sample(x.nrows(), |i| {
        let xi = x.row(i).to_vec();
        Ok(setup.pullback_x0(&xi, t[i]))
    })?;
    let x0 = stack_vectors(recorded.iter().map(|(x0, _, _)| x0.clone()).collect(), setup.d_x)?;
    let predictions = batch_matvec_shared(h, &x0)?;
    recorded
        .into_iter()
        .enumerate()
        .map(|(i, (_, pullback, score))| {
            Ok(Projected {
                score,
                innovation: setup.innovation(i, &predictions.row(i).to_vec())?,
                hj: rows_through(&pullback, h),
                pullback,
            })
        })
        .collect()
}

/// `C_i⁻¹ (y_i − H x̂0_i)` with `C_i = ratio(t_i)·H (HJ)ᵀ + σ²I`.
fn solve_full(
    setup: &Setup,
    h: &Array2<f64>,
    noise_var: f64,
    projected: &[Projected],
    t: &[f64],
) -> Result<Array2<f64>> {
    let cs: Vec<Array2<f64>> = projected
        .iter()
        .zip(t)
        .map(|(p, &ti)| shifted(&h.dot(&p.hj.t()), setup.sde.ratio(ti), noise_var))
        .collect();
    let innov = stack_vectors(
        projected.iter().map(|p| p.innovation.clone()).collect(),
        setup.d_y,
    )?;
    batch_solve(&stack_matrices(&cs)?, &innov)
        .inspect_err(|e| tracing::warn!(%e, "innovation covariance solve failed"))
}

fn matrix_noise(args: &GuidanceArgs) -> Result<(Setup, Array2<f64>, f64)> {
    let noise_std = args.require_noise_std()?;
    let (setup, h) = Setup::for_matrix(args)?;
    Ok((setup, h, noise_std * noise_std))
}

/// Full-covariance guidance, `ls = (HJ)ᵀ C⁻¹ (y − H x̂0)`.
pub struct Vjp {
    setup: Setup,
    h: Array2<f64>,
    noise_var: f64,
}

impl Vjp {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let (setup, h, noise_var) = matrix_noise(&args)?;
        Ok(Vjp {
            setup,
            h,
            noise_var,
        })
    }
}

impl GuidanceMethod for Vjp {
    fn name(&self) -> &str {
        MethodName::Vjp.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let projected = project(&self.setup, &self.h, x, t)?;
        let f = solve_full(&self.setup, &self.h, self.noise_var, &projected, t)?;
        let hj: Vec<Array2<f64>> = projected.iter().map(|p| p.hj.clone()).collect();
        let ls = batch_matvec_t(&stack_matrices(&hj)?, &f)?;
        add_correction(projected.into_iter().map(|p| p.score).collect(), &ls)
    }
}

/// Same covariance as [`Vjp`], but the correction is one more vjp,
/// `ls = Jᵀ (Hᵀ C⁻¹ (y − H x̂0))`.
pub struct VjpAlt {
    setup: Setup,
    h: Array2<f64>,
    noise_var: f64,
}

impl VjpAlt {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let (setup, h, noise_var) = matrix_noise(&args)?;
        Ok(VjpAlt {
            setup,
            h,
            noise_var,
        })
    }
}

impl GuidanceMethod for VjpAlt {
    fn name(&self) -> &str {
        MethodName::VjpAlt.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let projected = project(&self.setup, &self.h, x, t)?;
        let f = solve_full(&self.setup, &self.h, self.noise_var, &projected, t)?;
        let back = batch_matvec_shared(&self.h.t().to_owned(), &f)?;
        let ls = per_sample(x.nrows(), |i| Ok(projected[i].pullback.pull(&back.row(i).to_vec())))?;
        add_correction(
            projected.into_iter().map(|p| p.score).collect(),
            &stack_vectors(ls, self.setup.d_x)?,
        )
    }
}

/// Diagonal covariance from the full `HJ` rows:
/// `C_k = ratio(t)·Σ_j H_kj (HJ)_kj + σ²`.
pub struct VjpDiag {
    setup: Setup,
    h: Array2<f64>,
    noise_var: f64,
}

impl VjpDiag {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let (setup, h, noise_var) = matrix_noise(&args)?;
        Ok(VjpDiag {
            setup,
            h,
            noise_var,
        })
    }
}

impl GuidanceMethod for VjpDiag {
    fn name(&self) -> &str {
        MethodName::VjpDiag.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let projected = project(setup, &self.h, x, t)?;
        let ls = per_sample(x.nrows(), |i| {
            let p = &projected[i];
            let diag = (&self.h * &p.hj).sum_axis(Axis(1)).to_vec();
            let c = setup.diagonal_covariance(i, setup.sde.ratio(t[i]), diag, self.noise_var)?;
            let f: Vec<f64> = p.innovation.iter().zip(&c).map(|(r, c)| r / c).collect();
            let back = self.h.t().dot(&ArrayView1::from(&f[..]));
            Ok(p.pullback.pull(&back.to_vec()))
        })?;
        add_correction(
            projected.into_iter().map(|p| p.score).collect(),
            &stack_vectors(ls, setup.d_x)?,
        )
    }
}

/// Diagonal covariance for an arbitrary observation map, estimated as
/// `h(J_{h∘x̂0}ᵀ h(1))`. Exact for coordinate masks with a diagonal
/// `J_{x̂0}`.
pub struct VjpMask {
    setup: Setup,
    noise_var: f64,
}

impl VjpMask {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let noise_std = args.require_noise_std()?;
        Ok(VjpMask {
            setup: Setup::for_map(&args)?,
            noise_var: noise_std * noise_std,
        })
    }
}

impl GuidanceMethod for VjpMask {
    fn name(&self) -> &str {
        MethodName::VjpMask.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let ones = setup.observation.observe_f64(&vec![1.0; setup.d_x]);
        if ones.len() != setup.d_y {
            return Err(Error::ShapeMismatch(format!(
                "observation has {} components, measurement has {}",
                ones.len(),
                setup.d_y
            )));
        }

        let rows = per_sample(x.nrows(), |i| {
            let xi = x.row(i).to_vec();
            let (hx, pb, s) = setup.pullback_h_x0(&xi, t[i]);
            let innovation = setup.innovation(i, &hx)?;
            let diag = setup.observation.observe_f64(&pb.pull(&ones));
            let c = setup.diagonal_covariance(i, setup.sde.ratio(t[i]), diag, self.noise_var)?;
            let f: Vec<f64> = innovation.iter().zip(&c).map(|(r, c)| r / c).collect();
            Ok((s, pb.pull(&f)))
        })?;
        let (scores, ls): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
        add_correction(scores, &stack_vectors(ls, setup.d_x)?)
    }
}
