use ndarray::{Array1, Array2};

use super::{
    add_correction, per_sample, shifted, stack_matrices, stack_vectors, GuidanceArgs,
    GuidanceMethod, MethodName, Setup, SignalShape,
};
use crate::ad;
use crate::error::Result;
use crate::linalg::{batch_matvec_t, batch_mul, batch_solve};
use crate::sde::{estimate_h_x0, estimate_x0_batched, BatchEstimate};

/// How the Jacobian of `h∘x̂0` is assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JacobianMode {
    /// One recording, one reverse sweep per observation component.
    Reverse,
    /// One dual-number pass per signal component.
    Forward,
}

/// Which part of `C_yy = ratio(t)·M + σ²I` is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Covariance {
    Full,
    Diagonal,
}

/// Guidance through the full Jacobian `J = ∂h(x̂0)/∂x`.
///
/// `M` is `h` applied row-wise to `J`; for a linear map that is
/// `H J_{x̂0} Hᵀ`. The correction is `ls = Jᵀ C⁻¹ (y − h(x̂0))`, with `C`
/// solved per sample or, for [`Covariance::Diagonal`], inverted
/// elementwise.
pub struct JacobianGuidance {
    setup: Setup,
    noise_var: f64,
    mode: JacobianMode,
    covariance: Covariance,
}

impl JacobianGuidance {
    pub fn new(args: GuidanceArgs, mode: JacobianMode, covariance: Covariance) -> Result<Self> {
        let noise_std = args.require_noise_std()?;
        Ok(JacobianGuidance {
            setup: Setup::for_map(&args)?,
            noise_var: noise_std * noise_std,
            mode,
            covariance,
        })
    }

    pub fn jac_rev(args: GuidanceArgs) -> Result<Self> {
        Self::new(args, JacobianMode::Reverse, Covariance::Full)
    }

    pub fn jac_rev_diagonal(args: GuidanceArgs) -> Result<Self> {
        Self::new(args, JacobianMode::Reverse, Covariance::Diagonal)
    }

    pub fn jac_fwd(args: GuidanceArgs) -> Result<Self> {
        Self::new(args, JacobianMode::Forward, Covariance::Full)
    }

    pub fn jac_fwd_diagonal(args: GuidanceArgs) -> Result<Self> {
        Self::new(args, JacobianMode::Forward, Covariance::Diagonal)
    }

    pub fn mode(&self) -> JacobianMode {
        self.mode
    }

    pub fn covariance(&self) -> Covariance {
        self.covariance
    }

    /// `(h(x̂0), J, score)` for sample `i`. Forward mode reads the primal
    /// values from the batched estimate.
    fn linearize(
        &self,
        primal: Option<&BatchEstimate>,
        i: usize,
        x: &[f64],
        t: f64,
    ) -> (Vec<f64>, Array2<f64>, Vec<f64>) {
        let setup = &self.setup;
        match primal {
            None => {
                let (hx, pb, score) = setup.pullback_h_x0(x, t);
                (hx, pb.jacobian(), score)
            }
            Some(est) => {
                let (_, jac) = ad::jacobian_fwd(
                    |xs| estimate_h_x0(&*setup.sde, &*setup.observation, xs, t).0,
                    x,
                );
                (est.h_x0.row(i).to_vec(), jac, est.score.row(i).to_vec())
            }
        }
    }

    /// `M[k, :] = h(J[k, :])`.
    fn observed_rows(&self, jac: &Array2<f64>) -> Array2<f64> {
        let rows: Vec<Array1<f64>> = jac
            .rows()
            .into_iter()
            .map(|row| Array1::from(self.setup.observation.observe_f64(&row.to_vec())))
            .collect();
        let mut m = Array2::zeros((rows.len(), self.setup.d_y));
        for (mut dst, row) in m.rows_mut().into_iter().zip(&rows) {
            dst.assign(row);
        }
        m
    }
}

struct Linearized {
    score: Vec<f64>,
    innovation: Vec<f64>,
    jac: Array2<f64>,
    m: Array2<f64>,
}

impl GuidanceMethod for JacobianGuidance {
    fn name(&self) -> &str {
        match (self.mode, self.covariance) {
            (JacobianMode::Reverse, Covariance::Full) => MethodName::JacRev.as_str(),
            (JacobianMode::Reverse, Covariance::Diagonal) => MethodName::JacRevDiagonal.as_str(),
            (JacobianMode::Forward, Covariance::Full) => MethodName::JacFwd.as_str(),
            (JacobianMode::Forward, Covariance::Diagonal) => MethodName::JacFwdDiagonal.as_str(),
        }
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let primal = match self.mode {
            JacobianMode::Forward => Some(estimate_x0_batched(
                &*setup.sde,
                &*setup.observation,
                x.view(),
                t,
            )?),
            JacobianMode::Reverse => None,
        };
        let lin = per_sample(x.nrows(), |i| {
            let xi = x.row(i).to_vec();
            let (hx, jac, score) = self.linearize(primal.as_ref(), i, &xi, t[i]);
            let innovation = setup.innovation(i, &hx)?;
            let m = self.observed_rows(&jac);
            Ok(Linearized {
                score,
                innovation,
                jac,
                m,
            })
        })?;

        let innov = stack_vectors(lin.iter().map(|l| l.innovation.clone()).collect(), setup.d_y)?;
        let f = match self.covariance {
            Covariance::Full => {
                let cs: Vec<Array2<f64>> = lin
                    .iter()
                    .zip(t)
                    .map(|(l, &ti)| shifted(&l.m, setup.sde.ratio(ti), self.noise_var))
                    .collect();
                batch_solve(&stack_matrices(&cs)?, &innov)
                    .inspect_err(|e| tracing::warn!(%e, "innovation covariance solve failed"))?
            }
            Covariance::Diagonal => {
                let precision = per_sample(x.nrows(), |i| {
                    let c = setup.diagonal_covariance(
                        i,
                        setup.sde.ratio(t[i]),
                        lin[i].m.diag().iter().copied(),
                        self.noise_var,
                    )?;
                    Ok(c.into_iter().map(f64::recip).collect::<Vec<f64>>())
                })?;
                batch_mul(&innov, &stack_vectors(precision, setup.d_y)?)?
            }
        };

        let jacs: Vec<Array2<f64>> = lin.iter().map(|l| l.jac.clone()).collect();
        let ls = batch_matvec_t(&stack_matrices(&jacs)?, &f)?;
        add_correction(lin.into_iter().map(|l| l.score).collect(), &ls)
    }
}
