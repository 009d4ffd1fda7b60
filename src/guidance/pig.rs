use ndarray::{Array2, Array3};

use super::{
    add_correction, per_sample, shifted, stack_matrices, stack_vectors, GuidanceArgs,
    GuidanceMethod, MethodName, PigCovariance, Setup, SignalShape,
};
use crate::ad::Pullback;
use crate::error::{Error, Result};
use crate::linalg::{batch_solve, batch_solve_shared};

/// Pseudo-inverse guidance.
///
/// The innovation covariance uses the prior-aware variance `r2(t)` instead
/// of the Jacobian of `x̂0`, so one vjp per sample suffices:
/// `ls = J_{h∘x̂0}ᵀ C⁻¹ (y − h(x̂0))` with `C = r2(t)·HHᵀ + σ²I`, or the
/// scalar form `r2(t)·c + σ²`.
pub struct Pig {
    setup: Setup,
    noise_var: f64,
    covariance: PigCovariance,
}

impl Pig {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let noise_std = args.require_noise_std()?;
        let setup = Setup::for_map(&args)?;
        match &args.pig_covariance {
            PigCovariance::Scalar(c) if !c.is_finite() => {
                return Err(Error::Domain("PIG covariance scalar must be finite"));
            }
            PigCovariance::Matrix(hht) if hht.dim() != (setup.d_y, setup.d_y) => {
                return Err(Error::ShapeMismatch(format!(
                    "HHᵀ has shape {:?}, expected {}x{}",
                    hht.shape(),
                    setup.d_y,
                    setup.d_y
                )));
            }
            _ => {}
        }
        Ok(Pig {
            setup,
            noise_var: noise_std * noise_std,
            covariance: args.pig_covariance,
        })
    }
}

struct Recorded {
    score: Vec<f64>,
    innovation: Vec<f64>,
    pullback: Pullback<f64>,
}

impl GuidanceMethod for Pig {
    fn name(&self) -> &str {
        MethodName::Pig.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let recorded = per_sample(x.nrows(), |i| {
            let xi = x.row(i).to_vec();
            let (hx, pullback, score) = setup.pullback_h_x0(&xi, t[i]);
            Ok(Recorded {
                score,
                innovation: setup.innovation(i, &hx)?,
                pullback,
            })
        })?;

        let f = match &self.covariance {
            PigCovariance::Scalar(c) => {
                let rows = per_sample(x.nrows(), |i| {
                    let r2 = setup.sde.r2(t[i], 1.0);
                    let var = setup.diagonal_covariance(i, r2, [*c], self.noise_var)?[0];
                    Ok(recorded[i].innovation.iter().map(|r| r / var).collect::<Vec<f64>>())
                })?;
                stack_vectors(rows, setup.d_y)?
            }
            PigCovariance::Matrix(hht) => {
                let innov =
                    stack_vectors(recorded.iter().map(|r| r.innovation.clone()).collect(), setup.d_y)?;
                let solved = if t.iter().all(|&ti| ti == t[0]) {
                    // One factorization serves the whole batch.
                    batch_solve_shared(&shifted(hht, setup.sde.r2(t[0], 1.0), self.noise_var), &innov)
                } else {
                    let cs: Vec<Array2<f64>> = t
                        .iter()
                        .map(|&ti| shifted(hht, setup.sde.r2(ti, 1.0), self.noise_var))
                        .collect();
                    let c: Array3<f64> = stack_matrices(&cs)?;
                    batch_solve(&c, &innov)
                };
                solved.inspect_err(|e| tracing::warn!(%e, "PIG solve failed"))?
            }
        };

        let ls = per_sample(x.nrows(), |i| Ok(recorded[i].pullback.pull(&f.row(i).to_vec())))?;
        let scores = recorded.into_iter().map(|r| r.score).collect();
        add_correction(scores, &stack_vectors(ls, setup.d_x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::Scalar;
    use crate::observation::Linear;
    use crate::sde::{ScoreModel, Tweedie, VpSchedule};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::Arc;

    struct Damped;

    impl ScoreModel for Damped {
        fn score<T: Scalar<Float = f64>>(&self, x: &[T], _t: f64) -> Vec<T> {
            x.iter().map(|&xi| T::zero() - xi.scale(0.8)).collect()
        }
    }

    fn pig(batch: usize) -> Pig {
        let h = array![[1.0, 0.5], [0.0, 2.0]];
        let args = GuidanceArgs::new(
            Arc::new(Tweedie::new(VpSchedule::default(), Damped)),
            Arc::new(Linear::new(h.clone()).unwrap()),
            array![[0.3, -0.2]],
            SignalShape::new(batch, [2]),
        )
        .with_noise_std(0.2)
        .with_pig_covariance(PigCovariance::Matrix(h.dot(&h.t())));
        Pig::new(args).unwrap()
    }

    #[test]
    fn mixed_times_match_single_sample_solves() {
        let x = array![[0.4, -1.0], [1.2, 0.1]];
        let t = [0.2, 0.6];
        let joint = pig(2).corrected_score(&x, &t).unwrap();
        let single = pig(1);
        for i in 0..2 {
            let row = x.slice(ndarray::s![i..i + 1, ..]).to_owned();
            let alone = single.corrected_score(&row, &t[i..i + 1]).unwrap();
            for (a, b) in joint.row(i).iter().zip(alone.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn mismatched_covariance_is_rejected() {
        let args = GuidanceArgs::new(
            Arc::new(Tweedie::new(VpSchedule::default(), Damped)),
            Arc::new(Linear::identity(2)),
            array![[0.0, 0.0]],
            SignalShape::new(1, [2]),
        )
        .with_noise_std(0.1)
        .with_pig_covariance(PigCovariance::Matrix(Array2::eye(3)));
        assert!(matches!(Pig::new(args), Err(Error::ShapeMismatch(_))));
    }
}
