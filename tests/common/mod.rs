#![allow(dead_code)]

use std::sync::Arc;

use ndarray::{Array2, ArrayView1};
use tweedie_guide::ad::Scalar;
use tweedie_guide::guidance::{GuidanceArgs, GuidanceMethod, SignalShape};
use tweedie_guide::observation::{DynObservationMap, ObservationMap, Observe};
use tweedie_guide::sde::{DynSde, Estimate, PosteriorMean, ScoreModel, Sde, Tweedie, VpSchedule};

// ─── SDE stubs ─────────────────────────────────────────────────────────────

/// `x̂0 = x`, zero score, `ratio = r2 = 1`.
pub struct IdentitySde;

impl PosteriorMean for IdentitySde {
    fn estimate_x0<T: Scalar<Float = f64>>(&self, x: &[T], _t: f64) -> Estimate<T> {
        Estimate {
            x0: x.to_vec(),
            score: vec![T::zero(); x.len()],
        }
    }
}

impl Sde for IdentitySde {
    fn ratio(&self, _t: f64) -> f64 {
        1.0
    }

    fn r2(&self, _t: f64, _data_variance: f64) -> f64 {
        1.0
    }
}

/// Linear score `s(x) = -P x` for a symmetric precision `P`.
pub struct GaussianScore {
    pub precision: Array2<f64>,
}

impl GaussianScore {
    pub fn isotropic(dim: usize, p: f64) -> Self {
        GaussianScore {
            precision: Array2::eye(dim) * p,
        }
    }

    pub fn diagonal(p: &[f64]) -> Self {
        GaussianScore {
            precision: Array2::from_diag(&ArrayView1::from(p)),
        }
    }

    /// A fixed, well-conditioned, non-diagonal precision on three coordinates.
    pub fn coupled() -> Self {
        GaussianScore {
            precision: ndarray::array![[0.5, 0.3, 0.0], [0.3, 2.0, -0.2], [0.0, -0.2, 1.0]],
        }
    }
}

impl ScoreModel for GaussianScore {
    fn score<T: Scalar<Float = f64>>(&self, x: &[T], _t: f64) -> Vec<T> {
        self.precision
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .zip(x)
                    .fold(T::zero(), |acc, (&p, &xi)| acc - xi.scale(p))
            })
            .collect()
    }
}

pub fn vp_gaussian(model: GaussianScore) -> Arc<dyn DynSde> {
    Arc::new(Tweedie::new(VpSchedule::default(), model))
}

pub fn identity_sde() -> Arc<dyn DynSde> {
    Arc::new(IdentitySde)
}

// ─── Observation stubs ─────────────────────────────────────────────────────

/// `h(x) = x ⊙ x`: nonlinear, so it has no matrix.
pub struct Squared;

impl Observe for Squared {
    fn observe<T: Scalar<Float = f64>>(&self, x: &[T]) -> Vec<T> {
        x.iter().map(|&xi| xi * xi).collect()
    }
}

impl ObservationMap for Squared {
    fn output_dim(&self, input_dim: usize) -> usize {
        input_dim
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────

pub fn args(
    sde: Arc<dyn DynSde>,
    h: Arc<dyn DynObservationMap>,
    y: Array2<f64>,
    shape: SignalShape,
    noise_std: f64,
) -> GuidanceArgs {
    GuidanceArgs::new(sde, h, y, shape).with_noise_std(noise_std)
}

/// Evaluate a method on a flat `(batch, d)` signal at one shared time.
pub fn evaluate(method: &dyn GuidanceMethod, x: &Array2<f64>, t: f64) -> Array2<f64> {
    let out = method
        .guidance_score(x.view().into_dyn(), ndarray::arr1(&[t]).view().into_dyn())
        .unwrap();
    out.into_dimensionality().unwrap()
}

/// Unconditional scores, one row per sample.
pub fn scores(sde: &dyn DynSde, x: &Array2<f64>, t: f64) -> Array2<f64> {
    let mut out = Array2::zeros(x.dim());
    for (mut dst, row) in out.rows_mut().into_iter().zip(x.rows()) {
        let est = sde.estimate_x0_f64(&row.to_vec(), t);
        dst.assign(&ArrayView1::from(&est.score[..]));
    }
    out
}

pub fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
    assert_eq!(a.dim(), b.dim());
    for ((idx, x), y) in a.indexed_iter().zip(b.iter()) {
        assert!(
            (x - y).abs() <= tol * (1.0 + y.abs()),
            "at {idx:?}: {x} vs {y}"
        );
    }
}
