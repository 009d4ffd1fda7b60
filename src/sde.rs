//! The diffusion-SDE handle consumed by the guidance layer.
//!
//! The guidance variants need three things from the SDE: the Tweedie
//! posterior mean of `x0` given a noisy `x` (jointly with the unconditional
//! score), the covariance scale [`Sde::ratio`], and the prior-aware variance
//! [`Sde::r2`]. [`Tweedie`] provides all three for any [`Schedule`] and
//! [`ScoreModel`].

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::ad::{Dual64, Reverse64, Scalar};
use crate::error::{Error, Result};
use crate::observation::DynObservationMap;

/// Posterior-mean estimate of one sample, jointly with the score it was
/// derived from.
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate<T> {
    pub x0: Vec<T>,
    pub score: Vec<T>,
}

/// A (pretrained) score network `s(x, t) ≈ ∇ₓ log p_t(x)` for one sample.
pub trait ScoreModel: Send + Sync {
    fn score<T: Scalar<Float = f64>>(&self, x: &[T], t: f64) -> Vec<T>;
}

/// Forward-process marginal `x_t = m(t)·x0 + √v(t)·ε`.
pub trait Schedule: Send + Sync {
    fn mean_coeff(&self, t: f64) -> f64;
    fn variance(&self, t: f64) -> f64;
}

/// The differentiable part of an SDE handle.
pub trait PosteriorMean {
    fn estimate_x0<T: Scalar<Float = f64>>(&self, x: &[T], t: f64) -> Estimate<T>;
}

/// The variance terms of an SDE handle.
pub trait Sde: Send + Sync {
    /// `Cov[x0 | x_t] = ratio(t) · ∂x̂0/∂x_t`.
    fn ratio(&self, t: f64) -> f64;

    /// Posterior variance of `x0` under a Gaussian prior with the given
    /// variance.
    fn r2(&self, t: f64, data_variance: f64) -> f64;
}

/// Type-erased SDE handle, evaluable in every AD mode.
pub trait DynSde: Sde {
    fn estimate_x0_f64(&self, x: &[f64], t: f64) -> Estimate<f64>;
    fn estimate_x0_dual(&self, x: &[Dual64], t: f64) -> Estimate<Dual64>;
    fn estimate_x0_reverse(&self, x: &[Reverse64], t: f64) -> Estimate<Reverse64>;
}

impl<S: PosteriorMean + Sde> DynSde for S {
    fn estimate_x0_f64(&self, x: &[f64], t: f64) -> Estimate<f64> {
        self.estimate_x0(x, t)
    }

    fn estimate_x0_dual(&self, x: &[Dual64], t: f64) -> Estimate<Dual64> {
        self.estimate_x0(x, t)
    }

    fn estimate_x0_reverse(&self, x: &[Reverse64], t: f64) -> Estimate<Reverse64> {
        self.estimate_x0(x, t)
    }
}

/// The scalar types a guidance variant evaluates the erased collaborators in.
pub trait SdeScalar: Scalar<Float = f64> {
    fn estimate(sde: &dyn DynSde, x: &[Self], t: f64) -> Estimate<Self>;
    fn observe(h: &dyn DynObservationMap, x: &[Self]) -> Vec<Self>;
}

impl SdeScalar for f64 {
    fn estimate(sde: &dyn DynSde, x: &[Self], t: f64) -> Estimate<Self> {
        sde.estimate_x0_f64(x, t)
    }

    fn observe(h: &dyn DynObservationMap, x: &[Self]) -> Vec<Self> {
        h.observe_f64(x)
    }
}

impl SdeScalar for Dual64 {
    fn estimate(sde: &dyn DynSde, x: &[Self], t: f64) -> Estimate<Self> {
        sde.estimate_x0_dual(x, t)
    }

    fn observe(h: &dyn DynObservationMap, x: &[Self]) -> Vec<Self> {
        h.observe_dual(x)
    }
}

impl SdeScalar for Reverse64 {
    fn estimate(sde: &dyn DynSde, x: &[Self], t: f64) -> Estimate<Self> {
        sde.estimate_x0_reverse(x, t)
    }

    fn observe(h: &dyn DynObservationMap, x: &[Self]) -> Vec<Self> {
        h.observe_reverse(x)
    }
}

/// `(h(x̂0), estimate)` for one sample.
pub fn estimate_h_x0<T: SdeScalar>(
    sde: &dyn DynSde,
    h: &dyn DynObservationMap,
    x: &[T],
    t: f64,
) -> (Vec<T>, Estimate<T>) {
    let est = T::estimate(sde, x, t);
    (T::observe(h, &est.x0), est)
}

/// Batched posterior means over the rows of `x`.
#[derive(Clone, Debug)]
pub struct BatchEstimate {
    pub h_x0: Array2<f64>,
    pub x0: Array2<f64>,
    pub score: Array2<f64>,
}

/// [`estimate_h_x0`] mapped over the batch axis (axis 0). `t` holds one time
/// per sample, or a single time shared by all.
pub fn estimate_x0_batched(
    sde: &dyn DynSde,
    h: &dyn DynObservationMap,
    x: ArrayView2<'_, f64>,
    t: &[f64],
) -> Result<BatchEstimate> {
    let batch = x.nrows();
    if t.len() != batch && t.len() != 1 {
        return Err(Error::ShapeMismatch(format!(
            "{} times for a batch of {batch}",
            t.len()
        )));
    }

    let rows: Vec<(Vec<f64>, Estimate<f64>)> = x
        .axis_iter(Axis(0))
        .into_par_iter()
        .enumerate()
        .map(|(i, row)| {
            let ti = if t.len() == 1 { t[0] } else { t[i] };
            estimate_h_x0(sde, h, &row.to_vec(), ti)
        })
        .collect();

    let d_x = x.ncols();
    let d_y = rows.first().map_or(0, |(hx, _)| hx.len());
    let mut out = BatchEstimate {
        h_x0: Array2::zeros((batch, d_y)),
        x0: Array2::zeros((batch, d_x)),
        score: Array2::zeros((batch, d_x)),
    };
    for (i, (hx, est)) in rows.into_iter().enumerate() {
        if hx.len() != d_y {
            return Err(Error::ShapeMismatch(format!(
                "observation of sample {i} has length {}, expected {d_y}",
                hx.len()
            )));
        }
        out.h_x0.row_mut(i).assign(&ndarray::Array1::from(hx));
        out.x0.row_mut(i).assign(&ndarray::Array1::from(est.x0));
        out.score.row_mut(i).assign(&ndarray::Array1::from(est.score));
    }
    Ok(out)
}

/// Variance-preserving SDE with a linear β schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VpSchedule {
    pub beta_min: f64,
    pub beta_max: f64,
}

impl Default for VpSchedule {
    fn default() -> Self {
        VpSchedule {
            beta_min: 0.1,
            beta_max: 20.0,
        }
    }
}

impl Schedule for VpSchedule {
    fn mean_coeff(&self, t: f64) -> f64 {
        let log_mean = -0.25 * t * t * (self.beta_max - self.beta_min) - 0.5 * t * self.beta_min;
        log_mean.exp()
    }

    fn variance(&self, t: f64) -> f64 {
        let m = self.mean_coeff(t);
        1.0 - m * m
    }
}

/// Variance-exploding SDE with a geometric noise schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VeSchedule {
    pub sigma_min: f64,
    pub sigma_max: f64,
}

impl Default for VeSchedule {
    fn default() -> Self {
        VeSchedule {
            sigma_min: 0.01,
            sigma_max: 50.0,
        }
    }
}

impl Schedule for VeSchedule {
    fn mean_coeff(&self, _t: f64) -> f64 {
        1.0
    }

    fn variance(&self, t: f64) -> f64 {
        let std = self.sigma_min * (self.sigma_max / self.sigma_min).powf(t);
        std * std
    }
}

/// Tweedie's formula on top of a score model:
/// `x̂0 = (x + v(t)·s(x, t)) / m(t)`.
#[derive(Clone, Debug)]
pub struct Tweedie<S, M> {
    schedule: S,
    model: M,
}

impl<S: Schedule, M: ScoreModel> Tweedie<S, M> {
    pub fn new(schedule: S, model: M) -> Self {
        Tweedie { schedule, model }
    }

    pub fn schedule(&self) -> &S {
        &self.schedule
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<S: Schedule, M: ScoreModel> PosteriorMean for Tweedie<S, M> {
    fn estimate_x0<T: Scalar<Float = f64>>(&self, x: &[T], t: f64) -> Estimate<T> {
        let m = self.schedule.mean_coeff(t);
        let v = self.schedule.variance(t);
        let score = self.model.score(x, t);
        let x0 = x
            .iter()
            .zip(&score)
            .map(|(&xi, &si)| (xi + si.scale(v)).scale(1.0 / m))
            .collect();
        Estimate { x0, score }
    }
}

impl<S: Schedule, M: ScoreModel> Sde for Tweedie<S, M> {
    fn ratio(&self, t: f64) -> f64 {
        self.schedule.variance(t) / self.schedule.mean_coeff(t)
    }

    fn r2(&self, t: f64, data_variance: f64) -> f64 {
        let m = self.schedule.mean_coeff(t);
        let v = self.schedule.variance(t);
        v * data_variance / (m * m * data_variance + v)
    }
}
