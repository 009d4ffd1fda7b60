//! Guidance methods: corrected scores `s(x, t) ± ∇ₓ log p(y | x)`.
//!
//! Every variant is an immutable configuration struct implementing
//! [`GuidanceMethod`]. They differ in how they differentiate the Tweedie
//! estimate (one gradient, vjps, forward or reverse Jacobians) and in how
//! they model the innovation covariance `C_yy` (scalar, diagonal or full).
//!
//! | Variant | Differentiation | `C_yy` |
//! |---|---|---|
//! | [`Dps`] | one gradient over the batch | none (fixed step) |
//! | [`DpsMod`] | 1 vjp | `σ²` |
//! | [`Pig`] | 1 vjp | `r2(t)·HHᵀ + σ²` |
//! | [`Vjp`], [`VjpAlt`] | `d_y` vjps | full |
//! | [`VjpMask`] | 2 vjps | diagonal |
//! | [`VjpDiag`] | `d_y` vjps | diagonal |
//! | [`JacobianGuidance`] | forward / reverse Jacobian | full or diagonal |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, IxDyn};
use rayon::prelude::*;
use tracing::{debug_span, trace};

use crate::ad::{self, Pullback, Reverse64, Scalar};
use crate::error::{Error, Result};
use crate::linalg::singular_tol;
use crate::observation::DynObservationMap;
use crate::sde::{estimate_h_x0, DynSde, Estimate};

mod dps;
mod jac;
mod pig;
mod vjp;

pub use dps::{Dps, DpsMod};
pub use jac::{Covariance, JacobianGuidance, JacobianMode};
pub use pig::Pig;
pub use vjp::{Vjp, VjpAlt, VjpDiag, VjpMask};

/// Default DPS step size.
pub const DEFAULT_DPS_SCALE: f64 = 0.4;

/// Guidance function borrowed from a method: `(x, t) → corrected score`.
pub type GuidanceScoreFn<'m> =
    Box<dyn Fn(ArrayViewD<'_, f64>, ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> + Send + Sync + 'm>;

/// A guidance strategy.
pub trait GuidanceMethod: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    fn shape(&self) -> &SignalShape;

    /// Corrected scores for flattened signals `(batch, d_x)`, with one time
    /// per sample.
    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>>;

    /// Corrected scores for `x` of shape `(batch, *sample)`. `t` is
    /// `(batch, 1)`, `(batch,)`, or a single time for the whole batch.
    fn guidance_score(&self, x: ArrayViewD<'_, f64>, t: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let shape = self.shape();
        let _span = debug_span!("guidance_score", method = self.name(), batch = shape.batch).entered();

        if x.shape() != shape.dims().as_slice() {
            return Err(Error::ShapeMismatch(format!(
                "signal shape {:?} differs from the configured {:?}",
                x.shape(),
                shape.dims()
            )));
        }
        let times = broadcast_times(t, shape.batch)?;
        let flat = x
            .to_shape((shape.batch, shape.numel()))
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?
            .to_owned();

        let out = self.corrected_score(&flat, &times)?;
        trace!(d_x = shape.numel(), "corrected score computed");
        out.into_shape_with_order(IxDyn(x.shape()))
            .map_err(|e| Error::ShapeMismatch(e.to_string()))
    }

    /// The guidance function as a closure over this (immutable) method.
    fn make_guidance_score(&self) -> GuidanceScoreFn<'_> {
        Box::new(move |x: ArrayViewD<'_, f64>, t: ArrayViewD<'_, f64>| self.guidance_score(x, t))
    }
}

fn broadcast_times(t: ArrayViewD<'_, f64>, batch: usize) -> Result<Vec<f64>> {
    let dims = t.shape().to_vec();
    let t = match dims.as_slice() {
        [] | [_] => t,
        [_, 1] => t.index_axis_move(Axis(1), 0),
        other => {
            return Err(Error::ShapeMismatch(format!(
                "diffusion times of shape {other:?}, expected (batch, 1)"
            )))
        }
    };
    if t.iter().any(|v| !v.is_finite()) {
        return Err(Error::Domain("diffusion times must be finite"));
    }
    let times: Vec<f64> = t.iter().copied().collect();
    match times.len() {
        1 => Ok(vec![times[0]; batch]),
        n if n == batch => Ok(times),
        n => Err(Error::ShapeMismatch(format!(
            "{n} diffusion times for a batch of {batch}"
        ))),
    }
}

/// The stable, config-facing method identifiers.
///
/// The string forms are part of the on-disk format and keep their historical
/// spelling; the corrected spellings parse as aliases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MethodName {
    #[cfg_attr(feature = "serde", serde(rename = "diffusion_posterior_sampling"))]
    Dps,
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "diffusion_psoterior_sampling_mod",
            alias = "diffusion_posterior_sampling_mod"
        )
    )]
    DpsMod,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "pseduo_inverse_guidance", alias = "pseudo_inverse_guidance")
    )]
    Pig,
    #[cfg_attr(feature = "serde", serde(rename = "vjp_guidance"))]
    Vjp,
    #[cfg_attr(feature = "serde", serde(rename = "vjp_guidance_alt"))]
    VjpAlt,
    #[cfg_attr(feature = "serde", serde(rename = "vjp_guidance_mask"))]
    VjpMask,
    #[cfg_attr(feature = "serde", serde(rename = "vjp_guidance_diag"))]
    VjpDiag,
    #[cfg_attr(feature = "serde", serde(rename = "jac_rev_guidance"))]
    JacRev,
    #[cfg_attr(feature = "serde", serde(rename = "jac_rev_guidance_diag"))]
    JacRevDiagonal,
    #[cfg_attr(feature = "serde", serde(rename = "jac_fwd_guidance"))]
    JacFwd,
    #[cfg_attr(feature = "serde", serde(rename = "jac_fwd_guidance_diag"))]
    JacFwdDiagonal,
}

impl MethodName {
    pub const ALL: [MethodName; 11] = [
        MethodName::Dps,
        MethodName::DpsMod,
        MethodName::Pig,
        MethodName::Vjp,
        MethodName::VjpAlt,
        MethodName::VjpMask,
        MethodName::VjpDiag,
        MethodName::JacRev,
        MethodName::JacRevDiagonal,
        MethodName::JacFwd,
        MethodName::JacFwdDiagonal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::Dps => "diffusion_posterior_sampling",
            MethodName::DpsMod => "diffusion_psoterior_sampling_mod",
            MethodName::Pig => "pseduo_inverse_guidance",
            MethodName::Vjp => "vjp_guidance",
            MethodName::VjpAlt => "vjp_guidance_alt",
            MethodName::VjpMask => "vjp_guidance_mask",
            MethodName::VjpDiag => "vjp_guidance_diag",
            MethodName::JacRev => "jac_rev_guidance",
            MethodName::JacRevDiagonal => "jac_rev_guidance_diag",
            MethodName::JacFwd => "jac_fwd_guidance",
            MethodName::JacFwdDiagonal => "jac_fwd_guidance_diag",
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diffusion_posterior_sampling_mod" => return Ok(MethodName::DpsMod),
            "pseudo_inverse_guidance" => return Ok(MethodName::Pig),
            _ => {}
        }
        MethodName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::UnknownMethod(s.to_string()))
    }
}

/// Batch size and per-sample shape of the signal.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalShape {
    pub batch: usize,
    pub sample: Vec<usize>,
}

impl SignalShape {
    pub fn new(batch: usize, sample: impl Into<Vec<usize>>) -> Self {
        SignalShape {
            batch,
            sample: sample.into(),
        }
    }

    /// Flattened per-sample length `d_x`.
    pub fn numel(&self) -> usize {
        self.sample.iter().product()
    }

    /// `[batch, *sample]`.
    pub fn dims(&self) -> Vec<usize> {
        std::iter::once(self.batch)
            .chain(self.sample.iter().copied())
            .collect()
    }
}

/// Measurement second moment used by [`Pig`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PigCovariance {
    /// `C_yy = r2(t)·c + σ²`, elementwise.
    Scalar(f64),
    /// `C_yy = r2(t)·HHᵀ + σ²·I`, solved per sample.
    Matrix(Array2<f64>),
}

impl Default for PigCovariance {
    fn default() -> Self {
        PigCovariance::Scalar(1.0)
    }
}

/// Everything a registry constructor receives.
///
/// Not every variant uses every field: DPS ignores `noise_std`, the matrix
/// variants need a linear observation map, and only PIG reads
/// `pig_covariance`.
#[derive(Clone)]
pub struct GuidanceArgs {
    pub sde: Arc<dyn DynSde>,
    pub observation: Arc<dyn DynObservationMap>,
    /// Measurement, `(batch, d_y)` or `(1, d_y)`.
    pub y: Array2<f64>,
    pub shape: SignalShape,
    pub noise_std: Option<f64>,
    pub scale: f64,
    pub pig_covariance: PigCovariance,
}

impl GuidanceArgs {
    pub fn new(
        sde: Arc<dyn DynSde>,
        observation: Arc<dyn DynObservationMap>,
        y: Array2<f64>,
        shape: SignalShape,
    ) -> Self {
        GuidanceArgs {
            sde,
            observation,
            y,
            shape,
            noise_std: None,
            scale: DEFAULT_DPS_SCALE,
            pig_covariance: PigCovariance::default(),
        }
    }

    pub fn with_noise_std(mut self, noise_std: f64) -> Self {
        self.noise_std = Some(noise_std);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_pig_covariance(mut self, covariance: PigCovariance) -> Self {
        self.pig_covariance = covariance;
        self
    }

    pub(crate) fn require_noise_std(&self) -> Result<f64> {
        let std = self.noise_std.ok_or(Error::MissingArgument("noise_std"))?;
        if !std.is_finite() || std < 0.0 {
            return Err(Error::Domain("noise_std must be finite and non-negative"));
        }
        Ok(std)
    }

    pub(crate) fn require_matrix(&self) -> Result<Array2<f64>> {
        self.observation
            .dense_matrix(self.shape.numel())
            .ok_or(Error::MissingArgument("a linear observation map with a matrix H"))
    }
}

/// Validated configuration shared by all variants.
#[derive(Clone)]
pub(crate) struct Setup {
    pub sde: Arc<dyn DynSde>,
    pub observation: Arc<dyn DynObservationMap>,
    pub y: Array2<f64>,
    pub shape: SignalShape,
    pub d_x: usize,
    pub d_y: usize,
}

impl Setup {
    /// Checks `y` against the observation dimension `d_y` and the batch.
    pub fn new(args: &GuidanceArgs, d_y: usize) -> Result<Self> {
        let d_x = args.shape.numel();
        if args.shape.batch == 0 || d_x == 0 {
            return Err(Error::ShapeMismatch(format!(
                "empty signal shape {:?}",
                args.shape.dims()
            )));
        }
        let (rows, cols) = args.y.dim();
        if cols != d_y {
            return Err(Error::ShapeMismatch(format!(
                "measurement has {cols} components, observation map produces {d_y}"
            )));
        }
        if rows != 1 && rows != args.shape.batch {
            return Err(Error::ShapeMismatch(format!(
                "measurement has {rows} rows for a batch of {}",
                args.shape.batch
            )));
        }
        if args.y.iter().any(|v| !v.is_finite()) {
            return Err(Error::Domain("measurement contains non-finite values"));
        }
        Ok(Setup {
            sde: Arc::clone(&args.sde),
            observation: Arc::clone(&args.observation),
            y: args.y.clone(),
            shape: args.shape.clone(),
            d_x,
            d_y,
        })
    }

    /// `Setup::new` for variants that accept any observation map.
    pub fn for_map(args: &GuidanceArgs) -> Result<Self> {
        let d_x = args.shape.numel();
        if let Some(width) = args.observation.input_dim() {
            if width != d_x {
                return Err(Error::ShapeMismatch(format!(
                    "observation map takes signals of length {width}, got {d_x}"
                )));
            }
        }
        Self::new(args, args.observation.output_dim(d_x))
    }

    /// `Setup::new` for variants that need `H`; returns the validated matrix.
    pub fn for_matrix(args: &GuidanceArgs) -> Result<(Self, Array2<f64>)> {
        let h = args.require_matrix()?;
        if h.ncols() != args.shape.numel() {
            return Err(Error::ShapeMismatch(format!(
                "H has {} columns for signals of length {}",
                h.ncols(),
                args.shape.numel()
            )));
        }
        let setup = Self::new(args, h.nrows())?;
        Ok((setup, h))
    }

    pub fn y_row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.y.row(if self.y.nrows() == 1 { 0 } else { i })
    }

    /// `y_i − prediction`.
    pub fn innovation(&self, i: usize, prediction: &[f64]) -> Result<Vec<f64>> {
        if prediction.len() != self.d_y {
            return Err(Error::ShapeMismatch(format!(
                "observation of sample {i} has length {}, measurement has {}",
                prediction.len(),
                self.d_y
            )));
        }
        Ok(self
            .y_row(i)
            .iter()
            .zip(prediction)
            .map(|(y, p)| y - p)
            .collect())
    }

    /// Primal `(h(x̂0), estimate)`.
    pub fn estimate(&self, x: &[f64], t: f64) -> (Vec<f64>, Estimate<f64>) {
        estimate_h_x0(&*self.sde, &*self.observation, x, t)
    }

    /// Record `x ↦ h(x̂0(x))`; returns `(h(x̂0), pullback, score)`.
    pub fn pullback_h_x0(&self, x: &[f64], t: f64) -> (Vec<f64>, Pullback<f64>, Vec<f64>) {
        ad::pullback(
            |xs: &[Reverse64]| {
                let (hx, est) = estimate_h_x0(&*self.sde, &*self.observation, xs, t);
                (hx, values(&est.score))
            },
            x,
        )
    }

    /// Record `x ↦ x̂0(x)`; returns `(x̂0, pullback, score)`.
    pub fn pullback_x0(&self, x: &[f64], t: f64) -> (Vec<f64>, Pullback<f64>, Vec<f64>) {
        ad::pullback(
            |xs: &[Reverse64]| {
                let est = self.sde.estimate_x0_reverse(xs, t);
                let score = values(&est.score);
                (est.x0, score)
            },
            x,
        )
    }

    /// `ratio(t) · diag + σ²`, rejecting non-finite entries and entries that
    /// vanish next to the largest one.
    pub fn diagonal_covariance(
        &self,
        sample: usize,
        scale: f64,
        diag: impl IntoIterator<Item = f64>,
        noise_var: f64,
    ) -> Result<Vec<f64>> {
        let c: Vec<f64> = diag.into_iter().map(|d| scale * d + noise_var).collect();
        let largest = c.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let tol = singular_tol(c.len(), largest);
        match c.iter().position(|v| !v.is_finite() || v.abs() <= tol) {
            Some(k) => {
                tracing::warn!(sample, k, c = c[k], "vanishing diagonal innovation variance");
                Err(Error::LinearAlgebra { sample })
            }
            None => Ok(c),
        }
    }
}

pub(crate) fn values<T: Scalar<Float = f64>>(xs: &[T]) -> Vec<f64> {
    xs.iter().map(Scalar::value).collect()
}

/// Run `f` for every sample index on the rayon pool. On failure the error of
/// the lowest-indexed failing sample is returned.
pub(crate) fn per_sample<R, F>(batch: usize, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(usize) -> Result<R> + Send + Sync,
{
    let results: Vec<Result<R>> = (0..batch).into_par_iter().map(f).collect();
    results.into_iter().collect()
}

/// Stack equally long per-sample vectors into `(batch, width)`.
pub(crate) fn stack_vectors(rows: Vec<Vec<f64>>, width: usize) -> Result<Array2<f64>> {
    let batch = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((batch, width), flat).map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// Stack per-sample matrices into `(batch, rows, cols)`.
pub(crate) fn stack_matrices(mats: &[Array2<f64>]) -> Result<Array3<f64>> {
    let views: Vec<ArrayView2<'_, f64>> = mats.iter().map(|m| m.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))
}

/// `ratio · A + σ²·I` for a square `A`.
pub(crate) fn shifted(a: &Array2<f64>, scale: f64, noise_var: f64) -> Array2<f64> {
    let mut c = a * scale;
    c.diag_mut().mapv_inplace(|v| v + noise_var);
    c
}

/// Rows `k` of `H·J`, one vjp per row of `H`: `(HJ)_k = J ᵀ H_k`.
pub(crate) fn rows_through(pb: &Pullback<f64>, h: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros((h.nrows(), pb.num_inputs()));
    for (mut dst, hk) in out.rows_mut().into_iter().zip(h.rows()) {
        let row = pb.pull(&hk.to_vec());
        dst.assign(&ArrayView1::from(&row[..]));
    }
    out
}

/// `s + ls` per sample.
pub(crate) fn add_correction(scores: Vec<Vec<f64>>, ls: &Array2<f64>) -> Result<Array2<f64>> {
    let width = ls.ncols();
    let s = stack_vectors(scores, width)?;
    Ok(s + ls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn method_names_round_trip_through_strings() {
        for name in MethodName::ALL {
            assert_eq!(name.as_str().parse::<MethodName>().unwrap(), name);
            assert_eq!(name.to_string(), name.as_str());
        }
    }

    #[test]
    fn corrected_spellings_parse_as_aliases() {
        assert_eq!(
            "diffusion_posterior_sampling_mod".parse::<MethodName>().unwrap(),
            MethodName::DpsMod
        );
        assert_eq!(
            "pseudo_inverse_guidance".parse::<MethodName>().unwrap(),
            MethodName::Pig
        );
        assert!(matches!(
            "kalman".parse::<MethodName>(),
            Err(Error::UnknownMethod(_))
        ));
    }

    #[test]
    fn signal_shape_flattens_sample_dims() {
        let shape = SignalShape::new(4, [2, 3]);
        assert_eq!(shape.numel(), 6);
        assert_eq!(shape.dims(), vec![4, 2, 3]);
    }

    #[test]
    fn times_broadcast_or_match_the_batch() {
        let one = array![0.5];
        assert_eq!(broadcast_times(one.view().into_dyn(), 3).unwrap(), vec![0.5; 3]);
        let scalar = ndarray::arr0(0.25);
        assert_eq!(broadcast_times(scalar.view().into_dyn(), 2).unwrap(), vec![0.25; 2]);
        let three = array![0.1, 0.2, 0.3];
        assert_eq!(broadcast_times(three.view().into_dyn(), 3).unwrap().len(), 3);
        let two = array![0.1, 0.2];
        assert!(broadcast_times(two.view().into_dyn(), 3).is_err());
        let nan = array![f64::NAN];
        assert!(matches!(
            broadcast_times(nan.view().into_dyn(), 1),
            Err(Error::Domain(_))
        ));
    }

    #[test]
    fn column_times_are_squeezed() {
        let column = array![[0.1], [0.2], [0.3]];
        assert_eq!(
            broadcast_times(column.view().into_dyn(), 3).unwrap(),
            vec![0.1, 0.2, 0.3]
        );
        let wide = array![[0.1, 0.2], [0.3, 0.4]];
        assert!(matches!(
            broadcast_times(wide.view().into_dyn(), 2),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn shifted_adds_noise_on_the_diagonal() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(shifted(&a, 2.0, 0.5), array![[2.5, 4.0], [6.0, 8.5]]);
    }
}
