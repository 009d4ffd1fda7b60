use ndarray::Array2;
use num_traits::Zero;

use super::{add_correction, per_sample, stack_vectors, GuidanceArgs, GuidanceMethod, Setup, SignalShape};
use crate::ad::{self, Reverse64, Scalar};
use crate::error::{Error, Result};
use crate::guidance::MethodName;
use crate::sde::estimate_h_x0;

/// Diffusion posterior sampling: a fixed step down the gradient of the
/// residual norm.
///
/// `gs = s − scale · ∇ₓ ‖Y − h(X̂0)‖`, where the norm is taken over the whole
/// batch at once, so every sample's step is scaled by the batch residual.
/// The gradient is undefined where the residual vanishes exactly.
pub struct Dps {
    setup: Setup,
    scale: f64,
}

impl Dps {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        if !args.scale.is_finite() {
            return Err(Error::Domain("DPS scale must be finite"));
        }
        Ok(Dps {
            setup: Setup::for_map(&args)?,
            scale: args.scale,
        })
    }
}

impl GuidanceMethod for Dps {
    fn name(&self) -> &str {
        MethodName::Dps.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let d_x = setup.d_x;
        let flat: Vec<f64> = x.iter().copied().collect();
        let mut scores = Vec::with_capacity(flat.len());
        let mut bad_sample = None;

        let grad = ad::grad(
            |xs: &[Reverse64]| {
                let mut sq = Reverse64::zero();
                for (i, row) in xs.chunks(d_x).enumerate() {
                    let (hx, est) = estimate_h_x0(&*setup.sde, &*setup.observation, row, t[i]);
                    if hx.len() != setup.d_y {
                        bad_sample.get_or_insert(i);
                    }
                    for (&y, hk) in setup.y_row(i).iter().zip(hx) {
                        let r = y - hk;
                        sq = sq + r * r;
                    }
                    scores.extend(est.score.iter().map(Scalar::value));
                }
                sq.sqrt()
            },
            &flat,
        );
        if let Some(i) = bad_sample {
            return Err(Error::ShapeMismatch(format!(
                "observation of sample {i} does not have {} components",
                setup.d_y
            )));
        }

        let step = Array2::from_shape_vec(x.dim(), grad)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        let s = Array2::from_shape_vec(x.dim(), scores)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        Ok(s - step * self.scale)
    }
}

/// DPS with an isotropic Gaussian likelihood:
/// `ls = J_{h∘x̂0}ᵀ (y − h(x̂0)) / σ²`.
pub struct DpsMod {
    setup: Setup,
    noise_var: f64,
}

impl DpsMod {
    pub fn new(args: GuidanceArgs) -> Result<Self> {
        let noise_std = args.require_noise_std()?;
        if noise_std == 0.0 {
            return Err(Error::Domain("noise_std must be positive for this method"));
        }
        Ok(DpsMod {
            setup: Setup::for_map(&args)?,
            noise_var: noise_std * noise_std,
        })
    }
}

impl GuidanceMethod for DpsMod {
    fn name(&self) -> &str {
        MethodName::DpsMod.as_str()
    }

    fn shape(&self) -> &SignalShape {
        &self.setup.shape
    }

    fn corrected_score(&self, x: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>> {
        let setup = &self.setup;
        let rows = per_sample(x.nrows(), |i| {
            let xi = x.row(i).to_vec();
            let (hx, pb, s) = setup.pullback_h_x0(&xi, t[i]);
            let f: Vec<f64> = setup
                .innovation(i, &hx)?
                .into_iter()
                .map(|r| r / self.noise_var)
                .collect();
            Ok((s, pb.pull(&f)))
        })?;
        let (scores, ls): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
        add_correction(scores, &stack_vectors(ls, setup.d_x)?)
    }
}
