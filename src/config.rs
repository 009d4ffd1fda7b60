use std::sync::Arc;

use ndarray::Array2;

use crate::error::Result;
use crate::guidance::{
    GuidanceArgs, GuidanceMethod, MethodName, PigCovariance, SignalShape, DEFAULT_DPS_SCALE,
};
use crate::observation::DynObservationMap;
use crate::registry::{self, Registry};
use crate::sde::DynSde;

/// Method selection and hyperparameters, as read from a config file.
///
/// ```
/// # #[cfg(feature = "serde")] {
/// use tweedie_guide::config::GuidanceConfig;
/// use tweedie_guide::guidance::MethodName;
///
/// let cfg: GuidanceConfig =
///     serde_json::from_str(r#"{ "method": "vjp_guidance", "noise_std": 0.05 }"#).unwrap();
/// assert_eq!(cfg.method, MethodName::Vjp);
/// assert_eq!(cfg.dps_scale, 0.4);
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(deny_unknown_fields))]
pub struct GuidanceConfig {
    pub method: MethodName,
    #[cfg_attr(feature = "serde", serde(default))]
    pub noise_std: Option<f64>,
    #[cfg_attr(feature = "serde", serde(default = "default_dps_scale"))]
    pub dps_scale: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub pig_covariance: PigCovariance,
}

#[cfg(feature = "serde")]
fn default_dps_scale() -> f64 {
    DEFAULT_DPS_SCALE
}

impl GuidanceConfig {
    pub fn new(method: MethodName) -> Self {
        GuidanceConfig {
            method,
            noise_std: None,
            dps_scale: DEFAULT_DPS_SCALE,
            pig_covariance: PigCovariance::default(),
        }
    }

    pub fn into_args(
        self,
        sde: Arc<dyn DynSde>,
        observation: Arc<dyn DynObservationMap>,
        y: Array2<f64>,
        shape: SignalShape,
    ) -> GuidanceArgs {
        let mut args = GuidanceArgs::new(sde, observation, y, shape)
            .with_scale(self.dps_scale)
            .with_pig_covariance(self.pig_covariance);
        args.noise_std = self.noise_std;
        args
    }

    /// Construct the configured method through `registry`.
    pub fn build_with(
        self,
        registry: &Registry,
        sde: Arc<dyn DynSde>,
        observation: Arc<dyn DynObservationMap>,
        y: Array2<f64>,
        shape: SignalShape,
    ) -> Result<Box<dyn GuidanceMethod>> {
        let name = self.method.as_str();
        registry.get(name, self.into_args(sde, observation, y, shape))
    }

    /// Construct the configured method through the global registry.
    pub fn build(
        self,
        sde: Arc<dyn DynSde>,
        observation: Arc<dyn DynObservationMap>,
        y: Array2<f64>,
        shape: SignalShape,
    ) -> Result<Box<dyn GuidanceMethod>> {
        self.build_with(registry::global(), sde, observation, y, shape)
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: GuidanceConfig =
            serde_json::from_str(r#"{ "method": "diffusion_posterior_sampling" }"#).unwrap();
        assert_eq!(cfg, GuidanceConfig::new(MethodName::Dps));
    }

    #[test]
    fn historical_and_corrected_spellings_both_load() {
        for name in ["pseduo_inverse_guidance", "pseudo_inverse_guidance"] {
            let json = format!(r#"{{ "method": "{name}", "noise_std": 0.1 }}"#);
            let cfg: GuidanceConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(cfg.method, MethodName::Pig);
        }
        let out = serde_json::to_string(&GuidanceConfig::new(MethodName::Pig)).unwrap();
        assert!(out.contains("\"pseduo_inverse_guidance\""));
    }

    #[test]
    fn pig_matrix_covariance_deserializes() {
        let json = r#"{
            "method": "pseduo_inverse_guidance",
            "noise_std": 0.1,
            "pig_covariance": { "matrix": { "v": 1, "dim": [2, 2], "data": [2.0, 0.0, 0.0, 1.0] } }
        }"#;
        let cfg: GuidanceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cfg.pig_covariance,
            PigCovariance::Matrix(array![[2.0, 0.0], [0.0, 1.0]])
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<GuidanceConfig>(r#"{ "method": "vjp_guidance", "sigma": 1 }"#);
        assert!(err.is_err());
    }
}
