//! Guidance scores for diffusion posterior sampling.
//!
//! Given a pretrained score model wrapped in an [`sde::Sde`] handle, an
//! observation map `h` and a noisy measurement `y = h(x0) + σ·ε`, a
//! [`guidance::GuidanceMethod`] turns the unconditional score `s(x, t)` into
//! an approximation of the conditional score `∇ₓ log p_t(x | y)`. Methods are
//! selected by name through a [`registry::Registry`].
//!
//! Derivatives of the Tweedie estimate come from the small forward/reverse
//! AD engine in [`ad`].

pub mod ad;
pub mod config;
pub mod error;
pub mod guidance;
pub mod linalg;
pub mod observation;
pub mod registry;
pub mod sde;

pub use config::GuidanceConfig;
pub use error::{Error, Result};
pub use guidance::{GuidanceArgs, GuidanceMethod, MethodName, PigCovariance, SignalShape};
pub use observation::{Identity, Linear, Mask};
pub use registry::Registry;
pub use sde::{Tweedie, VeSchedule, VpSchedule};
