//! Minimal operator-overloading automatic differentiation.
//!
//! Forward mode uses [`Dual`] numbers, reverse mode uses [`Reverse`]
//! variables recorded on a thread-local [`tape::Tape`]. Differentiable code
//! is written once against [`Scalar`].
//!
//! | Primitive | Entry point |
//! |---|---|
//! | scalar gradient | [`grad`], [`value_and_grad`] |
//! | vector-Jacobian product | [`vjp`], [`pullback`] + [`Pullback::pull`] |
//! | Jacobian-vector product | [`jvp`] |
//! | forward-mode Jacobian | [`jacobian_fwd`] |
//! | reverse-mode Jacobian | [`jacobian_rev`], [`Pullback::jacobian`] |

mod api;
pub mod dual;
pub mod float;
mod ops;
pub mod reverse;
pub mod scalar;
pub mod tape;

pub use api::{grad, jacobian_fwd, jacobian_rev, jvp, pullback, value_and_grad, vjp, Pullback};
pub use dual::Dual;
pub use float::Float;
pub use reverse::Reverse;
pub use scalar::Scalar;

/// Forward-mode dual numbers over `f64`.
pub type Dual64 = Dual<f64>;
/// Reverse-mode variables over `f64`.
pub type Reverse64 = Reverse<f64>;
