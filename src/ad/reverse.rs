use std::fmt::{self, Display};

use super::tape::{self, TapeThreadLocal, CONSTANT};
use super::Float;

/// Reverse-mode AD variable.
///
/// A value and a tape index. `Copy` because the tape lives in a thread-local,
/// not inside this struct.
#[derive(Clone, Copy, Debug)]
pub struct Reverse<F: Float> {
    pub(crate) value: F,
    pub(crate) index: u32,
}

impl<F: Float> Reverse<F> {
    /// A constant, not tracked on the tape.
    #[inline]
    pub fn constant(value: F) -> Self {
        Reverse {
            value,
            index: CONSTANT,
        }
    }

    /// Wrap a tape allocation. Used by the closure API and by tests.
    #[inline]
    pub fn from_tape(value: F, index: u32) -> Self {
        Reverse { value, index }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.index == CONSTANT
    }
}

impl<F: Float + TapeThreadLocal> Reverse<F> {
    /// Record `f(self)` with local derivative `f_deriv`.
    #[inline]
    fn unary(self, f_val: F, f_deriv: F) -> Self {
        if self.is_constant() {
            return Reverse::constant(f_val);
        }
        let index = tape::with_active_tape(|t| t.push_unary(self.index, f_deriv));
        Reverse {
            value: f_val,
            index,
        }
    }

    #[inline]
    pub fn recip(self) -> Self {
        let inv = F::one() / self.value;
        self.unary(inv, -inv * inv)
    }

    #[inline]
    pub fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        let two = F::one() + F::one();
        self.unary(s, F::one() / (two * s))
    }

    #[inline]
    pub fn powi(self, n: i32) -> Self {
        let val = self.value.powi(n);
        let deriv = F::from_i32(n).unwrap_or_else(F::zero) * self.value.powi(n - 1);
        self.unary(val, deriv)
    }

    #[inline]
    pub fn exp(self) -> Self {
        let e = self.value.exp();
        self.unary(e, e)
    }

    #[inline]
    pub fn ln(self) -> Self {
        self.unary(self.value.ln(), F::one() / self.value)
    }

    #[inline]
    pub fn sin(self) -> Self {
        self.unary(self.value.sin(), self.value.cos())
    }

    #[inline]
    pub fn cos(self) -> Self {
        self.unary(self.value.cos(), -self.value.sin())
    }

    #[inline]
    pub fn tanh(self) -> Self {
        let t = self.value.tanh();
        self.unary(t, F::one() - t * t)
    }
}

impl<F: Float> Display for Reverse<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<F: Float> Default for Reverse<F> {
    fn default() -> Self {
        Reverse::constant(F::zero())
    }
}
