//! Operator overloads for [`Dual`] and [`Reverse`].

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use num_traits::{One, Zero};

use super::dual::Dual;
use super::reverse::Reverse;
use super::tape::{self, TapeThreadLocal, CONSTANT};
use super::Float;

// ── Dual<F> ──

impl<F: Float> Add for Dual<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Dual::new(self.re + rhs.re, self.eps + rhs.eps)
    }
}

impl<F: Float> Sub for Dual<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Dual::new(self.re - rhs.re, self.eps - rhs.eps)
    }
}

impl<F: Float> Mul for Dual<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Dual::new(self.re * rhs.re, self.re * rhs.eps + self.eps * rhs.re)
    }
}

impl<F: Float> Div for Dual<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = F::one() / rhs.re;
        Dual::new(
            self.re * inv,
            (self.eps * rhs.re - self.re * rhs.eps) * inv * inv,
        )
    }
}

impl<F: Float> Neg for Dual<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Dual::new(-self.re, -self.eps)
    }
}

impl<F: Float> Zero for Dual<F> {
    #[inline]
    fn zero() -> Self {
        Dual::constant(F::zero())
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.re.is_zero() && self.eps.is_zero()
    }
}

impl<F: Float> One for Dual<F> {
    #[inline]
    fn one() -> Self {
        Dual::constant(F::one())
    }
}

impl<F: Float> PartialEq for Dual<F> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.re == other.re
    }
}

impl<F: Float> PartialOrd for Dual<F> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.re.partial_cmp(&other.re)
    }
}

// ── Reverse<F> ──

/// Record a binary statement, skipping the tape when both sides are constant.
#[inline]
fn binary<F: Float + TapeThreadLocal>(
    value: F,
    lhs: Reverse<F>,
    lhs_mult: F,
    rhs: Reverse<F>,
    rhs_mult: F,
) -> Reverse<F> {
    if lhs.index == CONSTANT && rhs.index == CONSTANT {
        return Reverse::constant(value);
    }
    let index = tape::with_active_tape(|t| t.push_binary(lhs.index, lhs_mult, rhs.index, rhs_mult));
    Reverse { value, index }
}

impl<F: Float + TapeThreadLocal> Add for Reverse<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        binary(self.value + rhs.value, self, F::one(), rhs, F::one())
    }
}

impl<F: Float + TapeThreadLocal> Sub for Reverse<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        binary(self.value - rhs.value, self, F::one(), rhs, -F::one())
    }
}

impl<F: Float + TapeThreadLocal> Mul for Reverse<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        binary(self.value * rhs.value, self, rhs.value, rhs, self.value)
    }
}

impl<F: Float + TapeThreadLocal> Div for Reverse<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = F::one() / rhs.value;
        let value = self.value * inv;
        binary(value, self, inv, rhs, -value * inv)
    }
}

impl<F: Float + TapeThreadLocal> Neg for Reverse<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        if self.index == CONSTANT {
            return Reverse::constant(-self.value);
        }
        let index = tape::with_active_tape(|t| t.push_unary(self.index, -F::one()));
        Reverse {
            value: -self.value,
            index,
        }
    }
}

impl<F: Float + TapeThreadLocal> Zero for Reverse<F> {
    #[inline]
    fn zero() -> Self {
        Reverse::constant(F::zero())
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.index == CONSTANT && self.value.is_zero()
    }
}

impl<F: Float + TapeThreadLocal> One for Reverse<F> {
    #[inline]
    fn one() -> Self {
        Reverse::constant(F::one())
    }
}

impl<F: Float> PartialEq for Reverse<F> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<F: Float> PartialOrd for Reverse<F> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

// ── compound assignment and mixed ops with primitive floats ──

macro_rules! impl_assign_ops {
    ($t:ident, $($bound:tt)+) => {
        impl<F: $($bound)+> AddAssign for $t<F> {
            #[inline]
            fn add_assign(&mut self, rhs: Self) {
                *self = *self + rhs;
            }
        }

        impl<F: $($bound)+> SubAssign for $t<F> {
            #[inline]
            fn sub_assign(&mut self, rhs: Self) {
                *self = *self - rhs;
            }
        }

        impl<F: $($bound)+> MulAssign for $t<F> {
            #[inline]
            fn mul_assign(&mut self, rhs: Self) {
                *self = *self * rhs;
            }
        }

        impl<F: $($bound)+> DivAssign for $t<F> {
            #[inline]
            fn div_assign(&mut self, rhs: Self) {
                *self = *self / rhs;
            }
        }
    };
}

impl_assign_ops!(Dual, Float);
impl_assign_ops!(Reverse, Float + TapeThreadLocal);

macro_rules! impl_mixed_ops {
    ($t:ident, $lift:path, $f:ty) => {
        impl Add<$f> for $t<$f> {
            type Output = $t<$f>;
            #[inline]
            fn add(self, rhs: $f) -> $t<$f> {
                self + $lift(rhs)
            }
        }

        impl Add<$t<$f>> for $f {
            type Output = $t<$f>;
            #[inline]
            fn add(self, rhs: $t<$f>) -> $t<$f> {
                $lift(self) + rhs
            }
        }

        impl Sub<$f> for $t<$f> {
            type Output = $t<$f>;
            #[inline]
            fn sub(self, rhs: $f) -> $t<$f> {
                self - $lift(rhs)
            }
        }

        impl Sub<$t<$f>> for $f {
            type Output = $t<$f>;
            #[inline]
            fn sub(self, rhs: $t<$f>) -> $t<$f> {
                $lift(self) - rhs
            }
        }

        impl Mul<$f> for $t<$f> {
            type Output = $t<$f>;
            #[inline]
            fn mul(self, rhs: $f) -> $t<$f> {
                self * $lift(rhs)
            }
        }

        impl Mul<$t<$f>> for $f {
            type Output = $t<$f>;
            #[inline]
            fn mul(self, rhs: $t<$f>) -> $t<$f> {
                $lift(self) * rhs
            }
        }

        impl Div<$f> for $t<$f> {
            type Output = $t<$f>;
            #[inline]
            fn div(self, rhs: $f) -> $t<$f> {
                self / $lift(rhs)
            }
        }

        impl Div<$t<$f>> for $f {
            type Output = $t<$f>;
            #[inline]
            fn div(self, rhs: $t<$f>) -> $t<$f> {
                $lift(self) / rhs
            }
        }
    };
}

impl_mixed_ops!(Dual, Dual::constant, f32);
impl_mixed_ops!(Dual, Dual::constant, f64);
impl_mixed_ops!(Reverse, Reverse::constant, f32);
impl_mixed_ops!(Reverse, Reverse::constant, f64);
