use ndarray::Array2;

use super::dual::Dual;
use super::reverse::Reverse;
use super::tape::{Tape, TapeGuard, TapeThreadLocal, CONSTANT};
use super::Float;

/// Put `x` on a fresh tape as independent variables (indices `0..n`).
fn record_inputs<F: Float>(tape: &mut Tape<F>, x: &[F]) -> Vec<Reverse<F>> {
    x.iter()
        .map(|&val| {
            let (idx, v) = tape.new_variable(val);
            Reverse::from_tape(v, idx)
        })
        .collect()
}

/// Gradient of a scalar function `f : Rⁿ → R` by one reverse sweep.
///
/// ```
/// use tweedie_guide::ad;
/// let g = ad::grad(|x| x[0] * x[0] + x[1] * x[1], &[3.0_f64, 4.0]);
/// assert!((g[0] - 6.0).abs() < 1e-12);
/// assert!((g[1] - 8.0).abs() < 1e-12);
/// ```
pub fn grad<F: Float + TapeThreadLocal>(
    f: impl FnOnce(&[Reverse<F>]) -> Reverse<F>,
    x: &[F],
) -> Vec<F> {
    value_and_grad(f, x).1
}

/// Like [`grad`] but also returns `f(x)`.
pub fn value_and_grad<F: Float + TapeThreadLocal>(
    f: impl FnOnce(&[Reverse<F>]) -> Reverse<F>,
    x: &[F],
) -> (F, Vec<F>) {
    let n = x.len();
    let mut tape = Tape::with_capacity(n * 10);
    let inputs = record_inputs(&mut tape, x);

    let output = {
        let _guard = TapeGuard::new(&mut tape);
        f(&inputs)
    };

    if output.index == CONSTANT {
        return (output.value, vec![F::zero(); n]);
    }
    let adjoints = tape.reverse(output.index);
    (output.value, adjoints[..n].to_vec())
}

/// A recorded function `f : Rⁿ → Rᵐ` that maps output cotangents back to
/// input space. Sweeping does not re-evaluate `f`.
#[derive(Clone, Debug)]
pub struct Pullback<F: Float> {
    tape: Tape<F>,
    outputs: Vec<u32>,
    num_inputs: usize,
}

impl<F: Float> Pullback<F> {
    /// `wᵀ·J` as a vector of length `n`.
    pub fn pull(&self, w: &[F]) -> Vec<F> {
        assert_eq!(
            self.outputs.len(),
            w.len(),
            "cotangent length must match output length"
        );
        let seeds: Vec<(u32, F)> = self
            .outputs
            .iter()
            .zip(w)
            .filter(|(idx, _)| **idx != CONSTANT)
            .map(|(&idx, &wi)| (idx, wi))
            .collect();
        if seeds.is_empty() {
            return vec![F::zero(); self.num_inputs];
        }
        let adjoints = self.tape.reverse_seeded(&seeds);
        adjoints[..self.num_inputs].to_vec()
    }

    /// The full reverse-mode Jacobian, one sweep per output (row).
    pub fn jacobian(&self) -> Array2<F> {
        let m = self.outputs.len();
        let mut jac = Array2::zeros((m, self.num_inputs));
        for (i, &out) in self.outputs.iter().enumerate() {
            if out == CONSTANT {
                continue;
            }
            let adjoints = self.tape.reverse(out);
            for (dst, &a) in jac.row_mut(i).iter_mut().zip(&adjoints[..self.num_inputs]) {
                *dst = a;
            }
        }
        jac
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}

/// Evaluate `f` at `x` and keep the tape for later vector-Jacobian products.
///
/// `f` may return auxiliary data alongside its outputs; it is passed through
/// untouched (no derivative is taken of it).
pub fn pullback<F: Float + TapeThreadLocal, A>(
    f: impl FnOnce(&[Reverse<F>]) -> (Vec<Reverse<F>>, A),
    x: &[F],
) -> (Vec<F>, Pullback<F>, A) {
    let n = x.len();
    let mut tape = Tape::with_capacity(n * 10);
    let inputs = record_inputs(&mut tape, x);

    let (outputs, aux) = {
        let _guard = TapeGuard::new(&mut tape);
        f(&inputs)
    };

    let values = outputs.iter().map(|r| r.value).collect();
    let outputs = outputs.iter().map(|r| r.index).collect();
    (
        values,
        Pullback {
            tape,
            outputs,
            num_inputs: n,
        },
        aux,
    )
}

/// Vector-Jacobian product (reverse mode): `(f(x), wᵀ·J)`.
pub fn vjp<F: Float + TapeThreadLocal>(
    f: impl FnOnce(&[Reverse<F>]) -> Vec<Reverse<F>>,
    x: &[F],
    w: &[F],
) -> (Vec<F>, Vec<F>) {
    let (values, pb, ()) = pullback(|v| (f(v), ()), x);
    let g = pb.pull(w);
    (values, g)
}

/// Jacobian-vector product (forward mode): `(f(x), J·v)`.
pub fn jvp<F: Float>(f: impl Fn(&[Dual<F>]) -> Vec<Dual<F>>, x: &[F], v: &[F]) -> (Vec<F>, Vec<F>) {
    assert_eq!(x.len(), v.len(), "x and v must have the same length");
    let inputs: Vec<Dual<F>> = x.iter().zip(v).map(|(&xi, &vi)| Dual::new(xi, vi)).collect();
    let outputs = f(&inputs);
    let values = outputs.iter().map(|d| d.re).collect();
    let tangents = outputs.iter().map(|d| d.eps).collect();
    (values, tangents)
}

/// Full Jacobian of `f : Rⁿ → Rᵐ` by forward mode, one pass per input.
///
/// Returns `(f(x), J)` with `J[[i, j]] = ∂f_i/∂x_j`.
pub fn jacobian_fwd<F: Float>(
    f: impl Fn(&[Dual<F>]) -> Vec<Dual<F>>,
    x: &[F],
) -> (Vec<F>, Array2<F>) {
    let n = x.len();
    let mut inputs: Vec<Dual<F>> = x.iter().map(|&xi| Dual::constant(xi)).collect();
    let values: Vec<F> = f(&inputs).iter().map(|d| d.re).collect();

    let mut jac = Array2::zeros((values.len(), n));
    for j in 0..n {
        inputs[j].eps = F::one();
        let outputs = f(&inputs);
        inputs[j].eps = F::zero();
        for (dst, out) in jac.column_mut(j).iter_mut().zip(&outputs) {
            *dst = out.eps;
        }
    }
    (values, jac)
}

/// Full Jacobian of `f : Rⁿ → Rᵐ` by reverse mode: one recording, one sweep
/// per output.
pub fn jacobian_rev<F: Float + TapeThreadLocal>(
    f: impl FnOnce(&[Reverse<F>]) -> Vec<Reverse<F>>,
    x: &[F],
) -> (Vec<F>, Array2<F>) {
    let (values, pb, ()) = pullback(|v| (f(v), ()), x);
    (values, pb.jacobian())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn grad_of_constant_function_is_zero() {
        let g = grad(|_x: &[Reverse<f64>]| Reverse::constant(2.0), &[1.0, 2.0]);
        assert_eq!(g, vec![0.0, 0.0]);
    }

    #[test]
    fn pullback_reuses_recording_for_many_seeds() {
        // f(x) = [x0 * x1, x0 + 2 x1]
        let (vals, pb, aux) = pullback(
            |x| {
                let out = vec![x[0] * x[1], x[0] + x[1] * 2.0];
                (out, x[0].value * 10.0)
            },
            &[3.0, 5.0],
        );
        assert_eq!(vals, vec![15.0, 13.0]);
        assert_eq!(aux, 30.0);
        assert_eq!(pb.pull(&[1.0, 0.0]), vec![5.0, 3.0]);
        assert_eq!(pb.pull(&[0.0, 1.0]), vec![1.0, 2.0]);
        assert_eq!(pb.pull(&[1.0, 1.0]), vec![6.0, 5.0]);
    }

    #[test]
    fn forward_and_reverse_jacobians_agree() {
        let x = [0.3, -1.2, 2.0];
        let (v_fwd, j_fwd) = jacobian_fwd(
            |x| vec![x[0] * x[1].exp(), x[2].sin() + x[0] * x[0], x[1] / x[2]],
            &x,
        );
        let (v_rev, j_rev) = jacobian_rev(
            |x| vec![x[0] * x[1].exp(), x[2].sin() + x[0] * x[0], x[1] / x[2]],
            &x,
        );
        for (a, b) in v_fwd.iter().zip(&v_rev) {
            assert_relative_eq!(a, b, max_relative = 1e-14);
        }
        for (a, b) in j_fwd.iter().zip(j_rev.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn identity_output_pulls_straight_through() {
        let (_, pb, ()) = pullback(|x| (x.to_vec(), ()), &[1.0, 2.0]);
        assert_eq!(pb.pull(&[4.0, -1.0]), vec![4.0, -1.0]);
    }
}
