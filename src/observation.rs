//! Observation maps `h: Signal → Observation`.
//!
//! Implement [`Observe`] (the differentiable map, written once against
//! [`Scalar`]) and [`ObservationMap`] (shape metadata). Every such type is a
//! [`DynObservationMap`] and can be shared as `Arc<dyn DynObservationMap>`.

use ndarray::{Array1, Array2};

use crate::ad::{Dual64, Reverse64, Scalar};
use crate::error::{Error, Result};

/// The differentiable part of an observation map.
pub trait Observe {
    fn observe<T: Scalar<Float = f64>>(&self, x: &[T]) -> Vec<T>;
}

/// Object-safe metadata about an observation map.
pub trait ObservationMap: Send + Sync {
    /// The matrix `H` when the map is linear, `h(x) = H x`.
    fn matrix(&self) -> Option<&Array2<f64>> {
        None
    }

    /// `H` for signals of length `input_dim`, built on demand for linear
    /// maps that store no matrix.
    fn dense_matrix(&self, _input_dim: usize) -> Option<Array2<f64>> {
        self.matrix().cloned()
    }

    /// The signal length the map is built for, if it is fixed.
    fn input_dim(&self) -> Option<usize> {
        None
    }

    /// `d_y` for signals of flattened length `input_dim`.
    fn output_dim(&self, input_dim: usize) -> usize;
}

/// Type-erased observation map, evaluable in every AD mode.
pub trait DynObservationMap: ObservationMap {
    fn observe_f64(&self, x: &[f64]) -> Vec<f64>;
    fn observe_dual(&self, x: &[Dual64]) -> Vec<Dual64>;
    fn observe_reverse(&self, x: &[Reverse64]) -> Vec<Reverse64>;
}

impl<M: Observe + ObservationMap> DynObservationMap for M {
    fn observe_f64(&self, x: &[f64]) -> Vec<f64> {
        self.observe(x)
    }

    fn observe_dual(&self, x: &[Dual64]) -> Vec<Dual64> {
        self.observe(x)
    }

    fn observe_reverse(&self, x: &[Reverse64]) -> Vec<Reverse64> {
        self.observe(x)
    }
}

/// `h(x) = x`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Observe for Identity {
    fn observe<T: Scalar<Float = f64>>(&self, x: &[T]) -> Vec<T> {
        x.to_vec()
    }
}

impl ObservationMap for Identity {
    fn dense_matrix(&self, input_dim: usize) -> Option<Array2<f64>> {
        Some(Array2::eye(input_dim))
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        input_dim
    }
}

/// `h(x) = H x` for a dense `(d_y × d_x)` matrix.
#[derive(Clone, Debug)]
pub struct Linear {
    h: Array2<f64>,
}

impl Linear {
    pub fn new(h: Array2<f64>) -> Result<Self> {
        if h.is_empty() {
            return Err(Error::ShapeMismatch("observation matrix is empty".into()));
        }
        if h.iter().any(|v| !v.is_finite()) {
            return Err(Error::Domain("observation matrix contains non-finite values"));
        }
        Ok(Linear { h })
    }

    pub fn identity(dim: usize) -> Self {
        Linear {
            h: Array2::eye(dim),
        }
    }
}

impl Observe for Linear {
    fn observe<T: Scalar<Float = f64>>(&self, x: &[T]) -> Vec<T> {
        self.h
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .zip(x)
                    .filter(|(w, _)| **w != 0.0)
                    .fold(T::zero(), |acc, (&w, &xi)| acc + xi.scale(w))
            })
            .collect()
    }
}

impl ObservationMap for Linear {
    fn matrix(&self) -> Option<&Array2<f64>> {
        Some(&self.h)
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.h.ncols())
    }

    fn output_dim(&self, _input_dim: usize) -> usize {
        self.h.nrows()
    }
}

/// Coordinate mask `h(x) = m ⊙ x`. Observed and unobserved coordinates keep
/// their positions, so `d_y = d_x`.
#[derive(Clone, Debug)]
pub struct Mask {
    mask: Array1<f64>,
    matrix: Array2<f64>,
}

impl Mask {
    pub fn new(mask: Array1<f64>) -> Result<Self> {
        if mask.is_empty() {
            return Err(Error::ShapeMismatch("mask is empty".into()));
        }
        if mask.iter().any(|v| !v.is_finite()) {
            return Err(Error::Domain("mask contains non-finite values"));
        }
        let matrix = Array2::from_diag(&mask);
        Ok(Mask { mask, matrix })
    }

    /// A 0/1 mask keeping the listed coordinates.
    pub fn keep(dim: usize, observed: &[usize]) -> Result<Self> {
        let mut mask = Array1::zeros(dim);
        for &i in observed {
            if i >= dim {
                return Err(Error::ShapeMismatch(format!(
                    "observed coordinate {i} is outside a signal of length {dim}"
                )));
            }
            mask[i] = 1.0;
        }
        Self::new(mask)
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.mask
    }
}

impl Observe for Mask {
    fn observe<T: Scalar<Float = f64>>(&self, x: &[T]) -> Vec<T> {
        x.iter()
            .zip(self.mask.iter())
            .map(|(&xi, &m)| if m == 0.0 { T::zero() } else { xi.scale(m) })
            .collect()
    }
}

impl ObservationMap for Mask {
    fn matrix(&self) -> Option<&Array2<f64>> {
        Some(&self.matrix)
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.mask.len())
    }

    fn output_dim(&self, _input_dim: usize) -> usize {
        self.mask.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad;
    use ndarray::array;

    #[test]
    fn linear_map_matches_matrix_product() {
        let h = Linear::new(array![[1.0, 2.0, 0.0], [0.0, -1.0, 4.0]]).unwrap();
        let x = [1.0, 2.0, 3.0];
        assert_eq!(h.observe_f64(&x), vec![5.0, 10.0]);
        assert_eq!(h.output_dim(3), 2);
    }

    #[test]
    fn linear_map_jacobian_is_the_matrix() {
        let m = array![[1.0, 2.0, 0.0], [0.0, -1.0, 4.0]];
        let h = Linear::new(m.clone()).unwrap();
        let (_, jac) = ad::jacobian_rev(|x| h.observe_reverse(x), &[0.5, 0.1, -0.3]);
        assert_eq!(jac, m);
        let (_, jac) = ad::jacobian_fwd(|x| h.observe_dual(x), &[0.5, 0.1, -0.3]);
        assert_eq!(jac, m);
    }

    #[test]
    fn mask_zeroes_unobserved_coordinates() {
        let h = Mask::keep(4, &[0, 2]).unwrap();
        assert_eq!(h.observe_f64(&[1.0, 2.0, 3.0, 4.0]), vec![1.0, 0.0, 3.0, 0.0]);
        assert_eq!(h.matrix().unwrap().diag().to_vec(), vec![1.0, 0.0, 1.0, 0.0]);
        assert!(Mask::keep(2, &[5]).is_err());
    }

    #[test]
    fn identity_materializes_its_matrix() {
        assert!(Identity.matrix().is_none());
        assert!(Identity.input_dim().is_none());
        assert_eq!(Identity.dense_matrix(3), Some(Array2::eye(3)));
        assert_eq!(Identity.output_dim(7), 7);
    }

    #[test]
    fn fixed_maps_report_their_input_width() {
        let h = Linear::new(array![[1.0, 1.0, 5.0]]).unwrap();
        assert_eq!(h.input_dim(), Some(3));
        assert_eq!(Mask::keep(4, &[1]).unwrap().input_dim(), Some(4));
    }
}
