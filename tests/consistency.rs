//! Cross-checks between guidance variants that must agree in known limits.

mod common;

use std::sync::Arc;

use common::*;
use ndarray::{array, Array2, ArrayD, IxDyn};
use proptest::prelude::*;
use tweedie_guide::guidance::{GuidanceMethod, MethodName, SignalShape};
use tweedie_guide::observation::{DynObservationMap, Linear, Mask};
use tweedie_guide::registry::Registry;
use tweedie_guide::sde::DynSde;

const T: f64 = 0.4;

fn build(
    name: MethodName,
    sde: Arc<dyn DynSde>,
    h: Arc<dyn DynObservationMap>,
    y: Array2<f64>,
    shape: SignalShape,
    noise_std: f64,
) -> Box<dyn GuidanceMethod> {
    Registry::builtin()
        .get(name.as_str(), args(sde, h, y, shape, noise_std))
        .unwrap()
}

#[test]
fn full_covariance_variants_agree_on_a_linear_model() {
    let h: Arc<dyn DynObservationMap> =
        Arc::new(Linear::new(array![[1.0, 0.5, 0.0], [0.0, -1.0, 2.0]]).unwrap());
    let x = array![[0.3, -0.8, 1.1], [-1.4, 0.2, 0.6]];
    let y = array![[0.5, -0.2], [1.0, 0.4]];
    let shape = SignalShape::new(2, [3]);

    let reference = build(
        MethodName::Vjp,
        vp_gaussian(GaussianScore::coupled()),
        h.clone(),
        y.clone(),
        shape.clone(),
        0.1,
    );
    let expected = evaluate(reference.as_ref(), &x, T);

    for name in [MethodName::VjpAlt, MethodName::JacRev, MethodName::JacFwd] {
        let m = build(
            name,
            vp_gaussian(GaussianScore::coupled()),
            h.clone(),
            y.clone(),
            shape.clone(),
            0.1,
        );
        assert_close(&evaluate(m.as_ref(), &x, T), &expected, 1e-9);
    }
}

#[test]
fn diagonal_variants_agree_for_a_mask_and_diagonal_prior() {
    let h: Arc<dyn DynObservationMap> = Arc::new(Mask::keep(3, &[0, 2]).unwrap());
    let x = array![[0.3, -0.8, 1.1], [-1.4, 0.2, 0.6], [0.0, 1.0, -1.0]];
    let y = array![[0.5, 0.0, -0.2]];
    let shape = SignalShape::new(3, [3]);
    let sde = || vp_gaussian(GaussianScore::diagonal(&[0.5, 1.5, 3.0]));

    let expected = evaluate(
        build(MethodName::Vjp, sde(), h.clone(), y.clone(), shape.clone(), 0.2).as_ref(),
        &x,
        T,
    );
    for name in [
        MethodName::VjpAlt,
        MethodName::VjpMask,
        MethodName::VjpDiag,
        MethodName::JacRev,
        MethodName::JacRevDiagonal,
        MethodName::JacFwd,
        MethodName::JacFwdDiagonal,
    ] {
        let m = build(name, sde(), h.clone(), y.clone(), shape.clone(), 0.2);
        assert_close(&evaluate(m.as_ref(), &x, T), &expected, 1e-9);
    }
}

#[test]
fn zero_noise_full_covariance_inverts_the_jacobian() {
    // With H = I and a symmetric J, ls = Jᵀ (ratio·J)⁻¹ (y − x̂0) = (y − x̂0) / ratio.
    let sde = vp_gaussian(GaussianScore::coupled());
    let x = array![[0.2, 0.4, -0.6]];
    let y = array![[1.0, -1.0, 0.5]];
    let shape = SignalShape::new(1, [3]);

    let est = sde.estimate_x0_f64(&x.row(0).to_vec(), T);
    let ratio = sde.ratio(T);
    let expected: Array2<f64> = Array2::from_shape_fn((1, 3), |(_, j)| {
        est.score[j] + (y[[0, j]] - est.x0[j]) / ratio
    });

    for name in [MethodName::Vjp, MethodName::JacRev, MethodName::JacFwd] {
        let m = build(
            name,
            sde.clone(),
            Arc::new(Linear::identity(3)),
            y.clone(),
            shape.clone(),
            0.0,
        );
        assert_close(&evaluate(m.as_ref(), &x, T), &expected, 1e-8);
    }
}

#[test]
fn per_sample_times_match_separate_calls() {
    let h: Arc<dyn DynObservationMap> = Arc::new(Linear::new(array![[1.0, 1.0, 0.0]]).unwrap());
    let sde = vp_gaussian(GaussianScore::coupled());
    let x = array![[0.3, -0.8, 1.1], [-1.4, 0.2, 0.6]];
    let y = array![[0.5]];
    let times = array![[0.2], [0.7]];

    let both = build(
        MethodName::VjpAlt,
        sde.clone(),
        h.clone(),
        y.clone(),
        SignalShape::new(2, [3]),
        0.1,
    );
    let joint: Array2<f64> = both
        .guidance_score(x.view().into_dyn(), times.view().into_dyn())
        .unwrap()
        .into_dimensionality()
        .unwrap();

    let single = build(MethodName::VjpAlt, sde, h, y, SignalShape::new(1, [3]), 0.1);
    for i in 0..2 {
        let row = x.slice(ndarray::s![i..i + 1, ..]).to_owned();
        let alone = evaluate(single.as_ref(), &row, times[[i, 0]]);
        assert_close(&joint.slice(ndarray::s![i..i + 1, ..]).to_owned(), &alone, 1e-12);
    }
}

fn signals() -> impl Strategy<Value = (usize, Vec<usize>, Vec<f64>)> {
    (1usize..4, prop::collection::vec(1usize..4, 1..3)).prop_flat_map(|(batch, sample)| {
        let n = batch * sample.iter().product::<usize>();
        (
            Just(batch),
            Just(sample),
            prop::collection::vec(-2.0f64..2.0, n),
        )
    })
}

fn observe_sum(d_x: usize) -> Arc<dyn DynObservationMap> {
    let mut h = Array2::zeros((2, d_x));
    h.row_mut(0).fill(0.5);
    h[[1, 0]] = 1.0;
    Arc::new(Linear::new(h).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_method_preserves_the_signal_shape((batch, sample, data) in signals()) {
        let shape = SignalShape::new(batch, sample.clone());
        let d_x = shape.numel();
        let x = ArrayD::from_shape_vec(IxDyn(&shape.dims()), data).unwrap();
        let y = array![[3.0, -3.0]];
        let t = ndarray::arr1(&[0.5]);

        for name in MethodName::ALL {
            let m = build(
                name,
                vp_gaussian(GaussianScore::isotropic(d_x, 1.0)),
                observe_sum(d_x),
                y.clone(),
                shape.clone(),
                0.5,
            );
            let out = m.guidance_score(x.view(), t.view().into_dyn()).unwrap();
            prop_assert_eq!(out.shape(), x.shape());
            prop_assert!(out.iter().all(|v| v.is_finite()), "{} produced non-finite output", name);
        }
    }

    #[test]
    fn huge_noise_leaves_the_score_unchanged(
        data in prop::collection::vec(-2.0f64..2.0, 6),
        t in 0.05f64..0.5,
    ) {
        let x = Array2::from_shape_vec((2, 3), data).unwrap();
        let sde = vp_gaussian(GaussianScore::coupled());
        let s = scores(sde.as_ref(), &x, t);

        for name in MethodName::ALL.into_iter().filter(|m| *m != MethodName::Dps) {
            let m = build(
                name,
                sde.clone(),
                observe_sum(3),
                array![[1.0, -1.0]],
                SignalShape::new(2, [3]),
                1e5,
            );
            let gs = evaluate(m.as_ref(), &x, t);
            for (a, b) in gs.iter().zip(s.iter()) {
                prop_assert!((a - b).abs() < 1e-6, "{}: {} vs {}", name, a, b);
            }
        }
    }
}
