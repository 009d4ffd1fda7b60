mod common;

use std::sync::Arc;

use common::*;
use ndarray::array;
use tweedie_guide::guidance::{Dps, GuidanceMethod, MethodName, SignalShape};
use tweedie_guide::observation::{Identity, Linear};
use tweedie_guide::registry::{self, Registry};
use tweedie_guide::Error;

fn linear_args() -> tweedie_guide::GuidanceArgs {
    args(
        identity_sde(),
        Arc::new(Linear::identity(2)),
        array![[0.0, 0.0]],
        SignalShape::new(1, [2]),
        0.1,
    )
}

#[test]
fn every_builtin_constructs_under_its_own_name() {
    let reg = Registry::builtin();
    for name in MethodName::ALL {
        let method = reg.get(name.as_str(), linear_args()).unwrap();
        assert_eq!(method.name(), name.as_str());
    }
}

#[test]
fn aliases_construct_the_canonical_method() {
    let reg = Registry::builtin();
    let m = reg.get("pseudo_inverse_guidance", linear_args()).unwrap();
    assert_eq!(m.name(), "pseduo_inverse_guidance");
    let m = reg.get("diffusion_posterior_sampling_mod", linear_args()).unwrap();
    assert_eq!(m.name(), "diffusion_psoterior_sampling_mod");
}

#[test]
fn unknown_names_are_reported() {
    let reg = Registry::builtin();
    match reg.get("tweedie_moment_projection", linear_args()) {
        Err(Error::UnknownMethod(name)) => assert_eq!(name, "tweedie_moment_projection"),
        Err(other) => panic!("expected UnknownMethod, got {other}"),
        Ok(_) => panic!("expected UnknownMethod"),
    }
}

#[test]
fn custom_methods_can_extend_the_builtins() {
    let mut reg = Registry::builtin();
    reg.register("dps_strong", |a| {
        Ok(Box::new(Dps::new(a.with_scale(2.0))?) as Box<dyn GuidanceMethod>)
    })
    .unwrap();
    assert!(reg.names().contains(&"dps_strong"));
    let m = reg.get("dps_strong", linear_args()).unwrap();
    assert_eq!(m.name(), "diffusion_posterior_sampling");

    let dup = reg.register("vjp_guidance", |a| {
        Ok(Box::new(Dps::new(a)?) as Box<dyn GuidanceMethod>)
    });
    assert!(matches!(dup, Err(Error::DuplicateRegistration(_))));
}

#[test]
fn construction_errors_come_from_the_constructor() {
    let reg = Registry::builtin();
    let no_matrix = args(
        identity_sde(),
        Arc::new(Squared),
        array![[0.0, 0.0]],
        SignalShape::new(1, [2]),
        0.1,
    );
    assert!(matches!(
        reg.get("vjp_guidance", no_matrix.clone()),
        Err(Error::MissingArgument(_))
    ));
    assert!(reg.get("vjp_guidance_mask", no_matrix).is_ok());

    let identity = args(
        identity_sde(),
        Arc::new(Identity),
        array![[0.0, 0.0]],
        SignalShape::new(1, [2]),
        0.1,
    );
    for name in ["vjp_guidance", "vjp_guidance_alt", "vjp_guidance_diag"] {
        assert!(reg.get(name, identity.clone()).is_ok(), "{name} rejected the identity map");
    }

    let mut no_noise = linear_args();
    no_noise.noise_std = None;
    assert!(matches!(
        reg.get("jac_fwd_guidance", no_noise.clone()),
        Err(Error::MissingArgument("noise_std"))
    ));
    assert!(reg.get("diffusion_posterior_sampling", no_noise).is_ok());
}

#[test]
fn global_registry_is_the_builtin_one() {
    let global = registry::global();
    assert_eq!(global.names(), Registry::builtin().names());
    // Already initialised: a late install is handed back.
    assert!(registry::install(Registry::new()).is_err());
}
