//! Name → constructor lookup for guidance methods.
//!
//! [`Registry::builtin`] knows the eleven built-in variants. A process-wide
//! registry is available through [`global`]; it is built on first use and
//! can be replaced once, before that, with [`install`].

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{Error, Result};
use crate::guidance::{
    Dps, DpsMod, GuidanceArgs, GuidanceMethod, JacobianGuidance, MethodName, Pig, Vjp, VjpAlt,
    VjpDiag, VjpMask,
};

/// Builds a configured guidance method.
pub type Constructor = fn(GuidanceArgs) -> Result<Box<dyn GuidanceMethod>>;

#[derive(Clone, Debug, Default)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

fn boxed<M: GuidanceMethod + 'static>(m: Result<M>) -> Result<Box<dyn GuidanceMethod>> {
    m.map(|m| Box::new(m) as Box<dyn GuidanceMethod>)
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// All built-in variants under their [`MethodName`] strings, plus the
    /// corrected spellings as aliases.
    pub fn builtin() -> Self {
        let mut reg = Registry::new();
        let entries: [(MethodName, Constructor); 11] = [
            (MethodName::Dps, |a| boxed(Dps::new(a))),
            (MethodName::DpsMod, |a| boxed(DpsMod::new(a))),
            (MethodName::Pig, |a| boxed(Pig::new(a))),
            (MethodName::Vjp, |a| boxed(Vjp::new(a))),
            (MethodName::VjpAlt, |a| boxed(VjpAlt::new(a))),
            (MethodName::VjpMask, |a| boxed(VjpMask::new(a))),
            (MethodName::VjpDiag, |a| boxed(VjpDiag::new(a))),
            (MethodName::JacRev, |a| boxed(JacobianGuidance::jac_rev(a))),
            (MethodName::JacRevDiagonal, |a| boxed(JacobianGuidance::jac_rev_diagonal(a))),
            (MethodName::JacFwd, |a| boxed(JacobianGuidance::jac_fwd(a))),
            (MethodName::JacFwdDiagonal, |a| boxed(JacobianGuidance::jac_fwd_diagonal(a))),
        ];
        for (name, ctor) in entries {
            reg.constructors.insert(name.as_str().to_string(), ctor);
        }
        reg.constructors
            .insert("diffusion_posterior_sampling_mod".into(), |a| boxed(DpsMod::new(a)));
        reg.constructors
            .insert("pseudo_inverse_guidance".into(), |a| boxed(Pig::new(a)));
        reg
    }

    /// Add a constructor under a new name.
    pub fn register(&mut self, name: impl Into<String>, ctor: Constructor) -> Result<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(Error::DuplicateRegistration(name));
        }
        debug!(%name, "registered guidance method");
        self.constructors.insert(name, ctor);
        Ok(())
    }

    /// Construct the method registered under `name`.
    pub fn get(&self, name: &str, args: GuidanceArgs) -> Result<Box<dyn GuidanceMethod>> {
        let ctor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::UnknownMethod(name.to_string()))?;
        debug!(name, batch = args.shape.batch, "constructing guidance method");
        ctor(args)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry; [`Registry::builtin`] unless [`install`]ed.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| {
        debug!("initialising built-in guidance registry");
        Registry::builtin()
    })
}

/// Install `registry` as the process-wide one. Fails (handing the registry
/// back) once [`global`] has been initialised.
pub fn install(registry: Registry) -> std::result::Result<(), Registry> {
    GLOBAL.set(registry).inspect(|()| debug!("installed custom guidance registry"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_knows_every_method_name() {
        let reg = Registry::builtin();
        for name in MethodName::ALL {
            assert!(reg.contains(name.as_str()), "{name} missing");
        }
        assert!(reg.contains("pseudo_inverse_guidance"));
        assert_eq!(reg.len(), 13);
    }

    #[test]
    fn registering_twice_fails() {
        let mut reg = Registry::new();
        assert!(reg.is_empty());
        reg.register("mine", |a| boxed(Dps::new(a))).unwrap();
        assert!(matches!(
            reg.register("mine", |a| boxed(Dps::new(a))),
            Err(Error::DuplicateRegistration(n)) if n == "mine"
        ));
    }

    #[test]
    fn names_are_sorted() {
        let reg = Registry::builtin();
        let names = reg.names();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
