/// Errors surfaced by the guidance layer.
///
/// Nothing here is retried or silently regularized; every variant reaches the
/// caller (ultimately the outer sampling loop).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A name was registered twice. Fatal during start-up.
    #[error("guidance method `{0}` is already registered")]
    DuplicateRegistration(String),
    /// A lookup used a name nobody registered.
    #[error("guidance method `{0}` is not registered")]
    UnknownMethod(String),
    /// The innovation covariance of one sample could not be factorized.
    #[error("innovation covariance of sample {sample} is singular")]
    LinearAlgebra { sample: usize },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// The chosen variant needs a constructor argument that was not supplied.
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
