//! Crate-wide error type.
//!
//! Fatal conditions (unsupported dimension, missing required attributes,
//! distributed protocol violations, positions outside the grid) surface as
//! `PdError`. Soft failures such as the ADR iteration cap are logged by the
//! solver and never raised as errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdError {
    #[error("unsupported spatial dimension {0} (use 1, 2 or 3)")]
    UnsupportedDimension(usize),

    #[error("required attribute '{0}' is not registered")]
    MissingAttribute(String),

    #[error("attribute '{0}' registered after particle allocation")]
    SchemaFrozen(String),

    #[error("position ({x:.6e}, {y:.6e}, {z:.6e}) is outside the configured grid")]
    OutsideGrid { x: f64, y: f64, z: f64 },

    #[error("unknown particle id {0}")]
    UnknownParticle(usize),

    #[error("exchange protocol violation: {0}")]
    Protocol(String),

    #[error("malformed particle file: {0}")]
    ParticleFile(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
