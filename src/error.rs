use thiserror::Error;

/// Every failure the calculator surfaces. None of them is retried; a failed call leaves
/// the previously stored results untouched.
#[derive(Debug, Error)]
pub enum CalcError {
    #[error("Property '{0}' is not implemented by this calculator")]
    UnsupportedProperty(String),

    #[error(
        "Expect frames with ellipsoidal attributes, but frame at index {frame} is missing a required attribute '{attribute}'"
    )]
    MissingAttribute { frame: usize, attribute: String },

    #[error(
        "Attribute '{attribute}' of frame at index {frame} has shape {found:?}, expected {expected:?}"
    )]
    ShapeMismatch {
        frame: usize,
        attribute: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Attribute '{attribute}' of frame at index {frame} is invalid: {reason}")]
    InvalidAttribute {
        frame: usize,
        attribute: String,
        reason: String,
    },

    #[error("Frame at index {frame} is malformed: {reason}")]
    InvalidConfiguration { frame: usize, reason: String },

    #[error("Feature vector of length {found} cannot be reconciled with model input width {expected}")]
    FeatureWidth { expected: usize, found: usize },

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("{stage} failed: {source}")]
    Computation {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid calculator configuration: {0}")]
    Config(String),
}

impl CalcError {
    /// True for errors caused by the input frame rather than by the models.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CalcError::MissingAttribute { .. }
                | CalcError::ShapeMismatch { .. }
                | CalcError::InvalidAttribute { .. }
                | CalcError::InvalidConfiguration { .. }
                | CalcError::FeatureWidth { .. }
        )
    }

    /// Wraps a collaborator failure with the pipeline stage it came from. Errors that are
    /// already a `CalcError` (e.g. validation raised inside a descriptor) pass through
    /// unchanged.
    pub fn computation(stage: &'static str, err: anyhow::Error) -> Self {
        match err.downcast::<CalcError>() {
            Ok(inner) => inner,
            Err(other) => CalcError::Computation {
                stage,
                source: other.into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;
