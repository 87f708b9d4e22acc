//! Error taxonomy for model construction and forward passes.
//!
//! Construction problems are reported eagerly as [`ModelError::Config`]; a
//! model is never left half-built. Forward-time shape mismatches become
//! [`ModelError::Shape`] and fail the call without touching any parameter
//! state. Out-of-range pyramid requests are [`ModelError::Selection`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("feature selection out of range: index {index} but only {available} {granularity} outputs exist")]
    Selection {
        index: usize,
        available: usize,
        granularity: &'static str,
    },
}

impl ModelError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Shape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<ModelError> for candle_core::Error {
    fn from(err: ModelError) -> Self {
        candle_core::Error::wrap(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_expected_and_actual() {
        let err = ModelError::shape("patch_embed input", "3 channels", "1 channels");
        let msg = err.to_string();
        assert!(msg.contains("expected 3 channels"));
        assert!(msg.contains("got 1 channels"));
    }

    #[test]
    fn selection_error_names_the_range() {
        let err = ModelError::Selection { index: 7, available: 4, granularity: "stage" };
        assert!(err.to_string().contains("index 7"));
        assert!(err.to_string().contains("only 4 stage"));
    }
}
