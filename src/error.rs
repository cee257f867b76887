//! Error types for runnerset

use std::time::Duration;

use thiserror::Error;

use crate::cluster::ApplyError;
use crate::store::StoreError;
use crate::template::CompileError;

/// Main error type for runnerset operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid installation input; the caller must correct it
    #[error("validation error: {0}")]
    Validation(String),

    /// Template, overlay or data-value failure while compiling one instance
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// External apply/delete/list failure
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// The hosting cluster does not exist
    #[error("hosting cluster '{0}' does not exist")]
    ClusterMissing(String),

    /// Controller readiness was not observed within the budget
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error for the named wait
    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
        }
    }

    /// Create a cancellation error naming the interrupted operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled(operation.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the error is caused by caller input rather than by the
    /// cluster or an internal template defect
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Compile(e) => e.is_caller_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ApplyCause;
    use crate::template::CompileErrorKind;

    // ==========================================================================
    // Story Tests: Error Categorization During Reconcile
    // ==========================================================================

    /// Story: bad installation input is flagged as a caller problem
    #[test]
    fn story_validation_errors_are_caller_errors() {
        let err = Error::validation("installation name must not be empty");
        assert!(err.to_string().contains("validation error"));
        assert!(err.is_caller_error());

        let err = Error::from(CompileError::validation("repository must not be empty"));
        assert!(err.is_caller_error());
    }

    /// Story: template defects are internal, not the caller's fault
    #[test]
    fn story_template_defects_are_internal() {
        let err = Error::from(CompileError::new(
            CompileErrorKind::Overlay,
            "runner container missing from base",
        ));
        assert!(!err.is_caller_error());
        assert!(err.to_string().contains("runner container missing"));
    }

    /// Story: a timeout says what it waited on and for how long
    #[test]
    fn story_timeout_is_distinct_from_apply_failure() {
        let err = Error::timeout("CRD autoscalingrunnersets.actions.github.com", Duration::from_secs(2));
        assert!(err.to_string().contains("autoscalingrunnersets"));
        assert!(err.to_string().contains("2s"));
        assert!(matches!(err, Error::Timeout { .. }));

        let err = Error::from(ApplyError::new(
            "runner-controller",
            ApplyCause::Other,
            "admission webhook denied",
        ));
        assert!(matches!(err, Error::Apply(_)));
        assert!(!err.is_caller_error());
    }

    #[test]
    fn cancelled_names_operation() {
        let err = Error::cancelled("controller bootstrap");
        assert_eq!(err.to_string(), "operation cancelled: controller bootstrap");
    }
}
