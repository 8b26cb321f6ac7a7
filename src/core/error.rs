//! Error taxonomy for the request lifecycle.

use thiserror::Error;
use uuid::Uuid;

use crate::adapters::AdapterError;
use crate::domain::{DecisionKind, ErrorKind, StepKind};

use super::store::StoreError;

/// Errors surfaced by orchestrator operations
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Client error, never retried
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transient service error in {step}: {message}")]
    TransientService { step: StepKind, message: String },

    #[error("Step {step} failed after {attempts} attempts: {last_error}")]
    StepFailed {
        step: StepKind,
        attempts: u32,
        last_error: String,
    },

    #[error("Classification failed: {0}")]
    ClassificationFailed(String),

    /// Optimistic-lock loss or out-of-order event; reload and re-evaluate
    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    #[error("Conflicting decision for {request_id}: recorded {recorded:?}, received {received:?}")]
    ConflictingDecision {
        request_id: Uuid,
        recorded: DecisionKind,
        received: DecisionKind,
    },

    #[error("Consent declined")]
    ConsentDeclined,

    #[error("Consent already recorded for request {0}")]
    DuplicateConsent(Uuid),

    #[error("Verification unavailable: {0}")]
    VerificationUnavailable(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Request not found: {0}")]
    NotFound(Uuid),

    #[error("No request matches {0}")]
    UnknownReference(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl WorkflowError {
    /// Category persisted on failure records
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::InvalidInput(_) => ErrorKind::InvalidInput,
            WorkflowError::TransientService { .. } => ErrorKind::TransientService,
            WorkflowError::StepFailed { .. } => ErrorKind::StepFailed,
            WorkflowError::ClassificationFailed(_) => ErrorKind::ClassificationFailed,
            WorkflowError::ConflictingState(_) | WorkflowError::ConflictingDecision { .. } => {
                ErrorKind::ConflictingState
            }
            WorkflowError::ConsentDeclined => ErrorKind::ConsentDeclined,
            WorkflowError::DuplicateConsent(_) => ErrorKind::DuplicateConsent,
            WorkflowError::VerificationUnavailable(_) => ErrorKind::VerificationUnavailable,
            WorkflowError::InvalidSignature
            | WorkflowError::NotFound(_)
            | WorkflowError::UnknownReference(_) => ErrorKind::InvalidInput,
            WorkflowError::Store(_) => ErrorKind::StepFailed,
        }
    }

    /// Whether the failure came from an external step (vs. the caller or the store)
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::StepFailed { .. }
                | WorkflowError::ClassificationFailed(_)
                | WorkflowError::TransientService { .. }
        )
    }

    /// Map an exhausted external call into the error reported to the caller
    pub fn from_call(step: StepKind, error: &AdapterError, attempts: u32) -> Self {
        match (step, error) {
            (StepKind::Classification, AdapterError::Fatal(message)) => {
                WorkflowError::ClassificationFailed(message.clone())
            }
            _ => WorkflowError::StepFailed {
                step,
                attempts,
                last_error: error.to_string(),
            },
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => WorkflowError::NotFound(id),
            StoreError::Conflict { id, expected, actual } => WorkflowError::ConflictingState(
                format!("request {id} changed concurrently (expected version {expected}, found {actual})"),
            ),
            StoreError::DuplicateConsent(id) => WorkflowError::DuplicateConsent(id),
            other => WorkflowError::Store(other),
        }
    }
}
