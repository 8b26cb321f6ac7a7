//! Allowed lifecycle transitions.
//!
//! Every state change goes through [`transition`], so a write that would
//! skip a step or move backwards outside the HITL rework loop is refused
//! before it reaches the store.

use crate::domain::{Request, State};

use super::error::WorkflowError;

/// Whether `from -> to` is a legal edge
pub fn can_transition(from: State, to: State) -> bool {
    use State::*;

    matches!(
        (from, to),
        (Created, Classified)
            | (Classified, Verifying)
            | (Verifying, Verified)
            | (Verifying, NeedsFixes)
            | (NeedsFixes, PendingHitl)
            | (PendingHitl, Verified)
            | (PendingHitl, Rejected)
            | (PendingHitl, AwaitingInfo)
            // HITL rework loop
            | (AwaitingInfo, Verifying)
            | (Verified, ConsentPending)
            | (ConsentPending, ConsentGiven)
            | (ConsentGiven, ContractGenerated)
            | (ContractGenerated, SignaturePending)
            | (SignaturePending, Signed)
            | (Signed, PaymentPending)
            | (PaymentPending, Paid)
            | (PaymentPending, PaymentFailed)
            // Step failures park the request for manual retry
            | (Created, Failed)
            | (NeedsFixes, Failed)
            | (ConsentGiven, Failed)
            | (ContractGenerated, Failed)
            | (Signed, Failed)
            | (PaymentPending, Failed)
            | (Failed, Created)
            | (Failed, NeedsFixes)
            | (Failed, ConsentGiven)
            | (Failed, ContractGenerated)
            | (Failed, Signed)
            | (Failed, PaymentPending)
            // Rejection: reviewer, declined consent/signature, or cancellation
            | (Created, Rejected)
            | (Classified, Rejected)
            | (Verifying, Rejected)
            | (Verified, Rejected)
            | (NeedsFixes, Rejected)
            | (AwaitingInfo, Rejected)
            | (ConsentPending, Rejected)
            | (ConsentGiven, Rejected)
            | (ContractGenerated, Rejected)
            | (SignaturePending, Rejected)
            | (Failed, Rejected)
    )
}

/// Move `request` to `to`, refusing illegal edges
pub fn transition(request: &mut Request, to: State) -> Result<(), WorkflowError> {
    if !can_transition(request.state, to) {
        return Err(WorkflowError::ConflictingState(format!(
            "request {} cannot move from {} to {}",
            request.id, request.state, to
        )));
    }
    request.state = to;
    Ok(())
}
