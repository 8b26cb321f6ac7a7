//! Domain types for the contractflow orchestrator.
//!
//! This module contains the core data structures:
//! - Request: the versioned aggregate and its sub-records
//! - Events: Immutable audit records of state changes
//! - Messages: wire schemas for intake, HITL and webhooks

pub mod events;
pub mod messages;
pub mod request;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use messages::{
    AttachmentRef, ConsentInput, Decision, Escalation, IntakeRequest, PaymentWebhook,
    SettlementStatus, SignatureOutcome, SignatureWebhook,
};
pub use request::{
    Attachment, Classification, ConsentProof, ContractRef, DecisionKind, ErrorKind,
    FieldMismatch, HitlRecord, HitlResolution, InFlight, MismatchReason, OcrResult,
    PaymentRecord, PaymentStatus, Request, SignatureState, SignatureStatus, State, StepFailure,
    StepKind, Verdict, Verification,
};
