//! Core orchestration logic.
//!
//! This module contains:
//! - RequestStore: versioned request records plus the audit log
//! - StateMachine: the legal lifecycle edges
//! - Verification, consent, contract and webhook rules
//! - Orchestrator: Main execution engine

pub mod consent;
pub mod contract;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod verification;
pub mod webhook;

// Re-export commonly used types
pub use error::WorkflowError;
pub use orchestrator::{Orchestrator, RecoveryReport, WebhookOutcome};
pub use retry::RetryPolicy;
pub use state_machine::{can_transition, transition};
pub use store::{generate_idempotency_key, hash_input, RequestStore, StoreError};
