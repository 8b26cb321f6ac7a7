//! contractflow - Durable request lifecycle orchestrator
//!
//! Takes a customer service request from intake through classification,
//! document verification, back-office review, consent, contract
//! generation, e-signature and optional payment.
//!
//! # Architecture
//!
//! The system is built around a single versioned record per request:
//! - Every write is a compare-and-swap on the request version
//! - External calls carry idempotency keys and are marked in flight first
//! - Every transition is appended to an audit log
//! - Webhooks and decisions are applied idempotently by provider event id
//!
//! # Modules
//!
//! - `adapters`: External service integrations (classifier, OCR, HITL, storage, signature, payment)
//! - `core`: Orchestration logic (RequestStore, state machine, Orchestrator)
//! - `domain`: Data structures (Request, Event, messages)
//! - `api`: HTTP surface
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve the API
//! contractflow serve --bind 127.0.0.1:8080
//!
//! # Submit a request from the command line
//! contractflow submit "Please switch my tariff" -a uploads/bill.pdf:invoice -f customer_id=C12345
//!
//! # Approve an escalated request
//! contractflow decide <request-id> approve --reviewer bo-7
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, RequestStore, WorkflowError};
pub use domain::{Event, EventType, Request, State};
