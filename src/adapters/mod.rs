//! Adapter interfaces for external systems.
//!
//! Every external collaborator (classifier, OCR, back-office channel,
//! contract storage, e-signature and payment providers) sits behind a
//! trait so the orchestrator can be driven against fakes in tests.

pub mod classifier;
pub mod hitl;
pub mod http;
pub mod ocr;
pub mod payment;
pub mod signature;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{PaymentProviderKind, ResolvedConfig};
use crate::domain::{Attachment, Classification, Escalation};

pub use classifier::HttpClassifier;
pub use hitl::OutboxChannel;
pub use ocr::HttpOcr;
pub use payment::{HttpPaymentProvider, MockPaymentProvider};
pub use signature::HttpSignatureProvider;
pub use storage::FsContractStorage;

/// Failure of a single external call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Worth retrying: timeouts, connection errors, 5xx, 408, 429
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help: other 4xx, malformed responses
    #[error("fatal: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            AdapterError::Transient(message)
        } else {
            AdapterError::Fatal(message)
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::Fatal(format!("invalid response: {}", err))
        } else if let Some(status) = err.status() {
            AdapterError::from_status(status, &err.to_string())
        } else {
            // Timeouts, connect and request errors
            AdapterError::Transient(err.to_string())
        }
    }
}

/// Intent classification
#[async_trait]
pub trait ClassificationService: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, request_id: Uuid, description: &str)
        -> Result<Classification, AdapterError>;
}

/// Field extraction from a stored document
#[async_trait]
pub trait OcrService: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, attachment: &Attachment)
        -> Result<BTreeMap<String, String>, AdapterError>;
}

/// Back-office channel receiving escalations (at-least-once)
#[async_trait]
pub trait HitlChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, escalation: &Escalation) -> Result<(), AdapterError>;
}

/// Durable blob storage for rendered contracts
#[async_trait]
pub trait ContractStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Store `bytes` under `key`, returning the artifact URI. Writing the
    /// same bytes to the same key again must succeed.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, AdapterError>;
}

/// Envelope creation request sent to the e-signature provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeRequest {
    pub request_id: Uuid,
    pub contract_id: String,
    pub document_uri: String,
    pub document_sha256: String,
    pub idempotency_key: String,
}

#[async_trait]
pub trait SignatureProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the provider's envelope id
    async fn create_envelope(&self, envelope: &EnvelopeRequest) -> Result<String, AdapterError>;
}

/// Charge request sent to the payment provider (amount in minor units)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub request_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the provider reference that settlement webhooks will carry
    async fn charge(&self, charge: &ChargeRequest) -> Result<String, AdapterError>;
}

/// The full set of collaborators the orchestrator talks to
#[derive(Clone)]
pub struct Services {
    pub classifier: Arc<dyn ClassificationService>,
    pub ocr: Arc<dyn OcrService>,
    pub hitl: Arc<dyn HitlChannel>,
    pub contracts: Arc<dyn ContractStorage>,
    pub signature: Arc<dyn SignatureProvider>,
    pub payment: Arc<dyn PaymentProvider>,
}

impl Services {
    /// Wire the HTTP and filesystem adapters from configuration
    pub fn from_config(config: &ResolvedConfig) -> anyhow::Result<Self> {
        let settings = &config.settings;

        let payment: Arc<dyn PaymentProvider> = match settings.payment.provider {
            PaymentProviderKind::Http => Arc::new(HttpPaymentProvider::new(
                &settings.payment.url,
                Duration::from_secs(settings.payment.timeout_seconds),
            )?),
            PaymentProviderKind::Mock => Arc::new(MockPaymentProvider),
        };

        Ok(Self {
            classifier: Arc::new(HttpClassifier::new(
                &settings.classification.url,
                Duration::from_secs(settings.classification.timeout_seconds),
            )?),
            ocr: Arc::new(HttpOcr::new(
                &settings.verification.ocr_url,
                Duration::from_secs(settings.verification.ocr_timeout_seconds),
            )?),
            hitl: Arc::new(OutboxChannel::new(config.hitl_outbox_path())),
            contracts: Arc::new(FsContractStorage::new(config.contracts_dir())),
            signature: Arc::new(HttpSignatureProvider::new(
                &settings.signature.url,
                Duration::from_secs(settings.signature.timeout_seconds),
            )?),
            payment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(AdapterError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(AdapterError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(AdapterError::from_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(!AdapterError::from_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!AdapterError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_transient());
    }

    #[test]
    fn test_status_message_includes_body() {
        let err = AdapterError::from_status(StatusCode::BAD_GATEWAY, " upstream down \n");
        assert_eq!(err, AdapterError::Transient("HTTP 502: upstream down".to_string()));
    }
}
