//! Message schemas exchanged with clients and external collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::{Attachment, DecisionKind, FieldMismatch};

/// Body of `POST /request`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRequest {
    pub description: String,
    #[serde(default)]
    pub attachment_refs: Vec<AttachmentRef>,
    #[serde(default)]
    pub declared_fields: BTreeMap<String, String>,
}

/// Reference to an already uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub storage_key: String,
    #[serde(default = "default_declared_type")]
    pub declared_type: String,
}

fn default_declared_type() -> String {
    "document".to_string()
}

impl From<AttachmentRef> for Attachment {
    fn from(r: AttachmentRef) -> Self {
        let mut attachment = Attachment::new(r.storage_key, r.declared_type);
        if let Some(id) = r.id {
            attachment.id = id;
        }
        attachment
    }
}

/// Published to the HITL channel when verification yields `NEEDS_FIXES`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub request_id: Uuid,
    pub mismatches: Vec<FieldMismatch>,
    pub rationale: String,
    pub confidence: f64,
    /// Review round this escalation opens
    pub round: u32,
}

/// Consumed from the HITL channel to resume a parked request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub request_id: Uuid,
    pub decision: DecisionKind,
    pub reviewer_id: String,
    /// Review round the decision answers; decisions for an older round are refused
    #[serde(default)]
    pub round: Option<u32>,
}

/// Consent as captured by the consent endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentInput {
    pub accepted: bool,
    pub text_version: String,
    pub source_ip: String,
    pub user_agent: String,
}

/// Outcome reported by the e-signature provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureOutcome {
    Signed,
    Declined,
}

impl SignatureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureOutcome::Signed => "SIGNED",
            SignatureOutcome::Declined => "DECLINED",
        }
    }
}

/// Inbound e-signature webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureWebhook {
    pub envelope_id: String,
    pub status: SignatureOutcome,
    /// Provider event id; defaults to `{envelopeId}:{status}`
    #[serde(default)]
    pub event_id: Option<String>,
    /// Hex HMAC-SHA256 of the canonical payload
    pub signature: String,
}

impl SignatureWebhook {
    pub fn provider_event_id(&self) -> String {
        self.event_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.envelope_id, self.status.as_str()))
    }

    /// Bytes covered by the webhook signature
    pub fn canonical_payload(&self) -> String {
        format!(
            "{}|{}|{}",
            self.provider_event_id(),
            self.envelope_id,
            self.status.as_str()
        )
    }
}

/// Settlement status reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Paid,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Paid => "PAID",
            SettlementStatus::Failed => "FAILED",
        }
    }
}

/// Inbound payment webhook, deduplicated by provider reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhook {
    pub provider_reference: String,
    pub status: SettlementStatus,
    #[serde(default)]
    pub signature: Option<String>,
}

impl PaymentWebhook {
    pub fn canonical_payload(&self) -> String {
        format!("{}|{}", self.provider_reference, self.status.as_str())
    }
}
