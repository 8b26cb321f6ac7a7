//! The Request aggregate.
//!
//! A Request is the single versioned record the orchestrator reads and
//! writes. Every step persists its result here before the state advances,
//! so the lifecycle can be resumed from this record alone.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root aggregate for a customer service request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Assigned at creation, never changes
    pub id: Uuid,

    /// Free text submitted by the customer
    pub description: String,

    /// Documents supplied with the request, in submission order
    pub attachments: Vec<Attachment>,

    /// Field values declared by the customer (compared against OCR output)
    #[serde(default)]
    pub declared_fields: BTreeMap<String, String>,

    /// Current lifecycle state
    pub state: State,

    pub classification: Option<Classification>,

    pub verification: Option<Verification>,

    /// Back-office review history
    #[serde(default)]
    pub hitl: HitlRecord,

    pub consent_proof: Option<ConsentProof>,

    pub contract_ref: Option<ContractRef>,

    pub signature_status: Option<SignatureStatus>,

    pub payment_record: Option<PaymentRecord>,

    /// Set while an external call is outstanding
    pub in_flight: Option<InFlight>,

    /// Last permanent step failure (cleared on manual retry)
    pub failure: Option<StepFailure>,

    /// Attempt generation, bumped on every manual retry
    #[serde(default = "first_attempt")]
    pub attempt: u32,

    /// Cancellation deferred until the in-flight call is persisted
    #[serde(default)]
    pub cancel_requested: bool,

    /// Optimistic concurrency token, incremented on every persisted write
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

impl Request {
    /// Create a new request in `CREATED`
    pub fn new(
        description: String,
        attachments: Vec<Attachment>,
        declared_fields: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            description,
            attachments,
            declared_fields,
            state: State::Created,
            classification: None,
            verification: None,
            hitl: HitlRecord::default(),
            consent_proof: None,
            contract_ref: None,
            signature_status: None,
            payment_record: None,
            in_flight: None,
            failure: None,
            attempt: first_attempt(),
            cancel_requested: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether an external call is currently outstanding
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The decision recorded for the current review round, if any
    pub fn current_resolution(&self) -> Option<&HitlResolution> {
        self.hitl
            .resolutions
            .last()
            .filter(|r| r.round == self.hitl.round)
    }

    /// Check the cross-field invariants that must hold for every persisted write
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.consent_proof.is_some() {
            let verified = self
                .verification
                .as_ref()
                .map(|v| v.verdict == Verdict::Verified)
                .unwrap_or(false);
            if !verified {
                return Err("consent proof requires a VERIFIED verification".to_string());
            }
        }

        if self.contract_ref.is_some() && self.consent_proof.is_none() {
            return Err("contract reference requires a consent proof".to_string());
        }

        if self.signature_status.is_some() && self.contract_ref.is_none() {
            return Err("signature status requires a contract reference".to_string());
        }

        if let Some(ref payment) = self.payment_record {
            if payment.request_id != self.id {
                return Err("payment record belongs to another request".to_string());
            }
        }

        Ok(())
    }
}

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Created,
    Classified,
    Verifying,
    Verified,
    NeedsFixes,
    PendingHitl,
    /// Reviewer asked for more documents; accepts new attachments
    AwaitingInfo,
    ConsentPending,
    ConsentGiven,
    ContractGenerated,
    SignaturePending,
    Signed,
    PaymentPending,
    Paid,
    PaymentFailed,
    Rejected,
    /// A step failed permanently; awaits manual retry
    Failed,
}

impl State {
    pub const ALL: [State; 17] = [
        State::Created,
        State::Classified,
        State::Verifying,
        State::Verified,
        State::NeedsFixes,
        State::PendingHitl,
        State::AwaitingInfo,
        State::ConsentPending,
        State::ConsentGiven,
        State::ContractGenerated,
        State::SignaturePending,
        State::Signed,
        State::PaymentPending,
        State::Paid,
        State::PaymentFailed,
        State::Rejected,
        State::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::Classified => "CLASSIFIED",
            State::Verifying => "VERIFYING",
            State::Verified => "VERIFIED",
            State::NeedsFixes => "NEEDS_FIXES",
            State::PendingHitl => "PENDING_HITL",
            State::AwaitingInfo => "AWAITING_INFO",
            State::ConsentPending => "CONSENT_PENDING",
            State::ConsentGiven => "CONSENT_GIVEN",
            State::ContractGenerated => "CONTRACT_GENERATED",
            State::SignaturePending => "SIGNATURE_PENDING",
            State::Signed => "SIGNED",
            State::PaymentPending => "PAYMENT_PENDING",
            State::Paid => "PAID",
            State::PaymentFailed => "PAYMENT_FAILED",
            State::Rejected => "REJECTED",
            State::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == s)
    }

    /// States no transition ever leaves (`SIGNED` is final only without payment)
    pub fn is_final(&self) -> bool {
        matches!(self, State::Rejected | State::Paid | State::PaymentFailed)
    }

    /// Position along the happy path, used to check forward progress
    pub fn rank(&self) -> u8 {
        match self {
            State::Created => 0,
            State::Classified => 1,
            State::Verifying => 2,
            State::NeedsFixes => 3,
            State::PendingHitl => 4,
            State::AwaitingInfo => 5,
            State::Verified => 6,
            State::ConsentPending => 7,
            State::ConsentGiven => 8,
            State::ContractGenerated => 9,
            State::SignaturePending => 10,
            State::Signed => 11,
            State::PaymentPending => 12,
            State::Paid | State::PaymentFailed => 13,
            State::Rejected | State::Failed => 14,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document attached to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: Uuid,
    pub storage_key: String,
    pub declared_type: String,
    /// Set once by the verification step; immutable afterwards
    pub ocr_result: Option<OcrResult>,
}

impl Attachment {
    pub fn new(storage_key: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            storage_key: storage_key.into(),
            declared_type: declared_type.into(),
            ocr_result: None,
        }
    }
}

/// Key/value pairs extracted from an attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub fields: BTreeMap<String, String>,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub intent: String,
    /// In [0, 1]
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Verified,
    NeedsFixes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub verdict: Verdict,
    pub mismatches: Vec<FieldMismatch>,
    /// Set when a reviewer approved over the automated verdict
    #[serde(default)]
    pub manual_override: bool,
    pub verified_at: DateTime<Utc>,
}

/// A single field-level difference between declared and extracted values
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMismatch {
    pub field: String,
    pub declared: Option<String>,
    pub extracted: Option<String>,
    pub reason: MismatchReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchReason {
    ValueDiffers,
    MissingDeclared,
    MissingExtracted,
    VerificationUnavailable,
}

/// Review history across HITL rounds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRecord {
    /// Incremented each time the request is escalated
    pub round: u32,
    pub resolutions: Vec<HitlResolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResolution {
    pub round: u32,
    pub decision: DecisionKind,
    pub reviewer_id: String,
    pub decided_at: DateTime<Utc>,
}

/// Back-office decisions on an escalated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Approve,
    Reject,
    RequestMoreInfo,
}

/// Hash-attested record of accepted consent. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentProof {
    /// `sha256:<hex>` over consent text, request id and timestamp
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub text_version: String,
    pub source_ip: String,
    pub user_agent: String,
    pub retention_until: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRef {
    pub contract_id: String,
    pub storage_uri: String,
    pub storage_key: String,
    pub template_version: String,
    /// SHA-256 of the rendered artifact
    pub sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureState {
    Pending,
    Signed,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub status: SignatureState,
    pub envelope_id: String,
    /// Provider event that last changed the status
    pub provider_event_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// The closed set of steps that call external services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Classification,
    Verification,
    /// Publishing the escalation to the back office
    Escalation,
    Contract,
    Signature,
    Payment,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Classification => "classification",
            StepKind::Verification => "verification",
            StepKind::Escalation => "escalation",
            StepKind::Contract => "contract",
            StepKind::Signature => "signature",
            StepKind::Payment => "payment",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Marker persisted before an external call and cleared after its result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlight {
    pub step: StepKind,
    pub attempt: u32,
    pub idempotency_key: String,
    pub started_at: DateTime<Utc>,
}

/// Persisted error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    TransientService,
    StepFailed,
    ClassificationFailed,
    ConflictingState,
    ConsentDeclined,
    DuplicateConsent,
    VerificationUnavailable,
}

/// Detail kept on the request for manual remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step: StepKind,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    /// State to restore when the request is retried
    pub resume_state: State,
}
