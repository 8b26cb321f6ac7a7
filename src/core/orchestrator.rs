//! Main orchestrator for the request lifecycle.
//!
//! Drives each request through classification, verification, the HITL
//! gate, consent, contract generation, signature and payment. External
//! calls never run under a lock: the request is marked in flight before the
//! call and the result is persisted after it, both as compare-and-swap
//! writes on the request version.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterError, ChargeRequest, EnvelopeRequest, Services};
use crate::config::Settings;
use crate::domain::{
    Attachment, AttachmentRef, ConsentInput, ConsentProof, ContractRef, Decision, DecisionKind, Escalation,
    Event, EventType, HitlResolution, InFlight, IntakeRequest, OcrResult, PaymentRecord,
    PaymentStatus, PaymentWebhook, Request, SettlementStatus, SignatureOutcome, SignatureState,
    SignatureStatus, SignatureWebhook, State, StepFailure, StepKind, Verdict, Verification,
};

use super::consent;
use super::contract;
use super::error::WorkflowError;
use super::retry::RetryPolicy;
use super::state_machine::{can_transition, transition};
use super::store::{generate_idempotency_key, RequestStore, StoreError};
use super::verification::{self, compare_fields, decide_verdict, merge_extracted};
use super::webhook;

/// How many times a write is re-evaluated after losing a version race
const MAX_CONFLICT_RELOADS: u32 = 5;

const SIGNATURE_SOURCE: &str = "signature";
const PAYMENT_SOURCE: &str = "payment";

/// Result of applying an inbound webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Applied to the given request
    Applied(Uuid),
    /// Already applied earlier; nothing changed
    Duplicate,
}

/// Outcome of a startup recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<(Uuid, State)>,
    pub failed: Vec<(Uuid, String)>,
}

enum Progress {
    Continue,
    Park,
}

struct CallFailure {
    error: AdapterError,
    attempts: u32,
}

/// Request lifecycle orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<RequestStore>,
    services: Services,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(store: Arc<RequestStore>, services: Services, settings: Settings) -> Self {
        Self {
            store,
            services,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Persist a new request in `CREATED`. Processing starts with [`drive`].
    ///
    /// [`drive`]: Orchestrator::drive
    #[instrument(skip(self, intake))]
    pub fn submit(&self, intake: IntakeRequest) -> Result<Uuid, WorkflowError> {
        let attachments = intake.attachment_refs.into_iter().map(Attachment::from).collect();
        let mut request = Request::new(intake.description, attachments, intake.declared_fields);

        let event = Event::new(
            request.id,
            None,
            EventType::RequestCreated,
            format!("{}:created", request.id),
            format!(
                "Request created with {} attachment(s)",
                request.attachments.len()
            ),
            request.state,
        );
        self.store.insert(&mut request, &event)?;

        info!(request_id = %request.id, "Request created");
        Ok(request.id)
    }

    /// Advance a request until it waits on an external event or is final
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn drive(&self, id: Uuid) -> Result<Request, WorkflowError> {
        self.drive_inner(id, false).await
    }

    /// Drive every non-final request, taking over in-flight markers left
    /// by a crashed process. Run once at startup.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        let ids = self.store.list_active()?;
        info!(count = ids.len(), "Recovering active requests");

        let mut report = RecoveryReport::default();
        for id in ids {
            match self.drive_inner(id, true).await {
                Ok(request) => report.resumed.push((id, request.state)),
                Err(e) => {
                    warn!(request_id = %id, error = %e, "Recovery left request unfinished");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn drive_inner(&self, id: Uuid, takeover: bool) -> Result<Request, WorkflowError> {
        let mut conflicts = 0;
        let mut takeover = takeover;

        loop {
            let request = self.store.load(id)?;
            let result = self.step(request, takeover).await;
            takeover = false;

            match result {
                Ok(Progress::Continue) => conflicts = 0,
                Ok(Progress::Park) => return Ok(self.store.load(id)?),
                Err(WorkflowError::ConflictingState(reason)) if conflicts < MAX_CONFLICT_RELOADS => {
                    conflicts += 1;
                    debug!(request_id = %id, %reason, "Lost a write race, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the action for the request's current state
    async fn step(&self, request: Request, takeover: bool) -> Result<Progress, WorkflowError> {
        if request.cancel_requested && !request.is_in_flight() {
            self.finish_cancel(request)?;
            return Ok(Progress::Park);
        }

        if let Some(ref marker) = request.in_flight {
            let age = Utc::now() - marker.started_at;
            let stale = age.num_seconds() >= self.settings.workflow.stale_in_flight_seconds as i64;
            if !takeover && !stale {
                debug!(
                    request_id = %request.id,
                    step = %marker.step,
                    "Call in flight elsewhere, parking"
                );
                return Ok(Progress::Park);
            }
            info!(
                request_id = %request.id,
                step = %marker.step,
                key = %marker.idempotency_key,
                "Taking over in-flight call"
            );
        }

        match request.state {
            State::Created => self.classify(request).await,
            State::Classified => self.advance(request, State::Verifying),
            State::Verifying => self.verify(request).await,
            State::NeedsFixes => self.escalate(request).await,
            State::Verified => self.advance(request, State::ConsentPending),
            State::ConsentGiven => self.generate_contract(request).await,
            State::ContractGenerated => self.request_signature(request).await,
            State::Signed if self.settings.payment.enabled => self.start_payment(request).await,
            State::PaymentPending
                if request
                    .payment_record
                    .as_ref()
                    .map(|p| p.provider_reference.is_none())
                    .unwrap_or(false) =>
            {
                let (request, key) = self.begin_step(request, StepKind::Payment, |_| Ok(()))?;
                self.charge(request, key).await
            }
            _ => Ok(Progress::Park),
        }
    }

    /// A transition that needs no external call
    fn advance(&self, mut request: Request, to: State) -> Result<Progress, WorkflowError> {
        let from = request.state;
        transition(&mut request, to)?;

        let event = Event::new(
            request.id,
            None,
            EventType::StateChanged,
            format!("{}:{}", request.id, to.as_str().to_lowercase()),
            format!("{} -> {}", from, to),
            to,
        );
        self.store.save(&mut request, Some(&event))?;

        debug!(request_id = %request.id, %from, %to, "State advanced");
        Ok(Progress::Continue)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    async fn classify(&self, request: Request) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Classification;

        if request.description.trim().is_empty() {
            let event = Event::new(
                id,
                Some(step),
                EventType::InputRejected,
                generate_idempotency_key(id, step, request.attempt),
                "Description is empty".to_string(),
                request.state,
            )
            .with_error("description must not be empty".to_string());
            self.store.append_event(&event)?;

            warn!(request_id = %id, "Rejected empty description");
            return Err(WorkflowError::InvalidInput(
                "description must not be empty".to_string(),
            ));
        }

        let description = request.description.clone();
        let (request, key) = self.begin_step(request, step, |_| Ok(()))?;
        let started = Instant::now();

        let settings = &self.settings.classification;
        let classifier = self.services.classifier.as_ref();
        let text = description.as_str();

        let outcome = self
            .call_with_retry(
                id,
                step,
                &key,
                request.state,
                &settings.retry,
                Duration::from_secs(settings.timeout_seconds),
                move || classifier.classify(id, text),
            )
            .await;

        match outcome {
            Ok((classification, attempts)) => {
                if !settings.intents.contains(&classification.intent) {
                    let err = WorkflowError::ClassificationFailed(format!(
                        "unknown intent '{}'",
                        classification.intent
                    ));
                    self.fail_step(id, &key, step, &err, attempts)?;
                    return Err(err);
                }

                self.complete_step(id, &key, step, started, |r| {
                    r.classification = Some(classification.clone());
                    transition(r, State::Classified)?;
                    Ok(format!(
                        "Classified as {} ({:.2}) after {} attempt(s)",
                        classification.intent, classification.confidence, attempts
                    ))
                })?;
                Ok(Progress::Continue)
            }
            Err(failure) => {
                let err = WorkflowError::from_call(step, &failure.error, failure.attempts);
                self.fail_step(id, &key, step, &err, failure.attempts)?;
                Err(err)
            }
        }
    }

    /// OCR every attachment without a result, then compare. A document
    /// that cannot be read becomes a mismatch; it is never skipped.
    async fn verify(&self, request: Request) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Verification;
        let (request, key) = self.begin_step(request, step, |_| Ok(()))?;
        let started = Instant::now();

        let settings = &self.settings.verification;
        let ocr = self.services.ocr.as_ref();
        let timeout = Duration::from_secs(settings.ocr_timeout_seconds);

        let mut extracted = Vec::new();
        for attachment in request.attachments.iter().filter(|a| {
            a.ocr_result.is_none()
                && (settings.ocr_document_types.is_empty()
                    || settings.ocr_document_types.contains(&a.declared_type))
        }) {
            let outcome = self
                .call_with_retry(
                    id,
                    step,
                    &key,
                    request.state,
                    &settings.ocr_retry,
                    timeout,
                    move || ocr.extract(attachment),
                )
                .await;
            extracted.push((attachment.id, outcome.map(|(fields, _)| fields)));
        }

        let confidence = request
            .classification
            .as_ref()
            .map(|c| c.confidence)
            .unwrap_or(0.0);

        self.complete_step(id, &key, step, started, |r| {
            let now = Utc::now();
            let mut unreadable = Vec::new();

            for (attachment_id, outcome) in &extracted {
                let Some(attachment) = r.attachments.iter_mut().find(|a| a.id == *attachment_id)
                else {
                    continue;
                };
                match outcome {
                    Ok(fields) if attachment.ocr_result.is_none() => {
                        attachment.ocr_result = Some(OcrResult {
                            fields: fields.clone(),
                            extracted_at: now,
                        });
                    }
                    Ok(_) => {}
                    Err(_) => unreadable.push(verification::unavailable(&attachment.storage_key)),
                }
            }

            let mut mismatches = compare_fields(
                &settings.fields,
                &r.declared_fields,
                &merge_extracted(&r.attachments),
            );
            mismatches.extend(unreadable);
            mismatches.sort();

            let verdict = decide_verdict(confidence, settings.confidence_threshold, &mismatches);
            let summary = format!(
                "Verdict {:?}: {} mismatch(es), confidence {:.2}",
                verdict,
                mismatches.len(),
                confidence
            );

            r.verification = Some(Verification {
                verdict,
                mismatches,
                manual_override: false,
                verified_at: now,
            });
            transition(
                r,
                match verdict {
                    Verdict::Verified => State::Verified,
                    Verdict::NeedsFixes => State::NeedsFixes,
                },
            )?;
            Ok(summary)
        })?;

        Ok(Progress::Continue)
    }

    /// Publish one escalation per review round and park in `PENDING_HITL`
    async fn escalate(&self, request: Request) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Escalation;
        let (request, key) = self.begin_step(request, step, |_| Ok(()))?;
        let started = Instant::now();

        let (rationale, confidence) = request
            .classification
            .as_ref()
            .map(|c| (c.rationale.clone(), c.confidence))
            .unwrap_or_default();
        let escalation = Escalation {
            request_id: id,
            mismatches: request
                .verification
                .as_ref()
                .map(|v| v.mismatches.clone())
                .unwrap_or_default(),
            rationale,
            confidence,
            round: request.hitl.round + 1,
        };

        let settings = &self.settings.workflow;
        let channel = self.services.hitl.as_ref();
        let message = &escalation;

        let outcome = self
            .call_with_retry(
                id,
                step,
                &key,
                request.state,
                &settings.escalation_retry,
                Duration::from_secs(settings.escalation_timeout_seconds),
                move || channel.publish(message),
            )
            .await;

        match outcome {
            Ok(((), _)) => {
                let updated = self.complete_step(id, &key, step, started, |r| {
                    r.hitl.round = escalation.round;
                    transition(r, State::PendingHitl)?;
                    Ok(format!(
                        "Escalated to back office (round {}, {} mismatch(es))",
                        escalation.round,
                        escalation.mismatches.len()
                    ))
                })?;

                let event = Event::new(
                    id,
                    Some(step),
                    EventType::Escalated,
                    format!("{}:hitl:{}", id, escalation.round),
                    format!("Awaiting review round {}", escalation.round),
                    updated.state,
                );
                self.store.append_event(&event)?;

                info!(request_id = %id, round = escalation.round, "Escalated to back office");
                Ok(Progress::Park)
            }
            Err(failure) => {
                let err = WorkflowError::from_call(step, &failure.error, failure.attempts);
                self.fail_step(id, &key, step, &err, failure.attempts)?;
                Err(err)
            }
        }
    }

    /// Render and store the contract. Same request, same bytes, same key.
    async fn generate_contract(&self, request: Request) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Contract;
        let (request, key) = self.begin_step(request, step, |_| Ok(()))?;
        let started = Instant::now();

        let settings = &self.settings.contract;
        let rendered = contract::render(&request, settings);
        let storage = self.services.contracts.as_ref();
        let storage_key = rendered.storage_key.as_str();
        let bytes = rendered.bytes.as_slice();

        let outcome = self
            .call_with_retry(
                id,
                step,
                &key,
                request.state,
                &settings.retry,
                Duration::from_secs(settings.timeout_seconds),
                move || storage.put(storage_key, bytes),
            )
            .await;

        match outcome {
            Ok((uri, _)) => {
                self.complete_step(id, &key, step, started, |r| {
                    r.contract_ref = Some(ContractRef {
                        contract_id: rendered.contract_id.clone(),
                        storage_uri: uri.clone(),
                        storage_key: rendered.storage_key.clone(),
                        template_version: rendered.template_version.clone(),
                        sha256: rendered.sha256.clone(),
                    });
                    transition(r, State::ContractGenerated)?;
                    Ok(format!("Contract {} stored at {}", rendered.contract_id, uri))
                })?;
                Ok(Progress::Continue)
            }
            Err(failure) => {
                let err = WorkflowError::from_call(step, &failure.error, failure.attempts);
                self.fail_step(id, &key, step, &err, failure.attempts)?;
                Err(err)
            }
        }
    }

    async fn request_signature(&self, request: Request) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Signature;
        let contract = request.contract_ref.clone().ok_or_else(|| {
            WorkflowError::ConflictingState(format!("request {} has no contract", id))
        })?;

        let (request, key) = self.begin_step(request, step, |_| Ok(()))?;
        let started = Instant::now();

        let envelope = EnvelopeRequest {
            request_id: id,
            contract_id: contract.contract_id.clone(),
            document_uri: contract.storage_uri.clone(),
            document_sha256: contract.sha256.clone(),
            idempotency_key: key.clone(),
        };
        let settings = &self.settings.signature;
        let provider = self.services.signature.as_ref();
        let envelope = &envelope;

        let outcome = self
            .call_with_retry(
                id,
                step,
                &key,
                request.state,
                &settings.retry,
                Duration::from_secs(settings.timeout_seconds),
                move || provider.create_envelope(envelope),
            )
            .await;

        match outcome {
            Ok((envelope_id, _)) => {
                self.complete_step(id, &key, step, started, |r| {
                    r.signature_status = Some(SignatureStatus {
                        status: SignatureState::Pending,
                        envelope_id: envelope_id.clone(),
                        provider_event_id: None,
                        updated_at: Utc::now(),
                    });
                    transition(r, State::SignaturePending)?;
                    Ok(format!("Envelope {} sent for signature", envelope_id))
                })?;
                Ok(Progress::Continue)
            }
            Err(failure) => {
                let err = WorkflowError::from_call(step, &failure.error, failure.attempts);
                self.fail_step(id, &key, step, &err, failure.attempts)?;
                Err(err)
            }
        }
    }

    /// `SIGNED -> PAYMENT_PENDING` with a pending record, then charge
    async fn start_payment(&self, request: Request) -> Result<Progress, WorkflowError> {
        let amount = match self.payment_amount(&request) {
            Ok(amount) => amount,
            Err(err) => {
                self.fail_before_call(request, StepKind::Payment, &err)?;
                return Err(err);
            }
        };
        let currency = self.settings.payment.currency.clone();

        let (request, key) = self.begin_step(request, StepKind::Payment, |r| {
            if r.payment_record.is_none() {
                r.payment_record = Some(PaymentRecord {
                    id: Uuid::new_v4(),
                    request_id: r.id,
                    amount,
                    currency: currency.clone(),
                    status: PaymentStatus::Pending,
                    provider_reference: None,
                    created_at: Utc::now(),
                    settled_at: None,
                });
            }
            transition(r, State::PaymentPending)
        })?;

        self.charge(request, key).await
    }

    async fn charge(&self, request: Request, key: String) -> Result<Progress, WorkflowError> {
        let id = request.id;
        let step = StepKind::Payment;
        let started = Instant::now();

        let record = request.payment_record.clone().ok_or_else(|| {
            WorkflowError::ConflictingState(format!("request {} has no payment record", id))
        })?;
        let charge = ChargeRequest {
            request_id: id,
            amount: record.amount,
            currency: record.currency.clone(),
            idempotency_key: key.clone(),
        };

        let settings = &self.settings.payment;
        let provider = self.services.payment.as_ref();
        let charge = &charge;

        let outcome = self
            .call_with_retry(
                id,
                step,
                &key,
                request.state,
                &settings.retry,
                Duration::from_secs(settings.timeout_seconds),
                move || provider.charge(charge),
            )
            .await;

        match outcome {
            Ok((reference, _)) => {
                self.complete_step(id, &key, step, started, |r| {
                    if let Some(ref mut payment) = r.payment_record {
                        payment.provider_reference = Some(reference.clone());
                    }
                    Ok(format!(
                        "Charged {} {} as {}",
                        record.amount, record.currency, reference
                    ))
                })?;
                // Settlement arrives by webhook
                Ok(Progress::Park)
            }
            Err(failure) => {
                let err = WorkflowError::from_call(step, &failure.error, failure.attempts);
                self.fail_step(id, &key, step, &err, failure.attempts)?;
                Err(err)
            }
        }
    }

    /// Minor units from the declared `amount`, else the configured default
    fn payment_amount(&self, request: &Request) -> Result<i64, WorkflowError> {
        let amount = request
            .declared_fields
            .iter()
            .find(|(k, _)| verification::normalize_key(k) == "amount")
            .and_then(|(_, v)| verification::parse_amount(v))
            .map(|major| (major * 100.0).round() as i64)
            .unwrap_or(self.settings.payment.default_amount);

        if amount <= 0 {
            return Err(WorkflowError::InvalidInput(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        Ok(amount)
    }

    // ------------------------------------------------------------------
    // Step plumbing
    // ------------------------------------------------------------------

    /// Persist the in-flight marker before an external call. A marker left
    /// by a crashed call keeps its idempotency key.
    fn begin_step<F>(
        &self,
        mut request: Request,
        step: StepKind,
        prepare: F,
    ) -> Result<(Request, String), WorkflowError>
    where
        F: FnOnce(&mut Request) -> Result<(), WorkflowError>,
    {
        let key = match request.in_flight {
            Some(ref marker) if marker.step == step => marker.idempotency_key.clone(),
            _ => generate_idempotency_key(request.id, step, request.attempt),
        };

        prepare(&mut request)?;
        request.in_flight = Some(InFlight {
            step,
            attempt: request.attempt,
            idempotency_key: key.clone(),
            started_at: Utc::now(),
        });

        let event = Event::new(
            request.id,
            Some(step),
            EventType::StepStarted,
            key.clone(),
            format!("Step '{}' started", step),
            request.state,
        );
        self.store.save(&mut request, Some(&event))?;

        debug!(request_id = %request.id, %step, %key, "Step started");
        Ok((request, key))
    }

    /// Run an external call with a timeout, retrying transient failures
    #[allow(clippy::too_many_arguments)]
    async fn call_with_retry<T, F, Fut>(
        &self,
        request_id: Uuid,
        step: StepKind,
        key: &str,
        state: State,
        policy: &RetryPolicy,
        timeout: Duration,
        mut call: F,
    ) -> Result<(T, u32), CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();

            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Transient(format!(
                    "timed out after {:?}",
                    timeout
                ))),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    debug!(%request_id, %step, attempt, duration_ms, "Call succeeded");
                    return Ok((value, attempt));
                }
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);

                    let event = Event::new(
                        request_id,
                        Some(step),
                        EventType::StepRetrying,
                        key.to_string(),
                        format!(
                            "Step '{}' attempt {} failed, retrying in {:?}",
                            step, attempt, delay
                        ),
                        state,
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string());
                    if let Err(store_err) = self.store.append_event(&event) {
                        warn!(%request_id, error = %store_err, "Failed to record retry event");
                    }

                    warn!(
                        %request_id,
                        %step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(%request_id, %step, attempt, error = %e, "Step failed permanently");
                    return Err(CallFailure {
                        error: e,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Persist a call's result and clear the marker, provided the marker is
    /// still ours. A cancellation requested meanwhile is applied here.
    fn complete_step<F>(
        &self,
        id: Uuid,
        key: &str,
        step: StepKind,
        started: Instant,
        apply: F,
    ) -> Result<Request, WorkflowError>
    where
        F: Fn(&mut Request) -> Result<String, WorkflowError>,
    {
        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;
            ensure_marker(&request, key)?;

            let summary = apply(&mut request)?;
            request.in_flight = None;
            let cancelled = self.take_deferred_cancel(&mut request);

            let event = Event::new(
                id,
                Some(step),
                EventType::StepCompleted,
                key.to_string(),
                summary.clone(),
                request.state,
            )
            .with_duration(started.elapsed().as_millis() as u64);

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => {
                    info!(request_id = %id, %step, state = %request.state, "{}", summary);
                    if cancelled {
                        self.record_cancelled(&request)?;
                    }
                    return Ok(request);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::ConflictingState(format!(
            "gave up completing {} after repeated conflicts",
            key
        )))
    }

    /// Record a permanent step failure and park in `FAILED` for manual retry
    fn fail_step(
        &self,
        id: Uuid,
        key: &str,
        step: StepKind,
        err: &WorkflowError,
        attempts: u32,
    ) -> Result<Request, WorkflowError> {
        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;
            ensure_marker(&request, key)?;

            request.in_flight = None;
            request.failure = Some(StepFailure {
                step,
                kind: err.kind(),
                attempts,
                last_error: err.to_string(),
                failed_at: Utc::now(),
                resume_state: request.state,
            });

            let cancelled = self.take_deferred_cancel(&mut request);
            if !cancelled {
                transition(&mut request, State::Failed)?;
            }

            let event = Event::new(
                id,
                Some(step),
                EventType::StepFailed,
                key.to_string(),
                format!("Step '{}' failed after {} attempt(s)", step, attempts),
                request.state,
            )
            .with_error(err.to_string());

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => {
                    if cancelled {
                        self.record_cancelled(&request)?;
                    }
                    return Ok(request);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::ConflictingState(format!(
            "gave up failing {} after repeated conflicts",
            key
        )))
    }

    /// Park in `FAILED` when a step cannot even be attempted, so the request
    /// stops being picked up by every drive and recovery pass.
    fn fail_before_call(
        &self,
        mut request: Request,
        step: StepKind,
        err: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        let key = generate_idempotency_key(request.id, step, request.attempt);
        request.failure = Some(StepFailure {
            step,
            kind: err.kind(),
            attempts: 0,
            last_error: err.to_string(),
            failed_at: Utc::now(),
            resume_state: request.state,
        });
        transition(&mut request, State::Failed)?;

        let event = Event::new(
            request.id,
            Some(step),
            EventType::StepFailed,
            key,
            format!("Step '{}' could not start", step),
            request.state,
        )
        .with_error(err.to_string());
        self.store.save(&mut request, Some(&event))?;

        warn!(request_id = %request.id, %step, error = %err, "Step failed before any call");
        Ok(())
    }

    /// Apply a deferred cancellation if the current state allows it
    fn take_deferred_cancel(&self, request: &mut Request) -> bool {
        if !request.cancel_requested {
            return false;
        }
        request.cancel_requested = false;

        if !is_signed(request) && can_transition(request.state, State::Rejected) {
            request.state = State::Rejected;
            true
        } else {
            warn!(
                request_id = %request.id,
                state = %request.state,
                "Deferred cancellation dropped, state no longer cancellable"
            );
            false
        }
    }

    fn record_cancelled(&self, request: &Request) -> Result<(), WorkflowError> {
        let event = Event::new(
            request.id,
            None,
            EventType::Cancelled,
            format!("{}:cancel", request.id),
            "Request cancelled".to_string(),
            request.state,
        );
        self.store.append_event(&event)?;
        info!(request_id = %request.id, "Request cancelled");
        Ok(())
    }

    fn finish_cancel(&self, mut request: Request) -> Result<(), WorkflowError> {
        let cancelled = self.take_deferred_cancel(&mut request);
        self.store.save(&mut request, None)?;
        if cancelled {
            self.record_cancelled(&request)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Apply a back-office decision to a request parked in `PENDING_HITL`.
    ///
    /// A repeated decision matching the recorded one is a no-op; a
    /// different one is refused with `ConflictingDecision`.
    #[instrument(skip(self, decision), fields(request_id = %decision.request_id))]
    pub fn apply_decision(&self, decision: Decision) -> Result<Request, WorkflowError> {
        if decision.reviewer_id.trim().is_empty() {
            return Err(WorkflowError::InvalidInput("reviewerId is required".to_string()));
        }
        let id = decision.request_id;

        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;

            // Without a round a late answer to an earlier review would land on the open one
            if decision.round.is_none()
                && request.state == State::PendingHitl
                && request.hitl.round > 1
            {
                warn!(round = request.hitl.round, "Decision without round after re-escalation");
                return Err(WorkflowError::InvalidInput(format!(
                    "round is required, request {} is in review round {}",
                    id, request.hitl.round
                )));
            }

            let stale_round = decision.round.filter(|round| *round != request.hitl.round);
            if request.state != State::PendingHitl || stale_round.is_some() {
                let recorded = match stale_round {
                    Some(round) => request.hitl.resolutions.iter().rev().find(|r| r.round == round),
                    None => request.current_resolution(),
                };
                return match recorded {
                    Some(r) if r.decision == decision.decision => {
                        let event = Event::new(
                            id,
                            None,
                            EventType::DecisionDuplicate,
                            format!("{}:hitl:{}", id, r.round),
                            format!("Duplicate {:?} from {}", decision.decision, decision.reviewer_id),
                            request.state,
                        );
                        self.store.append_event(&event)?;
                        debug!("Duplicate decision ignored");
                        Ok(request)
                    }
                    Some(r) => Err(WorkflowError::ConflictingDecision {
                        request_id: id,
                        recorded: r.decision,
                        received: decision.decision,
                    }),
                    None => Err(WorkflowError::ConflictingState(format!(
                        "request {} is {}, not awaiting a decision",
                        id, request.state
                    ))),
                };
            }

            let round = request.hitl.round;
            let now = Utc::now();
            request.hitl.resolutions.push(HitlResolution {
                round,
                decision: decision.decision,
                reviewer_id: decision.reviewer_id.clone(),
                decided_at: now,
            });

            match decision.decision {
                DecisionKind::Approve => {
                    let verification = request.verification.get_or_insert_with(|| Verification {
                        verdict: Verdict::NeedsFixes,
                        mismatches: Vec::new(),
                        manual_override: false,
                        verified_at: now,
                    });
                    verification.verdict = Verdict::Verified;
                    verification.manual_override = true;
                    transition(&mut request, State::Verified)?;
                }
                DecisionKind::Reject => transition(&mut request, State::Rejected)?,
                DecisionKind::RequestMoreInfo => transition(&mut request, State::AwaitingInfo)?,
            }

            let event = Event::new(
                id,
                None,
                EventType::DecisionApplied,
                format!("{}:hitl:{}", id, round),
                format!(
                    "{:?} by {} (round {})",
                    decision.decision, decision.reviewer_id, round
                ),
                request.state,
            );

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => {
                    info!(decision = ?decision.decision, state = %request.state, "Decision applied");
                    return Ok(request);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(id))
    }

    /// Accept new documents for a request the reviewer sent back
    #[instrument(skip(self, refs, declared_updates), fields(request_id = %id))]
    pub fn add_attachments(
        &self,
        id: Uuid,
        refs: Vec<AttachmentRef>,
        declared_updates: BTreeMap<String, String>,
    ) -> Result<Request, WorkflowError> {
        if refs.is_empty() {
            return Err(WorkflowError::InvalidInput(
                "at least one attachment is required".to_string(),
            ));
        }

        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;
            if request.state != State::AwaitingInfo {
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {}, not awaiting information",
                    id, request.state
                )));
            }

            request
                .attachments
                .extend(refs.iter().cloned().map(Attachment::from));
            request.declared_fields.extend(declared_updates.clone());
            transition(&mut request, State::Verifying)?;

            let event = Event::new(
                id,
                None,
                EventType::AttachmentsAdded,
                format!("{}:attachments:{}", id, request.hitl.round),
                format!("{} attachment(s) added", refs.len()),
                request.state,
            );

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => return Ok(request),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(id))
    }

    /// Record the customer's consent decision.
    ///
    /// Accepted consent is stored exactly once as a hash-attested proof;
    /// a declined consent rejects the request without creating one.
    #[instrument(skip(self, input), fields(request_id = %id))]
    pub fn submit_consent(
        &self,
        id: Uuid,
        input: ConsentInput,
    ) -> Result<ConsentProof, WorkflowError> {
        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;

            if request.consent_proof.is_some() || self.store.consent_proof(id)?.is_some() {
                return Err(WorkflowError::DuplicateConsent(id));
            }
            if request.state != State::ConsentPending {
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {}, not awaiting consent",
                    id, request.state
                )));
            }

            if !input.accepted {
                transition(&mut request, State::Rejected)?;
                let event = Event::new(
                    id,
                    None,
                    EventType::ConsentDeclined,
                    format!("{}:consent", id),
                    format!("Consent {} declined", input.text_version),
                    request.state,
                );
                match self.store.save(&mut request, Some(&event)) {
                    Ok(()) => {
                        info!("Consent declined");
                        return Err(WorkflowError::ConsentDeclined);
                    }
                    Err(StoreError::Conflict { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let proof = consent::build_proof(&self.settings.consent, id, &input, Utc::now())?;
            request.consent_proof = Some(proof.clone());
            transition(&mut request, State::ConsentGiven)?;

            let event = Event::new(
                id,
                None,
                EventType::ConsentRecorded,
                format!("{}:consent", id),
                format!("Consent {} recorded as {}", proof.text_version, proof.hash),
                request.state,
            );

            match self.store.record_consent(&mut request, &event) {
                Ok(()) => {
                    info!(hash = %proof.hash, "Consent recorded");
                    return Ok(proof);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(id))
    }

    /// Apply an e-signature webhook, deduplicated by provider event id
    #[instrument(skip(self, hook), fields(envelope_id = %hook.envelope_id))]
    pub fn apply_signature_webhook(
        &self,
        hook: &SignatureWebhook,
    ) -> Result<WebhookOutcome, WorkflowError> {
        if !webhook::verify(
            &self.settings.signature.webhook_secret,
            &hook.canonical_payload(),
            &hook.signature,
        ) {
            warn!("Rejected signature webhook with invalid signature");
            return Err(WorkflowError::InvalidSignature);
        }
        let event_id = hook.provider_event_id();

        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self
                .store
                .find_by_envelope(&hook.envelope_id)?
                .ok_or_else(|| {
                    WorkflowError::UnknownReference(format!("envelope {}", hook.envelope_id))
                })?;
            let id = request.id;

            if self.store.has_inbound(SIGNATURE_SOURCE, &event_id)? {
                self.record_duplicate_webhook(&request, SIGNATURE_SOURCE, &event_id)?;
                return Ok(WebhookOutcome::Duplicate);
            }

            let status = match hook.status {
                SignatureOutcome::Signed => SignatureState::Signed,
                SignatureOutcome::Declined => SignatureState::Declined,
            };

            if request.state != State::SignaturePending {
                let recorded = request.signature_status.as_ref().map(|s| s.status);
                if recorded == Some(status) {
                    self.record_duplicate_webhook(&request, SIGNATURE_SOURCE, &event_id)?;
                    return Ok(WebhookOutcome::Duplicate);
                }
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {}, not awaiting a signature",
                    id, request.state
                )));
            }

            if let Some(ref mut signature) = request.signature_status {
                signature.status = status;
                signature.provider_event_id = Some(event_id.clone());
                signature.updated_at = Utc::now();
            }
            transition(
                &mut request,
                match hook.status {
                    SignatureOutcome::Signed => State::Signed,
                    SignatureOutcome::Declined => State::Rejected,
                },
            )?;

            let event = Event::new(
                id,
                Some(StepKind::Signature),
                EventType::WebhookApplied,
                format!("{}:{}", SIGNATURE_SOURCE, event_id),
                format!("Envelope {} {}", hook.envelope_id, hook.status.as_str()),
                request.state,
            );

            match self
                .store
                .save_with_inbound(&mut request, SIGNATURE_SOURCE, &event_id, &event)
            {
                Ok(()) => {
                    info!(request_id = %id, state = %request.state, "Signature webhook applied");
                    return Ok(WebhookOutcome::Applied(id));
                }
                Err(StoreError::DuplicateInbound { .. }) => return Ok(WebhookOutcome::Duplicate),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::ConflictingState(format!(
            "gave up applying signature event {} after repeated conflicts",
            event_id
        )))
    }

    /// Apply a payment settlement webhook, deduplicated by provider reference
    #[instrument(skip(self, hook), fields(provider_reference = %hook.provider_reference))]
    pub fn apply_payment_webhook(
        &self,
        hook: &PaymentWebhook,
    ) -> Result<WebhookOutcome, WorkflowError> {
        let secret = self
            .settings
            .payment
            .webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty());
        if let Some(secret) = secret {
            let valid = hook
                .signature
                .as_deref()
                .map(|sig| webhook::verify(secret, &hook.canonical_payload(), sig))
                .unwrap_or(false);
            if !valid {
                warn!("Rejected payment webhook with invalid signature");
                return Err(WorkflowError::InvalidSignature);
            }
        }
        let reference = hook.provider_reference.as_str();

        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self
                .store
                .find_by_provider_reference(reference)?
                .ok_or_else(|| WorkflowError::UnknownReference(format!("payment {}", reference)))?;
            let id = request.id;

            let status = match hook.status {
                SettlementStatus::Paid => PaymentStatus::Paid,
                SettlementStatus::Failed => PaymentStatus::Failed,
            };

            if request.state != State::PaymentPending {
                let recorded = request.payment_record.as_ref().map(|p| p.status);
                if recorded == Some(status) {
                    self.record_duplicate_webhook(&request, PAYMENT_SOURCE, reference)?;
                    return Ok(WebhookOutcome::Duplicate);
                }
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {}, not awaiting settlement",
                    id, request.state
                )));
            }

            if let Some(ref mut payment) = request.payment_record {
                payment.status = status;
                payment.settled_at = Some(Utc::now());
            }
            transition(
                &mut request,
                match hook.status {
                    SettlementStatus::Paid => State::Paid,
                    SettlementStatus::Failed => State::PaymentFailed,
                },
            )?;

            let event = Event::new(
                id,
                Some(StepKind::Payment),
                EventType::WebhookApplied,
                format!("{}:{}", PAYMENT_SOURCE, reference),
                format!("Payment {} {}", reference, hook.status.as_str()),
                request.state,
            );

            match self
                .store
                .save_with_inbound(&mut request, PAYMENT_SOURCE, reference, &event)
            {
                Ok(()) => {
                    info!(request_id = %id, state = %request.state, "Payment webhook applied");
                    return Ok(WebhookOutcome::Applied(id));
                }
                Err(StoreError::DuplicateInbound { .. }) => return Ok(WebhookOutcome::Duplicate),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkflowError::ConflictingState(format!(
            "gave up applying payment event {} after repeated conflicts",
            reference
        )))
    }

    fn record_duplicate_webhook(
        &self,
        request: &Request,
        source: &str,
        event_id: &str,
    ) -> Result<(), WorkflowError> {
        let event = Event::new(
            request.id,
            None,
            EventType::WebhookDuplicate,
            format!("{}:{}", source, event_id),
            format!("Duplicate {} event ignored", source),
            request.state,
        );
        self.store.append_event(&event)?;
        debug!(request_id = %request.id, source, event_id, "Duplicate webhook ignored");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    /// Cancel a request. While a call is in flight the cancellation is
    /// deferred until its result is persisted.
    #[instrument(skip(self), fields(request_id = %id))]
    pub fn cancel(&self, id: Uuid) -> Result<Request, WorkflowError> {
        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;

            if request.state.is_final() || is_signed(&request) {
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {} and can no longer be cancelled",
                    id, request.state
                )));
            }
            if request.cancel_requested {
                return Ok(request);
            }

            let (event_type, summary) = if request.is_in_flight() {
                request.cancel_requested = true;
                (EventType::CancelRequested, "Cancellation deferred until the in-flight call completes")
            } else {
                transition(&mut request, State::Rejected)?;
                (EventType::Cancelled, "Request cancelled")
            };

            let event = Event::new(
                id,
                None,
                event_type,
                format!("{}:cancel", id),
                summary.to_string(),
                request.state,
            );

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => {
                    info!(state = %request.state, deferred = request.cancel_requested, "{}", summary);
                    return Ok(request);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(id))
    }

    /// Manual retry of a failed step: restores the pre-failure state under
    /// a new attempt generation (and therefore new idempotency keys).
    #[instrument(skip(self), fields(request_id = %id))]
    pub fn retry(&self, id: Uuid) -> Result<Request, WorkflowError> {
        for _ in 0..MAX_CONFLICT_RELOADS {
            let mut request = self.store.load(id)?;

            if request.state != State::Failed {
                return Err(WorkflowError::ConflictingState(format!(
                    "request {} is {}, only FAILED requests can be retried",
                    id, request.state
                )));
            }
            let failure = request.failure.take().ok_or_else(|| {
                WorkflowError::ConflictingState(format!("request {} has no failure record", id))
            })?;

            request.attempt += 1;
            transition(&mut request, failure.resume_state)?;

            let event = Event::new(
                id,
                Some(failure.step),
                EventType::RetryRequested,
                generate_idempotency_key(id, failure.step, request.attempt),
                format!(
                    "Retrying {} as attempt {} (last error: {})",
                    failure.step, request.attempt, failure.last_error
                ),
                request.state,
            );

            match self.store.save(&mut request, Some(&event)) {
                Ok(()) => {
                    info!(attempt = request.attempt, state = %request.state, "Retry requested");
                    return Ok(request);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(conflict_exhausted(id))
    }

    /// Current request plus its audit log
    pub fn status(&self, id: Uuid) -> Result<(Request, Vec<Event>), WorkflowError> {
        let request = self.store.load(id)?;
        let events = self.store.events(id)?;
        Ok((request, events))
    }

    pub fn list(&self, limit: usize) -> Result<Vec<Request>, WorkflowError> {
        Ok(self.store.list(limit)?)
    }
}

fn ensure_marker(request: &Request, key: &str) -> Result<(), WorkflowError> {
    let owned = request
        .in_flight
        .as_ref()
        .map(|m| m.idempotency_key == key)
        .unwrap_or(false);
    if owned {
        Ok(())
    } else {
        Err(WorkflowError::ConflictingState(format!(
            "request {} no longer holds in-flight marker {}",
            request.id, key
        )))
    }
}

/// A signed contract binds the request; nothing may reject it afterwards,
/// including a cancel while a post-signature step sits in `FAILED`.
fn is_signed(request: &Request) -> bool {
    let signed_state = |state: State| matches!(state, State::Signed | State::PaymentPending);

    signed_state(request.state)
        || request
            .signature_status
            .as_ref()
            .map(|s| s.status == SignatureState::Signed)
            .unwrap_or(false)
        || request
            .failure
            .as_ref()
            .map(|f| signed_state(f.resume_state))
            .unwrap_or(false)
}

fn conflict_exhausted(id: Uuid) -> WorkflowError {
    WorkflowError::ConflictingState(format!(
        "request {} kept changing, gave up after {} reloads",
        id, MAX_CONFLICT_RELOADS
    ))
}
