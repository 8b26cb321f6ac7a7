//! Lifecycle Integration Tests
//!
//! Drives requests end to end against in-memory fakes: the happy path,
//! input rejection, transient and permanent step failures, manual retry,
//! and resuming after a crash.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use contractflow::adapters::AdapterError;
use contractflow::core::{generate_idempotency_key, WorkflowError};
use contractflow::domain::{
    ErrorKind, EventType, InFlight, SignatureOutcome, State, StepKind, Verdict,
};

use common::{classification, consent, signature_webhook, Harness};

#[tokio::test]
async fn test_happy_path_without_payment() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let (request, _) = h.orchestrator.status(id).unwrap();
    let verification = request.verification.as_ref().unwrap();
    assert_eq!(verification.verdict, Verdict::Verified);
    assert!(verification.mismatches.is_empty());
    assert!(!verification.manual_override);
    assert!(h.hitl.published().is_empty(), "no escalation on a clean request");

    let proof = h.orchestrator.submit_consent(id, consent(true)).unwrap();
    assert!(proof.hash.starts_with("sha256:"));

    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::SignaturePending);

    let contract = request.contract_ref.as_ref().unwrap();
    assert!(contract.contract_id.starts_with("CTR-"));
    assert_eq!(
        contract.storage_key,
        format!("contracts/{}/v1.txt", id)
    );
    assert!(h.storage.get(&contract.storage_key).is_some());

    let expected_key = generate_idempotency_key(id, StepKind::Signature, 1);
    assert_eq!(h.signature.keys(), vec![expected_key.clone()]);

    let envelope_id = request.signature_status.unwrap().envelope_id;
    let hook = signature_webhook(&envelope_id, SignatureOutcome::Signed, Some("evt-1"));
    h.orchestrator.apply_signature_webhook(&hook).unwrap();

    // Payment disabled: SIGNED is final
    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::Signed);
    assert!(request.payment_record.is_none());
    assert!(request.in_flight.is_none());
    assert!(h.payment.charges().is_empty());
}

#[tokio::test]
async fn test_state_never_regresses_on_happy_path() {
    let h = Harness::new();
    let (id, _) = h.until_signature().await;

    let (_, events) = h.orchestrator.status(id).unwrap();
    let ranks: Vec<u8> = events.iter().map(|e| e.state.rank()).collect();
    for pair in ranks.windows(2) {
        assert!(pair[0] <= pair[1], "state regressed: {:?}", ranks);
    }
}

#[tokio::test]
async fn test_empty_description_is_rejected_without_state_change() {
    let h = Harness::new();
    let id = h.submit("   ", &[]);

    let err = h.orchestrator.drive(id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidInput(_)));

    let (request, events) = h.orchestrator.status(id).unwrap();
    assert_eq!(request.state, State::Created);
    assert!(request.in_flight.is_none());
    assert_eq!(h.classifier.calls(), 0);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::InputRejected));
}

#[tokio::test]
async fn test_transient_classification_errors_are_retried() {
    let h = Harness::new();
    h.classifier
        .push(Err(AdapterError::Transient("HTTP 503: busy".to_string())));
    h.classifier
        .push(Err(AdapterError::Transient("timed out".to_string())));

    let id = h.submit("Please terminate my contract", &[]);
    let request = h.orchestrator.drive(id).await.unwrap();

    assert_eq!(request.state, State::ConsentPending);
    assert_eq!(h.classifier.calls(), 3);

    let (_, events) = h.orchestrator.status(id).unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == EventType::StepRetrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_exhausted_retries_park_request_in_failed() {
    let h = Harness::new();
    for _ in 0..3 {
        h.classifier
            .push(Err(AdapterError::Transient("HTTP 502".to_string())));
    }

    let id = h.submit("Please terminate my contract", &[]);
    let err = h.orchestrator.drive(id).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::StepFailed {
            step: StepKind::Classification,
            attempts: 3,
            ..
        }
    ));

    let (request, events) = h.orchestrator.status(id).unwrap();
    assert_eq!(request.state, State::Failed);
    assert!(request.in_flight.is_none());

    let failure = request.failure.unwrap();
    assert_eq!(failure.step, StepKind::Classification);
    assert_eq!(failure.kind, ErrorKind::StepFailed);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.resume_state, State::Created);
    assert!(events.iter().any(|e| e.event_type == EventType::StepFailed));
}

#[tokio::test]
async fn test_manual_retry_uses_new_attempt_generation() {
    let h = Harness::new();
    for _ in 0..3 {
        h.classifier
            .push(Err(AdapterError::Transient("HTTP 502".to_string())));
    }

    let id = h.submit("Please terminate my contract", &[]);
    h.orchestrator.drive(id).await.unwrap_err();

    let request = h.orchestrator.retry(id).unwrap();
    assert_eq!(request.state, State::Created);
    assert_eq!(request.attempt, 2);
    assert!(request.failure.is_none());

    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::ConsentPending);

    let (_, events) = h.orchestrator.status(id).unwrap();
    let second_key = generate_idempotency_key(id, StepKind::Classification, 2);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepCompleted && e.idempotency_key == second_key));
}

#[tokio::test]
async fn test_retry_only_from_failed() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let err = h.orchestrator.retry(id).unwrap_err();
    assert!(matches!(err, WorkflowError::ConflictingState(_)));
}

#[tokio::test]
async fn test_fatal_classification_error_is_not_retried() {
    let h = Harness::new();
    h.classifier
        .push(Err(AdapterError::Fatal("HTTP 400: bad request".to_string())));

    let id = h.submit("Hello", &[]);
    let err = h.orchestrator.drive(id).await.unwrap_err();

    assert!(matches!(err, WorkflowError::ClassificationFailed(_)));
    assert_eq!(h.classifier.calls(), 1);

    let (request, _) = h.orchestrator.status(id).unwrap();
    assert_eq!(request.state, State::Failed);
    assert_eq!(
        request.failure.unwrap().kind,
        ErrorKind::ClassificationFailed
    );
}

#[tokio::test]
async fn test_unknown_intent_fails_classification() {
    let h = Harness::new();
    h.classifier.push(Ok(classification("ORDER_PIZZA", 0.99)));

    let id = h.submit("One margherita please", &[]);
    let err = h.orchestrator.drive(id).await.unwrap_err();

    assert!(matches!(err, WorkflowError::ClassificationFailed(_)));
    let (request, _) = h.orchestrator.status(id).unwrap();
    assert_eq!(request.state, State::Failed);
    assert!(request.classification.is_none());
}

#[tokio::test]
async fn test_contract_failure_resumes_from_consent_given() {
    let h = Harness::new();
    let id = h.until_consent().await;
    h.orchestrator.submit_consent(id, consent(true)).unwrap();

    h.storage
        .fail_next(AdapterError::Fatal("bucket missing".to_string()));
    let err = h.orchestrator.drive(id).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::StepFailed {
            step: StepKind::Contract,
            ..
        }
    ));

    let (request, _) = h.orchestrator.status(id).unwrap();
    assert_eq!(request.state, State::Failed);
    assert_eq!(request.failure.as_ref().unwrap().resume_state, State::ConsentGiven);
    assert!(request.contract_ref.is_none());
    // Consent survives the failure
    assert!(request.consent_proof.is_some());

    h.orchestrator.retry(id).unwrap();
    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::SignaturePending);
    assert_eq!(h.storage.len(), 1);
}

#[tokio::test]
async fn test_stale_in_flight_marker_is_taken_over_with_same_key() {
    let h = Harness::new();
    let id = h.until_consent().await;
    h.orchestrator.submit_consent(id, consent(true)).unwrap();

    // Simulate a crash after the contract upload was marked in flight
    let mut request = h.store.load(id).unwrap();
    let contract_key = generate_idempotency_key(id, StepKind::Contract, 1);
    request.in_flight = Some(InFlight {
        step: StepKind::Contract,
        attempt: 1,
        idempotency_key: contract_key.clone(),
        started_at: Utc::now() - ChronoDuration::minutes(10),
    });
    h.store.save(&mut request, None).unwrap();

    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::SignaturePending);
    assert_eq!(h.storage.len(), 1);

    let (_, events) = h.orchestrator.status(id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepCompleted && e.idempotency_key == contract_key));
}

#[tokio::test]
async fn test_fresh_in_flight_marker_parks_until_recovery() {
    let h = Harness::new();
    let id = h.until_consent().await;
    h.orchestrator.submit_consent(id, consent(true)).unwrap();

    let mut request = h.store.load(id).unwrap();
    request.in_flight = Some(InFlight {
        step: StepKind::Contract,
        attempt: 1,
        idempotency_key: generate_idempotency_key(id, StepKind::Contract, 1),
        started_at: Utc::now(),
    });
    h.store.save(&mut request, None).unwrap();

    // Another driver owns the call
    let request = h.orchestrator.drive(id).await.unwrap();
    assert_eq!(request.state, State::ConsentGiven);
    assert_eq!(h.storage.puts.load(std::sync::atomic::Ordering::SeqCst), 0);

    // After a restart nobody else is driving: recovery takes the marker over
    let report = h.orchestrator.recover().await.unwrap();
    assert!(report.failed.is_empty());
    assert!(report
        .resumed
        .iter()
        .any(|(rid, state)| *rid == id && *state == State::SignaturePending));
}

#[tokio::test]
async fn test_drive_is_a_no_op_when_waiting() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let before = h.store.load(id).unwrap();
    let after = h.orchestrator.drive(id).await.unwrap();

    assert_eq!(after.state, State::ConsentPending);
    assert_eq!(after.version, before.version);
    assert_eq!(h.classifier.calls(), 1);
}

#[tokio::test]
async fn test_drive_unknown_request() {
    let h = Harness::new();
    let err = h.orchestrator.drive(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}
