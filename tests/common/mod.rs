//! Shared fakes for the integration tests.
//!
//! Each fake records its calls so tests can assert on how often, and with
//! which idempotency keys, the orchestrator reached out.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use contractflow::adapters::{
    AdapterError, ChargeRequest, ClassificationService, ContractStorage, EnvelopeRequest,
    HitlChannel, OcrService, PaymentProvider, Services, SignatureProvider,
};
use contractflow::config::Settings;
use contractflow::core::{webhook, Orchestrator, RequestStore, RetryPolicy};
use contractflow::domain::{
    Attachment, AttachmentRef, Classification, ConsentInput, Escalation, IntakeRequest,
    SignatureOutcome, SignatureWebhook, State,
};

pub const SIGNATURE_SECRET: &str = "test-signature-secret";

pub struct FakeClassifier {
    script: Mutex<VecDeque<Result<Classification, AdapterError>>>,
    fallback: Mutex<Classification>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl FakeClassifier {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(classification("OFFER_CHANGE", 0.92)),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every call not covered by `push` with this classification
    pub fn answer(&self, intent: &str, confidence: f64) {
        *self.fallback.lock().unwrap() = classification(intent, confidence);
    }

    /// Queue a one-off result, consumed in order before the fallback
    pub fn push(&self, result: Result<Classification, AdapterError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassificationService for FakeClassifier {
    fn name(&self) -> &str {
        "fake-classifier"
    }

    async fn classify(
        &self,
        _request_id: Uuid,
        _description: &str,
    ) -> Result<Classification, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}

pub fn classification(intent: &str, confidence: f64) -> Classification {
    Classification {
        intent: intent.to_string(),
        confidence,
        rationale: format!("looks like {}", intent.to_lowercase()),
    }
}

/// OCR keyed by storage key; unknown keys extract nothing
#[derive(Default)]
pub struct FakeOcr {
    documents: Mutex<HashMap<String, Result<BTreeMap<String, String>, AdapterError>>>,
    pub calls: AtomicUsize,
}

impl FakeOcr {
    pub fn document(&self, storage_key: &str, fields: &[(&str, &str)]) {
        self.documents
            .lock()
            .unwrap()
            .insert(storage_key.to_string(), Ok(to_map(fields)));
    }

    pub fn fail(&self, storage_key: &str, error: AdapterError) {
        self.documents
            .lock()
            .unwrap()
            .insert(storage_key.to_string(), Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrService for FakeOcr {
    fn name(&self) -> &str {
        "fake-ocr"
    }

    async fn extract(
        &self,
        attachment: &Attachment,
    ) -> Result<BTreeMap<String, String>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.documents
            .lock()
            .unwrap()
            .get(&attachment.storage_key)
            .cloned()
            .unwrap_or_else(|| Ok(BTreeMap::new()))
    }
}

#[derive(Default)]
pub struct RecordingHitl {
    published: Mutex<Vec<Escalation>>,
    failures: Mutex<VecDeque<AdapterError>>,
}

impl RecordingHitl {
    pub fn published(&self) -> Vec<Escalation> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail_next(&self, error: AdapterError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl HitlChannel for RecordingHitl {
    fn name(&self) -> &str {
        "recording-hitl"
    }

    async fn publish(&self, escalation: &Escalation) -> Result<(), AdapterError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.published.lock().unwrap().push(escalation.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<VecDeque<AdapterError>>,
    pub puts: AtomicUsize,
}

impl MemoryStorage {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn fail_next(&self, error: AdapterError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl ContractStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, AdapterError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(format!("mem://{}", key))
    }
}

/// Envelope ids derived from the idempotency key, like a real provider
#[derive(Default)]
pub struct FakeSignature {
    pub keys: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<AdapterError>>,
}

impl FakeSignature {
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn fail_next(&self, error: AdapterError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl SignatureProvider for FakeSignature {
    fn name(&self) -> &str {
        "fake-signature"
    }

    async fn create_envelope(&self, envelope: &EnvelopeRequest) -> Result<String, AdapterError> {
        self.keys
            .lock()
            .unwrap()
            .push(envelope.idempotency_key.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(format!("env-{}", envelope.idempotency_key))
    }
}

#[derive(Default)]
pub struct FakePayment {
    pub charges: Mutex<Vec<ChargeRequest>>,
    failures: Mutex<VecDeque<AdapterError>>,
}

impl FakePayment {
    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    pub fn fail_next(&self, error: AdapterError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl PaymentProvider for FakePayment {
    fn name(&self) -> &str {
        "fake-payment"
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<String, AdapterError> {
        self.charges.lock().unwrap().push(charge.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(format!("PAY-{}", charge.idempotency_key))
    }
}

/// An orchestrator wired to fakes over an in-memory store
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<RequestStore>,
    pub classifier: Arc<FakeClassifier>,
    pub ocr: Arc<FakeOcr>,
    pub hitl: Arc<RecordingHitl>,
    pub storage: Arc<MemoryStorage>,
    pub signature: Arc<FakeSignature>,
    pub payment: Arc<FakePayment>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = Arc::new(RequestStore::open_in_memory().unwrap());
        Self::with_store(store, settings)
    }

    pub fn with_store(store: Arc<RequestStore>, settings: Settings) -> Self {
        let classifier = Arc::new(FakeClassifier::new());
        let ocr = Arc::new(FakeOcr::default());
        let hitl = Arc::new(RecordingHitl::default());
        let storage = Arc::new(MemoryStorage::default());
        let signature = Arc::new(FakeSignature::default());
        let payment = Arc::new(FakePayment::default());

        let services = Services {
            classifier: classifier.clone(),
            ocr: ocr.clone(),
            hitl: hitl.clone(),
            contracts: storage.clone(),
            signature: signature.clone(),
            payment: payment.clone(),
        };

        Self {
            orchestrator: Orchestrator::new(store.clone(), services, settings),
            store,
            classifier,
            ocr,
            hitl,
            storage,
            signature,
            payment,
        }
    }

    /// Submit a request with one invoice attachment
    pub fn submit(&self, description: &str, declared: &[(&str, &str)]) -> Uuid {
        self.orchestrator
            .submit(IntakeRequest {
                description: description.to_string(),
                attachment_refs: vec![attachment("uploads/bill.pdf", "invoice")],
                declared_fields: to_map(declared),
            })
            .unwrap()
    }
}

impl Harness {
    /// Drive a clean request to `CONSENT_PENDING`
    pub async fn until_consent(&self) -> Uuid {
        self.ocr
            .document("uploads/bill.pdf", &[("customer_id", "C12345"), ("amount", "49.90")]);
        let id = self.submit(
            "Please switch me to the green offer",
            &[("customer_id", "C12345"), ("amount", "49,90")],
        );
        let request = self.orchestrator.drive(id).await.unwrap();
        assert_eq!(request.state, State::ConsentPending);
        id
    }

    /// Drive a clean request to `SIGNATURE_PENDING` and return its envelope id
    pub async fn until_signature(&self) -> (Uuid, String) {
        let id = self.until_consent().await;
        self.orchestrator.submit_consent(id, consent(true)).unwrap();
        let request = self.orchestrator.drive(id).await.unwrap();
        assert_eq!(request.state, State::SignaturePending);

        let envelope_id = request.signature_status.unwrap().envelope_id;
        (id, envelope_id)
    }
}

/// Default settings with immediate retries and a known webhook secret
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.classification.retry = RetryPolicy::immediate(3);
    settings.verification.ocr_retry = RetryPolicy::immediate(2);
    settings.contract.retry = RetryPolicy::immediate(3);
    settings.signature.retry = RetryPolicy::immediate(3);
    settings.signature.webhook_secret = SIGNATURE_SECRET.to_string();
    settings.payment.retry = RetryPolicy::immediate(3);
    settings.workflow.escalation_retry = RetryPolicy::immediate(2);
    settings
}

pub fn attachment(storage_key: &str, declared_type: &str) -> AttachmentRef {
    AttachmentRef {
        id: None,
        storage_key: storage_key.to_string(),
        declared_type: declared_type.to_string(),
    }
}

pub fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn consent(accepted: bool) -> ConsentInput {
    ConsentInput {
        accepted,
        text_version: "v1".to_string(),
        source_ip: "203.0.113.10".to_string(),
        user_agent: "integration-test".to_string(),
    }
}

/// A correctly signed signature webhook
pub fn signature_webhook(
    envelope_id: &str,
    status: SignatureOutcome,
    event_id: Option<&str>,
) -> SignatureWebhook {
    let mut hook = SignatureWebhook {
        envelope_id: envelope_id.to_string(),
        status,
        event_id: event_id.map(String::from),
        signature: String::new(),
    };
    hook.signature = webhook::sign(SIGNATURE_SECRET, &hook.canonical_payload());
    hook
}
