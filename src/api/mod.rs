//! HTTP surface.
//!
//! Every mutating route persists its change synchronously and then drives
//! the request in the background, so callers get an immediate answer and
//! poll `GET /request/{id}` for progress.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{header::USER_AGENT, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{Orchestrator, WebhookOutcome, WorkflowError};
use crate::domain::{
    AttachmentRef, ConsentInput, ConsentProof, Decision, Event, IntakeRequest, PaymentWebhook,
    Request, SignatureWebhook,
};

/// Build the router over a shared orchestrator
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/request", post(submit_request))
        .route("/requests", get(list_requests))
        .route("/request/{id}", get(get_request))
        .route("/request/{id}/attachments", post(add_attachments))
        .route("/request/{id}/cancel", post(cancel_request))
        .route("/request/{id}/retry", post(retry_request))
        .route("/consent", post(submit_consent))
        .route("/hitl/decision", post(submit_decision))
        .route("/webhooks/signature", post(signature_webhook))
        .route("/webhooks/payment", post(payment_webhook))
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process is stopped
pub async fn serve(orchestrator: Orchestrator, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let app = router(orchestrator);

    info!("contractflow API listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Advance a request off the request path
fn spawn_drive(orchestrator: &Orchestrator, id: Uuid) {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.drive(id).await {
            warn!(request_id = %id, error = %e, "Background drive stopped");
        }
    });
}

// ----------------------------------------------------------------------
// Bodies
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub request: Request,
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentsBody {
    pub attachment_refs: Vec<AttachmentRef>,
    #[serde(default)]
    pub declared_fields: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentBody {
    pub request_id: Uuid,
    pub accepted: bool,
    pub text_version: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Error returned by handlers, rendered as `{error, code}` JSON
#[derive(Debug)]
pub struct ApiError(pub WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            WorkflowError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            WorkflowError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            WorkflowError::UnknownReference(_) => (StatusCode::NOT_FOUND, "UNKNOWN_REFERENCE"),
            WorkflowError::ConflictingState(_) => (StatusCode::CONFLICT, "CONFLICTING_STATE"),
            WorkflowError::ConflictingDecision { .. } => {
                (StatusCode::CONFLICT, "CONFLICTING_DECISION")
            }
            WorkflowError::DuplicateConsent(_) => (StatusCode::CONFLICT, "DUPLICATE_CONSENT"),
            WorkflowError::ConsentDeclined => {
                (StatusCode::UNPROCESSABLE_ENTITY, "CONSENT_DECLINED")
            }
            WorkflowError::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE"),
            WorkflowError::TransientService { .. } => (StatusCode::BAD_GATEWAY, "TRANSIENT_SERVICE"),
            WorkflowError::StepFailed { .. } => (StatusCode::BAD_GATEWAY, "STEP_FAILED"),
            WorkflowError::ClassificationFailed(_) => {
                (StatusCode::BAD_GATEWAY, "CLASSIFICATION_FAILED")
            }
            WorkflowError::VerificationUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "VERIFICATION_UNAVAILABLE")
            }
            WorkflowError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code,
            }),
        )
            .into_response()
    }
}

/// Caller details captured for consent proofs
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub source_ip: String,
    pub user_agent: String,
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            source_ip: forwarded.or(peer).unwrap_or_else(|| "unknown".to_string()),
            user_agent,
        })
    }
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

async fn health_check() -> &'static str {
    "OK"
}

async fn submit_request(
    State(orchestrator): State<Orchestrator>,
    Json(intake): Json<IntakeRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let request_id = orchestrator.submit(intake)?;
    spawn_drive(&orchestrator, request_id);
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { request_id })))
}

async fn list_requests(
    State(orchestrator): State<Orchestrator>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Request>>, ApiError> {
    Ok(Json(orchestrator.list(params.limit)?))
}

async fn get_request(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let (request, events) = orchestrator.status(id)?;
    Ok(Json(StatusResponse { request, events }))
}

async fn add_attachments(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
    Json(body): Json<AttachmentsBody>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    orchestrator.add_attachments(id, body.attachment_refs, body.declared_fields)?;
    spawn_drive(&orchestrator, id);
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { request_id: id })))
}

async fn cancel_request(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> Result<Json<Request>, ApiError> {
    Ok(Json(orchestrator.cancel(id)?))
}

async fn retry_request(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    orchestrator.retry(id)?;
    spawn_drive(&orchestrator, id);
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { request_id: id })))
}

async fn submit_consent(
    State(orchestrator): State<Orchestrator>,
    client: ClientInfo,
    Json(body): Json<ConsentBody>,
) -> Result<Json<ConsentProof>, ApiError> {
    let input = ConsentInput {
        accepted: body.accepted,
        text_version: body.text_version,
        source_ip: client.source_ip,
        user_agent: client.user_agent,
    };

    let proof = orchestrator.submit_consent(body.request_id, input)?;
    spawn_drive(&orchestrator, body.request_id);
    Ok(Json(proof))
}

async fn submit_decision(
    State(orchestrator): State<Orchestrator>,
    Json(decision): Json<Decision>,
) -> Result<Json<Request>, ApiError> {
    let request = orchestrator.apply_decision(decision)?;
    spawn_drive(&orchestrator, request.id);
    Ok(Json(request))
}

async fn signature_webhook(
    State(orchestrator): State<Orchestrator>,
    Json(hook): Json<SignatureWebhook>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let outcome = orchestrator.apply_signature_webhook(&hook)?;
    Ok(Json(webhook_response(&orchestrator, outcome)))
}

async fn payment_webhook(
    State(orchestrator): State<Orchestrator>,
    Json(hook): Json<PaymentWebhook>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let outcome = orchestrator.apply_payment_webhook(&hook)?;
    Ok(Json(webhook_response(&orchestrator, outcome)))
}

fn webhook_response(orchestrator: &Orchestrator, outcome: WebhookOutcome) -> WebhookResponse {
    match outcome {
        WebhookOutcome::Applied(id) => {
            spawn_drive(orchestrator, id);
            WebhookResponse { status: "applied" }
        }
        WebhookOutcome::Duplicate => WebhookResponse { status: "duplicate" },
    }
}
