//! HTTP e-signature provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::http::JsonClient;
use super::{AdapterError, EnvelopeRequest, SignatureProvider};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeBody<'a> {
    request_id: Uuid,
    contract_id: &'a str,
    document_uri: &'a str,
    document_sha256: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeResponse {
    envelope_id: String,
}

/// Calls `POST {url}/envelopes` with an `Idempotency-Key` header, so a
/// replayed creation returns the envelope created the first time.
pub struct HttpSignatureProvider {
    client: JsonClient,
}

impl HttpSignatureProvider {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new(url, timeout)?,
        })
    }
}

#[async_trait]
impl SignatureProvider for HttpSignatureProvider {
    fn name(&self) -> &str {
        "http-signature"
    }

    async fn create_envelope(&self, envelope: &EnvelopeRequest) -> Result<String, AdapterError> {
        let response: EnvelopeResponse = self
            .client
            .post(
                "/envelopes",
                &EnvelopeBody {
                    request_id: envelope.request_id,
                    contract_id: &envelope.contract_id,
                    document_uri: &envelope.document_uri,
                    document_sha256: &envelope.document_sha256,
                },
                Some(&envelope.idempotency_key),
            )
            .await?;

        if response.envelope_id.trim().is_empty() {
            return Err(AdapterError::Fatal("empty envelope id".to_string()));
        }
        Ok(response.envelope_id)
    }
}
