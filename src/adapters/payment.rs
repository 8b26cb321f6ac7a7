//! Payment providers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::hash_input;

use super::http::JsonClient;
use super::{AdapterError, ChargeRequest, PaymentProvider};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargeBody<'a> {
    request_id: Uuid,
    amount: i64,
    currency: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeResponse {
    provider_reference: String,
}

/// Calls `POST {url}/charges`; settlement arrives later via webhook
pub struct HttpPaymentProvider {
    client: JsonClient,
}

impl HttpPaymentProvider {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new(url, timeout)?,
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    fn name(&self) -> &str {
        "http-payment"
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<String, AdapterError> {
        let response: ChargeResponse = self
            .client
            .post(
                "/charges",
                &ChargeBody {
                    request_id: charge.request_id,
                    amount: charge.amount,
                    currency: &charge.currency,
                },
                Some(&charge.idempotency_key),
            )
            .await?;

        Ok(response.provider_reference)
    }
}

/// Local provider for development: accepts every charge and derives the
/// reference from the idempotency key, so replays get the same reference.
pub struct MockPaymentProvider;

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    fn name(&self) -> &str {
        "mock-payment"
    }

    async fn charge(&self, charge: &ChargeRequest) -> Result<String, AdapterError> {
        Ok(format!("MOCK-{}", hash_input(&charge.idempotency_key)))
    }
}
