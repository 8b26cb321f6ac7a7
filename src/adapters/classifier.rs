//! HTTP intent classifier.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Classification;

use super::http::JsonClient;
use super::{AdapterError, ClassificationService};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyBody<'a> {
    request_id: Uuid,
    description: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyResponse {
    intent: String,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Calls `POST {url}/classify`
pub struct HttpClassifier {
    client: JsonClient,
}

impl HttpClassifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new(url, timeout)?,
        })
    }
}

#[async_trait]
impl ClassificationService for HttpClassifier {
    fn name(&self) -> &str {
        "http-classifier"
    }

    async fn classify(
        &self,
        request_id: Uuid,
        description: &str,
    ) -> Result<Classification, AdapterError> {
        let response: ClassifyResponse = self
            .client
            .post(
                "/classify",
                &ClassifyBody {
                    request_id,
                    description,
                },
                None,
            )
            .await?;

        if !(0.0..=1.0).contains(&response.confidence) {
            return Err(AdapterError::Fatal(format!(
                "confidence {} outside [0, 1]",
                response.confidence
            )));
        }

        Ok(Classification {
            intent: response.intent,
            confidence: response.confidence,
            rationale: response.rationale,
        })
    }
}
