//! HTTP OCR extraction service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Attachment;

use super::http::JsonClient;
use super::{AdapterError, OcrService};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractBody<'a> {
    attachment_id: Uuid,
    storage_key: &'a str,
    document_type: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

/// Calls `POST {url}/extract` with the attachment's storage key
pub struct HttpOcr {
    client: JsonClient,
}

impl HttpOcr {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: JsonClient::new(url, timeout)?,
        })
    }
}

#[async_trait]
impl OcrService for HttpOcr {
    fn name(&self) -> &str {
        "http-ocr"
    }

    async fn extract(
        &self,
        attachment: &Attachment,
    ) -> Result<BTreeMap<String, String>, AdapterError> {
        let response: ExtractResponse = self
            .client
            .post(
                "/extract",
                &ExtractBody {
                    attachment_id: attachment.id,
                    storage_key: &attachment.storage_key,
                    document_type: &attachment.declared_type,
                },
                None,
            )
            .await?;

        Ok(response.fields)
    }
}
