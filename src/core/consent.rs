//! Consent proofs.
//!
//! A proof binds the exact consent text shown to the customer, the request
//! and the moment of acceptance into one SHA-256 digest. Anyone holding the
//! text can recompute the digest later.

use chrono::{DateTime, Datelike, NaiveDate, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ConsentSettings;
use crate::domain::{ConsentInput, ConsentProof};

use super::error::WorkflowError;

/// `sha256:<hex>` over `{text}|{request_id}|{timestamp}`
pub fn consent_digest(text: &str, request_id: Uuid, timestamp: DateTime<Utc>) -> String {
    let raw = format!("{}|{}|{}", text, request_id, timestamp.to_rfc3339());
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Add whole years, falling back to Feb 28 for a Feb 29 start
pub fn retention_until(from: NaiveDate, years: u32) -> NaiveDate {
    let year = from.year() + years as i32;
    from.with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
        .unwrap_or(from)
}

/// Build the proof for an accepted consent.
///
/// The timestamp is truncated to whole seconds so the stored RFC 3339 form
/// reproduces the digest exactly.
pub fn build_proof(
    settings: &ConsentSettings,
    request_id: Uuid,
    input: &ConsentInput,
    now: DateTime<Utc>,
) -> Result<ConsentProof, WorkflowError> {
    let text = settings.texts.get(&input.text_version).ok_or_else(|| {
        WorkflowError::InvalidInput(format!(
            "unknown consent text version '{}'",
            input.text_version
        ))
    })?;

    let timestamp = now.trunc_subsecs(0);

    Ok(ConsentProof {
        hash: consent_digest(text, request_id, timestamp),
        timestamp,
        text_version: input.text_version.clone(),
        source_ip: input.source_ip.clone(),
        user_agent: input.user_agent.clone(),
        retention_until: retention_until(timestamp.date_naive(), settings.retention_years),
    })
}

/// Recompute the digest of a stored proof
pub fn verify_proof(settings: &ConsentSettings, request_id: Uuid, proof: &ConsentProof) -> bool {
    settings
        .texts
        .get(&proof.text_version)
        .map(|text| consent_digest(text, request_id, proof.timestamp) == proof.hash)
        .unwrap_or(false)
}
