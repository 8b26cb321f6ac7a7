//! Contract rendering.
//!
//! Rendering is a pure function of the request and the template settings:
//! the same request always yields byte-identical output, which keeps the
//! storage write idempotent across retries.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ContractSettings;
use crate::domain::Request;

const LINE_WIDTH: usize = 95;
const MIN_BREAK: usize = 40;

/// A rendered contract artifact, not yet stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContract {
    pub contract_id: String,
    pub storage_key: String,
    pub template_version: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
}

/// `CTR-` followed by 12 upper-case hex chars derived from the request id
pub fn contract_id(request_id: Uuid) -> String {
    let digest = Sha256::digest(request_id.as_bytes());
    format!("CTR-{}", hex::encode_upper(&digest[..6]))
}

pub fn storage_key(request_id: Uuid, template_version: &str) -> String {
    format!("contracts/{}/{}.txt", request_id, template_version)
}

/// Replace typographic characters and anything outside Latin-1
pub fn to_latin1(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' | '\u{2212}' => out.push('-'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201A}' => out.push(','),
            '\u{201C}' | '\u{201D}' | '\u{201E}' => out.push('"'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{202F}' | '\u{2009}' | '\u{2007}' | '\u{2002}' | '\u{2003}'
            | '\u{200A}' => out.push(' '),
            '\u{200B}' | '\u{2060}' => {}
            c if (c as u32) <= 0xFF => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

/// Wrap each paragraph at `width` columns, breaking on the last space
/// unless that would leave a line shorter than 40 chars.
pub fn wrap_lines(text: &str, width: usize) -> Vec<String> {
    let text = to_latin1(text);
    let mut lines = Vec::new();

    for para in text.lines() {
        let mut rest: Vec<char> = para.trim().chars().collect();
        while rest.len() > width {
            let cut = rest[..width]
                .iter()
                .rposition(|c| *c == ' ')
                .filter(|pos| *pos >= MIN_BREAK)
                .unwrap_or(width);
            let line: String = rest[..cut].iter().collect();
            lines.push(line.trim().to_string());
            let tail: String = rest[cut..].iter().collect();
            rest = tail.trim().chars().collect();
        }
        if !rest.is_empty() {
            lines.push(rest.into_iter().collect());
        }
    }

    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

/// Render the contract text for a consented request
pub fn render(request: &Request, settings: &ContractSettings) -> RenderedContract {
    let contract_id = contract_id(request.id);
    let mut body = Vec::new();

    body.push(format!("{} - Service Contract", settings.company_name));
    body.push(String::new());
    body.push(format!("Contract: {}", contract_id));
    body.push(format!("Request: {}", request.id));
    body.push(format!("Template: {}", settings.template_version));
    if let Some(ref classification) = request.classification {
        body.push(format!("Subject: {}", classification.intent));
    }
    if let Some(ref proof) = request.consent_proof {
        body.push(format!("Date: {}", proof.timestamp.date_naive()));
    }

    body.push(String::new());
    body.push("Customer details".to_string());
    for (field, value) in &request.declared_fields {
        body.extend(wrap_lines(&format!("  {}: {}", field, value), LINE_WIDTH));
    }

    body.push(String::new());
    body.push("Request".to_string());
    body.extend(wrap_lines(&request.description, LINE_WIDTH));

    body.push(String::new());
    body.push("Terms".to_string());
    body.extend(wrap_lines(&settings.terms, LINE_WIDTH));

    if let Some(ref proof) = request.consent_proof {
        body.push(String::new());
        body.push(format!(
            "Consent {} recorded as {}",
            proof.text_version, proof.hash
        ));
    }

    body.push(String::new());
    body.push("Customer signature: ______________________".to_string());
    body.push(format!("For {}: ______________________", settings.company_name));

    let mut text = body.join("\n");
    text.push('\n');

    // Latin-1 bytes: every char is <= 0xFF after normalisation
    let bytes: Vec<u8> = to_latin1(&text).chars().map(|c| c as u32 as u8).collect();
    let sha256 = hex::encode(Sha256::digest(&bytes));

    RenderedContract {
        contract_id,
        storage_key: storage_key(request.id, &settings.template_version),
        template_version: settings.template_version.clone(),
        bytes,
        sha256,
    }
}
