//! Field-level comparison of declared values against OCR output.
//!
//! Values are normalised per field kind before they are compared, so
//! "1.234,50 EUR" and "1234.5" are the same amount and "c 12345" and
//! "C12345" are the same identifier.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{Attachment, FieldMismatch, MismatchReason, Verdict};

/// How a field's values are normalised before comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Identifier,
    Amount,
    Date,
    Text,
}

/// Comparison rule for one named field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: FieldKind,

    /// A required field missing on either side is a mismatch
    #[serde(default)]
    pub required: bool,

    /// Absolute tolerance for amounts
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_kind() -> FieldKind {
    FieldKind::Text
}

fn default_tolerance() -> f64 {
    0.01
}

impl FieldRule {
    pub fn new(name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            required,
            tolerance: default_tolerance(),
        }
    }
}

/// Canonical form of a field name: lowercase, spaces and dashes as underscores
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

/// Lowercase, punctuation to spaces, whitespace collapsed
pub fn normalize_text(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Uppercase alphanumerics only, so `c-12 345` matches `C12345`
pub fn normalize_identifier(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Parse an amount written with either `,` or `.` as decimal separator
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');

    let canonical = match (last_comma, last_dot) {
        // Both present: whichever comes last is the decimal separator
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // Comma only: decimal if followed by at most two digits
        (Some(c), None) => {
            let decimals = cleaned.len() - c - 1;
            if decimals <= 2 && cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(d)) => {
            let decimals = cleaned.len() - d - 1;
            if cleaned.matches('.').count() > 1 || decimals == 3 {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };

    canonical.parse().ok()
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"];

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn values_match(rule: &FieldRule, declared: &str, extracted: &str) -> bool {
    match rule.kind {
        FieldKind::Text => normalize_text(declared) == normalize_text(extracted),
        FieldKind::Identifier => normalize_identifier(declared) == normalize_identifier(extracted),
        FieldKind::Amount => match (parse_amount(declared), parse_amount(extracted)) {
            (Some(a), Some(b)) => (a - b).abs() <= rule.tolerance + f64::EPSILON,
            _ => normalize_text(declared) == normalize_text(extracted),
        },
        FieldKind::Date => match (parse_date(declared), parse_date(extracted)) {
            (Some(a), Some(b)) => a == b,
            _ => normalize_text(declared) == normalize_text(extracted),
        },
    }
}

/// Compare declared fields against extracted fields.
///
/// Fields with a rule are compared by kind; declared fields without a rule
/// are compared as text when the document also carries them. The result is
/// sorted so repeated runs produce identical output.
pub fn compare_fields(
    rules: &[FieldRule],
    declared: &BTreeMap<String, String>,
    extracted: &BTreeMap<String, String>,
) -> Vec<FieldMismatch> {
    let declared: BTreeMap<String, &String> =
        declared.iter().map(|(k, v)| (normalize_key(k), v)).collect();
    let extracted: BTreeMap<String, &String> =
        extracted.iter().map(|(k, v)| (normalize_key(k), v)).collect();

    let mut mismatches = Vec::new();
    let mut covered = Vec::new();

    for rule in rules {
        let key = normalize_key(&rule.name);
        covered.push(key.clone());

        match (declared.get(&key), extracted.get(&key)) {
            (Some(d), Some(e)) => {
                if !values_match(rule, d, e) {
                    mismatches.push(FieldMismatch {
                        field: key,
                        declared: Some((*d).clone()),
                        extracted: Some((*e).clone()),
                        reason: MismatchReason::ValueDiffers,
                    });
                }
            }
            (Some(d), None) if rule.required => mismatches.push(FieldMismatch {
                field: key,
                declared: Some((*d).clone()),
                extracted: None,
                reason: MismatchReason::MissingExtracted,
            }),
            (None, Some(e)) if rule.required => mismatches.push(FieldMismatch {
                field: key,
                declared: None,
                extracted: Some((*e).clone()),
                reason: MismatchReason::MissingDeclared,
            }),
            (None, None) if rule.required => mismatches.push(FieldMismatch {
                field: key,
                declared: None,
                extracted: None,
                reason: MismatchReason::MissingExtracted,
            }),
            _ => {}
        }
    }

    let text_rule = FieldRule::new("", FieldKind::Text, false);
    for (key, d) in &declared {
        if covered.contains(key) {
            continue;
        }
        if let Some(e) = extracted.get(key) {
            if !values_match(&text_rule, d, e) {
                mismatches.push(FieldMismatch {
                    field: key.clone(),
                    declared: Some((*d).clone()),
                    extracted: Some((*e).clone()),
                    reason: MismatchReason::ValueDiffers,
                });
            }
        }
    }

    mismatches.sort();
    mismatches
}

/// Union of all extracted fields in submission order. A later attachment
/// overrides an earlier one, so a corrected document replaces the original.
pub fn merge_extracted(attachments: &[Attachment]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for attachment in attachments {
        if let Some(ref ocr) = attachment.ocr_result {
            for (key, value) in &ocr.fields {
                merged.insert(normalize_key(key), value.clone());
            }
        }
    }
    merged
}

/// Mismatch recorded when a document could not be read
pub fn unavailable(storage_key: &str) -> FieldMismatch {
    FieldMismatch {
        field: format!("attachment:{}", storage_key),
        declared: None,
        extracted: None,
        reason: MismatchReason::VerificationUnavailable,
    }
}

/// `VERIFIED` only with confidence at or above the threshold and no mismatches
pub fn decide_verdict(confidence: f64, threshold: f64, mismatches: &[FieldMismatch]) -> Verdict {
    if confidence >= threshold && mismatches.is_empty() {
        Verdict::Verified
    } else {
        Verdict::NeedsFixes
    }
}
