//! Configuration for contractflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONTRACTFLOW_HOME, CONTRACTFLOW_BIND,
//!    CONTRACTFLOW_SIGNATURE_SECRET, CONTRACTFLOW_PAYMENT_SECRET)
//! 2. Config file (.contractflow/config.yaml)
//! 3. Defaults (~/.contractflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .contractflow/config.yaml
//! - Paths in config file are relative to the .contractflow/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::verification::{FieldKind, FieldRule};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".contractflow";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(flatten)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (database, outbox, contracts)
    pub home: Option<String>,
}

/// Every tunable of the orchestrator, grouped by step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub classification: ClassificationSettings,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub consent: ConsentSettings,
    #[serde(default)]
    pub contract: ContractSettings,
    #[serde(default)]
    pub signature: SignatureSettings,
    #[serde(default)]
    pub payment: PaymentSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationSettings {
    #[serde(default = "default_classifier_url")]
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Accepted intents; anything else fails classification
    #[serde(default = "default_intents")]
    pub intents: Vec<String>,
}

fn default_classifier_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_intents() -> Vec<String> {
    [
        "CONTRACT_SIGNUP",
        "TERMINATION",
        "COMPLAINT",
        "OFFER_CHANGE",
        "TECHNICAL_INFO",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            url: default_classifier_url(),
            timeout_seconds: default_timeout(),
            retry: RetryPolicy::default(),
            intents: default_intents(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    /// Minimum classification confidence for an automatic `VERIFIED`
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_ocr_url")]
    pub ocr_url: String,
    #[serde(default = "default_ocr_timeout")]
    pub ocr_timeout_seconds: u64,
    #[serde(default)]
    pub ocr_retry: RetryPolicy,
    #[serde(default = "default_field_rules")]
    pub fields: Vec<FieldRule>,
    /// Declared attachment types sent to OCR; empty means all
    #[serde(default)]
    pub ocr_document_types: Vec<String>,
}

fn default_threshold() -> f64 {
    0.8
}

fn default_ocr_url() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_ocr_timeout() -> u64 {
    60
}

fn default_field_rules() -> Vec<FieldRule> {
    vec![
        FieldRule::new("customer_id", FieldKind::Identifier, false),
        FieldRule::new("meter_number", FieldKind::Identifier, false),
        FieldRule::new("amount", FieldKind::Amount, false),
        FieldRule::new("start_date", FieldKind::Date, false),
    ]
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_threshold(),
            ocr_url: default_ocr_url(),
            ocr_timeout_seconds: default_ocr_timeout(),
            ocr_retry: RetryPolicy::default(),
            fields: default_field_rules(),
            ocr_document_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentSettings {
    /// Consent texts by version; the digest covers the exact text
    #[serde(default = "default_consent_texts")]
    pub texts: BTreeMap<String, String>,
    #[serde(default = "default_retention_years")]
    pub retention_years: u32,
}

fn default_consent_texts() -> BTreeMap<String, String> {
    let mut texts = BTreeMap::new();
    texts.insert(
        "v1".to_string(),
        "I agree to the contract terms and to the processing of my data for this request."
            .to_string(),
    );
    texts
}

fn default_retention_years() -> u32 {
    2
}

impl Default for ConsentSettings {
    fn default() -> Self {
        Self {
            texts: default_consent_texts(),
            retention_years: default_retention_years(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSettings {
    #[serde(default = "default_template_version")]
    pub template_version: String,
    #[serde(default = "default_company_name")]
    pub company_name: String,
    #[serde(default = "default_terms")]
    pub terms: String,
    /// Defaults to `<home>/contracts`
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_template_version() -> String {
    "v1".to_string()
}

fn default_company_name() -> String {
    "Contractflow".to_string()
}

fn default_terms() -> String {
    "The supplier delivers the service described above from the start date agreed with \
     the customer. The customer may withdraw within fourteen days of signature. Prices \
     and conditions follow the offer selected in this request."
        .to_string()
}

impl Default for ContractSettings {
    fn default() -> Self {
        Self {
            template_version: default_template_version(),
            company_name: default_company_name(),
            terms: default_terms(),
            storage_dir: None,
            timeout_seconds: default_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSettings {
    #[serde(default = "default_signature_url")]
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// HMAC secret for inbound webhooks; empty rejects every webhook
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_signature_url() -> String {
    "http://127.0.0.1:8083".to_string()
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            url: default_signature_url(),
            timeout_seconds: default_timeout(),
            retry: RetryPolicy::default(),
            webhook_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProviderKind {
    Http,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettings {
    /// When disabled, `SIGNED` is final
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_payment_provider")]
    pub provider: PaymentProviderKind,
    #[serde(default = "default_payment_url")]
    pub url: String,
    /// Minor units, used when the request declares no `amount`
    #[serde(default = "default_amount")]
    pub default_amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// When set, payment webhooks must carry a valid signature
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_payment_provider() -> PaymentProviderKind {
    PaymentProviderKind::Mock
}

fn default_payment_url() -> String {
    "http://127.0.0.1:8084".to_string()
}

fn default_amount() -> i64 {
    4900
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_payment_provider(),
            url: default_payment_url(),
            default_amount: default_amount(),
            currency: default_currency(),
            timeout_seconds: default_timeout(),
            retry: RetryPolicy::default(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// An in-flight marker older than this is taken over by the next driver
    #[serde(default = "default_stale_in_flight")]
    pub stale_in_flight_seconds: u64,
    /// Publishing escalations to the back-office channel
    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout_seconds: u64,
    #[serde(default)]
    pub escalation_retry: RetryPolicy,
}

fn default_escalation_timeout() -> u64 {
    10
}

fn default_stale_in_flight() -> u64 {
    300
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            stale_in_flight_seconds: default_stale_in_flight(),
            escalation_timeout_seconds: default_escalation_timeout(),
            escalation_retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.verification.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("verification.confidence_threshold must be in [0, 1], got {}", threshold);
        }
        if self.consent.texts.is_empty() {
            anyhow::bail!("consent.texts must define at least one version");
        }
        if self.consent.retention_years == 0 {
            anyhow::bail!("consent.retention_years must be at least 1");
        }
        if self.classification.intents.is_empty() {
            anyhow::bail!("classification.intents must not be empty");
        }
        if self.payment.enabled && self.payment.default_amount <= 0 {
            anyhow::bail!("payment.default_amount must be positive");
        }
        Ok(())
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: Settings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home` (tests, one-off tools)
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            config_file: None,
            settings: Settings::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.home.join("contractflow.db")
    }

    pub fn contracts_dir(&self) -> PathBuf {
        match self.settings.contract.storage_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => self.home.join(dir),
            None => self.home.join("contracts"),
        }
    }

    pub fn hitl_outbox_path(&self) -> PathBuf {
        self.home.join("hitl").join("outbox.jsonl")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Environment overrides win over the file
fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(secret) = std::env::var("CONTRACTFLOW_SIGNATURE_SECRET") {
        settings.signature.webhook_secret = secret;
    }
    if let Ok(secret) = std::env::var("CONTRACTFLOW_PAYMENT_SECRET") {
        settings.payment.webhook_secret = Some(secret);
    }
    if let Ok(bind) = std::env::var("CONTRACTFLOW_BIND") {
        settings.server.bind = bind;
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = find_config_file();

    let (home, mut settings) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let config_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("CONTRACTFLOW_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(config_dir, home_path)
        } else {
            default_home
        };

        let mut settings = config.settings;
        if let Some(dir) = settings.contract.storage_dir.take() {
            settings.contract.storage_dir = Some(resolve_path(config_dir, &dir.to_string_lossy()));
        }

        (home, settings)
    } else {
        let home = std::env::var("CONTRACTFLOW_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        (home, Settings::default())
    };

    apply_env_overrides(&mut settings);
    settings.validate()?;

    Ok(ResolvedConfig {
        home,
        config_file,
        settings,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.verification.confidence_threshold, 0.8);
        assert_eq!(settings.consent.retention_years, 2);
        assert_eq!(settings.classification.intents.len(), 5);
        assert!(!settings.payment.enabled);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
verification:
  confidence_threshold: 0.9
  fields:
    - name: customer_id
      kind: identifier
      required: true
consent:
  texts:
    v1.3: "I accept."
payment:
  enabled: true
  provider: http
  default_amount: 1999
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1.0"));
        assert_eq!(config.paths.home.as_deref(), Some("./state"));

        let settings = config.settings;
        assert_eq!(settings.verification.confidence_threshold, 0.9);
        assert_eq!(settings.verification.fields.len(), 1);
        assert!(settings.verification.fields[0].required);
        assert_eq!(settings.consent.texts["v1.3"], "I accept.");
        assert_eq!(settings.consent.retention_years, 2);
        assert!(settings.payment.enabled);
        assert_eq!(settings.payment.provider, PaymentProviderKind::Http);
        assert_eq!(settings.payment.currency, "EUR");
        // Untouched sections keep their defaults
        assert_eq!(settings.signature.retry.max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut settings = Settings::default();
        settings.verification.confidence_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let mut config = ResolvedConfig::with_home(PathBuf::from("/srv/contractflow"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/srv/contractflow/contractflow.db")
        );
        assert_eq!(
            config.contracts_dir(),
            PathBuf::from("/srv/contractflow/contracts")
        );
        assert_eq!(
            config.hitl_outbox_path(),
            PathBuf::from("/srv/contractflow/hitl/outbox.jsonl")
        );

        config.settings.contract.storage_dir = Some(PathBuf::from("/data/contracts"));
        assert_eq!(config.contracts_dir(), PathBuf::from("/data/contracts"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.contractflow");

        assert_eq!(
            resolve_path(&base, "./state"),
            PathBuf::from("/home/user/project/.contractflow/./state")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
