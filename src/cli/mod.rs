//! Command-line interface for contractflow.
//!
//! Provides commands for serving the API, submitting requests, checking
//! status, applying back-office decisions, and operator recovery.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::adapters::Services;
use crate::api;
use crate::config::{self, ResolvedConfig};
use crate::core::{Orchestrator, RequestStore};
use crate::domain::{AttachmentRef, Decision, DecisionKind, IntakeRequest, Request};

/// contractflow - Durable request lifecycle orchestrator
#[derive(Parser, Debug)]
#[command(name = "contractflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API (resumes unfinished requests first)
    Serve {
        /// Address to bind to (defaults to server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Submit a request and drive it until it waits on an external event
    Submit {
        /// Customer description
        description: String,

        /// Attachment as STORAGE_KEY or STORAGE_KEY:TYPE (repeatable)
        #[arg(short, long = "attachment")]
        attachments: Vec<String>,

        /// Declared field as NAME=VALUE (repeatable)
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Show a request and its audit log
    Status {
        /// Request ID (UUID)
        request_id: String,

        /// Print the audit log
        #[arg(short, long)]
        events: bool,
    },

    /// List recent requests
    List {
        /// Maximum number of requests to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Apply a back-office decision to an escalated request
    Decide {
        /// Request ID (UUID)
        request_id: String,

        #[arg(value_enum)]
        decision: DecisionArg,

        /// Reviewer identity recorded with the decision
        #[arg(short, long)]
        reviewer: String,

        /// Review round the decision answers
        #[arg(long)]
        round: Option<u32>,
    },

    /// Retry the failed step of a request
    Retry {
        /// Request ID (UUID)
        request_id: String,
    },

    /// Cancel a request
    Cancel {
        /// Request ID (UUID)
        request_id: String,
    },

    /// Drive every unfinished request (after a crash)
    Recover,

    /// Show resolved configuration (debug)
    Config,
}

/// HITL decision for CLI (maps to DecisionKind)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
    /// Ask the customer for more documents
    MoreInfo,
}

impl From<DecisionArg> for DecisionKind {
    fn from(d: DecisionArg) -> Self {
        match d {
            DecisionArg::Approve => DecisionKind::Approve,
            DecisionArg::Reject => DecisionKind::Reject,
            DecisionArg::MoreInfo => DecisionKind::RequestMoreInfo,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { bind } => serve(bind).await,
            Commands::Submit {
                description,
                attachments,
                fields,
            } => submit(description, attachments, fields).await,
            Commands::Status { request_id, events } => show_status(&request_id, events),
            Commands::List { limit } => list_requests(limit),
            Commands::Decide {
                request_id,
                decision,
                reviewer,
                round,
            } => decide(&request_id, decision, reviewer, round).await,
            Commands::Retry { request_id } => retry(&request_id).await,
            Commands::Cancel { request_id } => cancel(&request_id),
            Commands::Recover => recover().await,
            Commands::Config => show_config(),
        }
    }
}

/// Build an orchestrator over the configured store and adapters
pub fn open_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home directory: {}", cfg.home.display()))?;

    let db = cfg.database_path();
    let store = RequestStore::open(&db)
        .with_context(|| format!("Failed to open request store: {}", db.display()))?;
    let services = Services::from_config(cfg).context("Failed to initialise adapters")?;

    Ok(Orchestrator::new(
        Arc::new(store),
        services,
        cfg.settings.clone(),
    ))
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid request ID: {}", s))
}

/// `key` or `key:type`
fn parse_attachment(s: &str) -> AttachmentRef {
    let (storage_key, declared_type) = match s.rsplit_once(':') {
        Some((key, kind)) if !key.is_empty() && !kind.is_empty() => (key, kind),
        _ => (s, "document"),
    };
    AttachmentRef {
        id: None,
        storage_key: storage_key.to_string(),
        declared_type: declared_type.to_string(),
    }
}

fn parse_fields(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("Field must be NAME=VALUE: {}", pair))
        })
        .collect()
}

fn print_summary(request: &Request) {
    println!("Request ID: {}", request.id);
    println!("State:      {}", request.state);
    println!("Version:    {}", request.version);
    println!("Attempt:    {}", request.attempt);
}

async fn serve(bind: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = open_orchestrator(cfg)?;

    let report = orchestrator.recover().await?;
    if !report.resumed.is_empty() || !report.failed.is_empty() {
        eprintln!(
            "[Recovered {} request(s), {} still failing]",
            report.resumed.len(),
            report.failed.len()
        );
    }

    let bind = bind.unwrap_or_else(|| cfg.settings.server.bind.clone());
    api::serve(orchestrator, &bind).await
}

async fn submit(description: String, attachments: Vec<String>, fields: Vec<String>) -> Result<()> {
    let orchestrator = open_orchestrator(config::config()?)?;

    let intake = IntakeRequest {
        description,
        attachment_refs: attachments.iter().map(|a| parse_attachment(a)).collect(),
        declared_fields: parse_fields(&fields)?,
    };
    let id = orchestrator.submit(intake)?;

    match orchestrator.drive(id).await {
        Ok(request) => {
            print_summary(&request);
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[Request {} stopped: {}]", id, e);
            std::process::exit(1);
        }
    }
}

fn show_status(request_id: &str, with_events: bool) -> Result<()> {
    let id = parse_id(request_id)?;
    let orchestrator = open_orchestrator(config::config()?)?;
    let (request, events) = orchestrator.status(id)?;

    print_summary(&request);
    println!("Created:    {}", request.created_at);
    println!("Updated:    {}", request.updated_at);

    if let Some(ref c) = request.classification {
        println!("\nClassification: {} ({:.2})", c.intent, c.confidence);
    }
    if let Some(ref v) = request.verification {
        println!(
            "Verification:   {:?}{} ({} mismatch(es))",
            v.verdict,
            if v.manual_override { " [override]" } else { "" },
            v.mismatches.len()
        );
        for m in &v.mismatches {
            println!("  {}: {:?}", m.field, m.reason);
        }
    }
    if request.hitl.round > 0 {
        println!("Review round:   {}", request.hitl.round);
    }
    if let Some(ref p) = request.consent_proof {
        println!("Consent:        {} at {}", p.hash, p.timestamp);
    }
    if let Some(ref c) = request.contract_ref {
        println!("Contract:       {} ({})", c.contract_id, c.storage_uri);
    }
    if let Some(ref s) = request.signature_status {
        println!("Signature:      {:?} (envelope {})", s.status, s.envelope_id);
    }
    if let Some(ref p) = request.payment_record {
        println!(
            "Payment:        {:?} {} {} ({})",
            p.status,
            p.amount,
            p.currency,
            p.provider_reference.as_deref().unwrap_or("-")
        );
    }
    if let Some(ref f) = request.failure {
        println!(
            "\nFailed step:    {} after {} attempt(s): {}",
            f.step, f.attempts, f.last_error
        );
    }
    if let Some(ref m) = request.in_flight {
        println!("\nIn flight:      {} since {} ({})", m.step, m.started_at, m.idempotency_key);
    }

    if with_events {
        println!("\n{:<26} {:<20} {:<18} SUMMARY", "TIMESTAMP", "EVENT", "STATE");
        println!("{}", "-".repeat(90));
        for event in events {
            println!(
                "{:<26} {:<20} {:<18} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.event_type.as_str(),
                event.state.as_str(),
                event.payload_summary
            );
        }
    }

    Ok(())
}

fn list_requests(limit: usize) -> Result<()> {
    let orchestrator = open_orchestrator(config::config()?)?;
    let requests = orchestrator.list(limit)?;

    if requests.is_empty() {
        println!("No requests found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<8} UPDATED", "REQUEST ID", "STATE", "VERSION");
    println!("{}", "-".repeat(90));

    for request in requests {
        println!(
            "{:<38} {:<20} {:<8} {}",
            request.id,
            request.state.as_str(),
            request.version,
            request.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn decide(
    request_id: &str,
    decision: DecisionArg,
    reviewer: String,
    round: Option<u32>,
) -> Result<()> {
    let id = parse_id(request_id)?;
    let orchestrator = open_orchestrator(config::config()?)?;

    orchestrator.apply_decision(Decision {
        request_id: id,
        decision: decision.into(),
        reviewer_id: reviewer,
        round,
    })?;

    let request = orchestrator.drive(id).await?;
    print_summary(&request);
    Ok(())
}

async fn retry(request_id: &str) -> Result<()> {
    let id = parse_id(request_id)?;
    let orchestrator = open_orchestrator(config::config()?)?;

    orchestrator.retry(id)?;
    match orchestrator.drive(id).await {
        Ok(request) => {
            print_summary(&request);
            Ok(())
        }
        Err(e) => {
            eprintln!("\n[Request {} failed again: {}]", id, e);
            std::process::exit(1);
        }
    }
}

fn cancel(request_id: &str) -> Result<()> {
    let id = parse_id(request_id)?;
    let orchestrator = open_orchestrator(config::config()?)?;

    let request = orchestrator.cancel(id)?;
    print_summary(&request);
    if request.cancel_requested {
        eprintln!("\n[Cancellation deferred until the in-flight call completes]");
    }
    Ok(())
}

async fn recover() -> Result<()> {
    let orchestrator = open_orchestrator(config::config()?)?;
    let report = orchestrator.recover().await?;

    for (id, state) in &report.resumed {
        println!("{:<38} {}", id, state);
    }
    for (id, error) in &report.failed {
        println!("{:<38} ERROR: {}", id, error);
    }
    eprintln!(
        "\n[{} resumed, {} failed]",
        report.resumed.len(),
        report.failed.len()
    );
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let s = &cfg.settings;

    println!("contractflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Database:  {}", cfg.database_path().display());
    println!("  Contracts: {}", cfg.contracts_dir().display());
    println!("  HITL:      {}", cfg.hitl_outbox_path().display());
    println!();
    println!("Services:");
    println!("  Classification: {}", s.classification.url);
    println!("  OCR:            {}", s.verification.ocr_url);
    println!("  Signature:      {}", s.signature.url);
    println!(
        "  Payment:        {} ({:?})",
        if s.payment.enabled { "enabled" } else { "disabled" },
        s.payment.provider
    );
    println!();
    println!("Verification:");
    println!("  Confidence threshold: {}", s.verification.confidence_threshold);
    println!("  Field rules:          {}", s.verification.fields.len());
    println!();
    println!("Workflow:");
    println!("  Stale in-flight after: {}s", s.workflow.stale_in_flight_seconds);
    println!("  Server bind:           {}", s.server.bind);

    Ok(())
}
