//! Durable request store backed by SQLite.
//!
//! One row per request holds the JSON-encoded aggregate plus the columns
//! needed for lookups. Writes are compare-and-swap on `version`; a stale
//! write is rejected, never merged. The audit log, consent proofs and
//! inbound-event dedupe markers live in their own tables and are written
//! in the same transaction as the request they belong to.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ConsentProof, Event, Request, State, StepKind};

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Request not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict { id: Uuid, expected: u64, actual: u64 },

    #[error("Request already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Consent proof already recorded for {0}")]
    DuplicateConsent(Uuid),

    #[error("Inbound event already applied: {source_name}/{event_id}")]
    DuplicateInbound { source_name: String, event_id: String },

    #[error("Invariant violated for {id}: {reason}")]
    Invariant { id: Uuid, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    version INTEGER NOT NULL,
    envelope_id TEXT,
    provider_reference TEXT,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_envelope ON requests(envelope_id);
CREATE INDEX IF NOT EXISTS idx_requests_provider_ref ON requests(provider_reference);
CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state);

CREATE TABLE IF NOT EXISTS consent_proofs (
    request_id TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_request ON events(request_id, seq);

CREATE TABLE IF NOT EXISTS inbound_events (
    source TEXT NOT NULL,
    event_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (source, event_id)
);
"#;

/// SQLite-backed request store
pub struct RequestStore {
    conn: Mutex<Connection>,
}

impl RequestStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Persist a new request at version 1
    pub fn insert(&self, request: &mut Request, event: &Event) -> Result<(), StoreError> {
        request
            .check_invariants()
            .map_err(|reason| StoreError::Invariant { id: request.id, reason })?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut stored = request.clone();
        stored.version = 1;
        stored.updated_at = Utc::now();
        let body = serde_json::to_string(&stored)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO requests
                (id, state, version, envelope_id, provider_reference, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stored.id.to_string(),
                stored.state.as_str(),
                stored.version as i64,
                envelope_id(&stored),
                provider_reference(&stored),
                body,
                stored.created_at.to_rfc3339(),
                stored.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(request.id));
        }

        append_event_tx(&tx, event)?;
        tx.commit()?;

        *request = stored;
        Ok(())
    }

    /// Load the current version of a request
    pub fn load(&self, id: Uuid) -> Result<Request, StoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM requests WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Compare-and-swap write: succeeds only if the stored version still
    /// equals `request.version`. On success `request.version` is bumped.
    pub fn save(&self, request: &mut Request, event: Option<&Event>) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stored = write_request(&tx, request)?;
        if let Some(event) = event {
            append_event_tx(&tx, event)?;
        }
        tx.commit()?;

        *request = stored;
        Ok(())
    }

    /// Write the consent proof (write-once) together with the request
    pub fn record_consent(&self, request: &mut Request, event: &Event) -> Result<(), StoreError> {
        let proof = request.consent_proof.clone().ok_or_else(|| StoreError::Invariant {
            id: request.id,
            reason: "no consent proof to record".to_string(),
        })?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO consent_proofs (request_id, hash, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id.to_string(),
                proof.hash,
                serde_json::to_string(&proof)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateConsent(request.id));
        }

        let stored = write_request(&tx, request)?;
        append_event_tx(&tx, event)?;
        tx.commit()?;

        *request = stored;
        Ok(())
    }

    /// Apply an inbound event exactly once: the dedupe marker and the
    /// request write commit together or not at all.
    pub fn save_with_inbound(
        &self,
        request: &mut Request,
        source: &str,
        event_id: &str,
        event: &Event,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO inbound_events (source, event_id, request_id, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                source,
                event_id,
                request.id.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateInbound {
                source_name: source.to_string(),
                event_id: event_id.to_string(),
            });
        }

        let stored = write_request(&tx, request)?;
        append_event_tx(&tx, event)?;
        tx.commit()?;

        *request = stored;
        Ok(())
    }

    /// Whether an inbound event has already been applied
    pub fn has_inbound(&self, source: &str, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM inbound_events WHERE source = ?1 AND event_id = ?2",
                params![source, event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The persisted (write-once) consent proof for a request
    pub fn consent_proof(&self, id: Uuid) -> Result<Option<ConsentProof>, StoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM consent_proofs WHERE request_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn find_by_envelope(&self, envelope_id: &str) -> Result<Option<Request>, StoreError> {
        self.find_one("SELECT body FROM requests WHERE envelope_id = ?1", envelope_id)
    }

    pub fn find_by_provider_reference(&self, reference: &str) -> Result<Option<Request>, StoreError> {
        self.find_one(
            "SELECT body FROM requests WHERE provider_reference = ?1",
            reference,
        )
    }

    fn find_one(&self, sql: &str, key: &str) -> Result<Option<Request>, StoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Most recently updated requests first
    pub fn list(&self, limit: usize) -> Result<Vec<Request>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM requests ORDER BY updated_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut requests = Vec::new();
        for body in rows {
            requests.push(serde_json::from_str(&body?)?);
        }
        Ok(requests)
    }

    /// Ids of requests not in a final state (recovery candidates)
    pub fn list_active(&self) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM requests WHERE state NOT IN (?1, ?2, ?3) ORDER BY created_at",
        )?;
        let rows = stmt.query_map(
            params![
                State::Rejected.as_str(),
                State::Paid.as_str(),
                State::PaymentFailed.as_str()
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut ids = Vec::new();
        for id in rows {
            if let Ok(uuid) = Uuid::parse_str(&id?) {
                ids.push(uuid);
            }
        }
        Ok(ids)
    }

    /// Append an audit event outside of a request write
    pub fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (request_id, event_type, body) VALUES (?1, ?2, ?3)",
            params![
                event.request_id.to_string(),
                event.event_type.as_str(),
                serde_json::to_string(event)?
            ],
        )?;
        Ok(())
    }

    /// Replay the audit log of a request in order
    pub fn events(&self, id: Uuid) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM events WHERE request_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for body in rows {
            events.push(serde_json::from_str(&body?)?);
        }
        Ok(events)
    }
}

fn envelope_id(request: &Request) -> Option<String> {
    request
        .signature_status
        .as_ref()
        .map(|s| s.envelope_id.clone())
}

fn provider_reference(request: &Request) -> Option<String> {
    request
        .payment_record
        .as_ref()
        .and_then(|p| p.provider_reference.clone())
}

/// CAS update inside an open transaction; returns the stored copy
fn write_request(tx: &Transaction<'_>, request: &Request) -> Result<Request, StoreError> {
    request
        .check_invariants()
        .map_err(|reason| StoreError::Invariant { id: request.id, reason })?;

    let id = request.id.to_string();

    let recorded_hash: Option<String> = tx
        .query_row(
            "SELECT hash FROM consent_proofs WHERE request_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(hash) = recorded_hash {
        let same = request
            .consent_proof
            .as_ref()
            .map(|p| p.hash == hash)
            .unwrap_or(false);
        if !same {
            return Err(StoreError::Invariant {
                id: request.id,
                reason: "consent proof is immutable once recorded".to_string(),
            });
        }
    }

    let mut stored = request.clone();
    stored.version = request.version + 1;
    stored.updated_at = Utc::now();
    let body = serde_json::to_string(&stored)?;

    let updated = tx.execute(
        "UPDATE requests
         SET state = ?1, version = ?2, envelope_id = ?3, provider_reference = ?4,
             body = ?5, updated_at = ?6
         WHERE id = ?7 AND version = ?8",
        params![
            stored.state.as_str(),
            stored.version as i64,
            envelope_id(&stored),
            provider_reference(&stored),
            body,
            stored.updated_at.to_rfc3339(),
            id,
            request.version as i64,
        ],
    )?;

    if updated == 0 {
        let actual: Option<i64> = tx
            .query_row(
                "SELECT version FROM requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        return match actual {
            Some(actual) => Err(StoreError::Conflict {
                id: request.id,
                expected: request.version,
                actual: actual as u64,
            }),
            None => Err(StoreError::NotFound(request.id)),
        };
    }

    Ok(stored)
}

fn append_event_tx(tx: &Transaction<'_>, event: &Event) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO events (request_id, event_type, body) VALUES (?1, ?2, ?3)",
        params![
            event.request_id.to_string(),
            event.event_type.as_str(),
            serde_json::to_string(event)?
        ],
    )?;
    Ok(())
}

/// Generate an idempotency key for an external call
pub fn generate_idempotency_key(request_id: Uuid, step: StepKind, attempt: u32) -> String {
    format!("{}:{}:{}", request_id, step.name(), attempt)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8]) // First 16 hex chars (8 bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use std::collections::BTreeMap;

    fn created_event(request: &Request) -> Event {
        Event::new(
            request.id,
            None,
            EventType::RequestCreated,
            format!("{}:created", request.id),
            "Request created".to_string(),
            request.state,
        )
    }

    fn new_request() -> Request {
        Request::new("Switch my offer".to_string(), vec![], BTreeMap::new())
    }

    #[test]
    fn test_insert_and_load() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request, &event).unwrap();

        assert_eq!(request.version, 1);
        let loaded = store.load(request.id).unwrap();
        assert_eq!(loaded.id, request.id);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state, State::Created);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request.clone(), &event).unwrap();

        let err = store.insert(&mut request, &event).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_save_bumps_version() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request, &event).unwrap();

        request.state = State::Classified;
        store.save(&mut request, None).unwrap();
        assert_eq!(request.version, 2);
        assert_eq!(store.load(request.id).unwrap().state, State::Classified);
    }

    #[test]
    fn test_stale_write_is_rejected() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request, &event).unwrap();

        let mut first = store.load(request.id).unwrap();
        let mut second = store.load(request.id).unwrap();

        first.state = State::Classified;
        store.save(&mut first, None).unwrap();

        second.state = State::Rejected;
        let err = store.save(&mut second, None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        // The winning write is untouched
        assert_eq!(store.load(request.id).unwrap().state, State::Classified);
    }

    #[test]
    fn test_save_unknown_request() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        request.version = 1;
        let err = store.save(&mut request, None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_inbound_dedupe() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request, &event).unwrap();
        let event = created_event(&request);

        assert!(!store.has_inbound("signature", "evt-1").unwrap());
        store
            .save_with_inbound(&mut request, "signature", "evt-1", &event)
            .unwrap();
        assert!(store.has_inbound("signature", "evt-1").unwrap());

        let err = store
            .save_with_inbound(&mut request, "signature", "evt-1", &event)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInbound { .. }));
        // Rolled back: version unchanged by the rejected write
        assert_eq!(store.load(request.id).unwrap().version, 2);
    }

    #[test]
    fn test_events_replay_in_order() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut request = new_request();
        let event = created_event(&request);
        store.insert(&mut request, &event).unwrap();

        for i in 0..3 {
            let event = Event::new(
                request.id,
                Some(StepKind::Classification),
                EventType::StepRetrying,
                format!("{}:classification:1", request.id),
                format!("retry {}", i),
                State::Created,
            );
            store.append_event(&event).unwrap();
        }

        let events = store.events(request.id).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type, EventType::RequestCreated);
        assert_eq!(events[3].payload_summary, "retry 2");
    }

    #[test]
    fn test_list_active_skips_final_states() {
        let store = RequestStore::open_in_memory().unwrap();
        let mut active = new_request();
        let event = created_event(&active);
        store.insert(&mut active, &event).unwrap();

        let mut done = new_request();
        done.state = State::Rejected;
        let event = created_event(&done);
        store.insert(&mut done, &event).unwrap();

        let ids = store.list_active().unwrap();
        assert_eq!(ids, vec![active.id]);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("requests.db");

        let mut request = new_request();
        {
            let store = RequestStore::open(&path).unwrap();
            let event = created_event(&request);
            store.insert(&mut request, &event).unwrap();
        }

        let store = RequestStore::open(&path).unwrap();
        assert_eq!(store.load(request.id).unwrap().description, "Switch my offer");
    }

    #[test]
    fn test_idempotency_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = generate_idempotency_key(id, StepKind::Contract, 2);
        assert_eq!(key, "550e8400-e29b-41d4-a716-446655440000:contract:2");
    }

    #[test]
    fn test_input_hash_consistency() {
        let hash1 = hash_input("test input");
        let hash2 = hash_input("test input");
        let hash3 = hash_input("different input");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 8 bytes = 16 hex chars
    }
}
