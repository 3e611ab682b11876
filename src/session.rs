//! Upload sessions: one in-flight upload per id, held in memory until its
//! TTL runs out. Expiry frees the raw file bytes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ExtratoError, Result};
use crate::models::{
    Bank, BatchStatus, ClassificationStats, DocumentType, FileKind, SkippedRow, TransactionDraft,
};

/// What `process` learned about a file, surfaced alongside the preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetadata {
    pub bank: Bank,
    pub document_type: DocumentType,
    pub file_kind: FileKind,
    /// Drafts in the preview, after exclusion. Duplicates are included.
    pub total_transactions: usize,
    /// Lines the normalizer looked at, transaction or not.
    pub total_rows: usize,
    pub skipped_rows: usize,
    pub skipped: Vec<SkippedRow>,
    pub excluded_count: usize,
    pub duplicate_count: usize,
    pub installment_continuity_copied: usize,
    pub classification_stats: ClassificationStats,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub batch_id: i64,
    pub file_name: String,
    pub extension: String,
    pub bank_hint: Option<Bank>,
    pub document_type_hint: Option<DocumentType>,
    raw: Option<Vec<u8>>,
    status: BatchStatus,
    pub drafts: Vec<TransactionDraft>,
    pub metadata: Option<ProcessMetadata>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Session data as handed to callers: everything but the raw bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: Uuid,
    pub batch_id: i64,
    pub file_name: String,
    pub status: BatchStatus,
    pub transactions: Vec<TransactionDraft>,
    pub metadata: Option<ProcessMetadata>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct NewSession {
    pub user_id: String,
    pub batch_id: i64,
    pub file_name: String,
    pub bank_hint: Option<Bank>,
    pub document_type_hint: Option<DocumentType>,
    pub bytes: Vec<u8>,
}

fn extension_of(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn invalid(expected: &str, actual: BatchStatus) -> ExtratoError {
    ExtratoError::InvalidState {
        expected: expected.to_string(),
        actual: actual.key().to_string(),
    }
}

impl Session {
    pub fn new(id: Uuid, new: NewSession, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id,
            extension: extension_of(&new.file_name),
            user_id: new.user_id,
            batch_id: new.batch_id,
            file_name: new.file_name,
            bank_hint: new.bank_hint,
            document_type_hint: new.document_type_hint,
            raw: Some(new.bytes),
            status: BatchStatus::Processing,
            drafts: Vec::new(),
            metadata: None,
            error: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn raw(&self) -> Result<&[u8]> {
        self.raw.as_deref().ok_or(ExtratoError::SessionExpired)
    }

    /// Enters `processing`. A `ready` session may be processed again; the
    /// previous preview is dropped.
    pub fn begin_processing(&mut self) -> Result<()> {
        match self.status {
            BatchStatus::Processing => {}
            BatchStatus::Ready => {
                self.status = BatchStatus::Processing;
                self.drafts.clear();
                self.metadata = None;
            }
            other => return Err(invalid("processing or ready", other)),
        }
        Ok(())
    }

    pub fn mark_ready(&mut self, drafts: Vec<TransactionDraft>, metadata: ProcessMetadata) -> Result<()> {
        if self.status != BatchStatus::Processing {
            return Err(invalid("processing", self.status));
        }
        self.drafts = drafts;
        self.metadata = Some(metadata);
        self.error = None;
        self.status = BatchStatus::Ready;
        Ok(())
    }

    /// Terminal. The raw bytes are no longer needed.
    pub fn mark_error(&mut self, reason: String) -> Result<()> {
        if self.status != BatchStatus::Processing {
            return Err(invalid("processing", self.status));
        }
        self.error = Some(reason);
        self.raw = None;
        self.status = BatchStatus::Error;
        Ok(())
    }

    /// Fails unless the session is `ready`; a confirmed session never
    /// confirms again.
    pub fn ensure_confirmable(&self) -> Result<()> {
        if self.status != BatchStatus::Ready {
            return Err(invalid("ready", self.status));
        }
        Ok(())
    }

    pub fn mark_confirmed(&mut self) -> Result<()> {
        self.ensure_confirmable()?;
        self.status = BatchStatus::Confirmed;
        self.raw = None;
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            batch_id: self.batch_id,
            file_name: self.file_name.clone(),
            status: self.status,
            transactions: self.drafts.clone(),
            metadata: self.metadata.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug, Default)]
struct Entries {
    /// Handles with their expiry, so sweeping never waits on a busy session.
    live: HashMap<Uuid, (DateTime<Utc>, SessionHandle)>,
    /// Ids evicted by expiry, with when they were evicted.
    expired: HashMap<Uuid, DateTime<Utc>>,
}

/// TTL-bounded session arena. The map lock is held only for lookups; each
/// session carries its own lock so uploads never wait on each other.
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, id: Uuid, new: NewSession, now: DateTime<Utc>) -> SessionHandle {
        self.sweep(now);
        let session = Session::new(id, new, now, self.ttl);
        let expires_at = session.expires_at;
        let handle = Arc::new(Mutex::new(session));
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.live.insert(id, (expires_at, Arc::clone(&handle)));
        debug!(%id, "session created");
        handle
    }

    pub fn get(&self, id: Uuid, now: DateTime<Utc>) -> Result<SessionHandle> {
        self.sweep(now);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = entries.live.get(&id) {
            return Ok(Arc::clone(handle));
        }
        if entries.expired.contains_key(&id) {
            Err(ExtratoError::SessionExpired)
        } else {
            Err(ExtratoError::SessionNotFound)
        }
    }

    /// Evicts expired sessions and frees their raw bytes; returns how many
    /// were evicted. Tombstones are kept for one more TTL. A session busy in
    /// another call is only unlinked; its bytes go when that call drops it.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let evicted: Vec<SessionHandle> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<Uuid> = entries
                .live
                .iter()
                .filter(|(_, (expires_at, _))| now >= *expires_at)
                .map(|(id, _)| *id)
                .collect();

            let mut evicted = Vec::with_capacity(expired.len());
            for id in expired {
                if let Some((_, handle)) = entries.live.remove(&id) {
                    evicted.push(handle);
                }
                entries.expired.insert(id, now);
            }
            let ttl = self.ttl;
            entries.expired.retain(|_, evicted_at| now - *evicted_at < ttl);
            evicted
        };

        for handle in &evicted {
            let session = match handle.try_lock() {
                Ok(session) => Some(session),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(mut session) = session {
                session.raw = None;
                session.drafts = Vec::new();
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "expired upload sessions evicted");
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(bytes: &[u8]) -> NewSession {
        NewSession {
            user_id: "local".into(),
            batch_id: 1,
            file_name: "Fatura.CSV".into(),
            bank_hint: None,
            document_type_hint: None,
            bytes: bytes.to_vec(),
        }
    }

    fn metadata() -> ProcessMetadata {
        ProcessMetadata {
            bank: Bank::Nubank,
            document_type: DocumentType::Invoice,
            file_kind: FileKind::DelimitedTable,
            total_transactions: 0,
            total_rows: 0,
            skipped_rows: 0,
            skipped: vec![],
            excluded_count: 0,
            duplicate_count: 0,
            installment_continuity_copied: 0,
            classification_stats: ClassificationStats::default(),
        }
    }

    #[test]
    fn test_session_keeps_extension_and_bytes() {
        let store = SessionStore::new(Duration::hours(24));
        let handle = store.insert(Uuid::new_v4(), new_session(b"date,title,amount"), Utc::now());
        let session = handle.lock().unwrap();
        assert_eq!(session.extension, "csv");
        assert_eq!(session.raw().unwrap(), b"date,title,amount");
        assert_eq!(session.status(), BatchStatus::Processing);
    }

    #[test]
    fn test_unknown_and_expired_ids() {
        let store = SessionStore::new(Duration::hours(24));
        let now = Utc::now();
        assert!(matches!(store.get(Uuid::new_v4(), now), Err(ExtratoError::SessionNotFound)));

        let handle = store.insert(Uuid::new_v4(), new_session(b"x"), now);
        let id = handle.lock().unwrap().id;
        assert!(store.get(id, now + Duration::hours(23)).is_ok());
        assert!(matches!(store.get(id, now + Duration::hours(24)), Err(ExtratoError::SessionExpired)));
        assert!(store.is_empty());
        // Expiry freed the bytes even though a handle is still alive.
        assert!(matches!(handle.lock().unwrap().raw(), Err(ExtratoError::SessionExpired)));
        // The tombstone eventually goes too.
        assert!(matches!(store.get(id, now + Duration::hours(49)), Err(ExtratoError::SessionNotFound)));
    }

    #[test]
    fn test_sweep_does_not_wait_on_busy_session() {
        let store = SessionStore::new(Duration::hours(24));
        let now = Utc::now();
        let busy = store.insert(Uuid::new_v4(), new_session(b"busy"), now);
        let idle = store.insert(Uuid::new_v4(), new_session(b"idle"), now);
        let busy_id = busy.lock().unwrap().id;

        let guard = busy.lock().unwrap();
        assert_eq!(store.sweep(now + Duration::hours(25)), 2);
        assert!(matches!(store.get(busy_id, now + Duration::hours(25)), Err(ExtratoError::SessionExpired)));
        assert!(matches!(idle.lock().unwrap().raw(), Err(ExtratoError::SessionExpired)));
        drop(guard);

        // Unlinked from the store: the last handle owns the bytes.
        assert_eq!(Arc::strong_count(&busy), 1);
    }

    #[test]
    fn test_state_machine() {
        let mut session = Session::new(Uuid::new_v4(), new_session(b"x"), Utc::now(), Duration::hours(1));
        assert!(matches!(session.ensure_confirmable(), Err(ExtratoError::InvalidState { .. })));
        session.begin_processing().unwrap();
        session.mark_ready(vec![], metadata()).unwrap();
        assert_eq!(session.status(), BatchStatus::Ready);

        // ready -> processing -> ready is a re-run
        session.begin_processing().unwrap();
        session.mark_ready(vec![], metadata()).unwrap();

        session.mark_confirmed().unwrap();
        assert!(matches!(session.mark_confirmed(), Err(ExtratoError::InvalidState { .. })));
        assert!(matches!(session.begin_processing(), Err(ExtratoError::InvalidState { .. })));
    }

    #[test]
    fn test_error_is_terminal() {
        let mut session = Session::new(Uuid::new_v4(), new_session(b"x"), Utc::now(), Duration::hours(1));
        session.mark_error("Could not detect the bank".into()).unwrap();
        assert_eq!(session.status(), BatchStatus::Error);
        assert!(session.raw().is_err());
        assert!(session.begin_processing().is_err());
        assert!(session.mark_confirmed().is_err());
        assert_eq!(session.view().error.as_deref(), Some("Could not detect the bank"));
    }
}
