//! Transaction identity hashes and the duplicate check against persisted rows.

use std::collections::HashMap;

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::fingerprint::normalize_text;
use crate::models::{Bank, DocumentType, TransactionDraft};
use crate::money::format_date;

const SEPARATOR: &str = "\u{1f}";

/// The hashed fields of a draft, in hashing order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub user_id: String,
    pub description: String,
    pub date: String,
    pub amount: i64,
    pub installment_sequence: Option<u32>,
    pub bank: Bank,
    pub document_type: DocumentType,
}

impl IdentityKey {
    pub fn of(user_id: &str, draft: &TransactionDraft) -> Self {
        Self {
            user_id: user_id.to_string(),
            description: normalize_text(&draft.description),
            date: format_date(draft.date),
            amount: draft.amount,
            installment_sequence: draft.installment_sequence,
            bank: draft.source_bank,
            document_type: draft.source_document_type,
        }
    }

    /// SHA-256 over the fields. `occurrence` is the 1-based position among
    /// identical rows of one file; the first occurrence hashes the plain key.
    pub fn hash(&self, occurrence: usize) -> String {
        let sequence = self.installment_sequence.map(|s| s.to_string()).unwrap_or_default();
        let amount = self.amount.to_string();
        let mut parts: Vec<&str> = vec![
            self.user_id.as_str(),
            self.description.as_str(),
            self.date.as_str(),
            amount.as_str(),
            sequence.as_str(),
            self.bank.key(),
            self.document_type.key(),
        ];
        let ordinal = occurrence.to_string();
        if occurrence > 1 {
            parts.push(ordinal.as_str());
        }
        let mut hasher = Sha256::new();
        hasher.update(parts.join(SEPARATOR).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Fills `identity_hash` on every draft, keeping repeated identical rows
/// within the batch distinct.
pub fn assign_identity_hashes(user_id: &str, drafts: &mut [TransactionDraft]) {
    let mut seen: HashMap<IdentityKey, usize> = HashMap::new();
    for draft in drafts.iter_mut() {
        let key = IdentityKey::of(user_id, draft);
        let occurrence = seen.entry(key.clone()).or_insert(0);
        *occurrence += 1;
        draft.identity_hash = key.hash(*occurrence);
    }
}

pub fn is_duplicate(conn: &Connection, user_id: &str, identity_hash: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM transactions WHERE user_id = ?1 AND identity_hash = ?2")?;
    Ok(stmt.exists(rusqlite::params![user_id, identity_hash])?)
}

/// Flags drafts already persisted for this user; returns how many were.
pub fn mark_duplicates(conn: &Connection, user_id: &str, drafts: &mut [TransactionDraft]) -> Result<usize> {
    let mut count = 0;
    for draft in drafts.iter_mut() {
        draft.is_duplicate = is_duplicate(conn, user_id, &draft.identity_hash)?;
        if draft.is_duplicate {
            count += 1;
        }
    }
    Ok(count)
}
