//! Upload batch records and the transactions they own: creation, status
//! updates, history, atomic confirm and cascading delete.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::date_column;
use crate::error::{ExtratoError, Result};
use crate::identity::is_duplicate;
use crate::models::{
    Bank, BatchStatus, ClassificationStats, DocumentType, Transaction, TransactionDraft, UploadBatch,
};
use crate::money::format_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOutcome {
    pub imported_count: usize,
    pub duplicate_count: usize,
    pub classification_stats: ClassificationStats,
}

/// Counts recorded when a batch's preview becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewCounts {
    pub bank: Bank,
    pub document_type: DocumentType,
    pub total_rows: usize,
    pub duplicate_count: usize,
    pub excluded_count: usize,
    pub skipped_count: usize,
    pub classification_stats: ClassificationStats,
}

const BATCH_COLUMNS: &str = "id, session_id, user_id, bank, document_type, file_name, status, total_rows, \
     imported_count, duplicate_count, excluded_count, skipped_count, classification_stats, error_reason, \
     created_at, confirmed_at";

fn batch_from_row(row: &rusqlite::Row) -> rusqlite::Result<UploadBatch> {
    let stats: Option<String> = row.get(12)?;
    Ok(UploadBatch {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        bank: row.get(3)?,
        document_type: row.get(4)?,
        file_name: row.get(5)?,
        status: row.get(6)?,
        total_rows: row.get(7)?,
        imported_count: row.get(8)?,
        duplicate_count: row.get(9)?,
        excluded_count: row.get(10)?,
        skipped_count: row.get(11)?,
        classification_stats: stats
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        error_reason: row.get(13)?,
        created_at: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        confirmed_at: row.get(15)?,
    })
}

fn stats_json(stats: &ClassificationStats) -> String {
    serde_json::to_string(stats).unwrap_or_default()
}

pub fn create_batch(conn: &Connection, session_id: &str, user_id: &str, file_name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO upload_batches (session_id, user_id, file_name, status) VALUES (?1, ?2, ?3, ?4)",
        params![session_id, user_id, file_name, BatchStatus::Processing],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_batch(conn: &Connection, user_id: &str, id: i64) -> Result<Option<UploadBatch>> {
    Ok(conn
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM upload_batches WHERE id = ?1 AND user_id = ?2"),
            params![id, user_id],
            batch_from_row,
        )
        .optional()?)
}

pub fn mark_ready(conn: &Connection, batch_id: i64, counts: &PreviewCounts) -> Result<()> {
    conn.execute(
        "UPDATE upload_batches SET status = ?1, bank = ?2, document_type = ?3, total_rows = ?4, \
         duplicate_count = ?5, excluded_count = ?6, skipped_count = ?7, classification_stats = ?8, \
         error_reason = NULL \
         WHERE id = ?9",
        params![
            BatchStatus::Ready,
            counts.bank,
            counts.document_type,
            counts.total_rows as i64,
            counts.duplicate_count as i64,
            counts.excluded_count as i64,
            counts.skipped_count as i64,
            stats_json(&counts.classification_stats),
            batch_id,
        ],
    )?;
    Ok(())
}

pub fn mark_error(conn: &Connection, batch_id: i64, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE upload_batches SET status = ?1, error_reason = ?2 WHERE id = ?3",
        params![BatchStatus::Error, reason, batch_id],
    )?;
    Ok(())
}

/// Batches newest first, optionally filtered by status.
pub fn list_history(
    conn: &Connection,
    user_id: &str,
    limit: usize,
    offset: usize,
    status: Option<BatchStatus>,
) -> Result<Vec<UploadBatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BATCH_COLUMNS} FROM upload_batches \
         WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2) \
         ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
    ))?;
    let batches = stmt
        .query_map(params![user_id, status, limit as i64, offset as i64], batch_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(batches)
}

fn insert_transaction(conn: &Connection, user_id: &str, batch_id: i64, draft: &TransactionDraft) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO transactions (user_id, batch_id, identity_hash, date, description, fingerprint, amount, \
         direction, source_bank, source_document_type, installment_sequence, installment_total, installment_key, \
         group_name, subgroup, spending_type, general_category, classification_origin) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            user_id,
            batch_id,
            draft.identity_hash,
            format_date(draft.date),
            draft.description,
            draft.fingerprint,
            draft.amount,
            draft.direction,
            draft.source_bank,
            draft.source_document_type,
            draft.installment_sequence,
            draft.installment_total,
            draft.installment_key,
            draft.group,
            draft.subgroup,
            draft.spending_type,
            draft.general_category,
            draft.classification_origin,
        ],
    )
}

/// Persists a ready batch's drafts in one IMMEDIATE transaction. Duplicates
/// are rechecked under the write lock and counted, never inserted. Either
/// every non-duplicate draft lands and the batch is confirmed, or nothing
/// changes.
pub fn confirm_batch(
    conn: &mut Connection,
    user_id: &str,
    batch_id: i64,
    drafts: &[TransactionDraft],
) -> Result<ConfirmOutcome> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(ExtratoError::persistence)?;

    let status: Option<BatchStatus> = tx
        .query_row(
            "SELECT status FROM upload_batches WHERE id = ?1 AND user_id = ?2",
            params![batch_id, user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(ExtratoError::persistence)?;
    match status {
        None => return Err(ExtratoError::UnknownBatch(batch_id)),
        Some(BatchStatus::Ready) => {}
        Some(other) => {
            return Err(ExtratoError::InvalidState {
                expected: BatchStatus::Ready.key().to_string(),
                actual: other.key().to_string(),
            })
        }
    }

    let mut imported = 0;
    let mut duplicates = 0;
    let mut stats = ClassificationStats::default();
    for draft in drafts {
        if draft.is_duplicate || is_duplicate(&tx, user_id, &draft.identity_hash)? {
            duplicates += 1;
            continue;
        }
        insert_transaction(&tx, user_id, batch_id, draft).map_err(ExtratoError::persistence)?;
        stats.record(draft.classification_origin);
        imported += 1;
    }

    tx.execute(
        "UPDATE upload_batches SET status = ?1, imported_count = ?2, duplicate_count = ?3, \
         classification_stats = ?4, confirmed_at = datetime('now') WHERE id = ?5",
        params![BatchStatus::Confirmed, imported as i64, duplicates as i64, stats_json(&stats), batch_id],
    )
    .map_err(ExtratoError::persistence)?;
    tx.commit().map_err(ExtratoError::persistence)?;

    info!(batch_id, imported, duplicates, "batch confirmed");
    Ok(ConfirmOutcome {
        imported_count: imported,
        duplicate_count: duplicates,
        classification_stats: stats,
    })
}

/// Removes a batch and every transaction it imported, atomically. Returns
/// how many transactions went with it.
pub fn delete_batch(conn: &mut Connection, user_id: &str, batch_id: i64) -> Result<usize> {
    if get_batch(conn, user_id, batch_id)?.is_none() {
        return Err(ExtratoError::UnknownBatch(batch_id));
    }
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(ExtratoError::persistence)?;
    let deleted = tx
        .execute(
            "DELETE FROM transactions WHERE batch_id = ?1 AND user_id = ?2",
            params![batch_id, user_id],
        )
        .map_err(ExtratoError::persistence)?;
    let removed = tx
        .execute(
            "DELETE FROM upload_batches WHERE id = ?1 AND user_id = ?2",
            params![batch_id, user_id],
        )
        .map_err(ExtratoError::persistence)?;
    if removed == 0 {
        warn!(batch_id, "batch disappeared during delete");
        return Err(ExtratoError::UnknownBatch(batch_id));
    }
    tx.commit().map_err(ExtratoError::persistence)?;
    info!(batch_id, deleted, "batch deleted");
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Persisted transactions
// ---------------------------------------------------------------------------

pub(crate) const TRANSACTION_COLUMNS: &str = "id, user_id, batch_id, identity_hash, date, description, fingerprint, \
     amount, direction, source_bank, source_document_type, installment_sequence, installment_total, \
     installment_key, group_name, subgroup, spending_type, general_category, classification_origin, created_at";

pub(crate) fn transaction_from_row(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        batch_id: row.get(2)?,
        identity_hash: row.get(3)?,
        date: date_column(row, 4)?,
        description: row.get(5)?,
        fingerprint: row.get(6)?,
        amount: row.get(7)?,
        direction: row.get(8)?,
        source_bank: row.get(9)?,
        source_document_type: row.get(10)?,
        installment_sequence: row.get(11)?,
        installment_total: row.get(12)?,
        installment_key: row.get(13)?,
        group: row.get(14)?,
        subgroup: row.get(15)?,
        spending_type: row.get(16)?,
        general_category: row.get(17)?,
        classification_origin: row.get(18)?,
        created_at: row.get::<_, Option<String>>(19)?.unwrap_or_default(),
    })
}

pub fn get_transaction(conn: &Connection, user_id: &str, id: i64) -> Result<Option<Transaction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1 AND user_id = ?2"),
            params![id, user_id],
            transaction_from_row,
        )
        .optional()?)
}

pub fn list_batch_transactions(conn: &Connection, user_id: &str, batch_id: i64) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE batch_id = ?1 AND user_id = ?2 ORDER BY date, id"
    ))?;
    let rows = stmt
        .query_map(params![batch_id, user_id], transaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
