//! Exclusion rules and the filter that drops matching drafts before they are
//! hashed, deduplicated or counted as imported.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::error::{ExtratoError, Result};
use crate::fingerprint::merchant_fingerprint;
use crate::models::{Bank, DocumentScope, DocumentType, ExclusionAction, ExclusionRule, TransactionDraft};

#[derive(Debug, Clone, PartialEq)]
pub struct NewExclusionRule {
    pub user_id: String,
    /// Free text; normalized to a merchant fingerprint on save.
    pub merchant_fingerprint: String,
    pub bank: Option<Bank>,
    pub document_scope: DocumentScope,
    pub action: ExclusionAction,
}

fn rule_from_row(row: &rusqlite::Row) -> rusqlite::Result<ExclusionRule> {
    Ok(ExclusionRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        merchant_fingerprint: row.get(2)?,
        bank: row.get(3)?,
        document_scope: row.get(4)?,
        action: row.get(5)?,
        is_active: row.get(6)?,
    })
}

const RULE_COLUMNS: &str = "id, user_id, merchant_fingerprint, bank, document_scope, action, is_active";

pub fn get_exclusion_rule(conn: &Connection, user_id: &str, id: i64) -> Result<Option<ExclusionRule>> {
    Ok(conn
        .query_row(
            &format!("SELECT {RULE_COLUMNS} FROM exclusion_rules WHERE id = ?1 AND user_id = ?2"),
            params![id, user_id],
            rule_from_row,
        )
        .optional()?)
}

pub fn create_exclusion_rule(conn: &Connection, rule: &NewExclusionRule) -> Result<ExclusionRule> {
    let fingerprint = merchant_fingerprint(&rule.merchant_fingerprint);
    if fingerprint.is_empty() {
        return Err(ExtratoError::Other("An exclusion rule needs a merchant description".into()));
    }
    conn.execute(
        "INSERT INTO exclusion_rules (user_id, merchant_fingerprint, bank, document_scope, action) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![rule.user_id, fingerprint, rule.bank, rule.document_scope, rule.action],
    )?;
    let id = conn.last_insert_rowid();
    info!(id, %fingerprint, "exclusion rule created");
    get_exclusion_rule(conn, &rule.user_id, id)?
        .ok_or_else(|| ExtratoError::Other("exclusion rule vanished after insert".into()))
}

pub fn list_exclusion_rules(conn: &Connection, user_id: &str, include_inactive: bool) -> Result<Vec<ExclusionRule>> {
    let sql = if include_inactive {
        format!("SELECT {RULE_COLUMNS} FROM exclusion_rules WHERE user_id = ?1 ORDER BY id")
    } else {
        format!("SELECT {RULE_COLUMNS} FROM exclusion_rules WHERE user_id = ?1 AND is_active = 1 ORDER BY id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map([user_id], rule_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub fn deactivate_exclusion_rule(conn: &Connection, user_id: &str, id: i64) -> Result<ExclusionRule> {
    match get_exclusion_rule(conn, user_id, id)? {
        None => Err(ExtratoError::Other(format!("No exclusion rule with ID {id}"))),
        Some(rule) if !rule.is_active => Err(ExtratoError::Other(format!("Exclusion rule {id} is already inactive"))),
        Some(rule) => {
            conn.execute("UPDATE exclusion_rules SET is_active = 0 WHERE id = ?1", [id])?;
            Ok(ExclusionRule {
                is_active: false,
                ..rule
            })
        }
    }
}

/// Deletes already-persisted transactions the rule matches. Only runs on
/// explicit request; rules otherwise act at ingestion time.
pub fn apply_rule_to_existing(conn: &mut Connection, user_id: &str, rule_id: i64) -> Result<usize> {
    let rule = get_exclusion_rule(conn, user_id, rule_id)?
        .ok_or_else(|| ExtratoError::Other(format!("No exclusion rule with ID {rule_id}")))?;
    if !rule.is_active {
        return Err(ExtratoError::Other(format!("Exclusion rule {rule_id} is inactive")));
    }

    let mut sql = String::from("DELETE FROM transactions WHERE user_id = ?1 AND fingerprint = ?2");
    if rule.bank.is_some() {
        sql.push_str(" AND source_bank = ?3");
    } else {
        sql.push_str(" AND ?3 IS NULL");
    }
    match rule.document_scope {
        DocumentScope::Card => sql.push_str(" AND source_document_type = 'invoice'"),
        DocumentScope::Statement => sql.push_str(" AND source_document_type = 'statement'"),
        DocumentScope::Any => {}
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(ExtratoError::persistence)?;
    let deleted = tx
        .execute(&sql, params![user_id, rule.merchant_fingerprint, rule.bank])
        .map_err(ExtratoError::persistence)?;
    tx.commit().map_err(ExtratoError::persistence)?;

    info!(rule_id, deleted, "exclusion rule applied to existing transactions");
    Ok(deleted)
}

/// Active rules for one user, matched by exact fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    rules: Vec<ExclusionRule>,
}

impl ExclusionFilter {
    pub fn load(conn: &Connection, user_id: &str) -> Result<Self> {
        Ok(Self::from_rules(list_exclusion_rules(conn, user_id, false)?))
    }

    pub fn from_rules(rules: Vec<ExclusionRule>) -> Self {
        Self {
            rules: rules.into_iter().filter(|r| r.is_active).collect(),
        }
    }

    pub fn matches(&self, fingerprint: &str, bank: Bank, document_type: DocumentType) -> bool {
        self.rules.iter().any(|rule| {
            rule.action == ExclusionAction::Exclude
                && rule.merchant_fingerprint == fingerprint
                && rule.bank.map_or(true, |b| b == bank)
                && rule.document_scope.covers(document_type)
        })
    }

    /// Splits off excluded drafts; returns the kept drafts in order and how
    /// many were excluded.
    pub fn apply(&self, drafts: Vec<TransactionDraft>) -> (Vec<TransactionDraft>, usize) {
        let before = drafts.len();
        let kept: Vec<TransactionDraft> = drafts
            .into_iter()
            .filter(|d| !self.matches(&d.fingerprint, d.source_bank, d.source_document_type))
            .collect();
        let excluded = before - kept.len();
        (kept, excluded)
    }
}
