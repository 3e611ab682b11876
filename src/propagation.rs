//! Manual reclassification of persisted transactions and its propagation to
//! sibling installments and same-merchant rows.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use tracing::info;

use crate::batches::get_transaction;
use crate::classifier::{get_pattern, upsert_pattern};
use crate::db::resolve_target;
use crate::error::{ExtratoError, Result};
use crate::installments::sibling_count;
use crate::models::{ClassificationOrigin, GeneralCategory, GroupConfig, SpendingType, Transaction};
use crate::scopes::{Mode, Scope, WriteScopes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagateInfo {
    pub same_installment_count: i64,
    pub has_pattern: bool,
    /// Other rows with the same fingerprint that pattern propagation would
    /// touch.
    pub same_pattern_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReclassifyRequest {
    pub transaction_id: i64,
    /// Defaults to the transaction's current group.
    pub group: Option<String>,
    /// Kept from the transaction when the group is unchanged and none is given.
    pub subgroup: Option<String>,
    pub propagate_installments: bool,
    pub propagate_pattern: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclassifyOutcome {
    pub transaction_id: i64,
    pub group: String,
    pub subgroup: Option<String>,
    pub spending_type: Option<SpendingType>,
    pub general_category: GeneralCategory,
    pub installments_updated: usize,
    pub pattern_updated: usize,
}

const PATTERN_ORIGINS: &str = "('historical-pattern', 'unclassified')";

fn same_pattern_count(conn: &Connection, user_id: &str, txn: &Transaction) -> Result<i64> {
    Ok(conn.query_row(
        &format!(
            "SELECT count(*) FROM transactions \
             WHERE user_id = ?1 AND fingerprint = ?2 AND id != ?3 AND classification_origin IN {PATTERN_ORIGINS}"
        ),
        params![user_id, txn.fingerprint, txn.id],
        |row| row.get(0),
    )?)
}

fn load(conn: &Connection, user_id: &str, transaction_id: i64) -> Result<Transaction> {
    get_transaction(conn, user_id, transaction_id)?.ok_or(ExtratoError::UnknownTransaction(transaction_id))
}

/// What propagation would reach from this transaction, so the caller can
/// offer "apply to all N installments" before reclassifying.
pub fn propagate_info(conn: &Connection, user_id: &str, transaction_id: i64) -> Result<PropagateInfo> {
    let txn = load(conn, user_id, transaction_id)?;
    let same_installment_count = match &txn.installment_key {
        Some(key) => sibling_count(conn, user_id, key, txn.id)?,
        None => 0,
    };
    Ok(PropagateInfo {
        same_installment_count,
        has_pattern: get_pattern(conn, user_id, &txn.fingerprint)?.is_some(),
        same_pattern_count: same_pattern_count(conn, user_id, &txn)?,
    })
}

/// Groups currently carried by the rows a reclassification will touch.
fn touched_groups(conn: &Connection, user_id: &str, txn: &Transaction, request: &ReclassifyRequest) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT group_name FROM transactions \
         WHERE user_id = ?1 AND group_name IS NOT NULL AND ( \
             id = ?2 \
             OR (?3 AND installment_key = ?4) \
             OR (?5 AND fingerprint = ?6 AND classification_origin IN {PATTERN_ORIGINS}))"
    ))?;
    let groups = stmt
        .query_map(
            params![
                user_id,
                txn.id,
                request.propagate_installments,
                txn.installment_key,
                request.propagate_pattern,
                txn.fingerprint
            ],
            |row| row.get(0),
        )?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(groups)
}

fn set_classification(
    conn: &Connection,
    where_sql: &str,
    config: &GroupConfig,
    subgroup: Option<&str>,
    origin: ClassificationOrigin,
    args: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<usize> {
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&config.name, &subgroup, &config.spending_type, &config.general_category, &origin];
    values.extend_from_slice(args);
    conn.execute(
        &format!(
            "UPDATE transactions SET group_name = ?1, subgroup = ?2, spending_type = ?3, general_category = ?4, \
             classification_origin = ?5 WHERE {where_sql}"
        ),
        values.as_slice(),
    )
}

/// Manually reclassifies one transaction. Optionally carries the decision to
/// every installment of the same purchase and to same-fingerprint rows that
/// were never manually classified. The learned pattern is always recorded.
/// Spending type and general category always come from the target group.
pub fn update_transaction(
    conn: &mut Connection,
    scopes: &WriteScopes,
    user_id: &str,
    request: &ReclassifyRequest,
) -> Result<ReclassifyOutcome> {
    let txn = load(conn, user_id, request.transaction_id)?;

    let group = match (&request.group, &txn.group) {
        (Some(g), _) => g.clone(),
        (None, Some(current)) => current.clone(),
        (None, None) => return Err(ExtratoError::Other("Choose a group for this transaction".into())),
    };
    let group_changed = txn.group.as_deref().map_or(true, |current| !current.eq_ignore_ascii_case(&group));
    let subgroup = match (&request.subgroup, group_changed) {
        (Some(s), _) => Some(s.clone()),
        (None, false) => txn.subgroup.clone(),
        (None, true) => None,
    };
    let (config, subgroup) = resolve_target(conn, &group, subgroup.as_deref())?;

    let installment_key = txn.installment_key.clone().filter(|_| request.propagate_installments);

    let mut wanted = vec![
        (Scope::fingerprint(user_id, &txn.fingerprint), Mode::Exclusive),
        (Scope::group(user_id, &config.name), Mode::Shared),
    ];
    if let Some(key) = &installment_key {
        wanted.push((Scope::installment_key(user_id, key), Mode::Exclusive));
    }
    for touched in touched_groups(conn, user_id, &txn, request)? {
        wanted.push((Scope::group(user_id, &touched), Mode::Shared));
    }
    let _guard = scopes.acquire(&wanted)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(ExtratoError::persistence)?;

    set_classification(
        &tx,
        "id = ?6 AND user_id = ?7",
        &config,
        subgroup.as_deref(),
        ClassificationOrigin::Manual,
        &[&txn.id, &user_id],
    )
    .map_err(ExtratoError::persistence)?;

    let installments_updated = match &installment_key {
        Some(key) => set_classification(
            &tx,
            "user_id = ?6 AND installment_key = ?7 AND id != ?8",
            &config,
            subgroup.as_deref(),
            ClassificationOrigin::InstallmentContinuity,
            &[&user_id, key, &txn.id],
        )
        .map_err(ExtratoError::persistence)?,
        None => 0,
    };

    let pattern_updated = if request.propagate_pattern {
        set_classification(
            &tx,
            &format!("user_id = ?6 AND fingerprint = ?7 AND id != ?8 AND classification_origin IN {PATTERN_ORIGINS}"),
            &config,
            subgroup.as_deref(),
            ClassificationOrigin::HistoricalPattern,
            &[&user_id, &txn.fingerprint, &txn.id],
        )
        .map_err(ExtratoError::persistence)?
    } else {
        0
    };

    upsert_pattern(&tx, user_id, &txn.fingerprint, &config.name, subgroup.as_deref(), config.spending_type)
        .map_err(ExtratoError::persistence)?;
    tx.commit().map_err(ExtratoError::persistence)?;

    info!(
        transaction_id = txn.id,
        group = %config.name,
        installments_updated,
        pattern_updated,
        "transaction reclassified"
    );
    Ok(ReclassifyOutcome {
        transaction_id: txn.id,
        group: config.name.clone(),
        subgroup,
        spending_type: config.spending_type,
        general_category: config.general_category,
        installments_updated,
        pattern_updated,
    })
}

/// Reclassifies with an explicit target group.
#[allow(clippy::too_many_arguments)]
pub fn propagate(
    conn: &mut Connection,
    scopes: &WriteScopes,
    user_id: &str,
    transaction_id: i64,
    group: &str,
    subgroup: Option<&str>,
    propagate_installments: bool,
    propagate_pattern: bool,
) -> Result<ReclassifyOutcome> {
    update_transaction(
        conn,
        scopes,
        user_id,
        &ReclassifyRequest {
            transaction_id,
            group: Some(group.to_string()),
            subgroup: subgroup.map(str::to_string),
            propagate_installments,
            propagate_pattern,
        },
    )
}
