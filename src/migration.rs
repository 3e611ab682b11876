//! Bulk group/subgroup remapping of persisted transactions.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::info;

use crate::db::resolve_target;
use crate::error::{ExtratoError, Result};
use crate::models::{GeneralCategory, GroupConfig, SpendingType};
use crate::scopes::{Mode, Scope, WriteScopes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub source_group: String,
    /// `None` matches every subgroup of the source group.
    pub source_subgroup: Option<String>,
    pub target_group: String,
    /// `None` leaves migrated rows without a subgroup.
    pub target_subgroup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPreview {
    pub affected_count: i64,
    pub target_group: String,
    pub target_subgroup: Option<String>,
    pub derived_spending_type: Option<SpendingType>,
    pub derived_general_category: GeneralCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub updated_count: usize,
    pub patterns_remapped: usize,
    pub marks_remapped: usize,
    /// Groups whose aggregates changed, for downstream reporting.
    pub groups_to_recalculate: Vec<String>,
}

const SOURCE_FILTER: &str =
    "user_id = ?1 AND group_name = ?2 COLLATE NOCASE AND (?3 IS NULL OR subgroup = ?3 COLLATE NOCASE)";

fn target(conn: &Connection, request: &MigrationRequest) -> Result<(GroupConfig, Option<String>)> {
    resolve_target(conn, &request.target_group, request.target_subgroup.as_deref())
}

/// Counts the rows a migration would move and the derived fields they would
/// get. Nothing is written.
pub fn preview(conn: &Connection, user_id: &str, request: &MigrationRequest) -> Result<MigrationPreview> {
    let (config, subgroup) = target(conn, request)?;
    let affected_count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM transactions WHERE {SOURCE_FILTER}"),
        params![user_id, request.source_group, request.source_subgroup],
        |row| row.get(0),
    )?;
    Ok(MigrationPreview {
        affected_count,
        target_group: config.name,
        target_subgroup: subgroup,
        derived_spending_type: config.spending_type,
        derived_general_category: config.general_category,
    })
}

/// Moves every matching row to the target in one IMMEDIATE transaction and
/// recomputes its derived fields. Patterns and generic marks pointing at the
/// source follow it so future imports land in the target too. Each row keeps
/// its classification origin.
pub fn execute(
    conn: &mut Connection,
    scopes: &WriteScopes,
    user_id: &str,
    request: &MigrationRequest,
) -> Result<MigrationOutcome> {
    let (config, subgroup) = target(conn, request)?;
    let _guard = scopes.acquire(&[
        (Scope::group(user_id, &request.source_group), Mode::Exclusive),
        (Scope::group(user_id, &config.name), Mode::Exclusive),
    ])?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(ExtratoError::persistence)?;

    let source_name: Option<String> = tx
        .query_row(
            &format!("SELECT group_name FROM transactions WHERE {SOURCE_FILTER} LIMIT 1"),
            params![user_id, request.source_group, request.source_subgroup],
            |row| row.get(0),
        )
        .optional()
        .map_err(ExtratoError::persistence)?;

    let updated_count = tx
        .execute(
            &format!(
                "UPDATE transactions SET group_name = ?4, subgroup = ?5, spending_type = ?6, general_category = ?7 \
                 WHERE {SOURCE_FILTER}"
            ),
            params![
                user_id,
                request.source_group,
                request.source_subgroup,
                config.name,
                subgroup,
                config.spending_type,
                config.general_category
            ],
        )
        .map_err(ExtratoError::persistence)?;

    let patterns_remapped = tx
        .execute(
            &format!(
                "UPDATE classification_patterns SET group_name = ?4, subgroup = ?5, spending_type = ?6, \
                 updated_at = datetime('now') WHERE {SOURCE_FILTER}"
            ),
            params![
                user_id,
                request.source_group,
                request.source_subgroup,
                config.name,
                subgroup,
                config.spending_type
            ],
        )
        .map_err(ExtratoError::persistence)?;

    let marks_remapped = tx
        .execute(
            &format!("UPDATE generic_marks SET group_name = ?4, subgroup = ?5 WHERE {SOURCE_FILTER}"),
            params![user_id, request.source_group, request.source_subgroup, config.name, subgroup],
        )
        .map_err(ExtratoError::persistence)?;

    tx.commit().map_err(ExtratoError::persistence)?;

    let mut groups_to_recalculate = Vec::new();
    if updated_count > 0 {
        let source = source_name.unwrap_or_else(|| request.source_group.clone());
        if !source.eq_ignore_ascii_case(&config.name) {
            groups_to_recalculate.push(source);
        }
        groups_to_recalculate.push(config.name.clone());
    }

    info!(
        source = %request.source_group,
        target = %config.name,
        updated_count,
        patterns_remapped,
        marks_remapped,
        "migration executed"
    );
    Ok(MigrationOutcome {
        updated_count,
        patterns_remapped,
        marks_remapped,
        groups_to_recalculate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batches::{get_transaction, list_batch_transactions};
    use crate::classifier::{create_generic_mark, get_pattern, list_generic_marks};
    use crate::db::test_support::test_db;
    use crate::propagation::propagate;

    fn seed(conn: &mut Connection, scopes: &WriteScopes) -> Vec<i64> {
        use crate::batches::{confirm_batch, create_batch, mark_ready, PreviewCounts};
        use crate::identity::assign_identity_hashes;
        use crate::models::test_support::draft;
        use crate::models::{Bank, ClassificationStats, DocumentType};

        let mut drafts = vec![
            draft("Mercado A", -1000, "2025-01-01"),
            draft("Mercado B", -2000, "2025-01-02"),
            draft("Restaurante", -3000, "2025-01-03"),
            draft("Uber", -4000, "2025-01-04"),
        ];
        assign_identity_hashes("local", &mut drafts);
        let batch = create_batch(conn, "s1", "local", "f.csv").unwrap();
        mark_ready(
            conn,
            batch,
            &PreviewCounts {
                bank: Bank::Nubank,
                document_type: DocumentType::Invoice,
                total_rows: 4,
                duplicate_count: 0,
                excluded_count: 0,
                skipped_count: 0,
                classification_stats: ClassificationStats::default(),
            },
        )
        .unwrap();
        confirm_batch(conn, "local", batch, &drafts).unwrap();
        let ids: Vec<i64> = list_batch_transactions(conn, "local", batch).unwrap().iter().map(|t| t.id).collect();
        propagate(conn, scopes, "local", ids[0], "Food", Some("Groceries"), false, false).unwrap();
        propagate(conn, scopes, "local", ids[1], "Food", Some("Groceries"), false, false).unwrap();
        propagate(conn, scopes, "local", ids[2], "Food", Some("Restaurants"), false, false).unwrap();
        propagate(conn, scopes, "local", ids[3], "Transport", None, false, false).unwrap();
        ids
    }

    fn request(source_sub: Option<&str>, target: &str, target_sub: Option<&str>) -> MigrationRequest {
        MigrationRequest {
            source_group: "food".into(),
            source_subgroup: source_sub.map(str::to_string),
            target_group: target.into(),
            target_subgroup: target_sub.map(str::to_string),
        }
    }

    #[test]
    fn test_execute_matches_preview() {
        let (_dir, mut conn) = test_db();
        let scopes = WriteScopes::new();
        let ids = seed(&mut conn, &scopes);

        let req = request(None, "Leisure", Some("Entertainment"));
        let before = preview(&conn, "local", &req).unwrap();
        assert_eq!(before.affected_count, 3);
        assert_eq!(before.derived_spending_type, Some(SpendingType::Variable));

        let outcome = execute(&mut conn, &scopes, "local", &req).unwrap();
        assert_eq!(outcome.updated_count as i64, before.affected_count);
        assert_eq!(outcome.groups_to_recalculate, vec!["Food".to_string(), "Leisure".to_string()]);
        assert_eq!(outcome.patterns_remapped, 3);

        for id in &ids[..3] {
            let t = get_transaction(&conn, "local", *id).unwrap().unwrap();
            assert_eq!(t.group.as_deref(), Some("Leisure"));
            assert_eq!(t.subgroup.as_deref(), Some("Entertainment"));
            assert_eq!(t.spending_type, before.derived_spending_type);
            assert_eq!(t.general_category, before.derived_general_category);
            assert_eq!(t.classification_origin, crate::models::ClassificationOrigin::Manual);
        }
        let untouched = get_transaction(&conn, "local", ids[3]).unwrap().unwrap();
        assert_eq!(untouched.group.as_deref(), Some("Transport"));
        assert_eq!(get_pattern(&conn, "local", "MERCADO A").unwrap().unwrap().group, "Leisure");
        assert_eq!(preview(&conn, "local", &req).unwrap().affected_count, 0);
    }

    #[test]
    fn test_source_subgroup_narrows() {
        let (_dir, mut conn) = test_db();
        let scopes = WriteScopes::new();
        seed(&mut conn, &scopes);
        create_generic_mark(&conn, "local", "MERCADO", "Food", Some("Groceries")).unwrap();

        let req = request(Some("groceries"), "Housing", None);
        assert_eq!(preview(&conn, "local", &req).unwrap().affected_count, 2);
        let outcome = execute(&mut conn, &scopes, "local", &req).unwrap();
        assert_eq!((outcome.updated_count, outcome.marks_remapped), (2, 1));
        let mark = &list_generic_marks(&conn, "local").unwrap()[0];
        assert_eq!((mark.group.as_str(), mark.subgroup.as_deref()), ("Housing", None));
        assert_eq!(preview(&conn, "local", &request(None, "Housing", None)).unwrap().affected_count, 1);
    }

    #[test]
    fn test_target_is_validated_and_scoped() {
        let (_dir, mut conn) = test_db();
        let scopes = WriteScopes::new();
        assert!(matches!(
            preview(&conn, "local", &request(None, "Nope", None)),
            Err(ExtratoError::UnknownGroup(_))
        ));
        let _propagation = scopes.acquire(&[(Scope::group("local", "Food"), Mode::Shared)]).unwrap();
        assert!(matches!(
            execute(&mut conn, &scopes, "local", &request(None, "Leisure", None)),
            Err(ExtratoError::PropagationConflict)
        ));
    }
}
