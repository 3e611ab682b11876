//! Classification: resolves group/subgroup for drafts through an explicit
//! precedence policy over installment siblings, learned patterns and
//! generic marks. Classification never fails; no match means unclassified.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::{group_index, resolve_target};
use crate::error::{ExtratoError, Result};
use crate::fingerprint::{contains_token, merchant_fingerprint};
use crate::installments::persisted_classification;
use crate::models::{
    Classification, ClassificationOrigin, ClassificationPattern, ClassificationStats, GenericMark, GroupConfig,
    SpendingType, TransactionDraft,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStep {
    InstallmentContinuity,
    HistoricalPattern,
    GenericMark,
}

impl ResolutionStep {
    pub fn origin(&self) -> ClassificationOrigin {
        match self {
            Self::InstallmentContinuity => ClassificationOrigin::InstallmentContinuity,
            Self::HistoricalPattern => ClassificationOrigin::HistoricalPattern,
            Self::GenericMark => ClassificationOrigin::GenericMark,
        }
    }
}

/// Evaluated in order per draft; the first step that resolves wins.
/// Drafts no step resolves stay unclassified.
pub const RESOLUTION_POLICY: [ResolutionStep; 3] = [
    ResolutionStep::InstallmentContinuity,
    ResolutionStep::HistoricalPattern,
    ResolutionStep::GenericMark,
];

pub struct ClassificationEngine {
    patterns: HashMap<String, ClassificationPattern>,
    /// Longest token first.
    marks: Vec<GenericMark>,
    groups: HashMap<String, GroupConfig>,
    persisted_siblings: HashMap<String, Classification>,
}

impl ClassificationEngine {
    pub fn new(
        patterns: Vec<ClassificationPattern>,
        mut marks: Vec<GenericMark>,
        groups: HashMap<String, GroupConfig>,
        persisted_siblings: HashMap<String, Classification>,
    ) -> Self {
        marks.sort_by(|a, b| b.token.len().cmp(&a.token.len()).then_with(|| a.token.cmp(&b.token)));
        Self {
            patterns: patterns.into_iter().map(|p| (p.fingerprint.clone(), p)).collect(),
            marks,
            groups,
            persisted_siblings,
        }
    }

    /// Loads the user's patterns and marks, the group configuration, and the
    /// classification of persisted installments the drafts are linked to.
    pub fn load(conn: &Connection, user_id: &str, drafts: &[TransactionDraft]) -> Result<Self> {
        let fingerprints: HashSet<&str> = drafts.iter().map(|d| d.fingerprint.as_str()).collect();
        let mut patterns = Vec::new();
        for fingerprint in fingerprints {
            if let Some(pattern) = get_pattern(conn, user_id, fingerprint)? {
                patterns.push(pattern);
            }
        }

        let mut persisted_siblings = HashMap::new();
        for key in drafts.iter().filter_map(|d| d.installment_key.as_deref()) {
            if persisted_siblings.contains_key(key) {
                continue;
            }
            if let Some(classification) = persisted_classification(conn, user_id, key)? {
                persisted_siblings.insert(key.to_string(), classification);
            }
        }

        Ok(Self::new(
            patterns,
            list_generic_marks(conn, user_id)?,
            group_index(conn)?,
            persisted_siblings,
        ))
    }

    fn resolve(
        &self,
        step: ResolutionStep,
        draft: &TransactionDraft,
        batch_siblings: &HashMap<String, Classification>,
    ) -> Option<Classification> {
        match step {
            ResolutionStep::InstallmentContinuity => {
                let key = draft.installment_key.as_ref()?;
                batch_siblings
                    .get(key)
                    .or_else(|| self.persisted_siblings.get(key))
                    .cloned()
            }
            ResolutionStep::HistoricalPattern => self.patterns.get(&draft.fingerprint).map(|p| Classification {
                group: p.group.clone(),
                subgroup: p.subgroup.clone(),
                spending_type: p.spending_type,
            }),
            ResolutionStep::GenericMark => self
                .marks
                .iter()
                .find(|m| contains_token(&draft.fingerprint, &m.token))
                .map(|m| Classification {
                    group: m.group.clone(),
                    subgroup: m.subgroup.clone(),
                    spending_type: None,
                }),
        }
    }

    /// Writes a resolved classification onto a draft. Spending type and
    /// general category come from the group's configuration when the group
    /// still exists.
    fn apply(&self, draft: &mut TransactionDraft, classification: Classification, origin: ClassificationOrigin) {
        match self.groups.get(&classification.group.to_uppercase()) {
            Some(config) => {
                draft.group = Some(config.name.clone());
                draft.spending_type = config.spending_type;
                draft.general_category = config.general_category;
            }
            None => {
                draft.group = Some(classification.group);
                if classification.spending_type.is_some() {
                    draft.spending_type = classification.spending_type;
                }
            }
        }
        draft.subgroup = classification.subgroup;
        draft.classification_origin = origin;
    }

    /// Classifies drafts in order. Earlier drafts of the batch count as
    /// already classified siblings for later installments.
    pub fn classify(&self, drafts: &mut [TransactionDraft]) -> ClassificationStats {
        let mut batch_siblings: HashMap<String, Classification> = HashMap::new();
        let mut stats = ClassificationStats::default();

        for draft in drafts.iter_mut() {
            let resolved = RESOLUTION_POLICY
                .iter()
                .find_map(|step| self.resolve(*step, draft, &batch_siblings).map(|c| (c, step.origin())));

            match resolved {
                Some((classification, origin)) => {
                    self.apply(draft, classification, origin);
                    if let (Some(key), Some(group)) = (&draft.installment_key, &draft.group) {
                        batch_siblings.entry(key.clone()).or_insert_with(|| Classification {
                            group: group.clone(),
                            subgroup: draft.subgroup.clone(),
                            spending_type: draft.spending_type,
                        });
                    }
                }
                None => draft.classification_origin = ClassificationOrigin::Unclassified,
            }
            stats.record(draft.classification_origin);
        }
        debug!(?stats, "drafts classified");
        stats
    }
}

// ---------------------------------------------------------------------------
// Pattern store
// ---------------------------------------------------------------------------

fn pattern_from_row(row: &rusqlite::Row) -> rusqlite::Result<ClassificationPattern> {
    Ok(ClassificationPattern {
        id: row.get(0)?,
        user_id: row.get(1)?,
        fingerprint: row.get(2)?,
        group: row.get(3)?,
        subgroup: row.get(4)?,
        spending_type: row.get(5)?,
        usage_count: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn get_pattern(conn: &Connection, user_id: &str, fingerprint: &str) -> Result<Option<ClassificationPattern>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, fingerprint, group_name, subgroup, spending_type, usage_count, updated_at \
         FROM classification_patterns WHERE user_id = ?1 AND fingerprint = ?2",
    )?;
    Ok(stmt.query_row(params![user_id, fingerprint], pattern_from_row).optional()?)
}

/// Records a manual decision for a fingerprint; repeated decisions bump the
/// usage count and replace the mapping.
pub fn upsert_pattern(
    conn: &Connection,
    user_id: &str,
    fingerprint: &str,
    group: &str,
    subgroup: Option<&str>,
    spending_type: Option<SpendingType>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO classification_patterns (user_id, fingerprint, group_name, subgroup, spending_type) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (user_id, fingerprint) DO UPDATE SET \
             group_name = excluded.group_name, \
             subgroup = excluded.subgroup, \
             spending_type = excluded.spending_type, \
             usage_count = usage_count + 1, \
             updated_at = datetime('now')",
        params![user_id, fingerprint, group, subgroup, spending_type],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic marks
// ---------------------------------------------------------------------------

pub fn create_generic_mark(
    conn: &Connection,
    user_id: &str,
    token: &str,
    group: &str,
    subgroup: Option<&str>,
) -> Result<GenericMark> {
    let token = merchant_fingerprint(token);
    if token.is_empty() {
        return Err(ExtratoError::Other("A generic mark needs a non-empty token".into()));
    }
    let (config, subgroup) = resolve_target(conn, group, subgroup)?;
    conn.execute(
        "INSERT INTO generic_marks (user_id, token, group_name, subgroup) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (user_id, token) DO UPDATE SET group_name = excluded.group_name, subgroup = excluded.subgroup",
        params![user_id, token, config.name, subgroup],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM generic_marks WHERE user_id = ?1 AND token = ?2",
        params![user_id, token],
        |row| row.get(0),
    )?;
    info!(%token, group = %config.name, "generic mark saved");
    Ok(GenericMark {
        id,
        user_id: user_id.to_string(),
        token,
        group: config.name,
        subgroup,
    })
}

pub fn list_generic_marks(conn: &Connection, user_id: &str) -> Result<Vec<GenericMark>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, user_id, token, group_name, subgroup FROM generic_marks WHERE user_id = ?1 ORDER BY token",
    )?;
    let marks = stmt
        .query_map([user_id], |row| {
            Ok(GenericMark {
                id: row.get(0)?,
                user_id: row.get(1)?,
                token: row.get(2)?,
                group: row.get(3)?,
                subgroup: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(marks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::models::test_support::{draft, installment};
    use crate::models::GeneralCategory;

    fn engine(conn: &Connection, drafts: &[TransactionDraft]) -> ClassificationEngine {
        ClassificationEngine::load(conn, "local", drafts).unwrap()
    }

    #[test]
    fn test_policy_order_is_explicit() {
        assert_eq!(
            RESOLUTION_POLICY,
            [
                ResolutionStep::InstallmentContinuity,
                ResolutionStep::HistoricalPattern,
                ResolutionStep::GenericMark
            ]
        );
    }

    #[test]
    fn test_pattern_applies_with_derived_fields() {
        let (_dir, conn) = test_db();
        upsert_pattern(&conn, "local", "UBER TRIP", "Transport", Some("Ride-hailing"), Some(SpendingType::Variable))
            .unwrap();
        let mut drafts = vec![draft("Uber *Trip", -2390, "2025-01-05"), draft("Padaria", -500, "2025-01-05")];
        let stats = engine(&conn, &drafts).classify(&mut drafts);

        assert_eq!(drafts[0].group.as_deref(), Some("Transport"));
        assert_eq!(drafts[0].subgroup.as_deref(), Some("Ride-hailing"));
        // Transport is configured as adjustable: the group wins over the pattern.
        assert_eq!(drafts[0].spending_type, Some(SpendingType::Adjustable));
        assert_eq!(drafts[0].classification_origin, ClassificationOrigin::HistoricalPattern);
        assert_eq!(drafts[1].classification_origin, ClassificationOrigin::Unclassified);
        assert_eq!(drafts[1].group, None);
        assert_eq!((stats.historical_pattern, stats.unclassified), (1, 1));
    }

    #[test]
    fn test_generic_mark_longest_token_wins() {
        let (_dir, conn) = test_db();
        create_generic_mark(&conn, "local", "pix", "Transfers", None).unwrap();
        create_generic_mark(&conn, "local", "pix recebido", "Other Income", Some("Refunds")).unwrap();
        let mut drafts = vec![
            draft("PIX RECEBIDO FULANO", 5000, "2025-01-05"),
            draft("PIX ENVIADO FULANO", -5000, "2025-01-05"),
        ];
        engine(&conn, &drafts).classify(&mut drafts);
        assert_eq!(drafts[0].group.as_deref(), Some("Other Income"));
        assert_eq!(drafts[0].classification_origin, ClassificationOrigin::GenericMark);
        assert_eq!(drafts[1].group.as_deref(), Some("Transfers"));
        assert_eq!(drafts[1].general_category, GeneralCategory::Transfer);
    }

    #[test]
    fn test_pattern_beats_generic_mark() {
        let (_dir, conn) = test_db();
        create_generic_mark(&conn, "local", "IFOOD", "Leisure", None).unwrap();
        upsert_pattern(&conn, "local", "IFOOD RESTAURANTE", "Food", Some("Delivery"), None).unwrap();
        let mut drafts = vec![draft("IFOOD *RESTAURANTE", -4500, "2025-01-05")];
        engine(&conn, &drafts).classify(&mut drafts);
        assert_eq!(drafts[0].group.as_deref(), Some("Food"));
        assert_eq!(drafts[0].classification_origin, ClassificationOrigin::HistoricalPattern);
    }

    #[test]
    fn test_installment_continuity_within_batch() {
        let (_dir, conn) = test_db();
        upsert_pattern(&conn, "local", "LOJA X", "Shopping", Some("Online"), None).unwrap();
        let mut drafts = vec![
            installment("LOJA X 1/2", -10000, "2025-01-10", 1, 2),
            installment("LOJA X 2/2", -10000, "2025-02-10", 2, 2),
        ];
        for d in drafts.iter_mut() {
            d.installment_key = Some("k".into());
        }
        engine(&conn, &drafts).classify(&mut drafts);
        assert_eq!(drafts[0].classification_origin, ClassificationOrigin::HistoricalPattern);
        assert_eq!(drafts[1].classification_origin, ClassificationOrigin::InstallmentContinuity);
        assert_eq!(drafts[1].subgroup.as_deref(), Some("Online"));
    }

    #[test]
    fn test_unknown_group_in_pattern_keeps_extractor_category() {
        let engine = ClassificationEngine::new(
            vec![ClassificationPattern {
                id: 1,
                user_id: "local".into(),
                fingerprint: "CAFE".into(),
                group: "Removed".into(),
                subgroup: None,
                spending_type: Some(SpendingType::Fixed),
                usage_count: 1,
                updated_at: String::new(),
            }],
            vec![],
            HashMap::new(),
            HashMap::new(),
        );
        let mut drafts = vec![draft("Cafe", -500, "2025-01-05")];
        engine.classify(&mut drafts);
        assert_eq!(drafts[0].group.as_deref(), Some("Removed"));
        assert_eq!(drafts[0].spending_type, Some(SpendingType::Fixed));
        assert_eq!(drafts[0].general_category, GeneralCategory::Expense);
    }

    #[test]
    fn test_upsert_pattern_counts_usage() {
        let (_dir, conn) = test_db();
        upsert_pattern(&conn, "local", "UBER TRIP", "Transport", None, None).unwrap();
        upsert_pattern(&conn, "local", "UBER TRIP", "Leisure", None, None).unwrap();
        let pattern = get_pattern(&conn, "local", "UBER TRIP").unwrap().unwrap();
        assert_eq!(pattern.group, "Leisure");
        assert_eq!(pattern.usage_count, 2);
        assert!(get_pattern(&conn, "ana", "UBER TRIP").unwrap().is_none());
    }

    #[test]
    fn test_generic_mark_validates_group() {
        let (_dir, conn) = test_db();
        assert!(matches!(
            create_generic_mark(&conn, "local", "PIX", "Nope", None),
            Err(ExtratoError::UnknownGroup(_))
        ));
        let mark = create_generic_mark(&conn, "local", " mercado ", "food", Some("groceries")).unwrap();
        assert_eq!((mark.token.as_str(), mark.group.as_str()), ("MERCADO", "Food"));
        assert_eq!(mark.subgroup.as_deref(), Some("Groceries"));
        assert_eq!(list_generic_marks(&conn, "local").unwrap().len(), 1);
    }
}
