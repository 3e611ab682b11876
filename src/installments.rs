//! Installment grouping: drafts and persisted transactions that are monthly
//! installments of one purchase share an installment key.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Months, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::db::date_column;
use crate::error::Result;
use crate::models::{Classification, ClassificationOrigin, GeneralCategory, SpendingType, TransactionDraft};
use crate::settings::Settings;

/// One known installment of a purchase, persisted or from the current batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallmentMember {
    pub key: String,
    pub fingerprint: String,
    pub total: u32,
    pub sequence: u32,
    pub amount: i64,
    /// First day of the month the purchase was made (estimated).
    pub first_month: NaiveDate,
    pub identity_hash: String,
}

/// Month of installment 1, estimated as `date - (sequence - 1)` months.
pub fn estimated_first_month(date: NaiveDate, sequence: u32) -> NaiveDate {
    let first_of_month = date.with_day(1).unwrap_or(date);
    first_of_month
        .checked_sub_months(Months::new(sequence.saturating_sub(1)))
        .unwrap_or(first_of_month)
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

/// Key for a new purchase: fingerprint, installment count, anchor amount and
/// purchase month. `ordinal` separates identical purchases made the same month.
pub fn mint_key(fingerprint: &str, total: u32, amount: i64, first_month: NaiveDate, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{fingerprint}|{total}|{amount}|{}", first_month.format("%Y-%m")).as_bytes());
    if ordinal > 0 {
        hasher.update(format!("|{ordinal}").as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy)]
pub struct InstallmentLinker {
    tolerance_cents: i64,
}

impl InstallmentLinker {
    pub fn new(tolerance_cents: i64) -> Self {
        Self {
            tolerance_cents: tolerance_cents.max(0),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.installment_tolerance_cents)
    }

    fn same_purchase(&self, member: &InstallmentMember, draft: &TransactionDraft, total: u32) -> bool {
        member.fingerprint == draft.fingerprint
            && member.total == total
            && (member.amount - draft.amount).abs() <= self.tolerance_cents
    }

    /// Existing purchase the draft can join: same merchant, plan and amount,
    /// its sequence still free, and every estimated purchase month within
    /// `total` months of each other. Invoices that print the original
    /// purchase date on every installment spread estimates over at most
    /// `total - 1` months. The closest fitting purchase wins.
    fn matching_purchase(
        &self,
        members: &[InstallmentMember],
        draft: &TransactionDraft,
        sequence: u32,
        total: u32,
        first_month: NaiveDate,
    ) -> Option<String> {
        let month = month_index(first_month);
        let mut keys: Vec<&str> = Vec::new();
        for member in members {
            if !keys.contains(&member.key.as_str()) {
                keys.push(&member.key);
            }
        }

        keys.into_iter()
            .filter_map(|key| {
                let purchase: Vec<&InstallmentMember> = members.iter().filter(|m| m.key == key).collect();
                if !purchase
                    .iter()
                    .all(|m| self.same_purchase(m, draft, total) && m.sequence != sequence)
                {
                    return None;
                }
                let months: Vec<i64> = purchase.iter().map(|m| month_index(m.first_month)).collect();
                let lo = months.iter().copied().min()?.min(month);
                let hi = months.iter().copied().max()?.max(month);
                if hi - lo >= total as i64 {
                    return None;
                }
                let distance = months.iter().map(|m| (m - month).abs()).min()?;
                Some((distance, key))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, key)| key.to_string())
    }

    /// Assigns an installment key to every installment draft, joining an
    /// existing purchase (persisted or elsewhere in the batch) when one fits.
    /// Drafts are linked in sequence order so file order never splits a
    /// purchase. Drafts must already carry identity hashes.
    pub fn link(&self, drafts: &mut [TransactionDraft], persisted: &[InstallmentMember]) {
        let mut members: Vec<InstallmentMember> = persisted.to_vec();

        let mut order: Vec<usize> = (0..drafts.len()).filter(|&i| drafts[i].is_installment()).collect();
        order.sort_by_key(|&i| drafts[i].installment_sequence);

        for idx in order {
            let draft = &mut drafts[idx];
            let (Some(sequence), Some(total)) = (draft.installment_sequence, draft.installment_total) else {
                continue;
            };
            let first_month = estimated_first_month(draft.date, sequence);

            // Re-imported row: keep the key it was persisted with.
            let known = members
                .iter()
                .find(|m| m.identity_hash == draft.identity_hash)
                .map(|m| m.key.clone());
            let key = known
                .or_else(|| self.matching_purchase(&members, draft, sequence, total, first_month))
                .unwrap_or_else(|| {
                    let used: HashSet<&str> = members.iter().map(|m| m.key.as_str()).collect();
                    (0..)
                        .map(|ordinal| mint_key(&draft.fingerprint, total, draft.amount, first_month, ordinal))
                        .find(|k| !used.contains(k.as_str()))
                        .unwrap_or_default()
                });

            debug!(fingerprint = %draft.fingerprint, sequence, total, %key, "installment linked");
            members.push(InstallmentMember {
                key: key.clone(),
                fingerprint: draft.fingerprint.clone(),
                total,
                sequence,
                amount: draft.amount,
                first_month,
                identity_hash: draft.identity_hash.clone(),
            });
            draft.installment_key = Some(key);
        }
    }

    /// Copies the classification of the lowest classified installment onto
    /// unclassified siblings in the batch.
    pub fn harmonize(&self, drafts: &mut [TransactionDraft]) -> usize {
        let mut sources: HashMap<String, (u32, Classification, GeneralCategory)> = HashMap::new();
        for draft in drafts.iter() {
            let (Some(key), Some(group), Some(seq)) = (&draft.installment_key, &draft.group, draft.installment_sequence)
            else {
                continue;
            };
            let candidate = Classification {
                group: group.clone(),
                subgroup: draft.subgroup.clone(),
                spending_type: draft.spending_type,
            };
            match sources.get(key) {
                Some((best, ..)) if *best <= seq => {}
                _ => {
                    sources.insert(key.clone(), (seq, candidate, draft.general_category));
                }
            }
        }

        let mut copied = 0;
        for draft in drafts.iter_mut() {
            if draft.is_classified() {
                continue;
            }
            let Some((_, source, category)) = draft.installment_key.as_ref().and_then(|k| sources.get(k)) else {
                continue;
            };
            draft.group = Some(source.group.clone());
            draft.subgroup = source.subgroup.clone();
            draft.spending_type = source.spending_type;
            draft.general_category = *category;
            draft.classification_origin = ClassificationOrigin::InstallmentContinuity;
            copied += 1;
        }
        copied
    }
}

/// Persisted installments sharing a fingerprint with any installment draft.
pub fn load_members(conn: &Connection, user_id: &str, drafts: &[TransactionDraft]) -> Result<Vec<InstallmentMember>> {
    let fingerprints: HashSet<&str> = drafts
        .iter()
        .filter(|d| d.is_installment())
        .map(|d| d.fingerprint.as_str())
        .collect();

    let mut stmt = conn.prepare_cached(
        "SELECT installment_key, fingerprint, installment_total, installment_sequence, amount, date, identity_hash \
         FROM transactions \
         WHERE user_id = ?1 AND fingerprint = ?2 AND installment_key IS NOT NULL \
         ORDER BY date, id",
    )?;
    let mut members = Vec::new();
    for fingerprint in fingerprints {
        let rows = stmt.query_map(params![user_id, fingerprint], |row| {
            let date = date_column(row, 5)?;
            let sequence: u32 = row.get(3)?;
            Ok(InstallmentMember {
                key: row.get(0)?,
                fingerprint: row.get(1)?,
                total: row.get(2)?,
                sequence,
                amount: row.get(4)?,
                first_month: estimated_first_month(date, sequence),
                identity_hash: row.get(6)?,
            })
        })?;
        for member in rows {
            members.push(member?);
        }
    }
    Ok(members)
}

/// Classification already given to a persisted installment of the purchase,
/// preferring manual decisions.
pub fn persisted_classification(conn: &Connection, user_id: &str, key: &str) -> Result<Option<Classification>> {
    let row = conn
        .query_row(
            "SELECT group_name, subgroup, spending_type FROM transactions \
             WHERE user_id = ?1 AND installment_key = ?2 AND group_name IS NOT NULL \
             ORDER BY (classification_origin = 'manual') DESC, installment_sequence, id LIMIT 1",
            params![user_id, key],
            |row| {
                Ok(Classification {
                    group: row.get(0)?,
                    subgroup: row.get(1)?,
                    spending_type: row.get::<_, Option<SpendingType>>(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Other persisted installments of the same purchase.
pub fn sibling_count(conn: &Connection, user_id: &str, key: &str, exclude_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT count(*) FROM transactions WHERE user_id = ?1 AND installment_key = ?2 AND id != ?3",
        params![user_id, key, exclude_id],
        |row| row.get(0),
    )?)
}
