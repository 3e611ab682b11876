use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{ExtratoError, Result};
use crate::models::{GeneralCategory, GroupConfig, SpendingType};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS category_groups (
    name TEXT PRIMARY KEY,
    spending_type TEXT,
    general_category TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subgroups (
    id INTEGER PRIMARY KEY,
    group_name TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (group_name, name),
    FOREIGN KEY (group_name) REFERENCES category_groups(name)
);

CREATE TABLE IF NOT EXISTS upload_batches (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    bank TEXT,
    document_type TEXT,
    file_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'processing',
    total_rows INTEGER NOT NULL DEFAULT 0,
    imported_count INTEGER NOT NULL DEFAULT 0,
    duplicate_count INTEGER NOT NULL DEFAULT 0,
    excluded_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    classification_stats TEXT,
    error_reason TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    confirmed_at TEXT
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    batch_id INTEGER NOT NULL,
    identity_hash TEXT NOT NULL,
    date TEXT NOT NULL,
    description TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    amount INTEGER NOT NULL,
    direction TEXT NOT NULL,
    source_bank TEXT NOT NULL,
    source_document_type TEXT NOT NULL,
    installment_sequence INTEGER,
    installment_total INTEGER,
    installment_key TEXT,
    group_name TEXT,
    subgroup TEXT,
    spending_type TEXT,
    general_category TEXT NOT NULL,
    classification_origin TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (batch_id) REFERENCES upload_batches(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_identity ON transactions(user_id, identity_hash);
CREATE INDEX IF NOT EXISTS idx_transactions_fingerprint ON transactions(user_id, fingerprint);
CREATE INDEX IF NOT EXISTS idx_transactions_installment ON transactions(user_id, installment_key);
CREATE INDEX IF NOT EXISTS idx_transactions_batch ON transactions(batch_id);
CREATE INDEX IF NOT EXISTS idx_transactions_group ON transactions(user_id, group_name, subgroup);

CREATE TABLE IF NOT EXISTS classification_patterns (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    group_name TEXT NOT NULL,
    subgroup TEXT,
    spending_type TEXT,
    usage_count INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT DEFAULT (datetime('now')),
    UNIQUE (user_id, fingerprint)
);

CREATE TABLE IF NOT EXISTS generic_marks (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    token TEXT NOT NULL,
    group_name TEXT NOT NULL,
    subgroup TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    UNIQUE (user_id, token)
);

CREATE TABLE IF NOT EXISTS exclusion_rules (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    merchant_fingerprint TEXT NOT NULL,
    bank TEXT,
    document_scope TEXT NOT NULL DEFAULT 'ambos',
    action TEXT NOT NULL DEFAULT 'exclude',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now'))
);
";

// (name, spending_type, general_category, subgroups)
const DEFAULT_GROUPS: &[(&str, Option<SpendingType>, GeneralCategory, &[&str])] = &[
    ("Housing", Some(SpendingType::Fixed), GeneralCategory::Expense, &["Rent", "Utilities", "Internet"]),
    ("Food", Some(SpendingType::Adjustable), GeneralCategory::Expense, &["Groceries", "Restaurants", "Delivery"]),
    ("Transport", Some(SpendingType::Adjustable), GeneralCategory::Expense, &["Fuel", "Ride-hailing", "Public transit"]),
    ("Health", Some(SpendingType::Fixed), GeneralCategory::Expense, &["Pharmacy", "Insurance", "Appointments"]),
    ("Subscriptions", Some(SpendingType::Fixed), GeneralCategory::Expense, &["Streaming", "Software"]),
    ("Shopping", Some(SpendingType::Variable), GeneralCategory::Expense, &["Online", "Clothing", "Electronics"]),
    ("Leisure", Some(SpendingType::Variable), GeneralCategory::Expense, &["Travel", "Entertainment"]),
    ("Education", Some(SpendingType::Fixed), GeneralCategory::Expense, &["Courses", "Books"]),
    ("Salary", None, GeneralCategory::Income, &["Payroll", "Bonus"]),
    ("Other Income", None, GeneralCategory::Income, &["Refunds", "Cashback"]),
    ("Investments", None, GeneralCategory::Investment, &["Applications", "Redemptions"]),
    ("Transfers", None, GeneralCategory::Transfer, &["Own accounts", "Card payment"]),
];

/// Reads a `YYYY-MM-DD` text column as a date.
pub fn date_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM category_groups", [], |row| row.get(0))?;
    if count == 0 {
        for (name, spending_type, general_category, subgroups) in DEFAULT_GROUPS {
            conn.execute(
                "INSERT INTO category_groups (name, spending_type, general_category) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, spending_type, general_category],
            )?;
            for subgroup in *subgroups {
                conn.execute(
                    "INSERT INTO subgroups (group_name, name) VALUES (?1, ?2)",
                    rusqlite::params![name, subgroup],
                )?;
            }
        }
    }
    Ok(())
}

pub fn group_config(conn: &Connection, name: &str) -> Result<Option<GroupConfig>> {
    let row = conn
        .query_row(
            "SELECT name, spending_type, general_category FROM category_groups WHERE name = ?1 COLLATE NOCASE",
            [name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<SpendingType>>(1)?,
                    row.get::<_, GeneralCategory>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((name, spending_type, general_category)) = row else {
        return Ok(None);
    };
    let mut stmt = conn.prepare_cached("SELECT name FROM subgroups WHERE group_name = ?1 ORDER BY name")?;
    let subgroups = stmt
        .query_map([&name], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(Some(GroupConfig {
        name,
        spending_type,
        general_category,
        subgroups,
    }))
}

pub fn list_groups(conn: &Connection) -> Result<Vec<GroupConfig>> {
    let names: Vec<String> = conn
        .prepare("SELECT name FROM category_groups ORDER BY general_category, name")?
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut groups = Vec::with_capacity(names.len());
    for name in names {
        if let Some(config) = group_config(conn, &name)? {
            groups.push(config);
        }
    }
    Ok(groups)
}

/// All group configurations keyed by upper-cased name, for hot lookups.
pub fn group_index(conn: &Connection) -> Result<HashMap<String, GroupConfig>> {
    Ok(list_groups(conn)?
        .into_iter()
        .map(|g| (g.name.to_uppercase(), g))
        .collect())
}

/// Validates a group/subgroup pair against the configuration and returns
/// the group with its canonical spelling.
pub fn resolve_target(conn: &Connection, group: &str, subgroup: Option<&str>) -> Result<(GroupConfig, Option<String>)> {
    let config = group_config(conn, group)?.ok_or_else(|| ExtratoError::UnknownGroup(group.to_string()))?;
    let subgroup = match subgroup {
        None => None,
        Some(s) => {
            let canonical = config
                .subgroups
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(s))
                .cloned()
                .ok_or_else(|| ExtratoError::UnknownSubgroup {
                    group: config.name.clone(),
                    subgroup: s.to_string(),
                })?;
            Some(canonical)
        }
    };
    Ok((config, subgroup))
}


#[cfg(test)]
mod tests {
    use super::test_support::test_db;
    use super::*;

    #[test]
    fn test_init_db_creates_tables() {
        let (_dir, conn) = test_db();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for expected in &[
            "category_groups",
            "subgroups",
            "upload_batches",
            "transactions",
            "classification_patterns",
            "generic_marks",
            "exclusion_rules",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let (_dir, conn) = test_db();
        init_db(&conn).unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM category_groups", [], |r| r.get(0)).unwrap();
        assert_eq!(count, DEFAULT_GROUPS.len() as i64);
    }

    #[test]
    fn test_group_config_derives_fields() {
        let (_dir, conn) = test_db();
        let housing = group_config(&conn, "housing").unwrap().unwrap();
        assert_eq!(housing.name, "Housing");
        assert_eq!(housing.spending_type, Some(SpendingType::Fixed));
        assert_eq!(housing.general_category, GeneralCategory::Expense);
        assert!(housing.has_subgroup("rent"));
        assert!(group_config(&conn, "Nope").unwrap().is_none());
    }

    #[test]
    fn test_resolve_target_validates_subgroup() {
        let (_dir, conn) = test_db();
        let (config, subgroup) = resolve_target(&conn, "Food", Some("groceries")).unwrap();
        assert_eq!(config.name, "Food");
        assert_eq!(subgroup.as_deref(), Some("Groceries"));
        assert!(matches!(
            resolve_target(&conn, "Food", Some("Rent")),
            Err(ExtratoError::UnknownSubgroup { .. })
        ));
        assert!(matches!(resolve_target(&conn, "Nope", None), Err(ExtratoError::UnknownGroup(_))));
    }
}
