use std::fmt;

use chrono::NaiveDate;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Gives a fieldless enum a stable string key used in the database, on the
/// command line and in serialized output.
macro_rules! keyed_enum {
    ($name:ident { $($variant:ident => $key:literal),+ $(,)? }) => {
        impl $name {
            pub fn key(&self) -> &'static str {
                match self {
                    $(Self::$variant => $key),+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key.trim().to_ascii_lowercase().as_str() {
                    $($key => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.key())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::from_key(s).ok_or_else(|| format!("unknown {}: {s}", stringify!($name)))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.key()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::from_key(s).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {}: {s}", stringify!($name)).into())
                })
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Source classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bank {
    Nubank,
    Itau,
    Inter,
    Bradesco,
    Santander,
    BancoDoBrasil,
    Caixa,
}

keyed_enum!(Bank {
    Nubank => "nubank",
    Itau => "itau",
    Inter => "inter",
    Bradesco => "bradesco",
    Santander => "santander",
    BancoDoBrasil => "banco-do-brasil",
    Caixa => "caixa",
});

impl Bank {
    pub const ALL: &'static [Bank] = &[
        Bank::Nubank,
        Bank::Itau,
        Bank::Inter,
        Bank::Bradesco,
        Bank::Santander,
        Bank::BancoDoBrasil,
        Bank::Caixa,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Nubank => "Nubank",
            Self::Itau => "Itaú",
            Self::Inter => "Banco Inter",
            Self::Bradesco => "Bradesco",
            Self::Santander => "Santander",
            Self::BancoDoBrasil => "Banco do Brasil",
            Self::Caixa => "Caixa",
        }
    }

    /// FEBRABAN compensation code, as found in OFX `<BANKID>`.
    pub fn febraban_code(&self) -> u32 {
        match self {
            Self::Nubank => 260,
            Self::Itau => 341,
            Self::Inter => 77,
            Self::Bradesco => 237,
            Self::Santander => 33,
            Self::BancoDoBrasil => 1,
            Self::Caixa => 104,
        }
    }

    /// Upper-case, accent-free tokens that identify the institution in
    /// free text (spreadsheet titles, PDF statements).
    pub fn text_markers(&self) -> &'static [&'static str] {
        match self {
            Self::Nubank => &["NUBANK", "NU PAGAMENTOS"],
            Self::Itau => &["ITAU UNIBANCO", "BANCO ITAU", "ITAUCARD", "ITAU"],
            Self::Inter => &["BANCO INTER", "INTER&CO", "INTER & CO"],
            Self::Bradesco => &["BRADESCO"],
            Self::Santander => &["SANTANDER"],
            Self::BancoDoBrasil => &["BANCO DO BRASIL", "OUROCARD"],
            Self::Caixa => &["CAIXA ECONOMICA", "CAIXA"],
        }
    }

    pub fn from_febraban_code(code: &str) -> Option<Bank> {
        let code: u32 = code.trim().parse().ok()?;
        Self::ALL.iter().copied().find(|b| b.febraban_code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    /// Credit-card statement (fatura).
    Invoice,
    /// Bank account statement (extrato).
    Statement,
}

keyed_enum!(DocumentType {
    Invoice => "invoice",
    Statement => "statement",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    DelimitedTable,
    Spreadsheet,
    AccountExport,
    TextExtract,
}

keyed_enum!(FileKind {
    DelimitedTable => "delimited-table",
    Spreadsheet => "spreadsheet",
    AccountExport => "account-export",
    TextExtract => "text-extract",
});

// ---------------------------------------------------------------------------
// Classification vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Expense,
    Income,
}

keyed_enum!(Direction {
    Expense => "expense",
    Income => "income",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneralCategory {
    Expense,
    Income,
    Investment,
    Transfer,
}

keyed_enum!(GeneralCategory {
    Expense => "expense",
    Income => "income",
    Investment => "investment",
    Transfer => "transfer",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpendingType {
    Fixed,
    Adjustable,
    Variable,
}

keyed_enum!(SpendingType {
    Fixed => "fixed",
    Adjustable => "adjustable",
    Variable => "variable",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationOrigin {
    InstallmentContinuity,
    HistoricalPattern,
    GenericMark,
    Manual,
    Unclassified,
}

keyed_enum!(ClassificationOrigin {
    InstallmentContinuity => "installment-continuity",
    HistoricalPattern => "historical-pattern",
    GenericMark => "generic-mark",
    Manual => "manual",
    Unclassified => "unclassified",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Ready,
    Confirmed,
    Error,
}

keyed_enum!(BatchStatus {
    Processing => "processing",
    Ready => "ready",
    Confirmed => "confirmed",
    Error => "error",
});

/// Which document types an exclusion rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentScope {
    #[serde(rename = "cartao")]
    Card,
    #[serde(rename = "extrato")]
    Statement,
    #[serde(rename = "ambos")]
    Any,
}

keyed_enum!(DocumentScope {
    Card => "cartao",
    Statement => "extrato",
    Any => "ambos",
});

impl DocumentScope {
    pub fn covers(&self, document_type: DocumentType) -> bool {
        match self {
            Self::Card => document_type == DocumentType::Invoice,
            Self::Statement => document_type == DocumentType::Statement,
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionAction {
    Exclude,
}

keyed_enum!(ExclusionAction {
    Exclude => "exclude",
});

// ---------------------------------------------------------------------------
// Pipeline records
// ---------------------------------------------------------------------------

/// One line of source content after format-specific decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub line: usize,
    pub date_text: String,
    pub description_text: String,
    pub amount_text: String,
    pub installment_text: Option<String>,
    /// Explicit debit/credit marker when the source carries one.
    pub direction_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum SkipReason {
    Blank,
    SectionHeader,
    Balance,
    Unparseable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDraft {
    pub identity_hash: String,
    pub date: NaiveDate,
    /// Verbatim source description.
    pub description: String,
    pub fingerprint: String,
    /// Signed minor units: negative for expenses.
    pub amount: i64,
    pub direction: Direction,
    pub source_bank: Bank,
    pub source_document_type: DocumentType,
    pub installment_sequence: Option<u32>,
    pub installment_total: Option<u32>,
    pub installment_key: Option<String>,
    pub group: Option<String>,
    pub subgroup: Option<String>,
    pub spending_type: Option<SpendingType>,
    pub general_category: GeneralCategory,
    pub classification_origin: ClassificationOrigin,
    pub is_duplicate: bool,
}

impl TransactionDraft {
    pub fn is_installment(&self) -> bool {
        self.installment_sequence.is_some() && self.installment_total.is_some()
    }

    pub fn is_classified(&self) -> bool {
        self.group.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub user_id: String,
    pub batch_id: i64,
    pub identity_hash: String,
    pub date: NaiveDate,
    pub description: String,
    pub fingerprint: String,
    pub amount: i64,
    pub direction: Direction,
    pub source_bank: Bank,
    pub source_document_type: DocumentType,
    pub installment_sequence: Option<u32>,
    pub installment_total: Option<u32>,
    pub installment_key: Option<String>,
    pub group: Option<String>,
    pub subgroup: Option<String>,
    pub spending_type: Option<SpendingType>,
    pub general_category: GeneralCategory,
    pub classification_origin: ClassificationOrigin,
    pub created_at: String,
}

/// Group/subgroup/spending type resolved for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub group: String,
    pub subgroup: Option<String>,
    pub spending_type: Option<SpendingType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationPattern {
    pub id: i64,
    pub user_id: String,
    pub fingerprint: String,
    pub group: String,
    pub subgroup: Option<String>,
    pub spending_type: Option<SpendingType>,
    pub usage_count: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericMark {
    pub id: i64,
    pub user_id: String,
    pub token: String,
    pub group: String,
    pub subgroup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionRule {
    pub id: i64,
    pub user_id: String,
    pub merchant_fingerprint: String,
    pub bank: Option<Bank>,
    pub document_scope: DocumentScope,
    pub action: ExclusionAction,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationStats {
    pub installment_continuity: usize,
    pub historical_pattern: usize,
    pub generic_mark: usize,
    pub manual: usize,
    pub unclassified: usize,
}

impl ClassificationStats {
    pub fn record(&mut self, origin: ClassificationOrigin) {
        match origin {
            ClassificationOrigin::InstallmentContinuity => self.installment_continuity += 1,
            ClassificationOrigin::HistoricalPattern => self.historical_pattern += 1,
            ClassificationOrigin::GenericMark => self.generic_mark += 1,
            ClassificationOrigin::Manual => self.manual += 1,
            ClassificationOrigin::Unclassified => self.unclassified += 1,
        }
    }

    pub fn from_drafts<'a>(drafts: impl IntoIterator<Item = &'a TransactionDraft>) -> Self {
        let mut stats = Self::default();
        for draft in drafts {
            stats.record(draft.classification_origin);
        }
        stats
    }

    pub fn classified(&self) -> usize {
        self.installment_continuity + self.historical_pattern + self.generic_mark + self.manual
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub id: i64,
    pub session_id: String,
    pub user_id: String,
    pub bank: Option<Bank>,
    pub document_type: Option<DocumentType>,
    pub file_name: String,
    pub status: BatchStatus,
    pub total_rows: i64,
    pub imported_count: i64,
    pub duplicate_count: i64,
    pub excluded_count: i64,
    pub skipped_count: i64,
    pub classification_stats: ClassificationStats,
    pub error_reason: Option<String>,
    pub created_at: String,
    pub confirmed_at: Option<String>,
}

/// A group's configuration: the source of every derived field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,
    pub spending_type: Option<SpendingType>,
    pub general_category: GeneralCategory,
    pub subgroups: Vec<String>,
}

impl GroupConfig {
    pub fn has_subgroup(&self, subgroup: &str) -> bool {
        self.subgroups.iter().any(|s| s.eq_ignore_ascii_case(subgroup))
    }
}
