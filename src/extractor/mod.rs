//! Document extractors: turn normalized rows into transaction drafts, one
//! strategy per document type.

pub mod invoice;
pub mod statement;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::{ExtratoError, Result};
use crate::fingerprint::{merchant_fingerprint, normalize_text, parse_installment_marker, InstallmentMarker};
use crate::models::{
    Bank, ClassificationOrigin, Direction, DocumentType, GeneralCategory, RawRow, SkipReason, SkippedRow,
    SpendingType, TransactionDraft,
};
use crate::money::{parse_amount_cents, parse_date};
use crate::settings::Settings;

pub use invoice::InvoiceExtractor;
pub use statement::StatementExtractor;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub drafts: Vec<TransactionDraft>,
    /// Rows whose date or amount could not be read.
    pub skipped: Vec<SkippedRow>,
}

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, rows: &[RawRow], bank: Bank, document_type: DocumentType) -> Extraction;
}

pub fn extractor_for(document_type: DocumentType, settings: &Settings) -> Box<dyn DocumentExtractor> {
    match document_type {
        DocumentType::Invoice => Box::new(InvoiceExtractor),
        DocumentType::Statement => Box::new(StatementExtractor::from_settings(settings)),
    }
}

/// Runs `build` over every row, turning row-level failures into skips.
pub(crate) fn extract_rows(rows: &[RawRow], build: impl Fn(&RawRow) -> Result<TransactionDraft>) -> Extraction {
    let mut out = Extraction::default();
    for row in rows {
        match build(row) {
            Ok(draft) => out.drafts.push(draft),
            Err(ExtratoError::RowParse { line, reason }) => {
                debug!(line, %reason, "row skipped");
                out.skipped.push(SkippedRow {
                    line,
                    reason: SkipReason::Unparseable(reason),
                });
            }
            Err(other) => out.skipped.push(SkippedRow {
                line: row.line,
                reason: SkipReason::Unparseable(other.to_string()),
            }),
        }
    }
    out
}

pub(crate) fn row_date(row: &RawRow) -> Result<NaiveDate> {
    parse_date(&row.date_text).ok_or_else(|| ExtratoError::RowParse {
        line: row.line,
        reason: format!("unreadable date '{}'", row.date_text),
    })
}

pub(crate) fn row_amount(row: &RawRow) -> Result<i64> {
    parse_amount_cents(&row.amount_text).ok_or_else(|| ExtratoError::RowParse {
        line: row.line,
        reason: format!("unreadable amount '{}'", row.amount_text),
    })
}

/// Explicit debit/credit markers: `D`/`C` columns, OFX `TRNTYPE`, "Natureza".
pub(crate) fn direction_marker(text: Option<&str>) -> Option<Direction> {
    let marker = normalize_text(text?);
    match marker.as_str() {
        "D" | "DEBITO" | "DEBIT" | "SAIDA" | "POS" | "ATM" | "FEE" | "SRVCHG" | "CHECK" | "DIRECTDEBIT" => {
            Some(Direction::Expense)
        }
        "C" | "CREDITO" | "CREDIT" | "ENTRADA" | "DEP" | "DEPOSIT" | "INT" | "DIV" | "DIRECTDEP" => {
            Some(Direction::Income)
        }
        _ => None,
    }
}

/// Everything a strategy decides about one row.
pub(crate) struct DraftParts {
    pub date: NaiveDate,
    pub amount: i64,
    pub direction: Direction,
    pub general_category: GeneralCategory,
    pub spending_type: Option<SpendingType>,
    pub installment: Option<InstallmentMarker>,
}

pub(crate) fn build_draft(row: &RawRow, bank: Bank, document_type: DocumentType, parts: DraftParts) -> TransactionDraft {
    TransactionDraft {
        identity_hash: String::new(),
        date: parts.date,
        description: row.description_text.clone(),
        fingerprint: merchant_fingerprint(&row.description_text),
        amount: parts.amount,
        direction: parts.direction,
        source_bank: bank,
        source_document_type: document_type,
        installment_sequence: parts.installment.map(|m| m.sequence),
        installment_total: parts.installment.map(|m| m.total),
        installment_key: None,
        group: None,
        subgroup: None,
        spending_type: parts.spending_type,
        general_category: parts.general_category,
        classification_origin: ClassificationOrigin::Unclassified,
        is_duplicate: false,
    }
}

/// Installment marker from a dedicated column, falling back to the description.
pub(crate) fn row_installment(row: &RawRow) -> Option<InstallmentMarker> {
    row.installment_text
        .as_deref()
        .and_then(parse_installment_marker)
        .or_else(|| parse_installment_marker(&row.description_text))
}
