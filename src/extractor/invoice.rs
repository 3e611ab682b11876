use crate::fingerprint::{contains_token, merchant_fingerprint};
use crate::models::{Bank, Direction, DocumentType, GeneralCategory, RawRow, SpendingType};

use super::{build_draft, direction_marker, extract_rows, row_amount, row_date, row_installment};
use super::{DocumentExtractor, DraftParts, Extraction};

/// Descriptions that mark a payment or credit on a card statement.
const CREDIT_TOKENS: &[&str] = &["PAGAMENTO", "ESTORNO", "CREDITO", "REEMBOLSO", "CASHBACK"];

/// Credit-card statements: every row is an expense unless it is explicitly a
/// payment or credit.
pub struct InvoiceExtractor;

fn is_credit(row: &RawRow, raw_amount: i64) -> bool {
    match direction_marker(row.direction_text.as_deref()) {
        Some(direction) => direction == Direction::Income,
        None => {
            let fingerprint = merchant_fingerprint(&row.description_text);
            raw_amount < 0 || CREDIT_TOKENS.iter().any(|t| contains_token(&fingerprint, t))
        }
    }
}

impl DocumentExtractor for InvoiceExtractor {
    fn extract(&self, rows: &[RawRow], bank: Bank, document_type: DocumentType) -> Extraction {
        extract_rows(rows, |row| {
            let date = row_date(row)?;
            let raw_amount = row_amount(row)?;
            let parts = if is_credit(row, raw_amount) {
                DraftParts {
                    date,
                    amount: raw_amount.abs(),
                    direction: Direction::Income,
                    general_category: GeneralCategory::Income,
                    spending_type: None,
                    installment: row_installment(row),
                }
            } else {
                DraftParts {
                    date,
                    amount: -raw_amount.abs(),
                    direction: Direction::Expense,
                    general_category: GeneralCategory::Expense,
                    spending_type: Some(SpendingType::Variable),
                    installment: row_installment(row),
                }
            };
            Ok(build_draft(row, bank, document_type, parts))
        })
    }
}
