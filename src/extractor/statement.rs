use crate::fingerprint::{contains_token, merchant_fingerprint, normalize_text, parse_installment_marker};
use crate::models::{Bank, Direction, DocumentType, GeneralCategory, RawRow, SpendingType};
use crate::settings::Settings;

use super::{build_draft, direction_marker, extract_rows, row_amount, row_date};
use super::{DocumentExtractor, DraftParts, Extraction};

/// Transfer rails on which a payment to the account holder's own name is a
/// move between own accounts.
const TRANSFER_RAILS: &[&str] = &["PIX", "TED", "DOC", "TRANSF", "TRANSFERENCIA"];

/// Bank account statements: direction from an explicit column or the sign,
/// category from transfer/investment vocabulary.
pub struct StatementExtractor {
    transfer_patterns: Vec<String>,
    investment_patterns: Vec<String>,
    account_holder: Option<String>,
}

impl StatementExtractor {
    pub fn new(transfer_patterns: &[String], investment_patterns: &[String], account_holder: Option<&str>) -> Self {
        Self {
            transfer_patterns: transfer_patterns.iter().map(|p| normalize_text(p)).filter(|p| !p.is_empty()).collect(),
            investment_patterns: investment_patterns
                .iter()
                .map(|p| merchant_fingerprint(p))
                .filter(|p| !p.is_empty())
                .collect(),
            account_holder: account_holder.map(merchant_fingerprint).filter(|h| !h.is_empty()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.transfer_patterns,
            &settings.investment_patterns,
            settings.account_holder.as_deref(),
        )
    }

    fn is_transfer(&self, description: &str) -> bool {
        let normalized = normalize_text(description);
        if self.transfer_patterns.iter().any(|p| normalized.contains(p.as_str())) {
            return true;
        }
        let Some(holder) = &self.account_holder else {
            return false;
        };
        let fingerprint = merchant_fingerprint(description);
        TRANSFER_RAILS.iter().any(|r| contains_token(&fingerprint, r)) && contains_token(&fingerprint, holder)
    }

    fn is_investment(&self, description: &str) -> bool {
        let fingerprint = merchant_fingerprint(description);
        self.investment_patterns.iter().any(|p| contains_token(&fingerprint, p))
    }

    pub fn general_category(&self, description: &str, direction: Direction) -> GeneralCategory {
        if self.is_transfer(description) {
            GeneralCategory::Transfer
        } else if self.is_investment(description) {
            GeneralCategory::Investment
        } else if direction == Direction::Income {
            GeneralCategory::Income
        } else {
            GeneralCategory::Expense
        }
    }
}

impl DocumentExtractor for StatementExtractor {
    fn extract(&self, rows: &[RawRow], bank: Bank, document_type: DocumentType) -> Extraction {
        extract_rows(rows, |row| {
            let date = row_date(row)?;
            let raw_amount = row_amount(row)?;
            let direction = direction_marker(row.direction_text.as_deref()).unwrap_or(if raw_amount < 0 {
                Direction::Expense
            } else {
                Direction::Income
            });
            let amount = match direction {
                Direction::Expense => -raw_amount.abs(),
                Direction::Income => raw_amount.abs(),
            };
            let general_category = self.general_category(&row.description_text, direction);
            let spending_type = (general_category == GeneralCategory::Expense).then_some(SpendingType::Variable);
            // Statements only carry installments when the bank spells them out.
            let installment = row
                .installment_text
                .as_deref()
                .and_then(parse_installment_marker)
                .or_else(|| parse_installment_marker(&row.description_text).filter(|m| m.has_prefix));

            Ok(build_draft(
                row,
                bank,
                document_type,
                DraftParts {
                    date,
                    amount,
                    direction,
                    general_category,
                    spending_type,
                    installment,
                },
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(desc: &str, amount: &str) -> RawRow {
        RawRow {
            line: 2,
            date_text: "03/02/2025".into(),
            description_text: desc.into(),
            amount_text: amount.into(),
            ..RawRow::default()
        }
    }

    fn extractor() -> StatementExtractor {
        let settings = Settings {
            account_holder: Some("Ana Souza".into()),
            ..Settings::default()
        };
        StatementExtractor::from_settings(&settings)
    }

    fn extract_one(r: RawRow) -> crate::models::TransactionDraft {
        extractor().extract(&[r], Bank::Itau, DocumentType::Statement).drafts.remove(0)
    }

    #[test]
    fn test_direction_from_sign() {
        let d = extract_one(row("PIX ENVIADO JOAO", "-50,00"));
        assert_eq!((d.direction, d.amount, d.general_category), (Direction::Expense, -5000, GeneralCategory::Expense));
        let d = extract_one(row("SALARIO EMPRESA X", "3.500,00"));
        assert_eq!((d.direction, d.amount, d.general_category), (Direction::Income, 350000, GeneralCategory::Income));
        assert_eq!(d.spending_type, None);
    }

    #[test]
    fn test_direction_from_column() {
        let mut r = row("TARIFA PACOTE", "25,00");
        r.direction_text = Some("D".into());
        let d = extract_one(r);
        assert_eq!((d.direction, d.amount), (Direction::Expense, -2500));
    }

    #[test]
    fn test_transfers_and_investments() {
        assert_eq!(
            extract_one(row("TRANSF ENTRE CONTAS 1234", "-100,00")).general_category,
            GeneralCategory::Transfer
        );
        assert_eq!(
            extract_one(row("PIX ENVIADO ANA SOUZA", "-100,00")).general_category,
            GeneralCategory::Transfer
        );
        assert_eq!(
            extract_one(row("PIX ENVIADO ANA PAULA", "-100,00")).general_category,
            GeneralCategory::Expense
        );
        assert_eq!(
            extract_one(row("APLICACAO CDB BANCO", "-1.000,00")).general_category,
            GeneralCategory::Investment
        );
    }

    #[test]
    fn test_installment_requires_explicit_prefix() {
        assert_eq!(extract_one(row("PIX RECEBIDO 02/03", "10,00")).installment_sequence, None);
        let d = extract_one(row("EMPRESTIMO PARC 02/12", "-300,00"));
        assert_eq!((d.installment_sequence, d.installment_total), (Some(2), Some(12)));
    }
}
