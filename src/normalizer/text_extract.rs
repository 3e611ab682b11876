use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::detector::{DetectedFormat, LoadedSource, SourceContent};
use crate::error::{ExtratoError, Result};
use crate::fingerprint::normalize_text;
use crate::models::{DocumentType, RawRow, SkipReason};
use crate::money::{complete_day_month, parse_date};

use super::{is_balance_line, is_summary_line, NormalizedRows, RowNormalizer};

/// Text pulled out of PDF statements (or plain `.txt` copies of them).
pub struct TextExtractNormalizer;

const AMOUNT: &str = r"[-+]?\s*(?:R\$\s*)?[-+]?\d{1,3}(?:\.?\d{3})*,\d{2}(?:\s*[-DC])?";

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^\s*(?P<date>\d{{2}}/\d{{2}}(?:/\d{{2,4}})?)\s+(?P<desc>.*?)\s*(?P<amount>{AMOUNT})\s*$"
        ))
        .expect("text row regex")
    })
}

fn trailing_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"\s+(?P<amount>{AMOUNT})\s*$")).expect("trailing amount regex"))
}

/// Splits `text` into what precedes a trailing amount and the amount.
fn split_trailing_amount(text: &str) -> Option<(&str, String)> {
    let padded = format!(" {text}");
    let caps = trailing_amount_re().captures(&padded)?;
    let start = caps.get(0)?.start().saturating_sub(1);
    Some((text.get(..start)?.trim(), caps["amount"].trim().to_string()))
}

fn dated_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?P<date>\d{2}/\d{2}(?:/\d{2,4})?)\s+(?P<desc>\S.*)$").expect("dated line regex"))
}

fn full_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{2}/\d{2}/\d{4}\b").expect("full date regex"))
}

/// Extracts text from an in-memory PDF. Malformed documents can make the
/// parser panic; that is reported as an unsupported format.
#[cfg(feature = "pdf")]
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    let owned = bytes.to_vec();
    let text = std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned))
        .map_err(|_| ExtratoError::UnsupportedFormat("the PDF could not be read".into()))?
        .map_err(|e| ExtratoError::UnsupportedFormat(format!("the PDF could not be read: {e}")))?;
    if text.trim().is_empty() {
        return Err(ExtratoError::UnsupportedFormat(
            "the PDF has no text layer (scanned documents are not supported)".into(),
        ));
    }
    Ok(text)
}

/// Due date ("Vencimento") if printed, else the first full date in the text.
pub fn reference_date(text: &str) -> Option<NaiveDate> {
    let normalized = normalize_text(text);
    if let Some(pos) = normalized.find("VENCIMENTO") {
        let window: String = normalized[pos..].chars().take(60).collect();
        if let Some(found) = full_date_re().find(&window).and_then(|m| parse_date(m.as_str())) {
            return Some(found);
        }
    }
    full_date_re().find_iter(&normalized).find_map(|m| parse_date(m.as_str()))
}

/// A dated line still waiting for its amount on a following line.
struct Pending {
    line: usize,
    date_text: String,
    description: String,
}

fn complete_date(raw: &str, reference: Option<NaiveDate>) -> String {
    if raw.len() == 5 {
        if let Some(date) = reference.and_then(|r| complete_day_month(raw, r)) {
            return date.format("%d/%m/%Y").to_string();
        }
    }
    raw.to_string()
}

impl RowNormalizer for TextExtractNormalizer {
    fn normalize(&self, source: &LoadedSource, format: &DetectedFormat) -> Result<NormalizedRows> {
        let SourceContent::Text(text) = &source.content else {
            return Err(ExtratoError::UnsupportedFormat("expected extracted text".into()));
        };

        let mut out = NormalizedRows {
            reference_date: reference_date(text),
            ..NormalizedRows::default()
        };
        let reference = out.reference_date;
        let mut pending: Option<Pending> = None;

        let flush = |out: &mut NormalizedRows, pending: &mut Option<Pending>| {
            if let Some(p) = pending.take() {
                out.skip(p.line, SkipReason::Unparseable("entry without an amount".into()));
            }
        };

        for (idx, raw_line) in text.lines().enumerate() {
            let line = idx + 1;
            if raw_line.trim().is_empty() {
                flush(&mut out, &mut pending);
                out.skip(line, SkipReason::Blank);
                continue;
            }
            if is_balance_line(raw_line) || normalize_text(raw_line).contains(" SALDO ") {
                flush(&mut out, &mut pending);
                out.skip(line, SkipReason::Balance);
                continue;
            }
            if is_summary_line(raw_line) {
                flush(&mut out, &mut pending);
                out.skip(line, SkipReason::SectionHeader);
                continue;
            }

            if let Some(caps) = row_re().captures(raw_line) {
                flush(&mut out, &mut pending);
                let mut description = caps["desc"].trim().to_string();
                let mut amount = caps["amount"].trim().to_string();
                // Statements print a running balance after the amount.
                if format.document_type == DocumentType::Statement {
                    if let Some((rest, inner)) = split_trailing_amount(&description) {
                        amount = inner;
                        description = rest.to_string();
                    }
                }
                if description.is_empty() {
                    out.skip(line, SkipReason::Unparseable("entry without a description".into()));
                    continue;
                }
                out.rows.push(RawRow {
                    line,
                    date_text: complete_date(&caps["date"], reference),
                    description_text: description,
                    amount_text: amount,
                    installment_text: None,
                    direction_text: None,
                });
                continue;
            }

            if let Some(caps) = dated_line_re().captures(raw_line) {
                flush(&mut out, &mut pending);
                pending = Some(Pending {
                    line,
                    date_text: complete_date(&caps["date"], reference),
                    description: caps["desc"].trim().to_string(),
                });
                continue;
            }

            // Continuation of a wrapped entry: more description, maybe the amount.
            // Merged lines are part of the entry, not skipped rows.
            if let Some(p) = pending.as_mut() {
                if let Some((rest, amount)) = split_trailing_amount(raw_line.trim()) {
                    if !rest.is_empty() {
                        p.description = format!("{} {rest}", p.description);
                    }
                    if let Some(p) = pending.take() {
                        out.rows.push(RawRow {
                            line: p.line,
                            date_text: p.date_text,
                            description_text: p.description,
                            amount_text: amount,
                            installment_text: None,
                            direction_text: None,
                        });
                    }
                } else {
                    p.description = format!("{} {}", p.description, raw_line.trim());
                }
                continue;
            }

            out.skip(line, SkipReason::SectionHeader);
        }
        flush(&mut out, &mut pending);
        out.skipped.sort_by_key(|s| s.line);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bank, FileKind};

    fn normalize(text: &str, doc: DocumentType) -> NormalizedRows {
        let source = LoadedSource {
            kind: FileKind::TextExtract,
            content: SourceContent::Text(text.to_string()),
        };
        let format = DetectedFormat {
            bank: Bank::Bradesco,
            document_type: doc,
            file_kind: FileKind::TextExtract,
            bank_from_signature: true,
        };
        TextExtractNormalizer.normalize(&source, &format).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_reference_date_prefers_due_date() {
        let text = "Emitido em 01/01/2025\nVencimento: 10/02/2025\n";
        assert_eq!(reference_date(text), Some(d(2025, 2, 10)));
        assert_eq!(reference_date("Emitido em 01/01/2025"), Some(d(2025, 1, 1)));
        assert_eq!(reference_date("nada"), None);
    }

    #[test]
    fn test_invoice_rows_complete_year() {
        let text = "FATURA BRADESCO\nVencimento 10/02/2025\n\n\
                    28/12 LOJA X 02/03 120,00\n\
                    05/01 PADARIA 1.234,56\n\
                    Total da fatura 1.354,56\n";
        let out = normalize(text, DocumentType::Invoice);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].date_text, "28/12/2024");
        assert_eq!(out.rows[0].description_text, "LOJA X 02/03");
        assert_eq!(out.rows[0].amount_text, "120,00");
        assert_eq!(out.rows[1].date_text, "05/01/2025");
        assert_eq!(out.rows[1].amount_text, "1.234,56");
        let reasons: Vec<_> = out.skipped.iter().map(|s| s.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::SectionHeader, SkipReason::SectionHeader, SkipReason::Blank, SkipReason::SectionHeader]
        );
    }

    #[test]
    fn test_statement_drops_running_balance() {
        let text = "Extrato 01/02/2025\n03/02/2025 PIX ENVIADO MARIA -50,00 1.150,00\nSALDO ANTERIOR 1.200,00\n";
        let out = normalize(text, DocumentType::Statement);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].description_text, "PIX ENVIADO MARIA");
        assert_eq!(out.rows[0].amount_text, "-50,00");
        assert!(out.skipped.iter().any(|s| s.reason == SkipReason::Balance));
    }

    #[test]
    fn test_wrapped_entry_is_joined() {
        let text = "Vencimento 10/03/2025\n02/03 MERCADO LIVRE\n*VENDEDOR ABC 59,90\n04/03 SEM VALOR\n";
        let out = normalize(text, DocumentType::Invoice);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].line, 2);
        assert_eq!(out.rows[0].description_text, "MERCADO LIVRE *VENDEDOR ABC");
        assert_eq!(out.rows[0].amount_text, "59,90");
        assert!(out
            .skipped
            .iter()
            .any(|s| s.line == 4 && matches!(s.reason, SkipReason::Unparseable(_))));
    }

    #[test]
    fn test_non_breaking_space_before_amount() {
        let text = "Extrato 01/02/2025\n03/02/2025 PIX MARIA\u{a0}-50,00 1.150,00\n\
                    04/02/2025 CAFÉ SÃO JOÃO\u{a0}\u{a0}-8,50\u{a0}1.141,50\n";
        let out = normalize(text, DocumentType::Statement);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].description_text, "PIX MARIA");
        assert_eq!(out.rows[0].amount_text, "-50,00");
        assert_eq!(out.rows[1].description_text, "CAFÉ SÃO JOÃO");
        assert_eq!(out.rows[1].amount_text, "-8,50");
    }

    #[test]
    fn test_wrapped_entry_with_multibyte_continuation() {
        let text = "Vencimento 10/03/2025\n02/03 MERCADO LIVRE\nAÇAÍ DA ESQUINA\u{a0}59,90\n";
        let out = normalize(text, DocumentType::Invoice);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].description_text, "MERCADO LIVRE AÇAÍ DA ESQUINA");
        assert_eq!(out.rows[0].amount_text, "59,90");
    }
}
