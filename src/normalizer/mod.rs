//! Row normalizers: one strategy per file kind, each turning decoded content
//! into `RawRow`s and a ledger of skipped rows.

pub mod account_export;
pub mod delimited;
#[cfg(feature = "spreadsheet")]
pub mod spreadsheet;
pub mod text_extract;

use chrono::NaiveDate;

use crate::detector::{DetectedFormat, LoadedSource};
use crate::error::{ExtratoError, Result};
use crate::fingerprint::{contains_token, fold_accents, merchant_fingerprint};
use crate::models::{DocumentType, FileKind, RawRow, SkipReason, SkippedRow};
use crate::money::parse_amount_cents;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRows {
    pub rows: Vec<RawRow>,
    pub skipped: Vec<SkippedRow>,
    /// Due/reference date printed on the document, when one was found.
    pub reference_date: Option<NaiveDate>,
}

impl NormalizedRows {
    pub(crate) fn skip(&mut self, line: usize, reason: SkipReason) {
        self.skipped.push(SkippedRow { line, reason });
    }
}

pub trait RowNormalizer: Send + Sync {
    fn normalize(&self, source: &LoadedSource, format: &DetectedFormat) -> Result<NormalizedRows>;
}

/// The normalizer for a file kind, chosen once per upload.
pub fn normalizer_for(kind: FileKind) -> &'static dyn RowNormalizer {
    match kind {
        FileKind::DelimitedTable => &delimited::DelimitedNormalizer,
        #[cfg(feature = "spreadsheet")]
        FileKind::Spreadsheet => &spreadsheet::SpreadsheetNormalizer,
        #[cfg(not(feature = "spreadsheet"))]
        FileKind::Spreadsheet => &UnsupportedNormalizer,
        FileKind::AccountExport => &account_export::AccountExportNormalizer,
        FileKind::TextExtract => &text_extract::TextExtractNormalizer,
    }
}

#[cfg(not(feature = "spreadsheet"))]
struct UnsupportedNormalizer;

#[cfg(not(feature = "spreadsheet"))]
impl RowNormalizer for UnsupportedNormalizer {
    fn normalize(&self, _source: &LoadedSource, _format: &DetectedFormat) -> Result<NormalizedRows> {
        Err(ExtratoError::UnsupportedFormat(
            "spreadsheet support is not enabled in this build".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tabular layouts (delimited text and spreadsheets)
// ---------------------------------------------------------------------------

/// Column positions discovered from a header row.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Columns {
    date: usize,
    description: usize,
    /// Second description column (Inter: "Histórico" + "Descrição").
    description_extra: Option<usize>,
    amount: usize,
    installment: Option<usize>,
    direction: Option<usize>,
}

fn fold_cell(cell: &str) -> String {
    let folded: String = cell.chars().map(fold_accents).collect::<String>().to_lowercase();
    folded
        .trim_matches(|c: char| c.is_whitespace() || c == '"' || c == ':')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_date_label(label: &str) -> bool {
    label == "data" || label == "date" || label.starts_with("data ")
}

fn is_description_label(label: &str) -> bool {
    const LABELS: &[&str] = &[
        "title",
        "description",
        "lancamento",
        "estabelecimento",
        "detalhes",
        "memo",
        "identificacao",
    ];
    LABELS.contains(&label) || label.starts_with("descricao") || label.starts_with("historico")
}

fn is_amount_label(label: &str) -> bool {
    label == "amount" || label == "valor" || label.starts_with("valor ") || label.starts_with("valor(")
}

fn is_direction_label(label: &str) -> bool {
    matches!(label, "d/c" | "c/d" | "dc" | "natureza" | "tipo" | "tipo de lancamento")
}

/// Finds the header among `cells`, if this row is one.
fn discover_columns(cells: &[String], document_type: DocumentType) -> Option<Columns> {
    let mut date = None;
    let mut descriptions = Vec::new();
    let mut amount = None;
    let mut installment = None;
    let mut direction = None;

    for (i, cell) in cells.iter().enumerate() {
        let label = fold_cell(cell);
        if label.is_empty() {
            continue;
        }
        if date.is_none() && is_date_label(&label) {
            date = Some(i);
        } else if amount.is_none() && is_amount_label(&label) {
            amount = Some(i);
        } else if label.contains("parcela") || (document_type == DocumentType::Invoice && label == "tipo") {
            installment.get_or_insert(i);
        } else if is_direction_label(&label) {
            direction.get_or_insert(i);
        } else if is_description_label(&label) {
            descriptions.push(i);
        }
    }

    Some(Columns {
        date: date?,
        description: *descriptions.first()?,
        description_extra: descriptions.get(1).copied(),
        amount: amount?,
        installment,
        direction,
    })
}

fn cell(cells: &[String], idx: usize) -> &str {
    cells.get(idx).map(|s| s.trim()).unwrap_or("")
}

/// True when the first whole token is a keyword, standing alone or followed
/// by a connective or a figure: "Total da fatura", "TOTAL 1.354,56". A
/// merchant such as "TOTAL EXPRESS" or "TOTALPASS" does not qualify.
fn opens_with_keyword(text: &str, keywords: &[&str], followers: &[&str]) -> bool {
    let fingerprint = merchant_fingerprint(text);
    let mut tokens = fingerprint.split(' ');
    match (tokens.next(), tokens.next()) {
        (Some(first), next) if keywords.contains(&first) => match next {
            None => true,
            Some(next) => followers.contains(&next) || next.chars().all(|c| c.is_ascii_digit()),
        },
        _ => false,
    }
}

fn is_balance_line(description: &str) -> bool {
    const FOLLOWERS: &[&str] = &[
        "ANTERIOR", "DO", "DA", "DISPONIVEL", "FINAL", "INICIAL", "ATUAL", "EM", "TOTAL", "BLOQUEADO", "CONTA",
        "PARCIAL", "LIQUIDO",
    ];
    let fingerprint = merchant_fingerprint(description);
    opens_with_keyword(description, &["SALDO"], FOLLOWERS)
        || contains_token(&fingerprint, "SALDO DO DIA")
        || contains_token(&fingerprint, "SALDO ANTERIOR")
}

fn is_summary_line(text: &str) -> bool {
    const FOLLOWERS: &[&str] = &[
        "DA", "DO", "DAS", "DOS", "DE", "A", "GERAL", "FATURA", "COMPRAS", "LANCAMENTOS", "PARCIAL", "NACIONAL",
        "NACIONAIS", "INTERNACIONAL", "INTERNACIONAIS", "PAGAR", "MES", "CARTAO",
    ];
    opens_with_keyword(text, &["TOTAL", "TOTAIS", "SUBTOTAL", "RESUMO"], FOLLOWERS)
}

/// Shared normalization for header-based tables. `rows` carries each row's
/// 1-based source line.
pub(crate) fn normalize_table(rows: &[(usize, Vec<String>)], document_type: DocumentType) -> Result<NormalizedRows> {
    let mut out = NormalizedRows::default();

    let header_pos = rows
        .iter()
        .position(|(_, cells)| discover_columns(cells, document_type).is_some())
        .ok_or_else(|| {
            ExtratoError::UnsupportedFormat("no header row with date, description and amount columns".into())
        })?;
    let (_, header_cells) = &rows[header_pos];
    let columns = discover_columns(header_cells, document_type)
        .ok_or_else(|| ExtratoError::UnsupportedFormat("unreadable header row".into()))?;

    for (line, cells) in &rows[..header_pos] {
        let reason = if cells.iter().all(|c| c.trim().is_empty()) {
            SkipReason::Blank
        } else {
            SkipReason::SectionHeader
        };
        out.skip(*line, reason);
    }

    let mut last_date: Option<String> = None;
    for (line, cells) in &rows[header_pos + 1..] {
        let line = *line;
        if cells.iter().all(|c| c.trim().is_empty()) {
            out.skip(line, SkipReason::Blank);
            continue;
        }

        let mut description = cell(cells, columns.description).to_string();
        if let Some(extra) = columns.description_extra.map(|i| cell(cells, i)).filter(|s| !s.is_empty()) {
            if description.is_empty() {
                description = extra.to_string();
            } else {
                description = format!("{description} {extra}");
            }
        }
        let date_cell = cell(cells, columns.date);
        let amount_text = cell(cells, columns.amount);

        if is_balance_line(&description) || is_balance_line(date_cell) {
            out.skip(line, SkipReason::Balance);
            continue;
        }
        if is_summary_line(&description) || is_summary_line(date_cell) {
            out.skip(line, SkipReason::SectionHeader);
            continue;
        }
        if parse_amount_cents(amount_text).is_none() {
            let reason = if amount_text.chars().any(|c| c.is_ascii_digit()) {
                SkipReason::Unparseable(format!("amount '{amount_text}' is not a number"))
            } else {
                SkipReason::SectionHeader
            };
            out.skip(line, reason);
            continue;
        }

        // Merged date cells: the date is only printed on the first row.
        let date_text = if date_cell.is_empty() {
            match &last_date {
                Some(previous) => previous.clone(),
                None => {
                    out.skip(line, SkipReason::Unparseable("missing date".into()));
                    continue;
                }
            }
        } else {
            last_date = Some(date_cell.to_string());
            date_cell.to_string()
        };

        out.rows.push(RawRow {
            line,
            date_text,
            description_text: description,
            amount_text: amount_text.to_string(),
            installment_text: columns
                .installment
                .map(|i| cell(cells, i).to_string())
                .filter(|s| !s.is_empty()),
            direction_text: columns
                .direction
                .map(|i| cell(cells, i).to_string())
                .filter(|s| !s.is_empty()),
        });
    }

    Ok(out)
}
