use crate::detector::{DetectedFormat, LoadedSource, SourceContent};
use crate::error::{ExtratoError, Result};
use crate::models::SkipReason;

use super::{normalize_table, NormalizedRows, RowNormalizer};

/// CSV-like exports: `,`, `;` or tab separated, header somewhere near the top.
pub struct DelimitedNormalizer;

/// Picks the delimiter that appears most across the first non-empty lines;
/// ties go to `;`, the Brazilian default.
pub fn sniff_delimiter(text: &str) -> u8 {
    let sample: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(5).collect();
    let count = |d: char| sample.iter().map(|l| l.matches(d).count()).sum::<usize>();
    let candidates = [(b';', count(';')), (b'\t', count('\t')), (b',', count(','))];
    candidates
        .iter()
        .fold((b';', 0), |best, &(d, n)| if n > best.1 { (d, n) } else { best })
        .0
}

impl RowNormalizer for DelimitedNormalizer {
    fn normalize(&self, source: &LoadedSource, format: &DetectedFormat) -> Result<NormalizedRows> {
        let SourceContent::Text(text) = &source.content else {
            return Err(ExtratoError::UnsupportedFormat("expected delimited text".into()));
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(sniff_delimiter(text))
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line() as usize).unwrap_or(rows.len() + 1);
            rows.push((line, record.iter().map(|s| s.to_string()).collect::<Vec<_>>()));
        }

        let mut out = normalize_table(&rows, format.document_type)?;

        // The CSV reader drops empty lines; record them so every line is accounted for.
        for (idx, raw) in text.lines().enumerate() {
            if raw.trim_end_matches('\r').is_empty() {
                out.skip(idx + 1, SkipReason::Blank);
            }
        }
        out.skipped.sort_by_key(|s| s.line);
        Ok(out)
    }
}
