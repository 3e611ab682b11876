use std::collections::HashMap;

use crate::detector::{DetectedFormat, LoadedSource, SourceContent};
use crate::error::{ExtratoError, Result};
use crate::models::{RawRow, SkipReason};

use super::{NormalizedRows, RowNormalizer};

/// OFX account exports, both SGML (unclosed leaf tags) and XML flavours.
pub struct AccountExportNormalizer;

fn row_from_fields(line: usize, fields: &HashMap<String, String>) -> std::result::Result<RawRow, SkipReason> {
    let field = |name: &str| fields.get(name).map(|s| s.trim()).filter(|s| !s.is_empty());

    let amount = field("TRNAMT").ok_or_else(|| SkipReason::Unparseable("missing TRNAMT".into()))?;
    let date = field("DTPOSTED").ok_or_else(|| SkipReason::Unparseable("missing DTPOSTED".into()))?;
    let description = field("MEMO")
        .or_else(|| field("NAME"))
        .ok_or_else(|| SkipReason::Unparseable("missing MEMO and NAME".into()))?;

    Ok(RawRow {
        line,
        date_text: date.to_string(),
        description_text: description.to_string(),
        amount_text: amount.to_string(),
        installment_text: None,
        direction_text: field("TRNTYPE").map(|s| s.to_string()),
    })
}

impl RowNormalizer for AccountExportNormalizer {
    fn normalize(&self, source: &LoadedSource, _format: &DetectedFormat) -> Result<NormalizedRows> {
        let SourceContent::Text(text) = &source.content else {
            return Err(ExtratoError::UnsupportedFormat("expected OFX text".into()));
        };

        let mut out = NormalizedRows::default();
        let mut current: Option<(usize, HashMap<String, String>)> = None;
        let mut line = 1;
        let mut scanned = 0;

        for (offset, _) in text.match_indices('<') {
            line += text[scanned..offset].matches('\n').count();
            scanned = offset;

            let rest = &text[offset + 1..];
            let Some(close) = rest.find('>') else {
                continue;
            };
            let tag = rest[..close].trim().to_ascii_uppercase();
            let after = &rest[close + 1..];
            let value = after[..after.find('<').unwrap_or(after.len())].trim();

            match tag.as_str() {
                "STMTTRN" => {
                    if let Some((start, fields)) = current.take() {
                        push_row(&mut out, start, &fields);
                    }
                    current = Some((line, HashMap::new()));
                }
                "/STMTTRN" => {
                    if let Some((start, fields)) = current.take() {
                        push_row(&mut out, start, &fields);
                    }
                }
                t if !t.starts_with('/') => {
                    if let Some((_, fields)) = current.as_mut() {
                        fields.insert(t.to_string(), value.to_string());
                    }
                }
                _ => {}
            }
        }
        if let Some((start, fields)) = current.take() {
            push_row(&mut out, start, &fields);
        }

        if out.rows.is_empty() && out.skipped.is_empty() && !text.to_ascii_uppercase().contains("<BANKTRANLIST>") {
            return Err(ExtratoError::UnsupportedFormat("OFX file has no transaction list".into()));
        }
        Ok(out)
    }
}

fn push_row(out: &mut NormalizedRows, line: usize, fields: &HashMap<String, String>) {
    match row_from_fields(line, fields) {
        Ok(row) => out.rows.push(row),
        Err(reason) => out.skip(line, reason),
    }
}
