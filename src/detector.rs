//! Format detection: decides how a file is decoded (file kind) and which
//! bank/document layout it follows.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ExtratoError, Result};
use crate::fingerprint::{contains_token, merchant_fingerprint, normalize_text};
use crate::models::{Bank, DocumentType, FileKind};

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

/// How many leading lines/rows are searched for institution names.
const PREAMBLE_LINES: usize = 15;

/// Decoded file content, before any row is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceContent {
    Text(String),
    Grid(Vec<Vec<String>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSource {
    pub kind: FileKind,
    pub content: SourceContent,
}

impl LoadedSource {
    /// Leading lines as plain text, used for signature probing.
    pub fn preamble(&self, limit: usize) -> Vec<String> {
        match &self.content {
            SourceContent::Text(text) => text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .take(limit)
                .map(|l| l.to_string())
                .collect(),
            SourceContent::Grid(rows) => rows
                .iter()
                .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
                .take(limit)
                .map(|r| r.join(" "))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedFormat {
    pub bank: Bank,
    pub document_type: DocumentType,
    pub file_kind: FileKind,
    /// True when the bank came from the file itself rather than a hint.
    pub bank_from_signature: bool,
}

/// Decodes raw bytes into text or a cell grid according to magic bytes and
/// the declared extension.
pub fn load_source(bytes: &[u8], extension: &str) -> Result<LoadedSource> {
    if bytes.is_empty() {
        return Err(ExtratoError::UnsupportedFormat("the file is empty".into()));
    }
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();

    let spreadsheet_magic = bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC);
    if spreadsheet_magic || SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
        if !spreadsheet_magic {
            return Err(ExtratoError::UnsupportedFormat(format!(
                "the .{ext} file is not a readable spreadsheet"
            )));
        }
        return load_spreadsheet(bytes);
    }

    if bytes.starts_with(b"%PDF") || ext == "pdf" {
        if !bytes.starts_with(b"%PDF") {
            return Err(ExtratoError::UnsupportedFormat("the .pdf file is not a PDF document".into()));
        }
        return load_pdf(bytes);
    }

    let text = decode_text(bytes);
    if text.contains('\0') {
        return Err(ExtratoError::UnsupportedFormat("binary content is not a bank export".into()));
    }
    let head = text.chars().take(4096).collect::<String>().to_ascii_uppercase();
    let looks_ofx = head.contains("OFXHEADER") || head.contains("<OFX>");
    if looks_ofx || ext == "ofx" || ext == "qfx" {
        if !looks_ofx {
            return Err(ExtratoError::UnsupportedFormat(format!("the .{ext} file has no OFX content")));
        }
        return Ok(LoadedSource {
            kind: FileKind::AccountExport,
            content: SourceContent::Text(text),
        });
    }

    let kind = if ext == "txt" {
        FileKind::TextExtract
    } else {
        FileKind::DelimitedTable
    };
    Ok(LoadedSource {
        kind,
        content: SourceContent::Text(text),
    })
}

#[cfg(feature = "spreadsheet")]
fn load_spreadsheet(bytes: &[u8]) -> Result<LoadedSource> {
    let grid = crate::normalizer::spreadsheet::read_grid(bytes)?;
    Ok(LoadedSource {
        kind: FileKind::Spreadsheet,
        content: SourceContent::Grid(grid),
    })
}

#[cfg(not(feature = "spreadsheet"))]
fn load_spreadsheet(_bytes: &[u8]) -> Result<LoadedSource> {
    Err(ExtratoError::UnsupportedFormat(
        "spreadsheet support is not enabled in this build".into(),
    ))
}

#[cfg(feature = "pdf")]
fn load_pdf(bytes: &[u8]) -> Result<LoadedSource> {
    let text = crate::normalizer::text_extract::pdf_text(bytes)?;
    Ok(LoadedSource {
        kind: FileKind::TextExtract,
        content: SourceContent::Text(text),
    })
}

#[cfg(not(feature = "pdf"))]
fn load_pdf(_bytes: &[u8]) -> Result<LoadedSource> {
    Err(ExtratoError::UnsupportedFormat("PDF support is not enabled in this build".into()))
}

/// UTF-8 (BOM stripped), falling back to Latin-1 for legacy bank exports.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// A layout recognised from the file's own structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    bank: Option<Bank>,
    document_type: Option<DocumentType>,
}

/// Folds a header line to lower-case, accent-free text with no padding
/// around delimiters, e.g. `Data Lançamento ; Valor` -> `data lancamento;valor`.
fn fold_header(line: &str) -> String {
    let folded: String = line
        .chars()
        .map(crate::fingerprint::fold_accents)
        .collect::<String>()
        .to_lowercase()
        .replace('"', "");
    folded
        .split([',', ';', '\t'])
        .map(|cell| cell.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join(if line.contains(';') { ";" } else { "," })
}

fn delimited_signature(text: &str) -> Option<Signature> {
    let header = text.lines().find(|l| !l.trim().is_empty())?;
    let folded = fold_header(header);
    let sig = |bank, doc| Some(Signature { bank: Some(bank), document_type: Some(doc) });
    match folded.as_str() {
        "date,title,amount" => sig(Bank::Nubank, DocumentType::Invoice),
        "data,valor,identificador,descricao" => sig(Bank::Nubank, DocumentType::Statement),
        "data;lancamento;categoria;tipo;valor" => sig(Bank::Inter, DocumentType::Invoice),
        h if h.starts_with("data lancamento;") && h.contains(";valor") && h.contains("saldo") => {
            sig(Bank::Inter, DocumentType::Statement)
        }
        _ => None,
    }
}

fn ofx_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let upper = text.to_ascii_uppercase();
    let start = upper.find(&open)? + open.len();
    let rest = &text[start..];
    let end = rest.find(['<', '\n', '\r']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn ofx_signature(text: &str) -> Signature {
    let upper = text.to_ascii_uppercase();
    let document_type = if upper.contains("<CREDITCARDMSGSRSV1>") {
        Some(DocumentType::Invoice)
    } else if upper.contains("<BANKMSGSRSV1>") {
        Some(DocumentType::Statement)
    } else {
        None
    };
    Signature {
        bank: ofx_tag(text, "BANKID").and_then(Bank::from_febraban_code),
        document_type,
    }
}

fn row_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*"?(?:\d{1,2}/\d{1,2}(?:/\d{2,4})?|\d{4}-\d{2}-\d{2})\b"#).expect("row start regex")
    })
}

/// Title lines that precede the column header or the first dated row.
fn title_lines(preamble: &[String]) -> &[String] {
    let end = preamble
        .iter()
        .position(|line| {
            let fp = merchant_fingerprint(line);
            row_start_re().is_match(line) || contains_token(&fp, "DATA") || contains_token(&fp, "DATE")
        })
        .unwrap_or(preamble.len());
    &preamble[..end]
}

/// First bank whose institution name appears in the title lines. Rows are
/// never searched: merchants and transfer counterparties name banks too.
fn bank_from_text(preamble: &[String]) -> Option<Bank> {
    let fingerprints: Vec<String> = title_lines(preamble).iter().map(|l| merchant_fingerprint(l)).collect();
    Bank::ALL.iter().copied().find(|bank| {
        bank.text_markers().iter().any(|marker| {
            let marker = merchant_fingerprint(marker);
            fingerprints.iter().any(|fp| contains_token(fp, &marker))
        })
    })
}

/// Document type from vocabulary: invoices talk about installments and due
/// dates, statements about balances.
fn document_type_from_tokens(preamble: &[String]) -> Option<DocumentType> {
    let text = normalize_text(&preamble.join(" "));
    const INVOICE: &[&str] = &["FATURA", "VENCIMENTO", "PARCELA"];
    const STATEMENT: &[&str] = &["EXTRATO", "SALDO"];
    if INVOICE.iter().any(|t| text.contains(t)) {
        Some(DocumentType::Invoice)
    } else if STATEMENT.iter().any(|t| text.contains(t)) {
        Some(DocumentType::Statement)
    } else {
        None
    }
}

/// Structural signature: header shape or OFX tags. Only this may override
/// a caller's hint.
fn signature(source: &LoadedSource) -> Signature {
    match (&source.kind, &source.content) {
        (FileKind::DelimitedTable, SourceContent::Text(text)) => delimited_signature(text).unwrap_or(Signature {
            bank: None,
            document_type: None,
        }),
        (FileKind::AccountExport, SourceContent::Text(text)) => ofx_signature(text),
        _ => Signature {
            bank: None,
            document_type: None,
        },
    }
}

/// Declares bank, document type and file kind for a decoded source. A
/// structural signature wins over hints; hints fill what the structure does
/// not say; institution names in the title lines are the last resort. With
/// none of these, the bank is undetectable.
pub fn detect(
    source: &LoadedSource,
    bank_hint: Option<Bank>,
    document_type_hint: Option<DocumentType>,
) -> Result<DetectedFormat> {
    let sig = signature(source);
    let preamble = source.preamble(PREAMBLE_LINES);

    let (bank, bank_from_signature) = match (sig.bank, bank_hint) {
        (Some(found), Some(hint)) if found != hint => {
            warn!(detected = %found, hint = %hint, "bank hint disagrees with file signature; using signature");
            (found, true)
        }
        (Some(found), _) => (found, true),
        (None, Some(hint)) => (hint, false),
        (None, None) => match bank_from_text(&preamble) {
            Some(found) => (found, true),
            None => return Err(ExtratoError::BankNotDetected),
        },
    };

    let document_type = match (sig.document_type, document_type_hint) {
        (Some(found), Some(hint)) if found != hint => {
            warn!(detected = %found, hint = %hint, "document type hint disagrees with file signature; using signature");
            found
        }
        (Some(found), _) => found,
        (None, Some(hint)) => hint,
        (None, None) => {
            document_type_from_tokens(&preamble).unwrap_or(DocumentType::Statement)
        }
    };

    debug!(%bank, %document_type, file_kind = %source.kind, bank_from_signature, "format detected");
    Ok(DetectedFormat {
        bank,
        document_type,
        file_kind: source.kind,
        bank_from_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(kind: FileKind, s: &str) -> LoadedSource {
        LoadedSource {
            kind,
            content: SourceContent::Text(s.to_string()),
        }
    }

    #[test]
    fn test_load_source_classifies_kinds() {
        let csv = load_source(b"date,title,amount\n2025-01-02,Uber,10.00\n", "csv").unwrap();
        assert_eq!(csv.kind, FileKind::DelimitedTable);
        let ofx = load_source(b"OFXHEADER:100\n<OFX></OFX>", "ofx").unwrap();
        assert_eq!(ofx.kind, FileKind::AccountExport);
        let txt = load_source(b"FATURA NUBANK\n", "txt").unwrap();
        assert_eq!(txt.kind, FileKind::TextExtract);
    }

    #[test]
    fn test_load_source_rejects_unparseable() {
        assert!(matches!(load_source(b"", "csv"), Err(ExtratoError::UnsupportedFormat(_))));
        assert!(matches!(
            load_source(b"not a workbook", "xlsx"),
            Err(ExtratoError::UnsupportedFormat(_))
        ));
        assert!(matches!(load_source(b"PK\x03\x04garbage", "xlsx"), Err(ExtratoError::UnsupportedFormat(_))));
        assert!(matches!(load_source(b"a,b\0c", "csv"), Err(ExtratoError::UnsupportedFormat(_))));
        assert!(matches!(load_source(b"date,amount", "ofx"), Err(ExtratoError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_decode_text_falls_back_to_latin1() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFData"), "Data");
        assert_eq!(decode_text(b"Descri\xE7\xE3o"), "Descrição");
    }

    #[test]
    fn test_detect_nubank_signatures() {
        let card = text(FileKind::DelimitedTable, "date,title,amount\n2025-01-02,Uber,10.00\n");
        let f = detect(&card, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Nubank, DocumentType::Invoice));
        assert!(f.bank_from_signature);

        let account = text(FileKind::DelimitedTable, "Data,Valor,Identificador,Descrição\n");
        let f = detect(&account, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Nubank, DocumentType::Statement));
    }

    #[test]
    fn test_detect_inter_signatures() {
        let statement = text(FileKind::DelimitedTable, "Data Lançamento;Histórico;Descrição;Valor;Saldo\n");
        let f = detect(&statement, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Inter, DocumentType::Statement));

        let card = text(FileKind::DelimitedTable, "\"Data\";\"Lançamento\";\"Categoria\";\"Tipo\";\"Valor\"\n");
        let f = detect(&card, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Inter, DocumentType::Invoice));
    }

    #[test]
    fn test_detect_ofx_bank_and_type() {
        let ofx = text(
            FileKind::AccountExport,
            "OFXHEADER:100\n<OFX><CREDITCARDMSGSRSV1><BANKID>0341\n</CREDITCARDMSGSRSV1></OFX>",
        );
        let f = detect(&ofx, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Itau, DocumentType::Invoice));

        let ofx = text(FileKind::AccountExport, "<OFX><BANKMSGSRSV1><BANKID>237</BANKID></BANKMSGSRSV1></OFX>");
        let f = detect(&ofx, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Bradesco, DocumentType::Statement));
    }

    #[test]
    fn test_signature_wins_over_hint() {
        let card = text(FileKind::DelimitedTable, "date,title,amount\n");
        let f = detect(&card, Some(Bank::Itau), Some(DocumentType::Statement)).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Nubank, DocumentType::Invoice));
    }

    #[test]
    fn test_hint_used_when_no_signature() {
        let generic = text(FileKind::DelimitedTable, "Data;Histórico;Valor\n01/02/2025;PIX;-10,00\n");
        let f = detect(&generic, Some(Bank::Caixa), None).unwrap();
        assert_eq!(f.bank, Bank::Caixa);
        assert!(!f.bank_from_signature);
        assert_eq!(f.document_type, DocumentType::Statement);
    }

    #[test]
    fn test_no_signature_no_hint_fails() {
        let generic = text(FileKind::DelimitedTable, "Data;Histórico;Valor\n");
        assert!(matches!(detect(&generic, None, None), Err(ExtratoError::BankNotDetected)));
    }

    #[test]
    fn test_text_extract_markers() {
        let pdf = text(
            FileKind::TextExtract,
            "Banco Bradesco S.A.\nFATURA DO CARTÃO\nVencimento 10/02/2025\n",
        );
        let f = detect(&pdf, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Bradesco, DocumentType::Invoice));

        let statement = text(FileKind::TextExtract, "SANTANDER\nExtrato de conta corrente\nSaldo anterior 10,00\n");
        let f = detect(&statement, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Santander, DocumentType::Statement));
    }

    #[test]
    fn test_bank_names_in_rows_never_override_hint() {
        let statement = text(
            FileKind::DelimitedTable,
            "Data;Histórico;Valor\n02/02/2025;SAQUE CAIXA 24H;-100,00\n03/02/2025;PIX ENVIADO NUBANK JOAO;-50,00\n",
        );
        let f = detect(&statement, Some(Bank::Bradesco), Some(DocumentType::Statement)).unwrap();
        assert_eq!(f.bank, Bank::Bradesco);
        assert!(!f.bank_from_signature);
    }

    #[test]
    fn test_bank_names_in_rows_are_not_a_signature() {
        let statement = text(
            FileKind::TextExtract,
            "Extrato de conta corrente\n02/02/2025 PIX ENVIADO NUBANK JOAO -50,00\n",
        );
        assert!(matches!(detect(&statement, None, None), Err(ExtratoError::BankNotDetected)));
    }

    #[test]
    fn test_dated_title_line_still_names_bank() {
        let pdf = text(FileKind::TextExtract, "Itaú Unibanco - Extrato emitido em 01/02/2025\n02/02/2025 PIX -10,00\n");
        let f = detect(&pdf, None, None).unwrap();
        assert_eq!(f.bank, Bank::Itau);
    }

    #[test]
    fn test_title_marker_yields_to_hint() {
        let pdf = text(FileKind::TextExtract, "Banco Bradesco S.A.\nExtrato\n02/02/2025 PIX -10,00\n");
        let f = detect(&pdf, Some(Bank::Itau), None).unwrap();
        assert_eq!(f.bank, Bank::Itau);
    }

    #[test]
    fn test_spreadsheet_title_cell_marks_bank() {
        let grid = LoadedSource {
            kind: FileKind::Spreadsheet,
            content: SourceContent::Grid(vec![
                vec!["Itaú Unibanco - Extrato".into(), "".into()],
                vec!["Data".into(), "Lançamento".into(), "Valor".into(), "Saldo".into()],
            ]),
        };
        let f = detect(&grid, None, None).unwrap();
        assert_eq!((f.bank, f.document_type), (Bank::Itau, DocumentType::Statement));
    }
}
