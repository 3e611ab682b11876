//! Merchant fingerprints: the normalized description used as the matching
//! key for classification patterns, generic marks and exclusion rules.

use std::sync::OnceLock;

use regex::Regex;

fn installment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\s*-\s*|\s+|^)(?P<prefix>PARC(?:ELA)?\.?\s*)?(?P<seq>\d{1,3})\s*(?:/|\s+DE\s+)(?P<total>\d{1,3})\s*$")
            .expect("installment regex")
    })
}

/// An installment marker ("k/n", "PARCELA k DE n") found at the end of a text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallmentMarker {
    pub sequence: u32,
    pub total: u32,
    pub has_prefix: bool,
    /// Byte offset in the normalized text where the marker begins.
    start: usize,
}

/// Folds Portuguese diacritics to ASCII; other characters pass through.
pub fn fold_accents(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        other => other,
    }
}

/// Upper-cases, folds accents and collapses whitespace. Punctuation is kept.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text.chars().map(fold_accents).collect::<String>().to_uppercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Finds a trailing installment marker. Only markers with
/// `1 <= sequence <= total` and `total >= 2` count.
pub fn parse_installment_marker(text: &str) -> Option<InstallmentMarker> {
    let normalized = normalize_text(text);
    let caps = installment_re().captures(&normalized)?;
    let sequence: u32 = caps.name("seq")?.as_str().parse().ok()?;
    let total: u32 = caps.name("total")?.as_str().parse().ok()?;
    if total < 2 || sequence == 0 || sequence > total {
        return None;
    }
    Some(InstallmentMarker {
        sequence,
        total,
        has_prefix: caps.name("prefix").is_some(),
        start: caps.get(0)?.start(),
    })
}

/// Normalized merchant key for a description: accents folded, upper-case,
/// installment marker removed, punctuation turned into spaces.
pub fn merchant_fingerprint(description: &str) -> String {
    let mut normalized = normalize_text(description);
    if let Some(marker) = parse_installment_marker(&normalized) {
        normalized.truncate(marker.start);
    }
    normalized
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-token containment: `token` appears in `fingerprint` on word
/// boundaries. Both sides are expected to be fingerprints already.
pub fn contains_token(fingerprint: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    fingerprint == token
        || fingerprint.starts_with(&format!("{token} "))
        || fingerprint.ends_with(&format!(" {token}"))
        || fingerprint.contains(&format!(" {token} "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_normalizes_case_and_whitespace() {
        assert_eq!(merchant_fingerprint("  Uber   *Trip "), "UBER TRIP");
        assert_eq!(merchant_fingerprint("UBER* TRIP"), "UBER TRIP");
        assert_eq!(merchant_fingerprint("Padaria São João"), "PADARIA SAO JOAO");
    }

    #[test]
    fn test_fingerprint_strips_installment_marker() {
        assert_eq!(merchant_fingerprint("Magazine Luiza - Parcela 2/10"), "MAGAZINE LUIZA");
        assert_eq!(merchant_fingerprint("MAGAZINE LUIZA 02/10"), "MAGAZINE LUIZA");
        assert_eq!(merchant_fingerprint("Magazine Luiza Parcela 3 de 10"), "MAGAZINE LUIZA");
    }

    #[test]
    fn test_fingerprint_keeps_non_installment_numbers() {
        // 12/03 cannot be an installment (sequence > total)
        assert_eq!(merchant_fingerprint("PIX RECEBIDO 12/03"), "PIX RECEBIDO 12 03");
        assert_eq!(merchant_fingerprint("POSTO 1/1"), "POSTO 1 1");
    }

    #[test]
    fn test_parse_installment_marker() {
        let m = parse_installment_marker("Loja X - Parcela 2/3").unwrap();
        assert_eq!((m.sequence, m.total, m.has_prefix), (2, 3, true));
        let m = parse_installment_marker("LOJA X 01/12").unwrap();
        assert_eq!((m.sequence, m.total, m.has_prefix), (1, 12, false));
        let m = parse_installment_marker("Parcela 4 de 6").unwrap();
        assert_eq!((m.sequence, m.total), (4, 6));
        assert!(parse_installment_marker("Compra à vista").is_none());
        assert!(parse_installment_marker("LOJA 0/3").is_none());
    }

    #[test]
    fn test_contains_token() {
        assert!(contains_token("PIX ENVIADO JOAO", "PIX"));
        assert!(contains_token("PIX ENVIADO JOAO", "ENVIADO JOAO"));
        assert!(!contains_token("PIXEL STORE", "PIX"));
        assert!(!contains_token("ANYTHING", ""));
    }
}
