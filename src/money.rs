//! Text-to-value helpers shared by the normalizers and extractors.

use chrono::{Datelike, NaiveDate};

/// Parses a money string into signed minor units (cents).
///
/// Both decimal conventions are accepted (`1.234,56` and `1,234.56`): the
/// last separator is the decimal point when one or two digits follow it,
/// otherwise every separator is a thousands separator. Negatives may be
/// written with a leading or trailing minus, parentheses, or a `D` suffix.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    let compact: String = raw
        .replace("R$", "")
        .replace('$', "")
        .replace('"', "")
        .split_whitespace()
        .collect();
    let mut s = compact.as_str();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner;
    }
    if let Some(rest) = s.strip_suffix(['D', 'd']) {
        negative = true;
        s = rest;
    } else if let Some(rest) = s.strip_suffix(['C', 'c']) {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix('-') {
        negative = !negative;
        s = rest;
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if s.is_empty() {
        return None;
    }

    let (int_part, frac_part) = match s.rfind([',', '.']) {
        Some(idx) if s.len() - idx - 1 <= 2 => (&s[..idx], &s[idx + 1..]),
        _ => (s, ""),
    };
    let int_digits: String = int_part.chars().filter(|c| *c != '.' && *c != ',').collect();
    if int_digits.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_digits.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let units: i64 = if int_digits.is_empty() { 0 } else { int_digits.parse().ok()? };
    let cents: i64 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().ok()? * 10,
        _ => frac_part.parse().ok()?,
    };
    let total = units.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -total } else { total })
}

/// Parses the date layouts found in bank exports.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // ISO timestamps: keep the date part.
    if raw.len() > 10 && raw.as_bytes().get(4) == Some(&b'-') {
        return parse_date(raw.get(..10)?);
    }

    let parts: Vec<&str> = raw.split(['/', '-', '.']).collect();
    if parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
        if nums.len() != 3 {
            return None;
        }
        return if parts[0].len() == 4 {
            NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2])
        } else {
            let year = match parts[2].len() {
                2 => 2000 + nums[2] as i32,
                4 => nums[2] as i32,
                _ => return None,
            };
            NaiveDate::from_ymd_opt(year, nums[1], nums[0])
        };
    }

    // OFX: yyyymmdd[hhmmss[.xxx][tz]]
    if raw.get(..8).is_some_and(|head| head.chars().all(|c| c.is_ascii_digit())) {
        let y: i32 = raw[0..4].parse().ok()?;
        let m: u32 = raw[4..6].parse().ok()?;
        let d: u32 = raw[6..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(y, m, d);
    }

    // Spreadsheet serial dates that lost their cell type.
    if (5..=6).contains(&raw.len()) && raw.chars().all(|c| c.is_ascii_digit()) {
        let serial: f64 = raw.parse().ok()?;
        if (20_000.0..80_000.0).contains(&serial) {
            return excel_serial_to_date(serial);
        }
    }

    None
}

/// Completes a year-less `dd/mm` date against a reference date: months after
/// the reference month belong to the previous year.
pub fn complete_day_month(raw: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let (d, m) = raw.trim().split_once('/')?;
    let day: u32 = d.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    let year = if month > reference.month() {
        reference.year() - 1
    } else {
        reference.year()
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::days(serial.trunc() as i64))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
