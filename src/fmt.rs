/// Format minor units as Brazilian reais with thousands separators: R$ 1.234,56
pub fn money(cents: i64) -> String {
    let negative = cents < 0;
    let abs = cents.unsigned_abs();
    let int_part = (abs / 100).to_string();
    let dec_part = abs % 100;

    let mut grouped = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    if negative {
        format!("-R$ {grouped},{dec_part:02}")
    } else {
        format!("R$ {grouped},{dec_part:02}")
    }
}

/// Human label for an optional group/subgroup pair.
pub fn classification_label(group: Option<&str>, subgroup: Option<&str>) -> String {
    match (group, subgroup) {
        (Some(g), Some(s)) => format!("{g} / {s}"),
        (Some(g), None) => g.to_string(),
        _ => "-".to_string(),
    }
}
