//! Helpers for the text found on Japanese tariff pages.

use once_cell::sync::Lazy;
use regex::Regex;

static YEN_AND_SEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([▲△−-]?)\s*(\d+)\s*円\s*(\d{1,2})\s*銭").expect("valid regex"));
static SIGNED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([▲△−-]?)\s*(\d+(?:\.\d+)?)").expect("valid regex"));
static THOUSANDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d),(\d{3})").expect("valid regex"));

/// Folds full-width digits and punctuation to ASCII and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|ch| match ch {
            '０'..='９' => char::from_u32(ch as u32 - '０' as u32 + '0' as u32).unwrap_or(ch),
            'Ａ'..='Ｚ' => char::from_u32(ch as u32 - 'Ａ' as u32 + 'A' as u32).unwrap_or(ch),
            'ａ'..='ｚ' => char::from_u32(ch as u32 - 'ａ' as u32 + 'a' as u32).unwrap_or(ch),
            '．' => '.',
            '，' => ',',
            '／' => '/',
            '－' => '-',
            '\u{3000}' => ' ',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_thousands(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = THOUSANDS.replace_all(&current, "$1$2").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Every unsigned number in `text`, with thousands separators removed.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let cleaned = strip_thousands(&normalize_text(text));
    SIGNED_NUMBER
        .captures_iter(&cleaned)
        .filter_map(|cap| cap[2].parse::<f64>().ok())
        .collect()
}

/// Parses a single price such as `1,234円`, `935円25銭`, `30.00円/kWh` or `▲1.69`.
///
/// `▲`/`△` mark negative amounts on Japanese tariff tables.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned = strip_thousands(&normalize_text(text));
    if let Some(cap) = YEN_AND_SEN.captures(&cleaned) {
        let yen: f64 = cap[2].parse().ok()?;
        let sen: f64 = cap[3].parse().ok()?;
        let value = yen + sen / 100.0;
        return Some(if cap[1].is_empty() { value } else { -value });
    }
    let cap = SIGNED_NUMBER.captures(&cleaned)?;
    let value: f64 = cap[2].parse().ok()?;
    Some(if cap[1].is_empty() { value } else { -value })
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
